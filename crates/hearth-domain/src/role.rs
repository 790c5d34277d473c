use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Ordered privilege level. Commands declare the minimal role allowed to run
/// them; access tokens carry the granted role.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    None,
    Viewer,
    User,
    Manager,
    Owner,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::None => "none",
            Role::Viewer => "viewer",
            Role::User => "user",
            Role::Manager => "manager",
            Role::Owner => "owner",
        }
    }

    /// Integer value used inside access tokens.
    pub fn as_index(&self) -> u8 {
        match self {
            Role::None => 0,
            Role::Viewer => 1,
            Role::User => 2,
            Role::Manager => 3,
            Role::Owner => 4,
        }
    }

    pub fn from_index(index: u8) -> Option<Role> {
        match index {
            0 => Some(Role::None),
            1 => Some(Role::Viewer),
            2 => Some(Role::User),
            3 => Some(Role::Manager),
            4 => Some(Role::Owner),
            _ => None,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Role::None),
            "viewer" => Ok(Role::Viewer),
            "user" => Ok(Role::User),
            "manager" => Ok(Role::Manager),
            "owner" => Ok(Role::Owner),
            _ => Err(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_are_ordered() {
        assert!(Role::None < Role::Viewer);
        assert!(Role::Viewer < Role::User);
        assert!(Role::User < Role::Manager);
        assert!(Role::Manager < Role::Owner);
    }

    #[test]
    fn index_round_trips() {
        for role in [Role::None, Role::Viewer, Role::User, Role::Manager, Role::Owner] {
            assert_eq!(Role::from_index(role.as_index()), Some(role));
        }
        assert_eq!(Role::from_index(5), None);
    }
}
