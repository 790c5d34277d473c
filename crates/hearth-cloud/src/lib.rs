//! Cloud registration & synchronization: the OAuth2 token machine,
//! device-resource reconciliation, command pull/push, state publication and
//! the notification channels feeding them.

mod backoff;
mod engine;
mod error;
mod notification;

pub use backoff::{BackoffEntry, BackoffPolicy};
pub use engine::{CloudEngine, GcdState, RegistrationData};
pub use error::CloudError;
pub use notification::{
    NotificationChannel, NotificationDelegate, PullChannel, PushChannel, ACTIVE_PULL_INTERVAL,
    BACKUP_PULL_INTERVAL,
};
