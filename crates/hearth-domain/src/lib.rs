//! Device model: schema-validated traits, the component tree, command
//! lifecycle and the state-change log.

mod command;
mod component;
mod error;
mod model;
mod observer;
mod path;
mod queue;
mod role;
mod schema;
mod state_log;

pub use command::{Command, CommandEvent, CommandState, Origin};
pub use component::{merge_dict, Child, Component, ComponentTree};
pub use error::{DomainError, ErrorInfo};
pub use model::DeviceModel;
pub use observer::{ObserverList, Subscription};
pub use path::{parse_path, PathSegment};
pub use queue::{CommandHandle, CommandHandler, CommandQueue};
pub use role::Role;
pub use schema::{validate_object, validate_value, TraitRegistry};
pub use state_log::{StateChange, StateChangeLog, DEFAULT_MAX_CHANGES_PER_COMPONENT};
