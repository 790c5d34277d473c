//! The embedding façade: wires the device model, settings, cloud engine and
//! local Privet surface together, and installs the built-in `device`,
//! `privet` and `_accessRevocationList` traits.

mod access_api;
mod base_api;
mod device;
mod error;

pub use access_api::AccessApiHandler;
pub use base_api::{BaseApiHandler, DEVICE_COMPONENT};
pub use device::{Device, Providers};
pub use error::DeviceError;

pub use hearth_cloud::{GcdState, RegistrationData};
pub use hearth_config::{PairingType, Settings};
pub use hearth_domain::{Command, CommandHandle, CommandState, Origin, Role};
