//! Session lifecycle: verify a token, bring the tunnel up, account for usage,
//! and tear everything down again.

pub mod controller;
mod establish;
pub mod types;

pub use controller::{
    Collaborators, ControllerSettings, SessionController, SessionHandle, TrafficFactory,
};
pub use types::{FailureReason, SessionError, SessionEvent, SessionState, UserHint};
