//! Secure messaging core and heartbeat hierarchy for a network of
//! containers hosting named roles.

pub mod certificate;
pub mod config;
pub mod container;
pub mod dispatch;
pub mod error;
pub mod heartbeat;
pub mod liveness;
pub mod message;
pub mod router;
pub mod timer;
pub mod tls;
pub mod types;

pub use config::Config;
pub use container::Container;
pub use dispatch::{Dispatcher, Skill, SkillContext, SkillState};
pub use error::{DispatchError, MessageError, NetworkError};
pub use message::Message;
pub use types::{Operation, QualifiedName};
