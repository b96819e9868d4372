pub mod config;
pub mod direction;
pub mod errors;
pub mod events;
pub mod platform;
pub mod session_types;
pub mod snapshot;
pub mod track;

pub use errors::{ErrorKind, Outcome};
pub use session_types::{Fingerprint, SessionId};
