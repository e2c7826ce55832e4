//! Element and data model shared by every loom crate.

pub mod element;
pub mod errors;
pub mod ids;
pub mod messages;
pub mod source;
pub mod thinking;

pub use element::{StreamElement, WireElement};
pub use errors::{MalformedElement, ProtocolViolation, SourceError};
