//! Element sources that read NDJSON from the network or from disk.

pub mod error;
pub mod http;
pub mod ndjson;
pub mod replay;

pub use error::TransportError;
pub use http::HttpElementSource;
pub use ndjson::NdjsonStream;
pub use replay::ReplaySource;
