//! Answer-stream assembly: trace builder, citation registry, the per-stream
//! assembler state machine and the session coordinator that drives it.

pub mod assembler;
pub mod citations;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod followups;
pub mod mock;
pub mod trace;

pub use assembler::{AssemblerState, Step, StreamAssembler};
pub use config::CoordinatorConfig;
pub use coordinator::{SessionCoordinator, StartRequest, StreamHandle};
pub use error::EngineError;
