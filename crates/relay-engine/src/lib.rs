//! Session core: bounded per-session event logs, their producers, the
//! registry that owns them, and resume/replay.

pub mod config;
pub mod error;
pub mod log;
mod producer;
pub mod registry;
pub mod replay;
pub mod session;
#[cfg(test)]
mod testing;

pub use config::EngineConfig;
pub use error::EngineError;
pub use log::{ReadOutcome, SequencedLog};
pub use registry::{GcReport, OpenedStream, SessionRegistry};
pub use replay::{ReplayItem, ReplayStream};
pub use session::{CancelTrigger, ListenerGuard, ProducerPhase, Session, SessionSnapshot};
