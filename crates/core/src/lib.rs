// Core engine for the Relay workflow orchestrator

pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod queue;
pub mod storage;
pub mod types;
pub mod workflow;

pub use config::EngineConfig;
pub use connection::ConnectionLifecycle;
pub use error::{EngineError, EngineResult};
pub use events::{EngineEvent, EngineEventKind, EventBus};
pub use queue::{JobHandler, JobOptions, JobQueue, RedbJobQueue};
pub use storage::RedbStore;
pub use types::*;
