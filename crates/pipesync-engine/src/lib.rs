//! Sync orchestration engine for Pipesync
//!
//! Drives the chunked fetch → classify → write → checkpoint loop over the
//! remote CRM and the local store:
//!
//! - [`orchestrator`]: session lifecycle, the chunk loop, resume and cancel
//! - [`scheduler`]: periodic incremental runs
//! - [`progress`]: broadcast progress events for observers
//! - [`status`]: read-only status projection for the control interface

pub mod orchestrator;
pub mod progress;
pub mod scheduler;
pub mod status;

pub use orchestrator::{EngineError, SyncOrchestrator};
pub use progress::ProgressEvent;
pub use scheduler::SyncScheduler;
pub use status::{status_report, StatusReport};
