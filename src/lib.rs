//! jobfleet: dispatch, track and report on containerized agent jobs.
//!
//! A session expands into one or more orchestrator jobs. A background
//! monitor folds job states into a session status, extracts findings from
//! job output once the session finishes, and notifies an external endpoint
//! exactly once. Session state survives restarts.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod extract;
pub mod manager;
pub mod monitor;
pub mod orchestrator;
pub mod persist;
pub mod progress;
pub mod session;
pub mod webhook;

pub use config::Config;
pub use error::{Error, Result};
pub use manager::SessionManager;
pub use monitor::{JobMonitor, MonitorHandle, spawn_monitor};
pub use session::{Session, SessionRequest, SessionStatus, SessionStore};
