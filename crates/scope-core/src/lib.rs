//! Shared data model, error taxonomy, event enumeration, configuration
//! surface and logging setup for the scanning engine. Every other crate in
//! the workspace depends on this one.

pub mod config;
pub mod error;
pub mod events;
pub mod logger;
pub mod types;

pub use config::ScopeConfig;
pub use error::{Result, ScopeError};
pub use events::{Event, ErrorCode, SubscriberId};
pub use logger::{init_global_logger, LogLevel, LogRotation, LoggerConfig, UnifiedLogger};
