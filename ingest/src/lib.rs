//! Ingest - resilient live media transport
//!
//! High-level API: a [`Context`] creates receiving [`Session`]s, redundant
//! [`FailoverGroup`]s and sending [`Feeder`]s. Each runs its own worker
//! thread; reads and statistics queries never block on the network.

pub mod context;
pub mod feeder;
pub mod group;
pub mod handle;
pub mod log;
pub mod session;
pub mod url;
mod worker;

pub use ingest_failover as failover;
pub use ingest_io as io;
pub use ingest_protocol as protocol;

pub use context::{Context, ContextConfig, Version};
pub use feeder::{Feeder, FeederConfig, FeederStats, StreamCommand};
pub use group::{FailoverGroup, GroupConfig, GroupStats};
pub use handle::MediaHandle;
pub use log::LogSink;
pub use session::{ConnectOptions, Session};
pub use url::{ConnectTarget, Endpoint};

// Re-export commonly used types
pub use failover::{MergeMode, Priority};
pub use protocol::{
    AdaptiveConfig, ConnectionState, EncoderControl, EncoderFeedback, ErrorCode,
    ErrorCorrectionConfig, FecMode, LatencyMode, ReadOutcome, ReconnectPolicy, RecoveryMode,
    SessionEvent, StatsSnapshot, StreamInfo,
};
