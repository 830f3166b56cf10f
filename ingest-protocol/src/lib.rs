//! Ingest protocol core
//!
//! Wire format, handshake, loss tracking and the receive-side machinery of
//! the ingest transport: FEC/ARQ recovery, the latency-bounded jitter buffer,
//! adaptive bitrate and overhead control, and statistics. Everything here is
//! driven by explicit `Instant`s and does no I/O.

pub mod ack;
pub mod adaptive;
pub mod buffer;
pub mod config;
pub mod connection;
pub mod error;
pub mod fec;
pub mod gf256;
pub mod handshake;
pub mod jitter;
pub mod loss;
pub mod packet;
pub mod pipeline;
pub mod recovery;
pub mod sequence;
pub mod stats;

pub use ack::{AckInfo, NakInfo, RttEstimator};
pub use adaptive::{
    AdaptiveConfig, BitrateController, EncoderControl, EncoderController, EncoderFeedback,
    FecTuner, NetworkSample,
};
pub use buffer::{BufferError, SendBuffer};
pub use config::{ErrorCorrectionConfig, FecMode, LatencyMode, RecoveryMode};
pub use connection::{
    Connection, ConnectionAction, ConnectionState, ReconnectPolicy, SessionEvent,
};
pub use error::{code_of, ErrorCode};
pub use fec::{FecEncoder, FecError};
pub use handshake::{ConnectRequest, ConnectResponse, FecParams, Role, StreamInfo};
pub use jitter::{Delivery, JitterBuffer, JitterConfig};
pub use loss::{LossList, LossRange};
pub use packet::{ControlPacket, ControlType, DataPacket, Packet, PacketError};
pub use pipeline::{Chunk, ChunkReader, IntervalCounters, ReadOutcome, ReceivePipeline};
pub use recovery::{Origin, RecoveredPacket, RecoveryCounters, RecoveryEngine};
pub use sequence::SeqNumber;
pub use stats::{
    ConnectionStats, ErrorCorrectionStats, NetworkStats, StatsAggregator, StatsSnapshot,
};
