//! Common surface of everything media can be read from

use ingest_io::LinkError;
use ingest_protocol::{ConnectionState, ErrorCode, ReadOutcome, StatsSnapshot};

/// Operations shared by a single [`Session`](crate::Session) and a
/// [`FailoverGroup`](crate::FailoverGroup)
pub trait MediaHandle {
    /// Copy ready media into `buf` without blocking
    fn read(&self, buf: &mut [u8], full_frames: bool) -> Result<ReadOutcome, ErrorCode>;

    fn disconnect(&self) -> Result<(), ErrorCode>;

    fn query_statistics(&self) -> Result<StatsSnapshot, ErrorCode>;

    fn status(&self) -> Result<ConnectionState, ErrorCode>;

    fn last_error(&self) -> Result<Option<ErrorCode>, ErrorCode>;
}

pub(crate) fn link_error(error: LinkError) -> ErrorCode {
    tracing::warn!("transport error: {}", error);
    match error {
        LinkError::AddrInUse(_) => ErrorCode::InvalidParameter,
        _ => ErrorCode::NetworkError,
    }
}
