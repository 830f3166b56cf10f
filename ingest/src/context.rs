//! Library context
//!
//! Holds what the handles share: the log sink and the liveness flag. Every
//! handle keeps a reference; once the context is destroyed their operations
//! fail with `NotInitialized`.

use crate::feeder::{Feeder, FeederConfig};
use crate::group::{FailoverGroup, GroupConfig};
use crate::log::{dispatch_for, LogSink, LOG_DISABLED};
use crate::session::Session;
use ingest_protocol::ErrorCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Status events buffered per handle before new ones are dropped
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct ContextConfig {
    /// -1 disables logging, 0 is the most verbose, 5 the least
    pub log_level: i32,
    pub log_sink: Option<LogSink>,
    pub event_capacity: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        ContextConfig {
            log_level: 3,
            log_sink: None,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub build: u32,
}

pub(crate) struct ContextInner {
    alive: AtomicBool,
    dispatch: Option<tracing::Dispatch>,
    event_capacity: usize,
}

/// Shared reference held by every handle
#[derive(Clone)]
pub(crate) struct ContextRef(Arc<ContextInner>);

impl ContextRef {
    pub(crate) fn check(&self) -> Result<(), ErrorCode> {
        if self.0.alive.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(ErrorCode::NotInitialized)
        }
    }

    pub(crate) fn event_capacity(&self) -> usize {
        self.0.event_capacity
    }

    /// Start a worker thread logging through the context's sink
    pub(crate) fn spawn<F>(&self, name: String, work: F) -> Result<JoinHandle<()>, ErrorCode>
    where
        F: FnOnce() + Send + 'static,
    {
        let dispatch = self.0.dispatch.clone();
        std::thread::Builder::new()
            .name(name)
            .spawn(move || match dispatch {
                Some(dispatch) => tracing::dispatcher::with_default(&dispatch, work),
                None => work(),
            })
            .map_err(|e| {
                tracing::error!("cannot start worker: {}", e);
                ErrorCode::Failed
            })
    }
}

pub struct Context {
    inner: ContextRef,
}

impl Context {
    pub fn init(config: ContextConfig) -> Result<Context, ErrorCode> {
        if !(LOG_DISABLED..=5).contains(&config.log_level) || config.event_capacity == 0 {
            return Err(ErrorCode::InvalidParameter);
        }
        let dispatch = config
            .log_sink
            .map(|sink| dispatch_for(config.log_level, sink));

        Ok(Context {
            inner: ContextRef(Arc::new(ContextInner {
                alive: AtomicBool::new(true),
                dispatch,
                event_capacity: config.event_capacity,
            })),
        })
    }

    pub fn version() -> Version {
        let part = |value: &str| value.parse().unwrap_or(0);
        Version {
            major: part(env!("CARGO_PKG_VERSION_MAJOR")),
            minor: part(env!("CARGO_PKG_VERSION_MINOR")),
            patch: part(env!("CARGO_PKG_VERSION_PATCH")),
            build: 0,
        }
    }

    pub fn create_session(&self) -> Result<Session, ErrorCode> {
        self.inner.check()?;
        Ok(Session::new(self.inner.clone()))
    }

    pub fn create_group(&self, config: GroupConfig) -> Result<FailoverGroup, ErrorCode> {
        self.inner.check()?;
        FailoverGroup::new(self.inner.clone(), config)
    }

    pub fn open_feeder(&self, config: FeederConfig) -> Result<Feeder, ErrorCode> {
        self.inner.check()?;
        Feeder::new(self.inner.clone(), config)
    }

    /// Invalidate every handle created from this context
    pub fn destroy(self) {
        self.inner.0.alive.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_log_level() {
        let config = ContextConfig {
            log_level: 9,
            ..ContextConfig::default()
        };
        assert!(matches!(Context::init(config), Err(ErrorCode::InvalidParameter)));
    }

    #[test]
    fn test_destroyed_context_rejects_handles() {
        let context = Context::init(ContextConfig::default()).unwrap();
        let session = context.create_session().unwrap();
        context.destroy();
        assert_eq!(session.status(), Err(ErrorCode::NotInitialized));
    }

    #[test]
    fn test_version() {
        assert_eq!(Context::version().major, 0);
        assert_eq!(Context::version().minor, 1);
    }
}
