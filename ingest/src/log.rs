//! Log sink bridge
//!
//! Library code logs through `tracing`. A [`SinkLayer`] forwards those events
//! to a user callback taking a numeric level: 0 is the most verbose, 1 to 5
//! increase in severity, and a configured level of -1 turns logging off.
//! `tracing` has no level above ERROR, so a filter of 5 (fatal only) still
//! lets errors through.

use std::fmt::{self, Write as _};
use std::sync::Arc;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Metadata, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

/// User log callback: level and formatted message
pub type LogSink = Arc<dyn Fn(i32, &str) + Send + Sync>;

pub const LOG_DISABLED: i32 = -1;

/// Highest filter that still passes errors
const MAX_EFFECTIVE_FILTER: i32 = 4;

/// Numeric level of a `tracing` level
pub fn level_value(level: &Level) -> i32 {
    match *level {
        Level::TRACE => 0,
        Level::DEBUG => 1,
        Level::INFO => 2,
        Level::WARN => 3,
        Level::ERROR => 4,
    }
}

#[derive(Clone)]
pub struct SinkLayer {
    min_level: i32,
    sink: LogSink,
}

impl SinkLayer {
    pub fn new(min_level: i32, sink: LogSink) -> Self {
        SinkLayer { min_level, sink }
    }

    fn accepts(&self, level: &Level) -> bool {
        self.min_level != LOG_DISABLED
            && level_value(level) >= self.min_level.min(MAX_EFFECTIVE_FILTER)
    }
}

impl<S: Subscriber> Layer<S> for SinkLayer {
    fn enabled(&self, metadata: &Metadata<'_>, _ctx: Context<'_, S>) -> bool {
        self.accepts(metadata.level())
    }

    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if !self.accepts(metadata.level()) {
            return;
        }
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let line = format!("[{}] {}", metadata.target(), visitor.message);
        (self.sink)(level_value(metadata.level()), &line);
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{:?}", value);
        } else {
            let _ = write!(self.message, " {}={:?}", field.name(), value);
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.message, " {}={}", field.name(), value);
        }
    }
}

/// Dispatcher that worker threads install for their lifetime
pub fn dispatch_for(min_level: i32, sink: LogSink) -> tracing::Dispatch {
    let subscriber = tracing_subscriber::registry().with(SinkLayer::new(min_level, sink));
    tracing::Dispatch::new(subscriber)
}
