//! Supervision spans around module runs

use std::time::{Duration, Instant};

use tracing::{Span, info, info_span, warn};

use crate::state::SpanStatus;

/// Creates one child span per module run
pub trait Supervisor: Send + Sync {
    fn start_child(&self, name: &str) -> Box<dyn SupervisorSpan>;
}

/// A running supervision span
pub trait SupervisorSpan: Send {
    fn set_status(&mut self, status: SpanStatus);

    /// Close the span, returning its duration
    fn finish(self: Box<Self>) -> Duration;
}

/// Measures time and nothing else
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSupervisor;

struct NoopSpan {
    started: Instant,
}

impl Supervisor for NoopSupervisor {
    fn start_child(&self, _name: &str) -> Box<dyn SupervisorSpan> {
        Box::new(NoopSpan {
            started: Instant::now(),
        })
    }
}

impl SupervisorSpan for NoopSpan {
    fn set_status(&mut self, _status: SpanStatus) {}

    fn finish(self: Box<Self>) -> Duration {
        self.started.elapsed()
    }
}

/// Emits a `supervise` span and a completion event per module
#[derive(Debug, Clone)]
pub struct TracingSupervisor {
    parent: Span,
}

impl Default for TracingSupervisor {
    fn default() -> Self {
        Self {
            parent: Span::current(),
        }
    }
}

impl TracingSupervisor {
    #[must_use]
    pub fn new(parent: Span) -> Self {
        Self { parent }
    }
}

struct TracingSpan {
    span: Span,
    name: String,
    status: SpanStatus,
    started: Instant,
}

impl Supervisor for TracingSupervisor {
    fn start_child(&self, name: &str) -> Box<dyn SupervisorSpan> {
        let span = info_span!(parent: &self.parent, "supervise", module = name);
        Box::new(TracingSpan {
            span,
            name: name.to_string(),
            status: SpanStatus::Ok,
            started: Instant::now(),
        })
    }
}

impl SupervisorSpan for TracingSpan {
    fn set_status(&mut self, status: SpanStatus) {
        self.status = status;
    }

    fn finish(self: Box<Self>) -> Duration {
        let elapsed = self.started.elapsed();
        let _guard = self.span.enter();
        let duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        match self.status {
            SpanStatus::Ok => info!(
                module = %self.name,
                duration_ms,
                status = self.status.as_str(),
                "module finished"
            ),
            SpanStatus::InternalError => warn!(
                module = %self.name,
                duration_ms,
                status = self.status.as_str(),
                "module finished"
            ),
        }
        elapsed
    }
}
