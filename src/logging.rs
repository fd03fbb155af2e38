use prometheus::IntCounterVec;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

/// Subscriber layer incrementing `log_statements_total{level}` for every
/// emitted event, so operators can alert on sustained error-level output.
pub struct LogCounterLayer {
    counter: IntCounterVec,
}

impl LogCounterLayer {
    pub fn new(counter: IntCounterVec) -> Self {
        Self { counter }
    }
}

impl<S: Subscriber> Layer<S> for LogCounterLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        let label = if level == Level::ERROR {
            "error"
        } else if level == Level::WARN {
            "warn"
        } else if level == Level::INFO {
            "info"
        } else if level == Level::DEBUG {
            "debug"
        } else {
            "trace"
        };
        self.counter.with_label_values(&[label]).inc();
    }
}
