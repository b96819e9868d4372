//! A bounded ring buffer of recent formatted log lines, exposed over
//! `GET /internal/logs/recent`. A custom `tracing_subscriber::Layer` mirrors
//! events into an in-memory ring rather than a broadcast channel.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::Local;
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

const CAPACITY: usize = 200;

pub struct RecentLogs {
    lines: Mutex<VecDeque<String>>,
}

impl RecentLogs {
    pub fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            lines: Mutex::new(VecDeque::with_capacity(CAPACITY)),
        })
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.lines.lock().unwrap().iter().cloned().collect()
    }

    fn push(&self, line: String) {
        let mut lines = self.lines.lock().unwrap();
        if lines.len() >= CAPACITY {
            lines.pop_front();
        }
        lines.push_back(line);
    }
}

pub struct RecentLogsLayer {
    sink: std::sync::Arc<RecentLogs>,
}

impl RecentLogsLayer {
    pub fn new(sink: std::sync::Arc<RecentLogs>) -> Self {
        Self { sink }
    }
}

impl<S> Layer<S> for RecentLogsLayer
where
    S: tracing::Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut message = format!("{} [{}] ", Local::now().format("%H:%M:%S"), event.metadata().level());
        let mut visitor = MessageVisitor(&mut message);
        event.record(&mut visitor);
        self.sink.push(message);
    }
}

struct MessageVisitor<'a>(&'a mut String);

impl<'a> tracing::field::Visit for MessageVisitor<'a> {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0.push_str(&format!("{:?}", value));
        } else {
            self.0.push_str(&format!(" {}={:?}", field.name(), value));
        }
    }
}
