//! Process log exposed as a subscriber stream.
//!
//! Messages produced before the first subscriber opens `/log` are queued in
//! a bounded startup buffer and drained into that subscriber; once the
//! buffer budget is exhausted a single `[truncated]` marker is appended and
//! further pre-subscription messages are dropped. A `tracing` layer feeds
//! every log event into the stream.

use crate::util::stream::{Stream, StreamGroup};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

const STARTUP_BUFFER_SIZE: usize = 64 << 10;

#[derive(Clone)]
pub struct Log {
    shared: Arc<LogShared>,
}

struct LogShared {
    group: StreamGroup,
    startup: Mutex<Option<Startup>>,
}

struct Startup {
    messages: VecDeque<String>,
    remaining: usize,
}

impl LogShared {
    fn write(&self, line: &str) {
        let mut startup = self.startup.lock().unwrap();
        match startup.as_mut() {
            Some(queue) => {
                if queue.remaining > 0 {
                    queue.messages.push_back(line.to_string());
                    if queue.remaining > line.len() {
                        queue.remaining -= line.len();
                    } else {
                        queue.remaining = 0;
                        queue.messages.push_back("[truncated]\n".to_string());
                    }
                }
            }
            None => {
                drop(startup);
                self.group.write(line);
            }
        }
    }
}

impl Log {
    pub fn new() -> Self {
        let startup = Mutex::new(Some(Startup {
            messages: VecDeque::new(),
            remaining: STARTUP_BUFFER_SIZE,
        }));
        // The first subscriber drains whatever accumulated during startup;
        // later subscribers only see live messages.
        let shared = Arc::new_cyclic(|weak: &std::sync::Weak<LogShared>| {
            let populate_shared = weak.clone();
            LogShared {
                group: StreamGroup::with_populate(move |strm: &Stream| {
                    if let Some(shared) = populate_shared.upgrade() {
                        let mut startup = shared.startup.lock().unwrap();
                        if let Some(queue) = startup.take() {
                            for message in queue.messages {
                                strm.write(&message);
                            }
                        }
                    }
                }),
                startup,
            }
        });
        Self { shared }
    }

    pub fn write(&self, line: &str) {
        self.shared.write(line);
    }

    pub fn subscribe(&self) -> Stream {
        self.shared.group.subscribe()
    }

    pub fn group(&self) -> &StreamGroup {
        &self.shared.group
    }

    pub fn close(&self) {
        self.shared.group.close();
    }

    /// A `tracing` layer forwarding formatted events into the log stream.
    pub fn layer(&self) -> LogLayer {
        LogLayer {
            shared: self.shared.clone(),
        }
    }
}

impl Default for Log {
    fn default() -> Self {
        Self::new()
    }
}

pub struct LogLayer {
    shared: Arc<LogShared>,
}

impl<S: Subscriber> Layer<S> for LogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let level = match *event.metadata().level() {
            Level::ERROR => "error",
            Level::WARN => "warning",
            Level::INFO => "info",
            Level::DEBUG => "debug",
            Level::TRACE => "trace",
        };
        let line = format!(
            "[{}][{}] {}\n",
            event.metadata().target(),
            level,
            visitor.message
        );
        self.shared.write(&line);
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        use fmt::Write;
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        }
    }
}
