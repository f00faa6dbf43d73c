use crate::debugger::session::Incoming;
use log::{Level, LevelFilter};
use std::sync::mpsc::Sender;
use std::sync::Mutex;

/// Logger of a connected session.
///
/// Records go to `env_logger` as usual, warnings and errors are mirrored into the client
/// console through the session control channel, so they interleave with protocol traffic.
pub struct DapLogger {
    inner: env_logger::Logger,
    output: Mutex<Sender<Incoming>>,
}

impl DapLogger {
    pub fn new(output: Sender<Incoming>) -> Self {
        Self {
            inner: env_logger::Logger::from_default_env(),
            output: Mutex::new(output),
        }
    }

    pub fn filter(&self) -> LevelFilter {
        self.inner.filter().max(LevelFilter::Warn)
    }
}

impl log::Log for DapLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= Level::Warn || self.inner.enabled(metadata)
    }

    fn log(&self, record: &log::Record) {
        if self.inner.enabled(record.metadata()) {
            self.inner.log(record);
        }
        if record.level() > Level::Warn {
            return;
        }

        let output = format!("[{}] {}\n", record.level(), record.args());
        if let Ok(sink) = self.output.lock() {
            // session is over, nobody to tell
            _ = sink.send(Incoming::Log(output));
        }
    }

    fn flush(&self) {
        self.inner.flush()
    }
}
