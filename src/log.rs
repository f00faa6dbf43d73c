use log::{LevelFilter, Log, Metadata, Record};
use std::sync::{Once, RwLock};

/// Global logger that forwards records into a replaceable inner logger.
///
/// The adapter starts with `env_logger` and may switch to a logger that also
/// mirrors records into the debug console once a client is connected.
pub struct LoggerSwitcher {
    inner: RwLock<Option<Box<dyn Log>>>,
    install: Once,
}

pub static LOGGER_SWITCHER: LoggerSwitcher = LoggerSwitcher {
    inner: RwLock::new(None),
    install: Once::new(),
};

impl LoggerSwitcher {
    /// Replace current logger and max log level.
    pub fn switch(&'static self, logger: impl Log + 'static, filter: LevelFilter) {
        if let Ok(mut inner) = self.inner.write() {
            *inner = Some(Box::new(logger));
        }
        self.install.call_once(|| {
            // someone else may already own the global logger (tests, embedding apps)
            _ = log::set_logger(self);
        });
        log::set_max_level(filter);
    }
}

impl Log for LoggerSwitcher {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.inner
            .read()
            .map(|inner| inner.as_ref().is_some_and(|l| l.enabled(metadata)))
            .unwrap_or_default()
    }

    fn log(&self, record: &Record) {
        if let Ok(inner) = self.inner.read() {
            if let Some(logger) = inner.as_ref() {
                logger.log(record);
            }
        }
    }

    fn flush(&self) {
        if let Ok(inner) = self.inner.read() {
            if let Some(logger) = inner.as_ref() {
                logger.flush();
            }
        }
    }
}
