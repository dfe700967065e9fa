//! Level-filtered logging with a pluggable sink.
//!
//! Dispatch is synchronous with the caller's thread, so records from one
//! thread reach the handler in the order they were produced. The default
//! [`ConsoleLogHandler`] serialises whole lines behind an internal lock; the
//! [`LogCrateHandler`] forwards records into the `log` facade instead.
use std::{
    fmt,
    sync::{Arc, OnceLock},
    time::{SystemTime, UNIX_EPOCH},
};

use parking_lot::Mutex;

use crate::datetime::Timestamp;

/// Log levels in ascending order. `All` and `Off` are thresholds only and
/// never appear on records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    All,
    Finest,
    Finer,
    Fine,
    Info,
    Warning,
    Severe,
    Off,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::All => "ALL",
            Self::Finest => "FINEST",
            Self::Finer => "FINER",
            Self::Fine => "FINE",
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Severe => "SEVERE",
            Self::Off => "OFF",
        })
    }
}

/// One log record.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub level: LogLevel,
    pub message: String,
    /// What the record is about, e.g. a connection or pool id.
    pub context: Option<String>,
    /// Milliseconds since the unix epoch, UTC.
    pub timestamp_millis: i64,
    pub file: &'static str,
    pub function: &'static str,
    pub line: u32,
}

/// A sink for log records.
pub trait LogHandler: Send + Sync {
    fn log(&self, record: &LogRecord);
}

/// Level-filtered dispatch to the current handler.
pub struct Logger {
    level: Mutex<LogLevel>,
    handler: Mutex<Arc<dyn LogHandler>>,
}

impl Logger {
    pub fn new() -> Logger {
        Logger {
            level: Mutex::new(LogLevel::Info),
            handler: Mutex::new(Arc::new(ConsoleLogHandler::new())),
        }
    }

    pub fn level(&self) -> LogLevel {
        *self.level.lock()
    }

    pub fn set_level(&self, level: LogLevel) {
        *self.level.lock() = level;
    }

    /// Whether a record at `level` would reach the handler.
    pub fn is_loggable(&self, level: LogLevel) -> bool {
        level >= self.level()
    }

    pub fn set_handler(&self, handler: Arc<dyn LogHandler>) {
        *self.handler.lock() = handler;
    }

    /// Dispatch one record, synchronously on the calling thread.
    pub fn log(&self, record: LogRecord) {
        if !self.is_loggable(record.level) {
            return;
        }
        let handler = self.handler.lock().clone();
        handler.log(&record);
    }

    #[doc(hidden)]
    pub fn log_source(
        &self,
        level: LogLevel,
        context: &str,
        function: &'static str,
        file: &'static str,
        line: u32,
        args: fmt::Arguments<'_>,
    ) {
        if !self.is_loggable(level) {
            return;
        }
        self.log(LogRecord {
            level,
            message: args.to_string(),
            context: (!context.is_empty()).then(|| context.to_owned()),
            timestamp_millis: now_millis(),
            file,
            function,
            line,
        });
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::new()
    }
}

/// The process-wide logger.
pub fn global() -> &'static Logger {
    static LOGGER: OnceLock<Logger> = OnceLock::new();
    LOGGER.get_or_init(Logger::new)
}

/// Crate-internal logging against the global logger.
macro_rules! plog {
    ($level:expr, $context:expr, $($arg:tt)*) => {
        $crate::logger::global().log_source(
            $level,
            $context,
            module_path!(),
            file!(),
            line!(),
            format_args!($($arg)*),
        )
    };
}

pub(crate) use plog;

/// Milliseconds since the unix epoch.
pub(crate) fn now_millis() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_millis() as i64,
        Err(before) => -(before.duration().as_millis() as i64),
    }
}

/// Formats `[<ISO-8601 timestamp UTC> <context> <LEVEL>] <message>` to
/// stdout, one whole line at a time.
pub struct ConsoleLogHandler {
    lock: Mutex<()>,
}

impl ConsoleLogHandler {
    pub fn new() -> ConsoleLogHandler {
        ConsoleLogHandler { lock: Mutex::new(()) }
    }
}

impl Default for ConsoleLogHandler {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn format_record(record: &LogRecord) -> String {
    let ts = Timestamp::from_unix_millis(record.timestamp_millis);
    let mut line = format!("[{}T{}+00:00", ts.date, ts.time);
    if let Some(context) = &record.context {
        line.push(' ');
        line.push_str(context);
    }
    line.push(' ');
    line.push_str(&record.level.to_string());
    line.push_str("] ");
    line.push_str(&record.message);
    line
}

impl LogHandler for ConsoleLogHandler {
    fn log(&self, record: &LogRecord) {
        let line = format_record(record);
        let _guard = self.lock.lock();
        println!("{line}");
    }
}

/// Forwards records into the [`log`] facade, for applications that already
/// route everything through it.
pub struct LogCrateHandler;

impl LogHandler for LogCrateHandler {
    fn log(&self, record: &LogRecord) {
        let level = match record.level {
            LogLevel::Finest | LogLevel::Finer => log::Level::Trace,
            LogLevel::Fine => log::Level::Debug,
            LogLevel::Info => log::Level::Info,
            LogLevel::Warning => log::Level::Warn,
            LogLevel::Severe => log::Level::Error,
            LogLevel::All | LogLevel::Off => return,
        };
        match &record.context {
            Some(context) => log::log!(target: "pglink", level, "{context}: {}", record.message),
            None => log::log!(target: "pglink", level, "{}", record.message),
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn threshold_algebra() {
        let logger = Logger::new();
        logger.set_level(LogLevel::Warning);
        assert!(logger.is_loggable(LogLevel::Warning));
        assert!(logger.is_loggable(LogLevel::Severe));
        assert!(!logger.is_loggable(LogLevel::Info));
        assert!(!logger.is_loggable(LogLevel::Finest));

        logger.set_level(LogLevel::Off);
        assert!(!logger.is_loggable(LogLevel::Severe));

        logger.set_level(LogLevel::All);
        assert!(logger.is_loggable(LogLevel::Finest));
    }

    #[test]
    fn record_format() {
        let record = LogRecord {
            level: LogLevel::Info,
            message: "metrics flushed".into(),
            context: Some("Pool-1".into()),
            timestamp_millis: 786_844_800_123,
            file: "pool.rs",
            function: "flush",
            line: 1,
        };
        assert_eq!(
            format_record(&record),
            "[1994-12-08T00:00:00.123+00:00 Pool-1 INFO] metrics flushed"
        );
    }

    #[test]
    fn record_format_without_context() {
        let record = LogRecord {
            level: LogLevel::Severe,
            message: "boom".into(),
            context: None,
            timestamp_millis: 0,
            file: "",
            function: "",
            line: 0,
        };
        assert_eq!(
            format_record(&record),
            "[1970-01-01T00:00:00.000+00:00 SEVERE] boom"
        );
    }

    #[test]
    fn handler_receives_filtered_records() {
        struct Counting(AtomicUsize);
        impl LogHandler for Counting {
            fn log(&self, _: &LogRecord) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let handler = Arc::new(Counting(AtomicUsize::new(0)));
        let logger = Logger::new();
        logger.set_handler(handler.clone());
        logger.set_level(LogLevel::Info);

        let record = |level| LogRecord {
            level,
            message: String::new(),
            context: None,
            timestamp_millis: 0,
            file: "",
            function: "",
            line: 0,
        };
        logger.log(record(LogLevel::Fine));
        logger.log(record(LogLevel::Info));
        logger.log(record(LogLevel::Severe));
        assert_eq!(handler.0.load(Ordering::SeqCst), 2);
    }
}
