//! Leveled output logging. All SDK messages meant for the host application go through
//! [`OutputLogger`], which filters by [`OutputLogLevel`] before handing them to an
//! [`OutputLoggerProvider`].
use std::{
    fmt::Display,
    sync::{Arc, OnceLock},
};

use regex::Regex;
use serde::{Deserialize, Serialize};

const MAX_MESSAGE_LENGTH: usize = 400;
const TRUNCATED_SUFFIX: &str = "...[TRUNCATED]";

/// Minimum severity of messages forwarded to the provider.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputLogLevel {
    None = 0,
    Error = 1,
    #[default]
    Warn = 2,
    Info = 3,
    Debug = 4,
}

/// Host-provided sink for SDK log messages.
pub trait OutputLoggerProvider: Send + Sync {
    fn init(&self) {}
    fn debug(&self, tag: &str, msg: String);
    fn info(&self, tag: &str, msg: String);
    fn warn(&self, tag: &str, msg: String);
    fn error(&self, tag: &str, msg: String);
    fn shutdown(&self) {}
}

/// Default provider that forwards messages to the [`log`] facade under the `statsig` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogCrateOutputLogger;

impl OutputLoggerProvider for LogCrateOutputLogger {
    fn debug(&self, tag: &str, msg: String) {
        log::debug!(target: "statsig", tag; "{msg}");
    }

    fn info(&self, tag: &str, msg: String) {
        log::info!(target: "statsig", tag; "{msg}");
    }

    fn warn(&self, tag: &str, msg: String) {
        log::warn!(target: "statsig", tag; "{msg}");
    }

    fn error(&self, tag: &str, msg: String) {
        log::error!(target: "statsig", tag; "{msg}");
    }
}

/// Level-filtering front for an [`OutputLoggerProvider`].
#[derive(Clone)]
pub struct OutputLogger {
    level: OutputLogLevel,
    provider: Arc<dyn OutputLoggerProvider>,
}

impl OutputLogger {
    pub fn new(level: OutputLogLevel, provider: Arc<dyn OutputLoggerProvider>) -> OutputLogger {
        OutputLogger { level, provider }
    }

    /// Logger that drops everything.
    pub fn disabled() -> OutputLogger {
        OutputLogger::new(OutputLogLevel::None, Arc::new(LogCrateOutputLogger))
    }

    pub fn level(&self) -> OutputLogLevel {
        self.level
    }

    pub fn is_enabled(&self, level: OutputLogLevel) -> bool {
        level != OutputLogLevel::None && level <= self.level
    }

    pub fn init(&self) {
        if self.level != OutputLogLevel::None {
            self.provider.init();
        }
    }

    pub fn shutdown(&self) {
        if self.level != OutputLogLevel::None {
            self.provider.shutdown();
        }
    }

    pub fn debug(&self, tag: &str, msg: impl Display) {
        if self.is_enabled(OutputLogLevel::Debug) {
            self.provider.debug(tag, sanitize(msg));
        }
    }

    pub fn info(&self, tag: &str, msg: impl Display) {
        if self.is_enabled(OutputLogLevel::Info) {
            self.provider.info(tag, sanitize(msg));
        }
    }

    pub fn warn(&self, tag: &str, msg: impl Display) {
        if self.is_enabled(OutputLogLevel::Warn) {
            self.provider.warn(tag, sanitize(msg));
        }
    }

    pub fn error(&self, tag: &str, msg: impl Display) {
        if self.is_enabled(OutputLogLevel::Error) {
            self.provider.error(tag, sanitize(msg));
        }
    }
}

impl Default for OutputLogger {
    fn default() -> OutputLogger {
        OutputLogger::new(OutputLogLevel::default(), Arc::new(LogCrateOutputLogger))
    }
}

impl std::fmt::Debug for OutputLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputLogger")
            .field("level", &self.level)
            .finish_non_exhaustive()
    }
}

/// Mask server secrets and cap the message length.
fn sanitize(msg: impl Display) -> String {
    static SECRET_KEY: OnceLock<Option<Regex>> = OnceLock::new();

    let msg = msg.to_string();
    let mut msg = match SECRET_KEY.get_or_init(|| Regex::new(r"secret-[A-Za-z0-9]+").ok()) {
        Some(re) => re.replace_all(&msg, "secret-****").into_owned(),
        None => msg,
    };

    if msg.len() > MAX_MESSAGE_LENGTH {
        let mut end = MAX_MESSAGE_LENGTH - TRUNCATED_SUFFIX.len();
        while !msg.is_char_boundary(end) {
            end -= 1;
        }
        msg.truncate(end);
        msg.push_str(TRUNCATED_SUFFIX);
    }
    msg
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    /// Provider that keeps every message it receives.
    #[derive(Default)]
    pub(crate) struct CapturingLogger {
        pub(crate) messages: Mutex<Vec<(OutputLogLevel, String, String)>>,
    }

    impl CapturingLogger {
        fn push(&self, level: OutputLogLevel, tag: &str, msg: String) {
            self.messages
                .lock()
                .unwrap()
                .push((level, tag.to_owned(), msg));
        }

        pub(crate) fn contains(&self, level: OutputLogLevel, needle: &str) -> bool {
            self.messages
                .lock()
                .unwrap()
                .iter()
                .any(|(l, _, m)| *l == level && m.contains(needle))
        }
    }

    impl OutputLoggerProvider for CapturingLogger {
        fn debug(&self, tag: &str, msg: String) {
            self.push(OutputLogLevel::Debug, tag, msg)
        }
        fn info(&self, tag: &str, msg: String) {
            self.push(OutputLogLevel::Info, tag, msg)
        }
        fn warn(&self, tag: &str, msg: String) {
            self.push(OutputLogLevel::Warn, tag, msg)
        }
        fn error(&self, tag: &str, msg: String) {
            self.push(OutputLogLevel::Error, tag, msg)
        }
    }

    #[test]
    fn filters_below_configured_level() {
        let provider = Arc::new(CapturingLogger::default());
        let logger = OutputLogger::new(OutputLogLevel::Warn, provider.clone());

        logger.debug("Test", "debug message");
        logger.info("Test", "info message");
        logger.warn("Test", "warn message");
        logger.error("Test", "error message");

        let messages = provider.messages.lock().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].0, OutputLogLevel::Warn);
        assert_eq!(messages[1].0, OutputLogLevel::Error);
    }

    #[test]
    fn none_level_drops_everything() {
        let provider = Arc::new(CapturingLogger::default());
        let logger = OutputLogger::new(OutputLogLevel::None, provider.clone());

        logger.error("Test", "error message");

        assert!(provider.messages.lock().unwrap().is_empty());
    }

    #[test]
    fn masks_secret_keys() {
        let msg = sanitize("request with secret-abc123XYZ failed");
        assert_eq!(msg, "request with secret-**** failed");
    }

    #[test]
    fn truncates_long_messages() {
        let msg = sanitize("x".repeat(1000));
        assert_eq!(msg.len(), MAX_MESSAGE_LENGTH);
        assert!(msg.ends_with(TRUNCATED_SUFFIX));
    }
}
