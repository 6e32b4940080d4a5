//! Guest logging import.
//!
//! Guests import `log.log(level: i32, message: string)`. Each entry is emitted
//! through `tracing` and kept in a [`LoggingHost`] collector so embedders and
//! tests can inspect what a call logged.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use mapping_runtime_core::{AscString, CallContext, HostFunction};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

/// Severity of a guest log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// One log line emitted by a guest.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
    /// Instance whose export was running when the guest logged.
    pub instance: String,
    pub timestamp: Instant,
}

/// Default number of entries a [`LoggingHost`] retains.
pub const DEFAULT_LOG_CAPACITY: usize = 1024;

/// Collector behind the `log.log` import.
///
/// Cloning shares the collector, so the clone bound into an instance and the
/// one kept by the embedder see the same entries. At most `capacity` entries
/// are retained; older ones are evicted first and counted in
/// [`LoggingHost::dropped`].
#[derive(Debug, Clone)]
pub struct LoggingHost {
    inner: Arc<Mutex<Buffer>>,
}

#[derive(Debug)]
struct Buffer {
    entries: VecDeque<LogEntry>,
    capacity: usize,
    dropped: u64,
}

impl Default for LoggingHost {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_LOG_CAPACITY)
    }
}

impl LoggingHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a collector retaining at most `capacity` entries.
    ///
    /// # Arguments
    ///
    /// * `capacity` - Retained entries; 0 keeps nothing but still emits via `tracing`
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Buffer {
                entries: VecDeque::with_capacity(capacity.min(DEFAULT_LOG_CAPACITY)),
                capacity,
                dropped: 0,
            })),
        }
    }

    /// Record a message and emit it via `tracing`.
    pub fn log(&self, instance: &str, level: LogLevel, message: &str) {
        match level {
            LogLevel::Debug => debug!(instance, guest_log = true, "{}", message),
            LogLevel::Info => info!(instance, guest_log = true, "{}", message),
            LogLevel::Warn => warn!(instance, guest_log = true, "{}", message),
            LogLevel::Error => error!(instance, guest_log = true, "{}", message),
        }

        let mut buffer = self.inner.lock();
        if buffer.capacity == 0 {
            buffer.dropped += 1;
            return;
        }
        if buffer.entries.len() == buffer.capacity {
            buffer.entries.pop_front();
            buffer.dropped += 1;
        }
        buffer.entries.push_back(LogEntry {
            level,
            message: message.to_string(),
            instance: instance.to_string(),
            timestamp: Instant::now(),
        });
    }

    /// Snapshot of the retained entries, oldest first.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.inner.lock().entries.iter().cloned().collect()
    }

    /// Drain the retained entries.
    pub fn take(&self) -> Vec<LogEntry> {
        self.inner.lock().entries.drain(..).collect()
    }

    /// Number of entries evicted or never retained because the buffer was full.
    pub fn dropped(&self) -> u64 {
        self.inner.lock().dropped
    }

    /// The `log.log(level, message)` host function, bound to this collector.
    pub fn host_function(&self) -> HostFunction {
        let host = self.clone();
        HostFunction::wrap2(move |ctx: &CallContext, level: i32, message: AscString| {
            let instance = ctx
                .inspect(|stack| stack.top().map(|frame| frame.instance_name().to_string()))
                .unwrap_or_default();
            host.log(&instance, level_from_i32(level), message.as_str());
            Ok(())
        })
    }
}

/// Convert a guest log level (0=debug, 1=info, 2=warn, 3=error).
///
/// Unknown values default to Info.
pub fn level_from_i32(level: i32) -> LogLevel {
    match level {
        0 => LogLevel::Debug,
        2 => LogLevel::Warn,
        3 => LogLevel::Error,
        _ => LogLevel::Info,
    }
}

/// Convert a [`LogLevel`] to its guest value.
pub fn level_to_i32(level: LogLevel) -> i32 {
    match level {
        LogLevel::Debug => 0,
        LogLevel::Info => 1,
        LogLevel::Warn => 2,
        LogLevel::Error => 3,
    }
}

#[cfg(test)]
mod tests {
    use mapping_runtime_core::ValueKind;

    use super::*;

    #[test]
    fn test_logging_collects_entries() {
        let host = LoggingHost::new();
        let shared = host.clone();

        host.log("mapping", LogLevel::Info, "Hello");
        shared.log("mapping", LogLevel::Error, "World");

        let entries = host.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].message, "Hello");
        assert_eq!(entries[0].level, LogLevel::Info);
        assert_eq!(entries[1].message, "World");
        assert_eq!(entries[1].level, LogLevel::Error);
        assert_eq!(entries[1].instance, "mapping");
    }

    #[test]
    fn test_take_drains() {
        let host = LoggingHost::new();
        host.log("a", LogLevel::Debug, "x");

        assert_eq!(host.take().len(), 1);
        assert!(host.entries().is_empty());
    }

    #[test]
    fn test_buffer_is_bounded() {
        let host = LoggingHost::with_capacity(3);
        for i in 0..10 {
            host.log("a", LogLevel::Info, &format!("line {i}"));
        }

        let entries = host.entries();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].message, "line 7");
        assert_eq!(entries[2].message, "line 9");
        assert_eq!(host.dropped(), 7);

        let silent = LoggingHost::with_capacity(0);
        silent.log("a", LogLevel::Warn, "ignored");
        assert!(silent.entries().is_empty());
        assert_eq!(silent.dropped(), 1);
    }

    #[test]
    fn test_host_function_signature() {
        let f = LoggingHost::new().host_function();
        assert_eq!(f.params(), &[ValueKind::I32, ValueKind::object::<AscString>()]);
        assert!(f.results().is_empty());
    }

    #[test]
    fn test_level_from_i32() {
        assert_eq!(level_from_i32(0), LogLevel::Debug);
        assert_eq!(level_from_i32(1), LogLevel::Info);
        assert_eq!(level_from_i32(2), LogLevel::Warn);
        assert_eq!(level_from_i32(3), LogLevel::Error);
        assert_eq!(level_from_i32(99), LogLevel::Info);
    }

    #[test]
    fn test_level_round_trip() {
        for level in [LogLevel::Debug, LogLevel::Info, LogLevel::Warn, LogLevel::Error] {
            assert_eq!(level_from_i32(level_to_i32(level)), level);
        }
    }
}
