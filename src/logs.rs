//! Bounded, subscribable logs for the supervised server and helper commands.
//!
//! Two independent [`LogChannel`]s live in a [`LogAggregator`]: one for the
//! server's own output and lifecycle, one for short-lived helper processes
//! (installer runs, version checks). Each channel keeps at most `capacity`
//! entries, evicting the oldest first, and pushes every new entry to its
//! observers synchronously before trimming.
//!
//! Late observers replay the retained history on attach:
//!
//! ```
//! use datasette_app_runner::logs::{LogAggregator, LogKind};
//!
//! let logs = LogAggregator::new(1000);
//! logs.server().log(LogKind::Stderr, "INFO:     Started server process [42]");
//!
//! let (history, id) = logs.server().subscribe_with_history(|entry| {
//!     println!("{}: {}", entry.kind, entry.message);
//! });
//! assert_eq!(history[0].message, "Started server process [42]");
//! logs.server().unsubscribe(id);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

/// Log-framework prefixes removed from captured lines.
const STRIPPED_PREFIXES: &[&str] = &["INFO:     ", "DEBUG:    "];

/// Where a log entry came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogKind {
    /// A line on the process's standard output
    Stdout,
    /// A line on the process's standard error
    Stderr,
    /// A process was launched
    Start,
    /// A process finished
    End,
    /// A failure noticed by the supervisor
    Error,
}

impl fmt::Display for LogKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogKind::Stdout => "stdout",
            LogKind::Stderr => "stderr",
            LogKind::Start => "start",
            LogKind::End => "end",
            LogKind::Error => "error",
        };
        f.write_str(name)
    }
}

/// One immutable log record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Message text with known prefixes stripped
    pub message: String,
    /// Stream classification
    #[serde(rename = "type")]
    pub kind: LogKind,
    /// When the entry was recorded
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,
}

impl LogEntry {
    /// Create an entry stamped with the current time.
    pub fn new(kind: LogKind, message: &str) -> Self {
        Self {
            message: clean_message(message),
            kind,
            timestamp: Utc::now(),
        }
    }
}

/// Strip trailing line endings and known log-framework prefixes.
pub fn clean_message(raw: &str) -> String {
    let line = raw.trim_end_matches(['\r', '\n']);
    let line = STRIPPED_PREFIXES
        .iter()
        .find_map(|prefix| line.strip_prefix(prefix))
        .unwrap_or(line);
    line.to_string()
}

/// Identifies one observer of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Observer = Arc<dyn Fn(&LogEntry) + Send + Sync>;

struct ChannelState {
    entries: VecDeque<LogEntry>,
    observers: Vec<(SubscriptionId, Observer)>,
    next_id: u64,
}

/// A capped, append-only log with synchronous fan-out.
///
/// Observers run while the channel is locked, which keeps delivery order
/// identical to history order. An observer must therefore not call back
/// into the same channel.
pub struct LogChannel {
    name: &'static str,
    capacity: usize,
    state: Mutex<ChannelState>,
}

impl LogChannel {
    /// Create an empty channel keeping at most `capacity` entries
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            capacity: capacity.max(1),
            state: Mutex::new(ChannelState {
                entries: VecDeque::with_capacity(capacity.min(1024)),
                observers: Vec::new(),
                next_id: 1,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, ChannelState> {
        // Observers cannot leave the entry list half-updated, so a poisoned
        // lock still guards consistent data.
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Channel name, used in tracing output and the log viewer routes
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Maximum retained entries
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append an entry, notify observers, then trim to capacity.
    pub fn record(&self, entry: LogEntry) {
        let mut state = self.state();
        state.entries.push_back(entry);
        if let Some(entry) = state.entries.back() {
            for (_, observer) in &state.observers {
                observer(entry);
            }
        }
        while state.entries.len() > self.capacity {
            state.entries.pop_front();
        }
    }

    /// Record `message` under `kind`. Blank messages are dropped.
    pub fn log(&self, kind: LogKind, message: &str) {
        let entry = LogEntry::new(kind, message);
        if entry.message.is_empty() {
            return;
        }
        tracing::trace!(channel = self.name, kind = %kind, message = %entry.message);
        self.record(entry);
    }

    /// Register an observer for entries recorded from now on
    pub fn subscribe(&self, observer: impl Fn(&LogEntry) + Send + Sync + 'static) -> SubscriptionId {
        self.subscribe_with_history(observer).1
    }

    /// Register an observer and return the retained history atomically,
    /// so no entry is missed or delivered twice.
    pub fn subscribe_with_history(
        &self,
        observer: impl Fn(&LogEntry) + Send + Sync + 'static,
    ) -> (Vec<LogEntry>, SubscriptionId) {
        let mut state = self.state();
        let id = SubscriptionId(state.next_id);
        state.next_id += 1;
        state.observers.push((id, Arc::new(observer)));
        tracing::debug!(channel = self.name, observers = state.observers.len(), "Log observer attached");
        (state.entries.iter().cloned().collect(), id)
    }

    /// Remove an observer. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut state = self.state();
        let before = state.observers.len();
        state.observers.retain(|(sub, _)| *sub != id);
        before != state.observers.len()
    }

    /// Retained entries, oldest first
    pub fn history(&self) -> Vec<LogEntry> {
        self.state().entries.iter().cloned().collect()
    }

    /// Number of retained entries
    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    /// Whether nothing has been retained
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for LogChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogChannel")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}

/// Owner and sole writer of the two log channels
#[derive(Debug)]
pub struct LogAggregator {
    server: LogChannel,
    process: LogChannel,
}

impl LogAggregator {
    /// Create both channels with the same capacity
    pub fn new(capacity: usize) -> Self {
        Self {
            server: LogChannel::new("server", capacity),
            process: LogChannel::new("process", capacity),
        }
    }

    /// Output and lifecycle of the supervised server
    pub fn server(&self) -> &LogChannel {
        &self.server
    }

    /// Output of helper commands
    pub fn process(&self) -> &LogChannel {
        &self.process
    }

    /// Look a channel up by its name
    pub fn channel(&self, name: &str) -> Option<&LogChannel> {
        match name {
            "server" => Some(&self.server),
            "process" => Some(&self.process),
            _ => None,
        }
    }
}

impl Default for LogAggregator {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_LOG_CAPACITY)
    }
}
