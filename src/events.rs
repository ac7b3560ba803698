//! Bounded journal of device lifecycle events, mirrored to the `log`
//! facade. The journal is what operators (and tests) read to follow what
//! the controller decided.

use log::info;
use std::collections::VecDeque;
use std::fmt;

const JOURNAL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// First beacon after silence or startup.
    Detected,
    /// A user or automation requested a state.
    Set,
    /// The pending command was re-sent.
    Retry,
    /// A pending command was confirmed by a device report.
    Confirmed,
    /// The device reported a state nobody here asked for.
    Changed,
    /// The pending window elapsed without confirmation.
    Timeout,
    /// No beacon or response for too long.
    Silent,
    /// A pulse expired and the off command was armed.
    Reset,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Detected => "DETECTED",
            EventKind::Set => "SET",
            EventKind::Retry => "RETRY",
            EventKind::Confirmed => "CONFIRMED",
            EventKind::Changed => "CHANGED",
            EventKind::Timeout => "TIMEOUT",
            EventKind::Silent => "SILENT",
            EventKind::Reset => "RESET",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct Event {
    pub time: i64,
    pub device: String,
    pub kind: EventKind,
    pub detail: String,
}

/// Ring buffer of recent events.
#[derive(Debug, Default)]
pub struct EventLog {
    entries: VecDeque<Event>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, time: i64, device: &str, kind: EventKind, detail: impl Into<String>) {
        let detail = detail.into();
        if detail.is_empty() {
            info!("device {device}: {kind}");
        } else {
            info!("device {device}: {kind} {detail}");
        }
        if self.entries.len() == JOURNAL_CAPACITY {
            self.entries.pop_front();
        }
        self.entries.push_back(Event {
            time,
            device: device.to_string(),
            kind,
            detail,
        });
    }

    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.entries.iter()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.entries.iter().filter(|e| e.kind == kind).count()
    }

    pub fn last(&self) -> Option<&Event> {
        self.entries.back()
    }
}
