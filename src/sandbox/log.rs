//! 沙箱日志条目与收集器

use serde::{Deserialize, Serialize};

/// stderr 中出现即视为执行失败的标记
pub const ERROR_MARKERS: &[&str] = &[
    "Traceback",
    "Error:",
    "IndentationError",
    "SyntaxError",
    "NameError",
    "TypeError",
    "ValueError",
    "ImportError",
    "ModuleNotFoundError",
    "AttributeError",
    "KeyError",
    "ZeroDivisionError",
    "FileNotFoundError",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogKind {
    System,
    File,
    Command,
    Stdout,
    Stderr,
    Success,
    Error,
}

/// 一条执行日志
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Unix 毫秒
    pub timestamp: u64,
    #[serde(rename = "type")]
    pub kind: LogKind,
    pub content: String,
}

impl LogEntry {
    pub fn new(kind: LogKind, content: impl Into<String>) -> Self {
        Self {
            timestamp: chrono::Utc::now().timestamp_millis().max(0) as u64,
            kind,
            content: content.into(),
        }
    }

    /// error 条目，或 stderr 中含有错误标记
    pub fn indicates_failure(&self) -> bool {
        match self.kind {
            LogKind::Error => true,
            LogKind::Stderr => ERROR_MARKERS.iter().any(|m| self.content.contains(m)),
            _ => false,
        }
    }
}

/// 实时日志回调（每产生一条调用一次）
pub type LogCallback = dyn Fn(&LogEntry) + Send + Sync;

/// 收集日志，同时转发给回调
pub(crate) struct Transcript<'a> {
    entries: Vec<LogEntry>,
    on_log: Option<&'a LogCallback>,
}

impl<'a> Transcript<'a> {
    pub fn new(on_log: Option<&'a LogCallback>) -> Self {
        Self {
            entries: Vec::new(),
            on_log,
        }
    }

    pub fn push(&mut self, kind: LogKind, content: impl Into<String>) {
        let entry = LogEntry::new(kind, content);
        if let Some(cb) = self.on_log {
            cb(&entry);
        }
        self.entries.push(entry);
    }

    pub fn into_entries(self) -> Vec<LogEntry> {
        self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_failure_markers() {
        assert!(LogEntry::new(LogKind::Error, "Exit code 1").indicates_failure());
        assert!(LogEntry::new(LogKind::Stderr, "Traceback (most recent call last)").indicates_failure());
        assert!(!LogEntry::new(LogKind::Stderr, "WARNING: pip is outdated").indicates_failure());
        // stdout 里的 "Error:" 不算
        assert!(!LogEntry::new(LogKind::Stdout, "Error: none").indicates_failure());
    }

    #[test]
    fn test_serialized_shape() {
        let entry = LogEntry::new(LogKind::Stdout, "2");
        let v = serde_json::to_value(&entry).unwrap();
        assert_eq!(v["type"], "stdout");
        assert_eq!(v["content"], "2");
        assert!(v["timestamp"].as_u64().unwrap() > 1_600_000_000_000);
    }

    #[test]
    fn test_transcript_forwards_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let cb = move |e: &LogEntry| sink.lock().unwrap().push(e.content.clone());
        let mut t = Transcript::new(Some(&cb));
        t.push(LogKind::System, "a");
        t.push(LogKind::Command, "$ b");
        let entries = t.into_entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(*seen.lock().unwrap(), vec!["a", "$ b"]);
    }
}
