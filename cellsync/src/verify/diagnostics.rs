//! Per-attempt error text and the bounded stack of tolerated warnings.

use std::collections::VecDeque;

/// Text and raw code accumulated during one attempt.
///
/// Reset by the retry loop at the start of every iteration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorLog {
    messages: Vec<String>,
    code: Option<u32>,
}

impl ErrorLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: impl Into<String>) {
        self.messages.push(message.into());
    }

    /// Records a raw code. The first code recorded in an attempt wins.
    pub fn set_code(&mut self, code: u32) {
        self.code.get_or_insert(code);
    }

    pub fn reset(&mut self) {
        self.messages.clear();
        self.code = None;
    }

    pub fn messages(&self) -> &[String] {
        &self.messages
    }

    pub fn code(&self) -> Option<u32> {
        self.code
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.code.is_none()
    }

    /// All messages joined for display or a `FAILURE` report.
    pub fn summary(&self) -> String {
        self.messages.join("; ")
    }
}

/// Most recent warnings, oldest dropped first.
#[derive(Debug, Clone)]
pub struct WarningStack {
    entries: VecDeque<String>,
    capacity: usize,
}

impl Default for WarningStack {
    fn default() -> Self {
        Self::with_capacity(32)
    }
}

impl WarningStack {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, warning: impl Into<String>) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(warning.into());
    }

    pub fn latest(&self) -> Option<&str> {
        self.entries.back().map(String::as_str)
    }

    /// Removes and returns every warning, oldest first.
    pub fn drain(&mut self) -> Vec<String> {
        self.entries.drain(..).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_keeps_first_code() {
        let mut log = ErrorLog::new();
        log.push("sensor lost");
        log.set_code(7);
        log.set_code(9);
        log.push("retrying");
        assert_eq!(log.code(), Some(7));
        assert_eq!(log.summary(), "sensor lost; retrying");

        log.reset();
        assert!(log.is_empty());
    }

    #[test]
    fn warnings_are_bounded() {
        let mut stack = WarningStack::with_capacity(2);
        stack.push("a");
        stack.push("b");
        stack.push("c");
        assert_eq!(stack.iter().collect::<Vec<_>>(), ["b", "c"]);
        assert_eq!(stack.latest(), Some("c"));
        assert_eq!(stack.drain(), vec!["b".to_owned(), "c".to_owned()]);
        assert!(stack.is_empty());
    }
}
