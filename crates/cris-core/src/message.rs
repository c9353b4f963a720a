//! User messages and the per-run message collector.
//!
//! A [`MessageCollector`] is owned by exactly one pipeline run. Validators,
//! handlers and post-handlers append to it; nothing is ever removed, and the
//! collector is frozen into a plain `Vec` once the run completes.

use std::ops::{Deref, DerefMut};

use serde::{Deserialize, Serialize};

/// Severity of a [`UserMessage`]. Serialized as `"Info" | "Warn" | "Error"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MessageLevel {
    Info,
    Warn,
    Error,
}

/// A message addressed to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserMessage {
    pub level: MessageLevel,
    pub text: String,
    #[serde(default)]
    pub code: Option<String>,
    /// Nesting depth under opened groups.
    #[serde(default)]
    pub depth: u16,
}

impl UserMessage {
    pub fn new(level: MessageLevel, text: impl Into<String>) -> Self {
        Self {
            level,
            text: text.into(),
            code: None,
            depth: 0,
        }
    }

    pub fn info(text: impl Into<String>) -> Self {
        Self::new(MessageLevel::Info, text)
    }

    pub fn warn(text: impl Into<String>) -> Self {
        Self::new(MessageLevel::Warn, text)
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self::new(MessageLevel::Error, text)
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_depth(mut self, depth: u16) -> Self {
        self.depth = depth;
        self
    }

    pub fn is_error(&self) -> bool {
        self.level == MessageLevel::Error
    }
}

/// Append-only message sink for one pipeline run.
#[derive(Debug, Default)]
pub struct MessageCollector {
    messages: Vec<UserMessage>,
    depth: u16,
    error_count: usize,
}

impl MessageCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message at the current group depth.
    pub fn push(&mut self, mut message: UserMessage) {
        message.depth = message.depth.saturating_add(self.depth);
        if message.is_error() {
            self.error_count += 1;
        }
        self.messages.push(message);
    }

    pub fn add(&mut self, level: MessageLevel, text: impl Into<String>, code: Option<&str>) {
        let mut message = UserMessage::new(level, text);
        message.code = code.map(str::to_string);
        self.push(message);
    }

    pub fn info(&mut self, text: impl Into<String>) {
        self.push(UserMessage::info(text));
    }

    pub fn warn(&mut self, text: impl Into<String>) {
        self.push(UserMessage::warn(text));
    }

    pub fn error(&mut self, text: impl Into<String>) {
        self.push(UserMessage::error(text));
    }

    pub fn error_code(&mut self, text: impl Into<String>, code: &str) {
        self.add(MessageLevel::Error, text, Some(code));
    }

    /// Append a group header and nest subsequent messages under it until the
    /// returned guard is dropped.
    pub fn open_group(&mut self, level: MessageLevel, text: impl Into<String>) -> MessageGroup<'_> {
        self.push(UserMessage::new(level, text));
        self.depth = self.depth.saturating_add(1);
        MessageGroup { collector: self }
    }

    pub fn depth(&self) -> u16 {
        self.depth
    }

    pub fn error_count(&self) -> usize {
        self.error_count
    }

    pub fn has_errors(&self) -> bool {
        self.error_count > 0
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn messages(&self) -> &[UserMessage] {
        &self.messages
    }

    /// Freeze the collector.
    pub fn into_messages(self) -> Vec<UserMessage> {
        self.messages
    }
}

/// Guard returned by [`MessageCollector::open_group`]; closes the group on drop.
pub struct MessageGroup<'a> {
    collector: &'a mut MessageCollector,
}

impl Deref for MessageGroup<'_> {
    type Target = MessageCollector;

    fn deref(&self) -> &Self::Target {
        self.collector
    }
}

impl DerefMut for MessageGroup<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.collector
    }
}

impl Drop for MessageGroup<'_> {
    fn drop(&mut self) {
        self.collector.depth = self.collector.depth.saturating_sub(1);
    }
}
