use tracing::Level;

/// Advisory notes left by middleware while processing a value.
///
/// Entries are never acted upon by the pipeline itself.
#[derive(Debug, Clone, Default)]
pub struct MiddlewareLog {
    entries: Vec<LogEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub level: Level,
    pub message: String,
}

impl MiddlewareLog {
    pub fn push(&mut self, level: Level, message: impl Into<String>) {
        self.entries.push(LogEntry {
            level,
            message: message.into(),
        });
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
