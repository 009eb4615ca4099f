//! Pipeline Configuration
//!
//! Tunables for the pipeline with environment variable overrides.

use std::time::Duration;

/// Default trailing-edge flush interval for streamed partials
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(100);

/// Default event bus channel capacity
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Pipeline tunables
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Minimum spacing between stream-update flushes per topic
    pub flush_interval: Duration,
    /// Broadcast channel capacity of the event bus
    pub event_capacity: usize,
    /// Whether to emit a rename suggestion after a topic's first exchange
    pub rename_suggestions: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            rename_suggestions: true,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from environment variables
    ///
    /// Recognized variables, all optional:
    /// - `DIALOG_FLUSH_INTERVAL_MS`: flush interval in milliseconds
    /// - `DIALOG_EVENT_CAPACITY`: event bus capacity
    /// - `DIALOG_RENAME_SUGGESTIONS`: `true`/`false`
    ///
    /// Unparseable values fall back to the defaults.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("DIALOG_FLUSH_INTERVAL_MS") {
            if let Ok(ms) = val.parse::<u64>() {
                config.flush_interval = Duration::from_millis(ms);
            } else {
                tracing::warn!(value = %val, "Invalid DIALOG_FLUSH_INTERVAL_MS, using default");
            }
        }

        if let Ok(val) = std::env::var("DIALOG_EVENT_CAPACITY") {
            if let Ok(capacity) = val.parse::<usize>() {
                if capacity > 0 {
                    config.event_capacity = capacity;
                }
            } else {
                tracing::warn!(value = %val, "Invalid DIALOG_EVENT_CAPACITY, using default");
            }
        }

        if let Ok(val) = std::env::var("DIALOG_RENAME_SUGGESTIONS") {
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" => config.rename_suggestions = true,
                "false" | "0" | "no" => config.rename_suggestions = false,
                _ => {
                    tracing::warn!(value = %val, "Invalid DIALOG_RENAME_SUGGESTIONS, using default");
                }
            }
        }

        config
    }

    /// Set the flush interval
    #[must_use]
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Set the event bus capacity
    #[must_use]
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Enable or disable rename suggestions
    #[must_use]
    pub fn with_rename_suggestions(mut self, enabled: bool) -> Self {
        self.rename_suggestions = enabled;
        self
    }
}
