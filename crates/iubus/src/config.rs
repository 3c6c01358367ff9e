//! Buffer configuration.

use std::time::Duration;

use iubus_core::DEFAULT_CHANNEL;

/// Default timeout for blocking RPCs to an owning OutputBuffer.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(2);

/// Default time to wait for another thread's payload batch to finish.
pub const DEFAULT_BATCH_TIMEOUT: Duration = Duration::from_millis(100);

/// Configuration for an [`InputBuffer`](crate::InputBuffer) or
/// [`OutputBuffer`](crate::OutputBuffer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferConfig {
    /// Component name, used to build the buffer's unique name.
    pub basename: String,
    /// Namespace above categories.
    pub channel: String,
    /// Categories an InputBuffer subscribes to on creation.
    pub category_interests: Vec<String>,
    /// Whether an InputBuffer requests missed IUs from their owner.
    pub resend: bool,
    /// Timeout for remote writes and resend requests.
    pub rpc_timeout: Duration,
    /// Timeout for entering a payload batch held by another thread.
    pub batch_timeout: Duration,
}

impl BufferConfig {
    /// Defaults for a component named `basename`.
    pub fn new(basename: impl Into<String>) -> Self {
        Self {
            basename: basename.into(),
            ..Self::default()
        }
    }

    pub fn builder(basename: impl Into<String>) -> BufferConfigBuilder {
        BufferConfigBuilder {
            config: Self::new(basename),
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            basename: "iubus".to_string(),
            channel: DEFAULT_CHANNEL.to_string(),
            category_interests: Vec::new(),
            resend: false,
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            batch_timeout: DEFAULT_BATCH_TIMEOUT,
        }
    }
}

/// Fluent construction of a [`BufferConfig`].
#[derive(Debug, Clone)]
pub struct BufferConfigBuilder {
    config: BufferConfig,
}

impl BufferConfigBuilder {
    pub fn channel(mut self, channel: impl Into<String>) -> Self {
        self.config.channel = channel.into();
        self
    }

    pub fn category_interest(mut self, category: impl Into<String>) -> Self {
        self.config.category_interests.push(category.into());
        self
    }

    pub fn category_interests<I, S>(mut self, categories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config
            .category_interests
            .extend(categories.into_iter().map(Into::into));
        self
    }

    pub fn resend(mut self, resend: bool) -> Self {
        self.config.resend = resend;
        self
    }

    pub fn rpc_timeout(mut self, timeout: Duration) -> Self {
        self.config.rpc_timeout = timeout;
        self
    }

    pub fn batch_timeout(mut self, timeout: Duration) -> Self {
        self.config.batch_timeout = timeout;
        self
    }

    pub fn build(self) -> BufferConfig {
        self.config
    }
}
