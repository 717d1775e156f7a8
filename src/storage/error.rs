use thiserror::Error;

/// Errors that can occur when talking to the shared state store.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Failed to reach the store at all.
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// The store rejected or failed a command.
    #[error("Store command failed: {0}")]
    CommandError(String),

    /// A stored value could not be serialized or deserialized.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// A numeric value (such as the depth counter) held something unparseable.
    #[error("Key '{key}' holds a non-integer value: {value}")]
    NotAnInteger {
        /// The key whose value could not be parsed.
        key: String,
        /// The raw value found.
        value: String,
    },

    /// Invalid or unsupported configuration.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// A conditional update kept losing to concurrent writers.
    #[error("Key '{0}' kept changing during a conditional update")]
    Contended(String),
}

impl StoreError {
    /// Returns a helpful suggestion for resolving this error.
    #[must_use]
    pub const fn suggestion(&self) -> &'static str {
        match self {
            Self::ConnectionError(_) => {
                "Check that REDIS_URL points at a running Redis instance and that it is \
                 reachable from this host. For local development: docker run -p 6379:6379 redis:7. \
                 Verify connectivity with: redis-cli -u <your-url> ping"
            }
            Self::CommandError(_) => {
                "Redis rejected a command. gpulane needs Redis 6.0 or newer (SET ... KEEPTTL, \
                 float BLPOP timeouts) with Lua scripting enabled."
            }
            Self::SerializationError(_) => {
                "A stored value could not be decoded. This usually means another program wrote \
                 to a gpulane key, or records were written by an incompatible version. \
                 Consider setting a dedicated namespace."
            }
            Self::NotAnInteger { .. } => {
                "The queue depth counter was overwritten with a non-numeric value. \
                 Run `gpulane stats --reconcile` to reset it from the live task records."
            }
            Self::ConfigurationError(_) => {
                "Check your configuration settings: the Redis URL must be a valid \
                 redis:// or rediss:// URL."
            }
            Self::Contended(_) => {
                "Other processes were updating the same key at the same time. \
                 Retry the command; it is safe to repeat."
            }
        }
    }

    /// Returns a richly formatted error message with context and suggestions.
    #[must_use]
    pub fn display_rich(&self) -> String {
        format!("Error: {}\n\nSuggestion:\n  {}", self, self.suggestion())
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_refusal() || err.is_connection_dropped() || err.is_timeout() {
            Self::ConnectionError(err.to_string())
        } else if err.kind() == redis::ErrorKind::InvalidClientConfig {
            Self::ConfigurationError(err.to_string())
        } else {
            Self::CommandError(err.to_string())
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}
