use std::time::Duration;

/// Errors raised by the cache primitive layer.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The call did not finish within the configured operation timeout.
    #[error("cache operation '{op}' timed out after {elapsed:?}")]
    Timeout { op: &'static str, elapsed: Duration },

    /// No connection could be obtained.
    #[error("cache connection error: {0}")]
    Connection(String),

    /// The server rejected or failed the command.
    #[error("cache command error: {0}")]
    Command(String),

    /// A script returned a status code outside its contract.
    #[error("unexpected script status {status} from {script}")]
    UnexpectedStatus { script: &'static str, status: i64 },
}

impl CacheError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_dropped() || err.is_connection_refusal() || err.is_io_error() {
            Self::Connection(err.to_string())
        } else {
            Self::Command(err.to_string())
        }
    }
}

impl From<deadpool_redis::PoolError> for CacheError {
    fn from(err: deadpool_redis::PoolError) -> Self {
        Self::Connection(format!("failed to get Redis connection: {err}"))
    }
}
