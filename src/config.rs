//! Client and server configuration.

use std::time::Duration;

/// Default port of the store server.
pub const DEFAULT_PORT: u16 = 44530;

/// Default number of object IDs a client reserves per round trip.
pub const DEFAULT_ALLOCATION_BLOCK_SIZE: u32 = 100;

/// Default upper bound on a client transaction's timeout (10 minutes).
pub const DEFAULT_MAX_TXN_TIMEOUT: Duration = Duration::from_millis(600_000);

/// Default server-side transaction timeout used by the reaper (10 minutes).
pub const DEFAULT_TXN_TIMEOUT: Duration = Duration::from_millis(600_000);

/// Default delay between reaper sweeps.
pub const DEFAULT_REAP_DELAY: Duration = Duration::from_millis(500);

/// Default number of transaction IDs the server reserves per refill.
pub const DEFAULT_TID_BLOCK_SIZE: u64 = 1000;

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("server host must be specified")]
    MissingHost,
    #[error("allocation block size must be between 1 and {max}, got {value}", max = i32::MAX)]
    InvalidAllocationBlockSize { value: u32 },
    #[error("{name} must be greater than zero")]
    ZeroDuration { name: &'static str },
    #[error("transaction ID block size must be greater than zero")]
    ZeroTidBlockSize,
}

/// Client-side settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Server host (required).
    pub host: String,
    pub port: u16,
    /// Object IDs requested from the server each time the local window runs out.
    pub allocation_block_size: u32,
    /// Transactions are treated as timed out once older than the smaller of
    /// their own timeout and this value.
    pub max_txn_timeout: Duration,
}

impl ClientConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            allocation_block_size: DEFAULT_ALLOCATION_BLOCK_SIZE,
            max_txn_timeout: DEFAULT_MAX_TXN_TIMEOUT,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_allocation_block_size(mut self, size: u32) -> Self {
        self.allocation_block_size = size;
        self
    }

    pub fn with_max_txn_timeout(mut self, timeout: Duration) -> Self {
        self.max_txn_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::MissingHost);
        }
        if self.allocation_block_size == 0 || self.allocation_block_size > i32::MAX as u32 {
            return Err(ConfigError::InvalidAllocationBlockSize {
                value: self.allocation_block_size,
            });
        }
        if self.max_txn_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration {
                name: "max transaction timeout",
            });
        }
        Ok(())
    }

    /// `host:port` of the server.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Server-side settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Listening port; 0 picks an ephemeral port.
    pub port: u16,
    /// Idle transactions older than this are aborted by the reaper.
    pub txn_timeout: Duration,
    /// Delay between reaper sweeps, independent of `txn_timeout`.
    pub reap_delay: Duration,
    pub tid_block_size: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            txn_timeout: DEFAULT_TXN_TIMEOUT,
            reap_delay: DEFAULT_REAP_DELAY,
            tid_block_size: DEFAULT_TID_BLOCK_SIZE,
        }
    }
}

impl ServerConfig {
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_txn_timeout(mut self, timeout: Duration) -> Self {
        self.txn_timeout = timeout;
        self
    }

    pub fn with_reap_delay(mut self, delay: Duration) -> Self {
        self.reap_delay = delay;
        self
    }

    pub fn with_tid_block_size(mut self, size: u64) -> Self {
        self.tid_block_size = size;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.txn_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration {
                name: "transaction timeout",
            });
        }
        if self.reap_delay.is_zero() {
            return Err(ConfigError::ZeroDuration { name: "reap delay" });
        }
        if self.tid_block_size == 0 {
            return Err(ConfigError::ZeroTidBlockSize);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_defaults() {
        let config = ClientConfig::new("localhost");
        assert_eq!(config.port, 44530);
        assert_eq!(config.allocation_block_size, 100);
        assert_eq!(config.max_txn_timeout, Duration::from_millis(600_000));
        assert_eq!(config.server_addr(), "localhost:44530");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_client_requires_host() {
        assert_eq!(
            ClientConfig::new(" ").validate(),
            Err(ConfigError::MissingHost)
        );
    }

    #[test]
    fn test_client_rejects_zero_block_size() {
        let config = ClientConfig::new("localhost").with_allocation_block_size(0);
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidAllocationBlockSize { value: 0 })
        );
    }

    #[test]
    fn test_server_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.reap_delay, Duration::from_millis(500));
        assert!(config.validate().is_ok());
        assert!(config.with_reap_delay(Duration::ZERO).validate().is_err());
    }
}
