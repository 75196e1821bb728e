//! HTTP surface configuration.

use std::time::Duration;

/// Limits applied to every request reaching the operations router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpConfig {
    /// Maximum time a single request may take before a 408 is returned.
    pub request_timeout: Duration,
    /// Largest accepted request body, in bytes.
    pub max_body_bytes: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            max_body_bytes: 2 * 1024 * 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_config_defaults() {
        let config = HttpConfig::default();
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.max_body_bytes, 2 * 1024 * 1024);
    }
}
