//! Knobs for the HTTP client pool shared by every egress identity.

use anyhow::{bail, Result};
use std::time::Duration;

const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_POOL_IDLE_TIMEOUT_SECS: u64 = 90;
const DEFAULT_POOL_MAX_IDLE_PER_HOST: usize = 8;
const DEFAULT_MAX_REDIRECTS: usize = 10;
const DEFAULT_MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct FetchClientOptions {
    pub connect_timeout: Duration,
    pub pool_idle_timeout: Duration,
    pub pool_max_idle_per_host: usize,
    pub max_redirects: usize,
    /// Larger bodies fail the attempt as a transport error.
    pub max_body_bytes: usize,
}

impl Default for FetchClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            pool_idle_timeout: Duration::from_secs(DEFAULT_POOL_IDLE_TIMEOUT_SECS),
            pool_max_idle_per_host: DEFAULT_POOL_MAX_IDLE_PER_HOST,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

impl FetchClientOptions {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.connect_timeout.is_zero() {
            bail!("connect_timeout must be greater than 0");
        }
        if self.pool_idle_timeout.is_zero() {
            bail!("pool_idle_timeout must be greater than 0");
        }
        if self.max_body_bytes == 0 {
            bail!("max_body_bytes must be greater than 0");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        FetchClientOptions::default().validate().unwrap();
    }

    #[test]
    fn zero_connect_timeout_is_rejected() {
        let options = FetchClientOptions {
            connect_timeout: Duration::ZERO,
            ..FetchClientOptions::default()
        };
        let err = options.validate().unwrap_err();
        assert!(format!("{err}").contains("connect_timeout"));
    }

    #[test]
    fn zero_body_cap_is_rejected() {
        let options = FetchClientOptions {
            max_body_bytes: 0,
            ..FetchClientOptions::default()
        };
        let err = options.validate().unwrap_err();
        assert!(format!("{err}").contains("max_body_bytes"));
    }
}
