//! Relay backend: the physical side of a zone, addressed by output
//! channel. Production talks to a Loxone-style miniserver over HTTP;
//! without one configured the backend is a no-op so the controller
//! still tracks state. Tests swap in a recording mock.

use anyhow::{Context, Result};
use std::time::Duration;

use crate::config::LoxoneConfig;

const RELAY_TIMEOUT: Duration = Duration::from_secs(5);

pub enum RelayBackend {
    Loxone {
        http: reqwest::Client,
        cfg: LoxoneConfig,
    },
    /// No relay configured; commands are logged and dropped.
    Disabled,
    #[cfg(test)]
    Mock(MockRelay),
}

impl RelayBackend {
    pub fn from_config(cfg: Option<LoxoneConfig>) -> Self {
        match cfg {
            Some(cfg) if !cfg.host.is_empty() => {
                let http = reqwest::Client::builder()
                    .timeout(RELAY_TIMEOUT)
                    .build()
                    .unwrap_or_default();
                RelayBackend::Loxone { http, cfg }
            }
            _ => {
                tracing::warn!("no relay backend configured, zone commands are virtual");
                RelayBackend::Disabled
            }
        }
    }

    /// Set an output channel to on/off. Idempotent on the backend
    /// side; errors indicate the command may not have reached it.
    pub async fn set_output(&self, channel: &str, on: bool) -> Result<()> {
        match self {
            RelayBackend::Loxone { http, cfg } => {
                let url = format!(
                    "http://{}/dev/sps/io/{}/{}",
                    cfg.host,
                    channel,
                    if on { 1 } else { 0 }
                );
                http.get(&url)
                    .basic_auth(&cfg.username, Some(&cfg.password))
                    .send()
                    .await
                    .with_context(|| format!("relay unreachable for channel {channel}"))?
                    .error_for_status()
                    .with_context(|| format!("relay rejected command for channel {channel}"))?;
                Ok(())
            }
            RelayBackend::Disabled => {
                tracing::debug!(channel, on, "relay disabled, command dropped");
                Ok(())
            }
            #[cfg(test)]
            RelayBackend::Mock(mock) => mock.set_output(channel, on),
        }
    }
}

// ---------------------------------------------------------------------------
// Test mock
// ---------------------------------------------------------------------------

#[cfg(test)]
pub struct MockRelay {
    pub fail: bool,
    pub calls: std::sync::Mutex<Vec<(String, bool)>>,
}

#[cfg(test)]
impl MockRelay {
    pub fn new() -> Self {
        Self {
            fail: false,
            calls: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            calls: std::sync::Mutex::new(Vec::new()),
        }
    }

    fn set_output(&self, channel: &str, on: bool) -> Result<()> {
        self.calls.lock().unwrap().push((channel.to_string(), on));
        if self.fail {
            anyhow::bail!("mock relay failure");
        }
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
