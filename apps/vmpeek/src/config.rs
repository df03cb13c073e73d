use crate::session::SessionConfig;
use std::env;
use std::time::Duration;

pub const DEFAULT_QMP_ADDR: &str = "127.0.0.1:55555";

/// vmpeek configuration, resolved from the environment before CLI overrides apply.
#[derive(Debug, Clone)]
pub struct Config {
    /// QMP control socket address (defaults to 127.0.0.1:55555)
    pub qmp_addr: String,
    pub connect_timeout: Duration,
    pub monitor_timeout: Duration,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = SessionConfig::default();
        let addr = env::var("VMPEEK_QMP_ADDR").unwrap_or_else(|_| DEFAULT_QMP_ADDR.to_string());
        Self {
            qmp_addr: normalize_addr(&addr),
            connect_timeout: millis_from_env("VMPEEK_CONNECT_TIMEOUT_MS")
                .unwrap_or(defaults.connect_timeout),
            monitor_timeout: millis_from_env("VMPEEK_MONITOR_TIMEOUT_MS")
                .unwrap_or(defaults.monitor_timeout),
        }
    }

    pub fn with_addr(mut self, addr: &str) -> Self {
        self.qmp_addr = normalize_addr(addr);
        self
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig::default()
            .with_connect_timeout(self.connect_timeout)
            .with_monitor_timeout(self.monitor_timeout)
    }
}

impl Default for Config {
    fn default() -> Self {
        let defaults = SessionConfig::default();
        Self {
            qmp_addr: DEFAULT_QMP_ADDR.to_string(),
            connect_timeout: defaults.connect_timeout,
            monitor_timeout: defaults.monitor_timeout,
        }
    }
}

// Normalize localhost to IPv4; QEMU usually listens on 127.0.0.1 only.
pub fn normalize_addr(addr: &str) -> String {
    let addr = addr.trim();
    if addr.starts_with("localhost:") {
        addr.replacen("localhost", "127.0.0.1", 1)
    } else {
        addr.to_string()
    }
}

fn millis_from_env(var: &str) -> Option<Duration> {
    env::var(var)
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
}
