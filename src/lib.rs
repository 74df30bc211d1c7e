//! Cloud browser session launcher with managed local tunnel
//!
//! This library wires automated test suites to a cloud browser grid:
//! - Layered configuration: application config file, programmatic overrides,
//!   environment fallback
//! - A managed local tunnel process, shared across a suite run and stopped
//!   when the suite's guard goes out of scope
//! - Detection of an externally managed tunnel via a one-shot port probe
//! - Remote WebDriver session construction with merged capabilities

pub mod config;
pub mod session;
pub mod tunnel;

pub use config::{ConfigError, ConfigKey, EnvProvider, ProcessEnv, SessionConfig, ACCESS_KEY_ENV};
pub use session::{
    Launcher, SessionBackend, SessionError, WebDriverBackend, DEFAULT_APP_CONFIG, HUB_HOST,
};
pub use tunnel::{
    TunnelError, TunnelGuard, TunnelHandle, TunnelProcess, DEFAULT_BINARY, TUNNEL_PORT,
};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize logging
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cloudgrid=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_exports() {
        // Verify all public exports are accessible
        let _config = SessionConfig::default();
        let _handle = TunnelHandle::new();
        let _backend = WebDriverBackend;
    }
}
