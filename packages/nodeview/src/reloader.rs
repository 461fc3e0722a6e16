//! Live reload protocol.
//!
//! The server pushes `"reload"` over a WebSocket whenever a build finishes.
//! The viewer then fetches the build status: a clean build, or an error it has
//! already shown once, means the tree should be reloaded; a new error freezes
//! the current tree and goes on the banner.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::diagnostics::ErrorSink;

/// Text of the push message that announces a finished build.
pub const RELOAD_MESSAGE: &str = "reload";

/// Outcome of the last build, as served by the build-status endpoint.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BuildStatus {
    /// Empty when the build succeeded.
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub tstamp: f64,
}

impl BuildStatus {
    pub fn is_clean(&self) -> bool {
        self.error.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadDecision {
    Reload,
    /// Keep the current tree; the error is on the banner.
    Freeze,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconnect {
    Retry(Duration),
    GiveUp,
    /// The host stopped watching; stay disconnected.
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Consecutive failed connections before giving up.
    pub max_retries: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 250,
            max_delay_ms: 10_000,
            max_retries: 20,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms))
    }
}

#[derive(Debug, Clone, Default)]
pub struct Reloader {
    policy: ReconnectPolicy,
    /// Timestamp of the last build error shown.
    error_tstamp: Option<f64>,
    failures: u32,
    stopped: bool,
}

impl Reloader {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            error_tstamp: None,
            failures: 0,
            stopped: false,
        }
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// True when `text` asks for a build-status check.
    pub fn on_message(&self, text: &str) -> bool {
        text == RELOAD_MESSAGE
    }

    pub fn reconcile(&mut self, status: &BuildStatus, errors: &mut dyn ErrorSink) -> ReloadDecision {
        if status.is_clean() || self.error_tstamp == Some(status.tstamp) {
            errors.clear_error();
            log::info!("Build is current, reloading");
            ReloadDecision::Reload
        } else {
            self.error_tstamp = Some(status.tstamp);
            errors.set_error(&status.error);
            ReloadDecision::Freeze
        }
    }

    /// Stop watching. Pending reconnects must check [`Reloader::is_watching`].
    pub fn stop(&mut self) {
        self.stopped = true;
    }

    /// Watch again, with a fresh retry budget.
    pub fn resume(&mut self) {
        self.stopped = false;
        self.failures = 0;
    }

    pub fn is_watching(&self) -> bool {
        !self.stopped
    }

    /// The channel connected.
    pub fn on_open(&mut self) {
        if self.failures > 0 {
            log::info!("Reload channel reconnected after {} attempts", self.failures);
        }
        self.failures = 0;
    }

    /// The channel closed or failed to connect.
    pub fn on_close(&mut self) -> Reconnect {
        if self.stopped {
            return Reconnect::Stopped;
        }
        if self.failures >= self.policy.max_retries {
            log::warn!("Reload channel gave up after {} attempts", self.failures);
            return Reconnect::GiveUp;
        }
        let delay = self.policy.delay(self.failures);
        self.failures += 1;
        log::debug!("Reload channel closed, retrying in {:?}", delay);
        Reconnect::Retry(delay)
    }
}

/// The push channel URL for a page served from `page_url`.
///
/// `http` becomes `ws` and `https` becomes `wss`; host and port are kept.
pub fn channel_url(page_url: &str, channel_path: &str) -> Result<String, url::ParseError> {
    let mut url = Url::parse(page_url)?;
    let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
    // Switching between special schemes always succeeds.
    let _ = url.set_scheme(scheme);
    url.set_query(None);
    url.set_fragment(None);
    Ok(url.join(channel_path)?.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::ErrorLog;

    fn status(error: &str, tstamp: f64) -> BuildStatus {
        BuildStatus {
            error: error.to_string(),
            tstamp,
        }
    }

    #[test]
    fn test_reload_message() {
        let reloader = Reloader::default();
        assert!(reloader.on_message("reload"));
        assert!(!reloader.on_message("ping"));
        assert!(!reloader.on_message("reload "));
    }

    #[test]
    fn test_clean_build_reloads() {
        let mut reloader = Reloader::default();
        let mut errors = ErrorLog::new();
        errors.set_error("stale");
        assert_eq!(reloader.reconcile(&status("", 5.0), &mut errors), ReloadDecision::Reload);
        assert_eq!(errors.current(), None);
    }

    #[test]
    fn test_error_shown_once_then_reloads() {
        let mut reloader = Reloader::default();
        let mut errors = ErrorLog::new();

        assert_eq!(reloader.reconcile(&status("syntax error", 7.0), &mut errors), ReloadDecision::Freeze);
        assert_eq!(errors.current(), Some("syntax error"));

        // Same build reported again: clear and reload.
        assert_eq!(reloader.reconcile(&status("syntax error", 7.0), &mut errors), ReloadDecision::Reload);
        assert_eq!(errors.current(), None);

        assert_eq!(reloader.reconcile(&status("other", 8.0), &mut errors), ReloadDecision::Freeze);
        assert_eq!(errors.current(), Some("other"));
    }

    #[test]
    fn test_backoff_caps_and_gives_up() {
        let mut reloader = Reloader::new(ReconnectPolicy {
            base_delay_ms: 100,
            max_delay_ms: 1000,
            max_retries: 6,
        });
        let delays: Vec<_> = (0..6).map(|_| reloader.on_close()).collect();
        assert_eq!(
            delays,
            [100, 200, 400, 800, 1000, 1000]
                .map(|ms| Reconnect::Retry(Duration::from_millis(ms)))
                .to_vec()
        );
        assert_eq!(reloader.on_close(), Reconnect::GiveUp);

        reloader.on_open();
        assert_eq!(reloader.on_close(), Reconnect::Retry(Duration::from_millis(100)));
    }

    #[test]
    fn test_stopped_channel_stays_closed() {
        let mut reloader = Reloader::new(ReconnectPolicy::default());
        assert_eq!(reloader.on_close(), Reconnect::Retry(Duration::from_millis(250)));
        reloader.stop();
        assert!(!reloader.is_watching());
        assert_eq!(reloader.on_close(), Reconnect::Stopped);

        reloader.resume();
        assert!(reloader.is_watching());
        assert_eq!(reloader.on_close(), Reconnect::Retry(Duration::from_millis(250)));
    }

    #[test]
    fn test_large_attempts_do_not_overflow() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay(200), Duration::from_millis(policy.max_delay_ms));
    }

    #[test]
    fn test_channel_url() {
        assert_eq!(
            channel_url("http://localhost:8000/view?x=1#top", "/ws/reload").unwrap(),
            "ws://localhost:8000/ws/reload"
        );
        assert_eq!(
            channel_url("https://example.com/a/b", "/ws/reload").unwrap(),
            "wss://example.com/ws/reload"
        );
        assert!(channel_url("not a url", "/ws/reload").is_err());
    }

    #[test]
    fn test_status_wire_format() {
        let parsed: BuildStatus = serde_json::from_str(r#"{"error": "boom", "tstamp": 1700000000.5}"#).unwrap();
        assert_eq!(parsed, status("boom", 1700000000.5));
        let clean: BuildStatus = serde_json::from_str("{}").unwrap();
        assert!(clean.is_clean());
    }
}
