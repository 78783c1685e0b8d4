//! Engine-wide tunables. Small and typed, in the style of the pack's own small config
//! structs (e.g. `vizier-core::config`), sized to what this crate actually needs rather
//! than a general-purpose configuration file format — spec.md fixes no on-disk format.
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Upper bound on any caller-supplied watch timeout.
    pub max_watch_timeout: Duration,
    /// Timeout used when a caller does not specify one.
    pub default_watch_timeout: Duration,
    /// Total budget for graceful shutdown before outstanding watches are force-resolved.
    pub shutdown_grace: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            max_watch_timeout: Duration::from_secs(60),
            default_watch_timeout: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl EngineConfig {
    /// Clamps a caller-requested timeout to `(0, max_watch_timeout]`, falling back to
    /// `default_watch_timeout` when `requested` is `None`.
    pub fn clamp_watch_timeout(&self, requested: Option<Duration>) -> Duration {
        let wanted = requested.unwrap_or(self.default_watch_timeout);
        wanted.min(self.max_watch_timeout)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn clamps_to_max() {
        let cfg = EngineConfig::default();
        let clamped = cfg.clamp_watch_timeout(Some(Duration::from_secs(1000)));
        assert_eq!(clamped, cfg.max_watch_timeout);
    }

    #[test]
    fn missing_timeout_uses_default() {
        let cfg = EngineConfig::default();
        let clamped = cfg.clamp_watch_timeout(None);
        assert_eq!(clamped, cfg.default_watch_timeout);
    }
}
