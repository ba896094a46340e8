//! Multiplexer settings

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::pane::DEFAULT_SPLIT_RATIO;
use crate::session::{ReconnectConfig, TerminalSize};
use crate::ssh::{JumpHost, ProfileChainResolver};

/// Current settings file version
pub const SETTINGS_VERSION: u32 = 1;

/// Connection establishment settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectSettings {
    /// Per-hop handshake timeout
    pub timeout_secs: u64,
    pub keepalive_interval_secs: u64,
    /// Missed keepalives before the transport gives up
    pub keepalive_max: usize,
    /// How long a host-key or KBI prompt waits for the user
    pub prompt_timeout_secs: u64,
    /// Initial PTY size for new sessions
    pub terminal: TerminalSize,
}

impl Default for ConnectSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            keepalive_interval_secs: 30,
            keepalive_max: 3,
            prompt_timeout_secs: 60,
            terminal: TerminalSize::default(),
        }
    }
}

impl ConnectSettings {
    pub fn prompt_timeout(&self) -> Duration {
        Duration::from_secs(self.prompt_timeout_secs)
    }
}

/// Pane layout settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LayoutSettings {
    pub default_split_ratio: f64,
    /// Bounds for interactive divider drags
    pub min_ratio: f64,
    pub max_ratio: f64,
}

impl Default for LayoutSettings {
    fn default() -> Self {
        Self {
            default_split_ratio: DEFAULT_SPLIT_RATIO,
            min_ratio: 0.1,
            max_ratio: 0.9,
        }
    }
}

impl LayoutSettings {
    /// Bounds satisfy 0 < min <= max < 1 and the default ratio lies in (0, 1)
    pub fn is_valid(&self) -> bool {
        self.min_ratio > 0.0
            && self.min_ratio <= self.max_ratio
            && self.max_ratio < 1.0
            && self.default_split_ratio > 0.0
            && self.default_split_ratio < 1.0
    }

    /// Clamp a divider position; invalid bounds fall back to the defaults
    pub fn clamp_ratio(&self, ratio: f64) -> f64 {
        let fallback;
        let bounds = if self.is_valid() {
            self
        } else {
            fallback = Self::default();
            &fallback
        };
        if ratio.is_nan() {
            return bounds.default_split_ratio;
        }
        ratio.clamp(bounds.min_ratio, bounds.max_ratio)
    }
}

/// Root of `settings.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MuxSettings {
    pub version: u32,
    pub reconnect: ReconnectConfig,
    pub connect: ConnectSettings,
    pub layout: LayoutSettings,
    /// Named jump-host chains, without secrets
    pub proxy_jump_profiles: HashMap<String, Vec<JumpHost>>,
}

impl Default for MuxSettings {
    fn default() -> Self {
        Self {
            version: SETTINGS_VERSION,
            reconnect: ReconnectConfig::default(),
            connect: ConnectSettings::default(),
            layout: LayoutSettings::default(),
            proxy_jump_profiles: HashMap::new(),
        }
    }
}

impl MuxSettings {
    /// Chain resolver over the configured proxy-jump profiles
    pub fn chain_resolver(&self) -> ProfileChainResolver {
        ProfileChainResolver::new(self.proxy_jump_profiles.clone())
    }

    /// Replace out-of-range values read from disk with their defaults
    pub fn sanitized(mut self) -> Self {
        if !self.layout.is_valid() {
            warn!(
                "Invalid layout settings (minRatio {}, maxRatio {}, defaultSplitRatio {}), using defaults",
                self.layout.min_ratio, self.layout.max_ratio, self.layout.default_split_ratio
            );
            self.layout = LayoutSettings::default();
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = MuxSettings::default();
        assert_eq!(settings.version, SETTINGS_VERSION);
        assert_eq!(settings.reconnect.max_attempts, 3);
        assert_eq!(settings.reconnect.delay_ms, 2000);
        assert_eq!(settings.connect.terminal, TerminalSize::new(80, 24));
        assert_eq!(settings.connect.prompt_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let settings: MuxSettings = serde_json::from_str(
            r#"{
                "reconnect": { "maxAttempts": 5 },
                "proxyJumpProfiles": {
                    "dmz": [{ "host_id": "bastion", "hostname": "bastion.example.com", "username": "ops" }]
                }
            }"#,
        )
        .unwrap();
        assert_eq!(settings.reconnect.max_attempts, 5);
        assert_eq!(settings.reconnect.delay_ms, 2000);
        assert!(settings.reconnect.enabled);
        assert_eq!(settings.connect.timeout_secs, 30);
        assert_eq!(settings.proxy_jump_profiles["dmz"][0].port, 22);
    }

    #[test]
    fn test_clamp_ratio() {
        let layout = LayoutSettings::default();
        assert_eq!(layout.clamp_ratio(0.05), 0.1);
        assert_eq!(layout.clamp_ratio(0.95), 0.9);
        assert_eq!(layout.clamp_ratio(0.4), 0.4);
        assert_eq!(layout.clamp_ratio(f64::NAN), 0.5);
    }

    #[test]
    fn test_inverted_bounds_do_not_panic() {
        let layout: LayoutSettings =
            serde_json::from_str(r#"{"minRatio":0.9,"maxRatio":0.1}"#).unwrap();
        assert!(!layout.is_valid());
        assert_eq!(layout.clamp_ratio(0.5), 0.5);
        assert_eq!(layout.clamp_ratio(0.99), 0.9);

        let nan_bound = LayoutSettings {
            min_ratio: f64::NAN,
            ..LayoutSettings::default()
        };
        assert_eq!(nan_bound.clamp_ratio(0.02), 0.1);
    }

    #[test]
    fn test_sanitized_resets_invalid_layout() {
        let mut settings = MuxSettings::default();
        settings.layout.min_ratio = 0.0;
        settings.reconnect.max_attempts = 9;

        let settings = settings.sanitized();
        assert_eq!(settings.layout, LayoutSettings::default());
        assert_eq!(settings.reconnect.max_attempts, 9);
    }
}
