//! Runtime settings of the network core.

use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_true() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetConfig {
    /// Expose container networks on the host through bridges.
    #[serde(default = "default_true")]
    pub network_bridge: bool,

    #[serde(default = "default_timeout_secs")]
    pub tcp_connect_timeout_secs: u64,

    #[serde(default = "default_timeout_secs")]
    pub udp_idle_timeout_secs: u64,

    #[serde(default = "default_true")]
    pub icmp_enabled: bool,

    /// Upstream proxy for guest TCP, `http://` or `socks5://`. Unset connects directly.
    #[serde(default)]
    pub tcp_proxy: Option<String>,

    #[serde(default)]
    pub tcp_proxy_bypass: Vec<String>,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            network_bridge: true,
            tcp_connect_timeout_secs: default_timeout_secs(),
            udp_idle_timeout_secs: default_timeout_secs(),
            icmp_enabled: true,
            tcp_proxy: None,
            tcp_proxy_bypass: Vec::new(),
        }
    }
}

impl NetConfig {
    /// Defaults overlaid with `ROSS_NET_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().overlay(|k| std::env::var(k).ok())
    }

    fn overlay(mut self, get: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(v) = get("ROSS_NET_BRIDGE") {
            match v.as_str() {
                "0" | "false" | "off" => self.network_bridge = false,
                "1" | "true" | "on" => self.network_bridge = true,
                _ => tracing::warn!(value = %v, "ignoring invalid ROSS_NET_BRIDGE"),
            }
        }
        if let Some(n) = get("ROSS_NET_TCP_CONNECT_TIMEOUT").and_then(|v| v.parse::<u64>().ok()) {
            self.tcp_connect_timeout_secs = n.max(1);
        }
        if let Some(n) = get("ROSS_NET_UDP_IDLE_TIMEOUT").and_then(|v| v.parse::<u64>().ok()) {
            self.udp_idle_timeout_secs = n.max(1);
        }
        if let Some(v) = get("ROSS_NET_PROXY") {
            self.tcp_proxy = (!v.trim().is_empty()).then(|| v.trim().to_string());
        }
        if let Some(v) = get("ROSS_NET_NO_PROXY") {
            self.tcp_proxy_bypass = v
                .split(',')
                .map(str::trim)
                .filter(|e| !e.is_empty())
                .map(String::from)
                .collect();
        }
        self
    }

    pub fn tcp_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.tcp_connect_timeout_secs)
    }

    pub fn udp_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.udp_idle_timeout_secs)
    }
}

/// One change of the live config feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigDiff {
    pub old: NetConfig,
    pub new: NetConfig,
}

impl ConfigDiff {
    pub fn bridge_toggled(&self) -> Option<bool> {
        (self.old.network_bridge != self.new.network_bridge).then_some(self.new.network_bridge)
    }

    pub fn proxy_changed(&self) -> bool {
        self.old.tcp_proxy != self.new.tcp_proxy || self.old.tcp_proxy_bypass != self.new.tcp_proxy_bypass
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_from_empty_json() {
        let c: NetConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(c, NetConfig::default());
        assert_eq!(c.tcp_connect_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_env_overlay() {
        let env: HashMap<&str, &str> = [
            ("ROSS_NET_BRIDGE", "0"),
            ("ROSS_NET_TCP_CONNECT_TIMEOUT", "5"),
            ("ROSS_NET_UDP_IDLE_TIMEOUT", "junk"),
        ]
        .into_iter()
        .collect();
        let c = NetConfig::default().overlay(|k| env.get(k).map(|v| v.to_string()));
        assert!(!c.network_bridge);
        assert_eq!(c.tcp_connect_timeout_secs, 5);
        assert_eq!(c.udp_idle_timeout_secs, 30);
    }

    #[test]
    fn test_bridge_toggle_diff() {
        let old = NetConfig::default();
        let new = NetConfig {
            network_bridge: false,
            ..old.clone()
        };
        assert_eq!(ConfigDiff { old: old.clone(), new }.bridge_toggled(), Some(false));
        assert_eq!(ConfigDiff { old: old.clone(), new: old }.bridge_toggled(), None);
    }

    #[test]
    fn test_proxy_from_env_and_diff() {
        let env: HashMap<&str, &str> = [
            ("ROSS_NET_PROXY", " socks5://10.0.0.1:1080 "),
            ("ROSS_NET_NO_PROXY", "10.0.0.0/8, ,192.168.1.5"),
        ]
        .into_iter()
        .collect();
        let old = NetConfig::default();
        let new = old.clone().overlay(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(new.tcp_proxy.as_deref(), Some("socks5://10.0.0.1:1080"));
        assert_eq!(new.tcp_proxy_bypass, vec!["10.0.0.0/8", "192.168.1.5"]);

        let diff = ConfigDiff { old: old.clone(), new };
        assert!(diff.proxy_changed());
        assert_eq!(diff.bridge_toggled(), None);
        assert!(!ConfigDiff { old: old.clone(), new: old }.proxy_changed());
    }
}
