//! Load config from file and environment.

use mesh_core::Timing;
use serde::Deserialize;
use std::path::PathBuf;

/// Daemon configuration. File: ~/.config/peermesh/config.toml or /etc/peermesh/config.toml.
/// Env overrides: PEERMESH_CONTROL_PORT, PEERMESH_TRANSPORT_PORT, PEERMESH_INTERFACE.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Control socket port on 127.0.0.1 (default 20530).
    #[serde(default = "default_control_port")]
    pub control_port: u16,
    /// Session and descriptor TCP port; 0 picks a free one.
    #[serde(default)]
    pub transport_port: u16,
    /// IPv4 address to announce; empty uses the default route's.
    #[serde(default)]
    pub interface: String,
    /// Files served next to the descriptors.
    #[serde(default)]
    pub content_folder: Option<PathBuf>,
    #[serde(default)]
    pub timing: Timing,
}

fn default_control_port() -> u16 {
    20530
}

impl Default for Config {
    fn default() -> Self {
        Self {
            control_port: default_control_port(),
            transport_port: 0,
            interface: String::new(),
            content_folder: None,
            timing: Timing::default(),
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |k| std::env::var(k).ok());
    c
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(p) = var("PEERMESH_CONTROL_PORT").and_then(|s| s.parse::<u16>().ok()) {
        c.control_port = p;
    }
    if let Some(p) = var("PEERMESH_TRANSPORT_PORT").and_then(|s| s.parse::<u16>().ok()) {
        c.transport_port = p;
    }
    if let Some(i) = var("PEERMESH_INTERFACE") {
        c.interface = i;
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/peermesh/config.toml"));
    }
    out.push(PathBuf::from("/etc/peermesh/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p).map(|s| toml::from_str::<Config>(&s)) {
                Ok(Ok(c)) => return Some(c),
                Ok(Err(e)) => tracing::warn!(path = %p.display(), "ignoring config: {}", e),
                Err(e) => tracing::warn!(path = %p.display(), "cannot read config: {}", e),
            }
            break;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn file_values_and_defaults() {
        let c: Config = toml::from_str(
            "transport_port = 7862\ninterface = \"10.0.0.2\"\n[timing]\nannounce_interval = 60\n",
        )
        .unwrap();
        assert_eq!(c.control_port, 20530);
        assert_eq!(c.transport_port, 7862);
        assert_eq!(c.interface, "10.0.0.2");
        assert_eq!(c.timing.announce_interval, Duration::from_secs(60));
        assert_eq!(c.timing.search_interval, Duration::from_secs(300));
        assert_eq!(c.timing.retry_delay, Duration::from_millis(100));
    }

    #[test]
    fn unknown_keys_rejected() {
        assert!(toml::from_str::<Config>("proxy_port = 1").is_err());
    }

    #[test]
    fn env_overrides() {
        let mut c = Config::default();
        apply_env(&mut c, |k| match k {
            "PEERMESH_CONTROL_PORT" => Some("3000".into()),
            "PEERMESH_TRANSPORT_PORT" => Some("not a port".into()),
            "PEERMESH_INTERFACE" => Some("192.168.0.7".into()),
            _ => None,
        });
        assert_eq!(c.control_port, 3000);
        assert_eq!(c.transport_port, 0);
        assert_eq!(c.interface, "192.168.0.7");
    }
}
