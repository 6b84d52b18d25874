//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml
//!
//! A missing or malformed config file is fatal; there is no silent fallback
//! to defaults outside of tests.

use crate::domain::types::FrameBounds;
use anyhow::{bail, Context};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use tracing::warn;

/// How nested zones share containment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HierarchyPolicy {
    /// Every zone is evaluated on its own polygon only
    #[default]
    Independent,
    /// A point inside a child zone also counts as inside all of its ancestors
    Propagate,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngressConfig {
    /// Topic carrying one detection frame per message
    #[serde(default = "default_ingress_topic")]
    pub topic: String,
    #[serde(default = "default_ingress_queue_size")]
    pub queue_size: usize,
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self { topic: default_ingress_topic(), queue_size: default_ingress_queue_size() }
    }
}

fn default_ingress_topic() -> String {
    "detections/frames".to_string()
}

fn default_ingress_queue_size() -> usize {
    256
}

#[derive(Debug, Clone, Deserialize)]
pub struct EgressConfig {
    /// Topic for zone events (QoS 1)
    #[serde(default = "default_egress_topic")]
    pub topic: String,
    /// Bounded publisher queue capacity
    #[serde(default = "default_egress_queue_size")]
    pub queue_size: usize,
    /// Queue fill percentage that triggers a high-water warning
    #[serde(default = "default_high_water_pct")]
    pub high_water_pct: u8,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    /// Upper bound on draining the queue at shutdown
    #[serde(default = "default_shutdown_drain_ms")]
    pub shutdown_drain_ms: u64,
    /// Optional JSONL file receiving events that could not be delivered
    #[serde(default)]
    pub diagnostics_file: Option<String>,
}

impl Default for EgressConfig {
    fn default() -> Self {
        Self {
            topic: default_egress_topic(),
            queue_size: default_egress_queue_size(),
            high_water_pct: default_high_water_pct(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            shutdown_drain_ms: default_shutdown_drain_ms(),
            diagnostics_file: None,
        }
    }
}

fn default_egress_topic() -> String {
    "zonewatch/events".to_string()
}

fn default_egress_queue_size() -> usize {
    1024
}

fn default_high_water_pct() -> u8 {
    80
}

fn default_reconnect_delay_ms() -> u64 {
    1000
}

fn default_shutdown_drain_ms() -> u64 {
    2000
}

#[derive(Debug, Clone, Deserialize)]
pub struct ZonesConfig {
    /// Path to the zone definition JSON
    pub file: String,
    #[serde(default = "default_frame_width")]
    pub frame_width: f64,
    #[serde(default = "default_frame_height")]
    pub frame_height: f64,
    #[serde(default)]
    pub hierarchy_policy: HierarchyPolicy,
}

fn default_frame_width() -> f64 {
    1280.0
}

fn default_frame_height() -> f64 {
    720.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct MembershipConfig {
    /// Grace period before a missing track is confirmed outside
    #[serde(default = "default_tolerance_ms")]
    pub tolerance_ms: u64,
    /// Default dwell threshold; 0 disables dwell unless a zone sets its own
    #[serde(default)]
    pub dwell_threshold_ms: u64,
    /// Absence after which a track is considered gone (defaults to tolerance_ms)
    #[serde(default)]
    pub track_lost_ms: Option<u64>,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self { tolerance_ms: default_tolerance_ms(), dwell_threshold_ms: 0, track_lost_ms: None }
    }
}

fn default_tolerance_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub interval_secs: u64,
    /// Prometheus metrics HTTP port (0 to disable)
    #[serde(default)]
    pub prometheus_port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: 10, prometheus_port: 0 }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SiteConfig {
    /// Site identifier stamped on every published event
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TomlConfig {
    #[serde(default)]
    pub site: SiteConfig,
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub ingress: IngressConfig,
    #[serde(default)]
    pub egress: EgressConfig,
    pub zones: ZonesConfig,
    #[serde(default)]
    pub membership: MembershipConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    site_id: Option<String>,
    mqtt_host: String,
    mqtt_port: u16,
    mqtt_username: Option<String>,
    mqtt_password: Option<String>,
    ingress_topic: String,
    ingress_queue_size: usize,
    egress_topic: String,
    egress_queue_size: usize,
    high_water_pct: u8,
    reconnect_delay_ms: u64,
    shutdown_drain_ms: u64,
    diagnostics_file: Option<String>,
    zones_file: String,
    frame_bounds: FrameBounds,
    hierarchy_policy: HierarchyPolicy,
    tolerance_ms: u64,
    dwell_threshold_ms: u64,
    track_lost_ms: u64,
    metrics_interval_secs: u64,
    prometheus_port: u16,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            site_id: None,
            mqtt_host: "localhost".to_string(),
            mqtt_port: 1883,
            mqtt_username: None,
            mqtt_password: None,
            ingress_topic: default_ingress_topic(),
            ingress_queue_size: default_ingress_queue_size(),
            egress_topic: default_egress_topic(),
            egress_queue_size: default_egress_queue_size(),
            high_water_pct: default_high_water_pct(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            shutdown_drain_ms: default_shutdown_drain_ms(),
            diagnostics_file: None,
            zones_file: "config/zones.json".to_string(),
            frame_bounds: FrameBounds::default(),
            hierarchy_policy: HierarchyPolicy::Independent,
            tolerance_ms: default_tolerance_ms(),
            dwell_threshold_ms: 0,
            track_lost_ms: default_tolerance_ms(),
            metrics_interval_secs: 10,
            prometheus_port: 0,
            config_file: "default".to_string(),
        }
    }
}

impl Config {
    /// Determine config file path: explicit argument, then environment, then default
    pub fn resolve_config_path(explicit: Option<&str>) -> String {
        if let Some(path) = explicit {
            return path.to_string();
        }

        if let Ok(path) = env::var("CONFIG_FILE") {
            return path;
        }

        "config/dev.toml".to_string()
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        let config = Self::from_toml(toml_config, path.display().to_string());
        config.validate().with_context(|| format!("Invalid config file {}", path.display()))?;
        Ok(config)
    }

    fn from_toml(toml_config: TomlConfig, config_file: String) -> Self {
        let membership = toml_config.membership;
        Self {
            site_id: toml_config.site.id,
            mqtt_host: toml_config.mqtt.host,
            mqtt_port: toml_config.mqtt.port,
            mqtt_username: toml_config.mqtt.username,
            mqtt_password: toml_config.mqtt.password,
            ingress_topic: toml_config.ingress.topic,
            ingress_queue_size: toml_config.ingress.queue_size,
            egress_topic: toml_config.egress.topic,
            egress_queue_size: toml_config.egress.queue_size,
            high_water_pct: toml_config.egress.high_water_pct,
            reconnect_delay_ms: toml_config.egress.reconnect_delay_ms,
            shutdown_drain_ms: toml_config.egress.shutdown_drain_ms,
            diagnostics_file: toml_config.egress.diagnostics_file,
            zones_file: toml_config.zones.file,
            frame_bounds: FrameBounds::new(
                toml_config.zones.frame_width,
                toml_config.zones.frame_height,
            ),
            hierarchy_policy: toml_config.zones.hierarchy_policy,
            tolerance_ms: membership.tolerance_ms,
            dwell_threshold_ms: membership.dwell_threshold_ms,
            track_lost_ms: membership.track_lost_ms.unwrap_or(membership.tolerance_ms),
            metrics_interval_secs: toml_config.metrics.interval_secs,
            prometheus_port: toml_config.metrics.prometheus_port,
            config_file,
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.ingress_queue_size == 0 || self.egress_queue_size == 0 {
            bail!("queue sizes must be greater than zero");
        }
        if self.high_water_pct == 0 || self.high_water_pct > 100 {
            bail!("egress.high_water_pct must be in 1..=100, got {}", self.high_water_pct);
        }
        let FrameBounds { width, height } = self.frame_bounds;
        if !(width.is_finite() && height.is_finite() && width > 0.0 && height > 0.0) {
            bail!("zones.frame_width/frame_height must be positive, got {width}x{height}");
        }
        if self.metrics_interval_secs == 0 {
            bail!("metrics.interval_secs must be greater than zero");
        }
        // Zero would expire every track in the frame it is seen
        if self.track_lost_ms == 0 {
            bail!("membership.track_lost_ms must be greater than zero");
        }
        if self.track_lost_ms < self.tolerance_ms {
            warn!(
                track_lost_ms = %self.track_lost_ms,
                tolerance_ms = %self.tolerance_ms,
                "track_lost_ms below tolerance_ms: absent tracks exit before the tolerance window"
            );
        }
        Ok(())
    }

    // Getters for all config fields
    pub fn site_id(&self) -> Option<&str> {
        self.site_id.as_deref()
    }

    pub fn mqtt_host(&self) -> &str {
        &self.mqtt_host
    }

    pub fn mqtt_port(&self) -> u16 {
        self.mqtt_port
    }

    pub fn mqtt_username(&self) -> Option<&str> {
        self.mqtt_username.as_deref()
    }

    pub fn mqtt_password(&self) -> Option<&str> {
        self.mqtt_password.as_deref()
    }

    pub fn ingress_topic(&self) -> &str {
        &self.ingress_topic
    }

    pub fn ingress_queue_size(&self) -> usize {
        self.ingress_queue_size
    }

    pub fn egress_topic(&self) -> &str {
        &self.egress_topic
    }

    pub fn egress_queue_size(&self) -> usize {
        self.egress_queue_size
    }

    /// Queue depth at which the high-water warning fires (at least 1)
    pub fn egress_high_water(&self) -> usize {
        (self.egress_queue_size * self.high_water_pct as usize / 100).max(1)
    }

    pub fn reconnect_delay_ms(&self) -> u64 {
        self.reconnect_delay_ms
    }

    pub fn shutdown_drain_ms(&self) -> u64 {
        self.shutdown_drain_ms
    }

    pub fn diagnostics_file(&self) -> Option<&str> {
        self.diagnostics_file.as_deref()
    }

    pub fn zones_file(&self) -> &str {
        &self.zones_file
    }

    pub fn frame_bounds(&self) -> FrameBounds {
        self.frame_bounds
    }

    pub fn hierarchy_policy(&self) -> HierarchyPolicy {
        self.hierarchy_policy
    }

    pub fn tolerance_ms(&self) -> u64 {
        self.tolerance_ms
    }

    pub fn dwell_threshold_ms(&self) -> u64 {
        self.dwell_threshold_ms
    }

    pub fn track_lost_ms(&self) -> u64 {
        self.track_lost_ms
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn prometheus_port(&self) -> u16 {
        self.prometheus_port
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Builder method for tests to set the tolerance window
    #[cfg(test)]
    pub fn with_tolerance_ms(mut self, ms: u64) -> Self {
        self.tolerance_ms = ms;
        self.track_lost_ms = ms;
        self
    }

    /// Builder method for tests to set the default dwell threshold
    #[cfg(test)]
    pub fn with_dwell_threshold_ms(mut self, ms: u64) -> Self {
        self.dwell_threshold_ms = ms;
        self
    }

    #[cfg(test)]
    pub fn with_hierarchy_policy(mut self, policy: HierarchyPolicy) -> Self {
        self.hierarchy_policy = policy;
        self
    }

    #[cfg(test)]
    pub fn with_egress_queue_size(mut self, size: usize) -> Self {
        self.egress_queue_size = size;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[mqtt]
host = "broker"
port = 1883

[zones]
file = "zones.json"
"#;

    fn parse(content: &str) -> anyhow::Result<Config> {
        let toml_config: TomlConfig = toml::from_str(content)?;
        let config = Config::from_toml(toml_config, "inline".to_string());
        config.validate()?;
        Ok(config)
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.mqtt_host(), "localhost");
        assert_eq!(config.mqtt_port(), 1883);
        assert_eq!(config.tolerance_ms(), 1000);
        assert_eq!(config.track_lost_ms(), 1000);
        assert_eq!(config.dwell_threshold_ms(), 0);
        assert_eq!(config.hierarchy_policy(), HierarchyPolicy::Independent);
        assert_eq!(config.site_id(), None);
    }

    #[test]
    fn test_minimal_sections_use_defaults() {
        let config = parse(MINIMAL).unwrap();
        assert_eq!(config.ingress_topic(), "detections/frames");
        assert_eq!(config.egress_topic(), "zonewatch/events");
        assert_eq!(config.egress_queue_size(), 1024);
        assert_eq!(config.egress_high_water(), 819);
        assert_eq!(config.shutdown_drain_ms(), 2000);
        assert_eq!(config.frame_bounds(), FrameBounds::new(1280.0, 720.0));
        assert_eq!(config.prometheus_port(), 0);
        assert_eq!(config.diagnostics_file(), None);
    }

    #[test]
    fn test_track_lost_defaults_to_tolerance() {
        let config = parse(&format!("{MINIMAL}\n[membership]\ntolerance_ms = 1500\n")).unwrap();
        assert_eq!(config.tolerance_ms(), 1500);
        assert_eq!(config.track_lost_ms(), 1500);

        let config = parse(&format!(
            "{MINIMAL}\n[membership]\ntolerance_ms = 1500\ntrack_lost_ms = 4000\n"
        ))
        .unwrap();
        assert_eq!(config.track_lost_ms(), 4000);
    }

    #[test]
    fn test_hierarchy_policy_parsing() {
        let content = MINIMAL.replace("file = \"zones.json\"", "file = \"z.json\"\nhierarchy_policy = \"propagate\"");
        assert_eq!(parse(&content).unwrap().hierarchy_policy(), HierarchyPolicy::Propagate);

        let bad = MINIMAL.replace("file = \"zones.json\"", "file = \"z.json\"\nhierarchy_policy = \"nested\"");
        assert!(parse(&bad).is_err());
    }

    #[test]
    fn test_validation_rejects_nonsense() {
        assert!(parse(&format!("{MINIMAL}\n[egress]\nqueue_size = 0\n")).is_err());
        assert!(parse(&format!("{MINIMAL}\n[egress]\nhigh_water_pct = 150\n")).is_err());
        let zero_width = MINIMAL.replace("file = \"zones.json\"", "file = \"z.json\"\nframe_width = 0.0");
        assert!(parse(&zero_width).is_err());
    }

    #[test]
    fn test_zero_track_lost_is_rejected() {
        let err = parse(&format!("{MINIMAL}\n[membership]\ntrack_lost_ms = 0\n")).unwrap_err();
        assert!(err.to_string().contains("track_lost_ms"));

        // Short but non-zero is allowed, with a warning
        let config = parse(&format!("{MINIMAL}\n[membership]\ntolerance_ms = 1000\ntrack_lost_ms = 200\n")).unwrap();
        assert_eq!(config.track_lost_ms(), 200);
    }

    #[test]
    fn test_missing_zones_section_is_error() {
        assert!(parse("[mqtt]\nhost = \"x\"\nport = 1\n").is_err());
    }

    #[test]
    fn test_resolve_config_path_explicit() {
        assert_eq!(Config::resolve_config_path(Some("config/site.toml")), "config/site.toml");
    }

    #[test]
    fn test_high_water_never_zero() {
        let config = Config::default().with_egress_queue_size(1);
        assert_eq!(config.egress_high_water(), 1);
    }
}
