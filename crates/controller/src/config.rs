//! TOML config file loading and validation.
//!
//! The config covers process-level settings only: the relay backend
//! credentials, the weather provider, MQTT ingestion, and the web
//! port. Zones, sequences and schedules live in the database and are
//! managed through the API.

use anyhow::{bail, Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub web: WebConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub loxone: Option<LoxoneConfig>,
    #[serde(default)]
    pub weather: WeatherConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebConfig {
    #[serde(default = "default_web_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_url")]
    pub url: String,
}

/// Relay backend (Loxone miniserver style): a single "set output
/// channel to 0/1" HTTP endpoint with basic auth.
#[derive(Debug, Clone, Deserialize)]
pub struct LoxoneConfig {
    pub host: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WeatherConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_lat")]
    pub lat: f64,
    #[serde(default = "default_lon")]
    pub lon: f64,
    /// Rain probability (percent) at or above which scheduled runs
    /// are skipped.
    #[serde(default = "default_rain_threshold")]
    pub rain_threshold: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_mqtt_host")]
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_base_topic")]
    pub base_topic: String,
}

fn default_web_port() -> u16 {
    3000
}
fn default_db_url() -> String {
    "sqlite:irrigation.db?mode=rwc".to_string()
}
fn default_true() -> bool {
    true
}
fn default_provider() -> String {
    "open-meteo".to_string()
}
fn default_lat() -> f64 {
    48.2082
}
fn default_lon() -> f64 {
    16.3738
}
fn default_rain_threshold() -> i64 {
    70
}
fn default_mqtt_host() -> String {
    "127.0.0.1".to_string()
}
fn default_mqtt_port() -> u16 {
    1883
}
fn default_base_topic() -> String {
    "irrigation".to_string()
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            port: default_web_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_db_url(),
        }
    }
}

impl Default for WeatherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            provider: default_provider(),
            api_key: String::new(),
            lat: default_lat(),
            lon: default_lon(),
            rain_threshold: default_rain_threshold(),
        }
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            username: String::new(),
            password: String::new(),
            base_topic: default_base_topic(),
        }
    }
}

pub const KNOWN_PROVIDERS: &[&str] = &["open-meteo", "openweathermap"];

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error
    /// describing every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if !KNOWN_PROVIDERS.contains(&self.weather.provider.as_str()) {
            errors.push(format!(
                "weather: unknown provider '{}' (known: {})",
                self.weather.provider,
                KNOWN_PROVIDERS.join(", ")
            ));
        }
        if self.weather.provider == "openweathermap" && self.weather.api_key.trim().is_empty() {
            errors.push("weather: openweathermap requires api_key".to_string());
        }
        if !(0..=100).contains(&self.weather.rain_threshold) {
            errors.push(format!(
                "weather: rain_threshold {} out of range [0, 100]",
                self.weather.rain_threshold
            ));
        }
        if !(-90.0..=90.0).contains(&self.weather.lat) {
            errors.push(format!("weather: lat {} out of range [-90, 90]", self.weather.lat));
        }
        if !(-180.0..=180.0).contains(&self.weather.lon) {
            errors.push(format!(
                "weather: lon {} out of range [-180, 180]",
                self.weather.lon
            ));
        }

        if let Some(lox) = &self.loxone {
            if lox.host.trim().is_empty() {
                errors.push("loxone: host is empty".to_string());
            }
            if lox.username.trim().is_empty() {
                errors.push("loxone: username is empty".to_string());
            }
        }

        if self.mqtt.enabled {
            if self.mqtt.host.trim().is_empty() {
                errors.push("mqtt: host is empty".to_string());
            }
            if self.mqtt.base_topic.trim().is_empty() || self.mqtt.base_topic.contains('/') {
                errors.push(format!(
                    "mqtt: base_topic '{}' must be a single non-empty topic segment",
                    self.mqtt.base_topic
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }
}

/// Read, parse, and validate a TOML config file. A missing file yields
/// the defaults (weather enabled with open-meteo, everything else off).
pub fn load(path: &str) -> Result<Config> {
    if !std::path::Path::new(path).exists() {
        tracing::warn!(path, "config file not found, using defaults");
        return Ok(Config::default());
    }
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
