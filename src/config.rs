use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Deserializer};
use tracing::trace;

use crate::error::ConfigError;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub graphite: GraphiteConfig,

    /// Backend used by the static rules (required if any is enabled)
    pub elasticsearch: Option<ElasticConfig>,

    #[serde(rename = "static-rules", default)]
    pub static_rules: Vec<StaticRule>,

    #[serde(default)]
    pub kibanas: Vec<KibanaConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GraphiteConfig {
    pub host: String,

    #[serde(default = "default_graphite_port")]
    pub port: u16,

    /// Prepended to every metric path (`<prefix>.<rule>.count`)
    #[serde(default)]
    pub prefix: String,

    #[serde(
        default = "default_health_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub health_interval: Duration,

    #[serde(
        default = "default_sink_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub probe_timeout: Duration,

    /// Upper bound for writing one line, a relay that stops reading trips it
    #[serde(
        default = "default_sink_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub write_timeout: Duration,

    #[serde(
        default = "default_sink_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub dial_timeout: Duration,

    /// Pause between two connection attempts, at startup and on reconnect
    #[serde(
        default = "default_reconnect_backoff",
        deserialize_with = "deserialize_duration"
    )]
    pub reconnect_backoff: Duration,

    #[serde(default = "default_startup_attempts")]
    pub startup_attempts: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ElasticConfig {
    pub url: String,
    pub user: Option<String>,
    pub password: Option<String>,

    #[serde(default = "default_time_field")]
    pub time_field: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StaticRule {
    pub name: String,

    /// Query string expression
    pub pattern: String,

    pub index: String,

    #[serde(deserialize_with = "deserialize_duration")]
    pub check_every: Duration,

    #[serde(default)]
    pub enabled: bool,
}

/// A Kibana instance whose saved searches become rules
#[derive(Debug, Clone, Deserialize)]
pub struct KibanaConfig {
    pub name: String,

    /// Elasticsearch holding the `.kibana` index, also used for the counts
    pub kibana_es_url: String,
    pub kibana_es_user: Option<String>,
    pub kibana_es_pass: Option<String>,

    /// Index the discovered rules are counted against
    pub index: String,

    /// Only saved searches whose title starts with this become rules
    #[serde(default)]
    pub should_prefix_with: String,

    #[serde(deserialize_with = "deserialize_duration")]
    pub watch_interval: Duration,

    #[serde(deserialize_with = "deserialize_duration")]
    pub check_every: Duration,

    #[serde(default = "default_time_field")]
    pub time_field: String,

    #[serde(default)]
    pub enabled: bool,
}

fn default_graphite_port() -> u16 {
    2003
}

fn default_health_interval() -> Duration {
    Duration::from_secs(15)
}

fn default_sink_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_reconnect_backoff() -> Duration {
    Duration::from_secs(5)
}

fn default_startup_attempts() -> u32 {
    3
}

fn default_time_field() -> String {
    "@timestamp".to_string()
}

static DURATION_FORMAT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+(ms|h|m|s))+$").expect("valid duration regex"));

static DURATION_PART: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)(ms|h|m|s)").expect("valid duration regex"));

/// Longest duration accepted anywhere in the config (one year)
pub const MAX_DURATION: Duration = Duration::from_secs(365 * 24 * 3600);

/// Parse durations like `500ms`, `10s`, `5m`, `1h` or `1m30s`
///
/// Zero and anything above [`MAX_DURATION`] are rejected.
pub fn parse_duration(input: &str) -> Result<Duration, ConfigError> {
    let input = input.trim();
    if !DURATION_FORMAT.is_match(input) {
        return Err(ConfigError::Duration(input.to_string()));
    }

    let invalid = || ConfigError::Duration(input.to_string());

    let mut total = Duration::ZERO;
    for part in DURATION_PART.captures_iter(input) {
        let amount: u64 = part[1].parse().map_err(|_| invalid())?;
        let unit = match &part[2] {
            "ms" => Some(Duration::from_millis(amount)),
            "s" => Some(Duration::from_secs(amount)),
            "m" => amount.checked_mul(60).map(Duration::from_secs),
            "h" => amount.checked_mul(3600).map(Duration::from_secs),
            _ => None,
        };
        total = unit
            .and_then(|unit| total.checked_add(unit))
            .ok_or_else(invalid)?;
    }

    if total.is_zero() || total > MAX_DURATION {
        return Err(invalid());
    }

    Ok(total)
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_duration(&raw).map_err(serde::de::Error::custom)
}

impl Config {
    /// Load the configuration from `path`, or from
    /// `~/.config/es-hit/config.toml` if no path is given
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => default_config_path().ok_or(ConfigError::NotFound)?,
        };

        let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;

        let config: Config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;

        config.validate()?;
        trace!("loaded config: {config:?}");

        Ok(config)
    }

    pub fn enabled_static_rules(&self) -> impl Iterator<Item = &StaticRule> {
        self.static_rules.iter().filter(|rule| rule.enabled)
    }

    pub fn enabled_kibanas(&self) -> impl Iterator<Item = &KibanaConfig> {
        self.kibanas.iter().filter(|kibana| kibana.enabled)
    }

    /// Checks that cannot be expressed through serde alone
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.graphite.startup_attempts == 0 {
            return Err(ConfigError::Invalid(
                "graphite.startup_attempts must be at least 1".to_string(),
            ));
        }

        if self.enabled_static_rules().next().is_some() && self.elasticsearch.is_none() {
            return Err(ConfigError::Invalid(
                "static rules are enabled but no [elasticsearch] section is configured"
                    .to_string(),
            ));
        }

        let mut names = HashSet::new();
        for rule in self.enabled_static_rules() {
            if !names.insert(rule.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "static rule {:?} is defined more than once",
                    rule.name
                )));
            }
        }

        let mut names = HashSet::new();
        for kibana in self.enabled_kibanas() {
            if !names.insert(kibana.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "kibana {:?} is defined more than once",
                    kibana.name
                )));
            }
        }

        Ok(())
    }
}

fn default_config_path() -> Option<PathBuf> {
    let path = dirs::config_dir()?.join("es-hit").join("config.toml");
    path.exists().then_some(path)
}
