use crate::error::{ConfigError, Result, SpotctlError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Per-invocation configuration, applied at region level.
///
/// Group tags may override a subset of these per group; see
/// [`GroupConfig::from_tags`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Multiplier applied to the on-demand price before spot candidates are
    /// compared against it.
    pub on_demand_price_multiplier: f64,
    pub bidding_policy: BiddingPolicy,
    /// Buffer percentage over the current spot price for aggressive bids.
    pub spot_price_buffer_percentage: f64,
    /// GP2 volumes at or below this size (GiB) are rewritten to GP3.
    pub gp2_conversion_threshold: i32,
    /// Case-insensitive "true" pipes launch-configuration user data through
    /// the Beanstalk patcher.
    pub patch_beanstalk_userdata: String,
    /// Per-call deadline for cloud API operations, in seconds.
    pub cloud_call_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            on_demand_price_multiplier: 1.0,
            bidding_policy: BiddingPolicy::Normal,
            spot_price_buffer_percentage: 10.0,
            gp2_conversion_threshold: 280,
            patch_beanstalk_userdata: "false".to_string(),
            cloud_call_timeout_secs: 30,
        }
    }
}

/// How the maximum spot bid is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BiddingPolicy {
    /// Bid the effective on-demand price.
    Normal,
    /// Bid close to the current spot price, capped at the on-demand price.
    Aggressive,
}

impl FromStr for BiddingPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "normal" => Ok(BiddingPolicy::Normal),
            "aggressive" => Ok(BiddingPolicy::Aggressive),
            other => Err(ConfigError::InvalidValue {
                field: "bidding_policy".to_string(),
                reason: format!("unknown policy '{}'", other),
            }),
        }
    }
}

/// Effective per-group settings: region defaults plus tag overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    pub on_demand_price_multiplier: f64,
    pub bidding_policy: BiddingPolicy,
    pub spot_price_buffer_percentage: f64,
    pub gp2_conversion_threshold: i32,
    pub allowed_instance_types: Vec<String>,
    pub disallowed_instance_types: Vec<String>,
    pub patch_beanstalk_userdata: String,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self::from_defaults(&Config::default())
    }
}

impl GroupConfig {
    /// Region-wide defaults with no group overrides.
    pub fn from_defaults(config: &Config) -> Self {
        Self {
            on_demand_price_multiplier: config.on_demand_price_multiplier,
            bidding_policy: config.bidding_policy,
            spot_price_buffer_percentage: config.spot_price_buffer_percentage,
            gp2_conversion_threshold: config.gp2_conversion_threshold,
            allowed_instance_types: Vec::new(),
            disallowed_instance_types: Vec::new(),
            patch_beanstalk_userdata: config.patch_beanstalk_userdata.clone(),
        }
    }

    /// Layer group-tag overrides over the region defaults.
    ///
    /// Recognized tag keys: `on-demand-price-multiplier`,
    /// `allowed-instance-types`, `disallowed-instance-types` (comma or space
    /// separated glob lists). Unparsable values are ignored with a warning.
    pub fn from_tags<'a, I>(config: &Config, tags: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut effective = Self::from_defaults(config);
        for (key, value) in tags {
            match key {
                "on-demand-price-multiplier" => match value.parse::<f64>() {
                    Ok(m) if m > 0.0 => effective.on_demand_price_multiplier = m,
                    _ => tracing::warn!(
                        "Ignoring invalid on-demand-price-multiplier tag value '{}'",
                        value
                    ),
                },
                "allowed-instance-types" => {
                    effective.allowed_instance_types = split_type_list(value);
                }
                "disallowed-instance-types" => {
                    effective.disallowed_instance_types = split_type_list(value);
                }
                _ => {}
            }
        }
        effective
    }

    pub fn patch_beanstalk_userdata_enabled(&self) -> bool {
        self.patch_beanstalk_userdata.eq_ignore_ascii_case("true")
    }
}

fn split_type_list(value: &str) -> Vec<String> {
    value
        .split([',', ' '])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl Config {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => PathBuf::from(".spotctl.toml"),
        };

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path).map_err(|e| {
                SpotctlError::Config(ConfigError::ParseError(format!(
                    "Failed to read config {}: {}",
                    config_path.display(),
                    e
                )))
            })?;
            let config: Config = toml::from_str(&content).map_err(|e| {
                SpotctlError::Config(ConfigError::ParseError(format!(
                    "Failed to parse config {}: {}",
                    config_path.display(),
                    e
                )))
            })?;
            config.validate()?;
            Ok(config)
        } else {
            if path.is_some() {
                tracing::warn!(
                    "Config file not found: {}, using defaults",
                    config_path.display()
                );
            }
            Ok(Config::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).map_err(|e| {
            SpotctlError::Config(ConfigError::ParseError(format!(
                "Failed to serialize config: {}",
                e
            )))
        })?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.on_demand_price_multiplier <= 0.0 {
            return Err(SpotctlError::Config(ConfigError::InvalidValue {
                field: "on_demand_price_multiplier".to_string(),
                reason: "must be positive".to_string(),
            }));
        }
        if self.spot_price_buffer_percentage < 0.0 {
            return Err(SpotctlError::Config(ConfigError::InvalidValue {
                field: "spot_price_buffer_percentage".to_string(),
                reason: "must not be negative".to_string(),
            }));
        }
        if self.gp2_conversion_threshold < 0 {
            return Err(SpotctlError::Config(ConfigError::InvalidValue {
                field: "gp2_conversion_threshold".to_string(),
                reason: "must not be negative".to_string(),
            }));
        }
        Ok(())
    }
}

pub fn init_config(output: &Path) -> Result<()> {
    let config = Config::default();
    config.save(output)?;
    println!("Created config file: {}", output.display());
    Ok(())
}
