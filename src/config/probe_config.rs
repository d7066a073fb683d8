use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// A TLS protocol version, stored as its numeric preference value
/// (1 = TLS 1.0 ... 4 = TLS 1.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum TlsVersion {
    Tls10 = 1,
    Tls11 = 2,
    Tls12 = 3,
    Tls13 = 4,
}

impl TlsVersion {
    pub const ALL: [TlsVersion; 4] = [
        TlsVersion::Tls10,
        TlsVersion::Tls11,
        TlsVersion::Tls12,
        TlsVersion::Tls13,
    ];

    pub fn pref_value(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for TlsVersion {
    type Error = ConfigError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        TlsVersion::ALL
            .into_iter()
            .find(|v| v.pref_value() == value)
            .ok_or_else(|| ConfigError::TlsVersion(value.to_string()))
    }
}

impl From<TlsVersion> for u8 {
    fn from(version: TlsVersion) -> Self {
        version.pref_value()
    }
}

impl FromStr for TlsVersion {
    type Err = ConfigError;

    /// Accepts `1.2`, `tls1.2`, `TLSv1.2`, `TLS 1.2` or the preference value `3`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        let bare = lowered
            .trim_start_matches("tls")
            .trim_start_matches('v')
            .trim();
        match bare {
            "1.0" | "1" => Ok(TlsVersion::Tls10),
            "1.1" | "2" => Ok(TlsVersion::Tls11),
            "1.2" | "3" => Ok(TlsVersion::Tls12),
            "1.3" | "4" => Ok(TlsVersion::Tls13),
            _ => Err(ConfigError::TlsVersion(s.to_string())),
        }
    }
}

impl fmt::Display for TlsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TlsVersion::Tls10 => "TLS 1.0",
            TlsVersion::Tls11 => "TLS 1.1",
            TlsVersion::Tls12 => "TLS 1.2",
            TlsVersion::Tls13 => "TLS 1.3",
        };
        f.write_str(label)
    }
}

/// One probe: which TLS version window to force, and which host to fetch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeConfig {
    /// Highest TLS version offered while this probe runs.
    #[serde(alias = "max_version")]
    pub max_version: TlsVersion,

    /// Lowest TLS version the connection may fall back to.
    #[serde(alias = "fallback_limit")]
    pub fallback_limit: TlsVersion,

    /// Host (optionally `host:port`) fetched over `https://`.
    #[serde(rename = "website", alias = "host", alias = "target_host")]
    pub host: String,
}

impl ProbeConfig {
    pub fn new(
        max_version: TlsVersion,
        fallback_limit: TlsVersion,
        host: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let config = ProbeConfig {
            max_version,
            fallback_limit,
            host: host.into(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::Invalid {
                name: "host",
                reason: "target host is empty".to_string(),
            });
        }
        if self.fallback_limit > self.max_version {
            return Err(ConfigError::Invalid {
                name: "fallback_limit",
                reason: format!(
                    "{} is above the maximum version {} for {}",
                    self.fallback_limit, self.max_version, self.host
                ),
            });
        }
        Ok(())
    }
}

/// The fixed list of probes for a run.
#[derive(Debug, Clone)]
pub struct ConfigurationSet {
    configurations: Vec<ProbeConfig>,
    shuffle: bool,
}

impl ConfigurationSet {
    pub fn new(configurations: Vec<ProbeConfig>, shuffle: bool) -> Result<Self, ConfigError> {
        for config in &configurations {
            config.validate()?;
        }
        Ok(ConfigurationSet {
            configurations,
            shuffle,
        })
    }

    /// Builds the cartesian product of hosts and TLS versions. Without an
    /// explicit fallback limit each probe pins the window to its own version.
    pub fn from_matrix(
        hosts: &[String],
        versions: &[TlsVersion],
        fallback_limit: Option<TlsVersion>,
        shuffle: bool,
    ) -> Result<Self, ConfigError> {
        let mut configurations = Vec::with_capacity(hosts.len() * versions.len());
        for host in hosts {
            for version in versions {
                let limit = fallback_limit.map_or(*version, |limit| limit.min(*version));
                configurations.push(ProbeConfig::new(*version, limit, host.clone())?);
            }
        }
        ConfigurationSet::new(configurations, shuffle)
    }

    pub fn len(&self) -> usize {
        self.configurations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.configurations.is_empty()
    }

    pub fn is_shuffled(&self) -> bool {
        self.shuffle
    }

    /// The probes in declared order.
    pub fn iter(&self) -> impl Iterator<Item = &ProbeConfig> {
        self.configurations.iter()
    }

    /// The probes in issue order; permuted when shuffling is enabled.
    pub fn configurations(&self) -> Vec<ProbeConfig> {
        self.configurations_with(&mut rand::thread_rng())
    }

    pub fn configurations_with<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<ProbeConfig> {
        let mut ordered = self.configurations.clone();
        if self.shuffle {
            ordered.shuffle(rng);
        }
        ordered
    }
}

impl Default for ConfigurationSet {
    /// One host that speaks TLS 1.3, one that does not, and a TLS 1.2 control.
    fn default() -> Self {
        ConfigurationSet {
            configurations: default_configurations(),
            shuffle: true,
        }
    }
}

pub fn default_configurations() -> Vec<ProbeConfig> {
    vec![
        ProbeConfig {
            max_version: TlsVersion::Tls13,
            fallback_limit: TlsVersion::Tls13,
            host: "enabled.tls13.com".to_string(),
        },
        ProbeConfig {
            max_version: TlsVersion::Tls13,
            fallback_limit: TlsVersion::Tls13,
            host: "disabled.tls13.com".to_string(),
        },
        ProbeConfig {
            max_version: TlsVersion::Tls12,
            fallback_limit: TlsVersion::Tls12,
            host: "control.tls12.com".to_string(),
        },
    ]
}

/// Preference values a person chose deliberately. Present values make the
/// run abort before touching anything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct UserPreferences {
    pub max_version: Option<TlsVersion>,
    pub fallback_limit: Option<TlsVersion>,
}

/// The YAML configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileConfig {
    /// Per-probe timeout in milliseconds.
    pub timeout_ms: Option<u64>,

    /// Randomise probe order. Defaults to true.
    pub shuffle: Option<bool>,

    /// Base URL of the telemetry collector.
    pub telemetry_endpoint: Option<String>,

    /// Report channel name used by the telemetry collector.
    pub channel: Option<String>,

    /// PEM bundle of trust anchors treated as built-in roots.
    pub ca_bundle: Option<PathBuf>,

    pub dns_hosts: Option<Vec<String>>,

    #[serde(default)]
    pub preferences: UserPreferences,

    #[serde(default)]
    pub configurations: Vec<ProbeConfig>,
}
