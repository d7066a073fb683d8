use std::env;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use trust_dns_resolver::{
    TokioAsyncResolver,
    config::{NameServerConfig, NameServerConfigGroup, Protocol, ResolverConfig, ResolverOpts},
};

use super::probe_config::{
    ConfigurationSet, FileConfig, ProbeConfig, TlsVersion, UserPreferences,
    default_configurations,
};
use crate::cli::Args;
use crate::error::{ConfigError, SetupError};
use crate::http_probe::certs::TrustAnchors;
use crate::http_probe::probe::DEFAULT_TIMEOUT;
use crate::telemetry::DEFAULT_CHANNEL;

const DEFAULT_CONFIG_FILE: &str = "config.yml";
const DEFAULT_DNS_HOSTS: &str = "1.1.1.1,8.8.8.8";

/// Where distributions usually keep the system trust bundle.
const SYSTEM_CA_BUNDLES: &[&str] = &[
    "/etc/ssl/certs/ca-certificates.crt",
    "/etc/pki/tls/certs/ca-bundle.crt",
    "/etc/ssl/cert.pem",
];

/// Where the roots the transport verifies against come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustSource {
    /// Named with `--ca-bundle`, `SSL_CERT_FILE` or `ca_bundle`; must load.
    Bundle(PathBuf),
    /// Found at a well-known system location.
    System(PathBuf),
    /// Nothing found; the TLS library defaults apply.
    Default,
}

impl TrustSource {
    pub fn path(&self) -> Option<&Path> {
        match self {
            TrustSource::Bundle(path) | TrustSource::System(path) => Some(path),
            TrustSource::Default => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsentMode {
    Ask,
    Always,
    Never,
}

pub struct AppConfig {
    pub configurations: ConfigurationSet,
    pub timeout: Duration,
    pub dns_hosts: Vec<String>,
    pub telemetry_endpoint: Option<String>,
    pub channel: String,
    pub output: Option<PathBuf>,
    pub trust: TrustSource,
    pub consent: ConsentMode,
    /// Values a person set; any present value stops the run.
    pub user_preferences: UserPreferences,
    pub max_host_width: usize,
}

/// Load the application configuration.
/// Sources, lowest precedence first: built-in defaults, `.env`, the YAML file
/// named by `--config` or `CONFIG_FILE`, environment variables, then flags.
/// A missing file is only an error when it was named explicitly.
pub fn load_config(args: &Args) -> Result<AppConfig, ConfigError> {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            log::warn!("Ignoring unreadable .env file: {e}");
        }
    }

    let (path, explicit) = match (&args.config, env::var("CONFIG_FILE")) {
        (Some(path), _) => (path.clone(), true),
        (None, Ok(path)) => (PathBuf::from(path), true),
        (None, Err(_)) => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
    };
    let file = read_file_config(&path, explicit)?;

    resolve_config(args, file, |name| env::var(name).ok())
}

pub fn read_file_config(path: &Path, explicit: bool) -> Result<FileConfig, ConfigError> {
    let config_str = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) if !explicit && e.kind() == std::io::ErrorKind::NotFound => {
            log::debug!("No config file at {}, using defaults", path.display());
            return Ok(FileConfig::default());
        }
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    log::info!("Using config file {}", path.display());
    serde_yaml::from_str(&config_str).map_err(|source| ConfigError::Yaml {
        path: path.to_path_buf(),
        source,
    })
}

/// Merges the file, the environment (through `env`) and the flags.
pub fn resolve_config(
    args: &Args,
    file: FileConfig,
    env: impl Fn(&str) -> Option<String>,
) -> Result<AppConfig, ConfigError> {
    let shuffle = !args.no_shuffle && file.shuffle.unwrap_or(true);

    let base = if file.configurations.is_empty() {
        default_configurations()
    } else {
        file.configurations
    };
    let configurations = if args.targets.is_empty() && args.tls_versions.is_empty() {
        ConfigurationSet::new(base, shuffle)?
    } else {
        let hosts = if args.targets.is_empty() {
            unique_hosts(&base)
        } else {
            args.targets.iter().map(|t| t.trim().to_string()).collect()
        };
        let versions = if args.tls_versions.is_empty() {
            vec![TlsVersion::Tls13]
        } else {
            args.tls_versions.clone()
        };
        ConfigurationSet::from_matrix(&hosts, &versions, args.fallback_limit, shuffle)?
    };
    if configurations.is_empty() {
        return Err(ConfigError::Invalid {
            name: "targets",
            reason: "no probe configurations".to_string(),
        });
    }

    let timeout = args
        .timeout
        .or(file.timeout_ms.map(Duration::from_millis))
        .unwrap_or(DEFAULT_TIMEOUT);
    if timeout.is_zero() {
        return Err(ConfigError::Invalid {
            name: "timeout",
            reason: "must be greater than zero".to_string(),
        });
    }

    let dns_hosts = if !args.dns_hosts.is_empty() {
        args.dns_hosts.clone()
    } else if let Some(hosts) = env("DNS_HOSTS") {
        split_list(&hosts)
    } else if let Some(hosts) = file.dns_hosts {
        hosts
    } else {
        split_list(DEFAULT_DNS_HOSTS)
    };
    log::info!("Using DNS hosts: {:?}", dns_hosts);

    let telemetry_endpoint = args
        .endpoint
        .clone()
        .or_else(|| env("TELEMETRY_ENDPOINT"))
        .or(file.telemetry_endpoint)
        .filter(|e| !e.trim().is_empty());

    let mut user_preferences = file.preferences;
    if let Some(value) = env("TLS_VERSION_MAX") {
        user_preferences.max_version = Some(value.parse()?);
    }
    if let Some(value) = env("TLS_VERSION_FALLBACK_LIMIT") {
        user_preferences.fallback_limit = Some(value.parse()?);
    }

    let trust = match args
        .ca_bundle
        .clone()
        .or_else(|| env("SSL_CERT_FILE").map(PathBuf::from))
        .or(file.ca_bundle)
    {
        Some(path) => TrustSource::Bundle(path),
        None => system_ca_bundle(SYSTEM_CA_BUNDLES),
    };
    log::debug!("Trust store: {:?}", trust);

    let consent = if args.yes {
        ConsentMode::Always
    } else if args.no_consent {
        ConsentMode::Never
    } else {
        ConsentMode::Ask
    };

    let max_host_width = configurations
        .iter()
        .map(|c| c.host.len())
        .max()
        .unwrap_or(10);

    Ok(AppConfig {
        configurations,
        timeout,
        dns_hosts,
        telemetry_endpoint,
        channel: args
            .channel
            .clone()
            .or(file.channel)
            .unwrap_or_else(|| DEFAULT_CHANNEL.to_string()),
        output: args.output.clone(),
        trust,
        consent,
        user_preferences,
        max_host_width,
    })
}

fn system_ca_bundle(candidates: &[&str]) -> TrustSource {
    candidates
        .iter()
        .map(Path::new)
        .find(|p| p.is_file())
        .map_or(TrustSource::Default, |p| TrustSource::System(p.to_path_buf()))
}

fn split_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn unique_hosts(configs: &[ProbeConfig]) -> Vec<String> {
    let mut hosts: Vec<String> = Vec::new();
    for config in configs {
        if !hosts.contains(&config.host) {
            hosts.push(config.host.clone());
        }
    }
    hosts
}

/// Parses `10s`, `1500ms`, `2m`, or a bare number of milliseconds.
pub fn parse_duration(s: &str) -> Result<Duration, ConfigError> {
    let s = s.trim();
    let invalid = || ConfigError::Duration(s.to_string());
    let (digits, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(i) => s.split_at(i),
        None => (s, "ms"),
    };
    let value: u64 = digits.parse().map_err(|_| invalid())?;
    match unit.trim() {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => value
            .checked_mul(60)
            .map(Duration::from_secs)
            .ok_or_else(invalid),
        _ => Err(invalid()),
    }
}

/// Setup a DNS resolver using the provided DNS hosts
/// This function creates a `TokioAsyncResolver` configured with the specified DNS hosts.
/// It sets the resolver options to have 2 attempts, a timeout of 100 milliseconds, and a cache size of 1024 for quick DNS lookups.
/// # Arguments
///     * `dns_hosts` - A slice of strings representing DNS host IPs (e.g., "1.1.1.1")
/// # Returns
///     A `Result` containing a `TokioAsyncResolver` if successful, or an error naming the host that is not an IP address.
pub fn setup_resolver(dns_hosts: &[String]) -> Result<TokioAsyncResolver, SetupError> {
    let mut opts = ResolverOpts::default();
    opts.attempts = 2;
    opts.timeout = Duration::from_millis(100);
    opts.cache_size = 1024;

    let mut name_servers = NameServerConfigGroup::new();

    for host in dns_hosts {
        let ip: IpAddr = host.parse().map_err(|_| SetupError::DnsHost {
            host: host.clone(),
        })?;
        name_servers.push(NameServerConfig {
            socket_addr: (ip, 53).into(),
            protocol: Protocol::Tcp,
            tls_dns_name: None,
            trust_negative_responses: false,
            bind_addr: None,
        });
    }

    let resolver_config = ResolverConfig::from_parts(None, vec![], name_servers);
    Ok(TokioAsyncResolver::tokio(resolver_config, opts))
}

/// Loads the roots that count as built in. An explicit bundle must load; a
/// system bundle that fails to load only disables the built-in check.
pub fn setup_trust_anchors(trust: &TrustSource) -> Result<TrustAnchors, SetupError> {
    match trust {
        TrustSource::Bundle(path) => TrustAnchors::load(path),
        TrustSource::System(path) => match TrustAnchors::load(path) {
            Ok(anchors) => Ok(anchors),
            Err(e) => {
                log::warn!("{e}; built-in root detection is disabled");
                Ok(TrustAnchors::default())
            }
        },
        TrustSource::Default => {
            log::warn!("No system CA bundle found; built-in root detection is disabled");
            Ok(TrustAnchors::default())
        }
    }
}
