use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::config::app_config::parse_duration;
use crate::config::probe_config::TlsVersion;
use crate::error::ConfigError;

/// Probe test hosts under forced TLS version windows and report what the
/// connections looked like.
#[derive(Debug, Clone, Default, Parser)]
#[command(name = "probe", version, about)]
pub struct Args {
    /// Hosts to probe, comma separated (`host` or `host:port`)
    #[arg(long, value_delimiter = ',')]
    pub targets: Vec<String>,

    /// Maximum TLS versions to probe each target with, comma separated
    #[arg(long = "tls-version", value_delimiter = ',', value_parser = parse_tls_version)]
    pub tls_versions: Vec<TlsVersion>,

    /// Lowest TLS version a probe may fall back to (defaults to its maximum)
    #[arg(long, value_parser = parse_tls_version)]
    pub fallback_limit: Option<TlsVersion>,

    /// Per-probe timeout, e.g. `10s`, `1500ms`
    #[arg(long, value_parser = parse_duration)]
    pub timeout: Option<Duration>,

    /// Write the final report to this file
    #[arg(long, short)]
    pub output: Option<PathBuf>,

    /// Telemetry collector base URL
    #[arg(long)]
    pub endpoint: Option<String>,

    /// Report channel name
    #[arg(long)]
    pub channel: Option<String>,

    /// Probe in declared order
    #[arg(long)]
    pub no_shuffle: bool,

    /// Include certificate details without asking
    #[arg(long, short = 'y', conflicts_with = "no_consent")]
    pub yes: bool,

    /// Leave certificate details out without asking
    #[arg(long)]
    pub no_consent: bool,

    /// PEM bundle of roots that count as built in
    #[arg(long)]
    pub ca_bundle: Option<PathBuf>,

    /// DNS servers to resolve targets with, comma separated
    #[arg(long, value_delimiter = ',')]
    pub dns_hosts: Vec<String>,

    /// YAML config file (default `$CONFIG_FILE` or `config.yml`)
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// Log at debug level
    #[arg(long, short)]
    pub verbose: bool,
}

fn parse_tls_version(s: &str) -> Result<TlsVersion, ConfigError> {
    s.parse()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_command_is_well_formed() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_documented_invocation() {
        let args = Args::try_parse_from([
            "probe",
            "--targets",
            "enabled.example.com,disabled.example.com",
            "--tls-version",
            "1.3,1.2",
            "--timeout",
            "10s",
            "--output",
            "report.json",
        ])
        .unwrap();

        assert_eq!(args.targets, vec!["enabled.example.com", "disabled.example.com"]);
        assert_eq!(args.tls_versions, vec![TlsVersion::Tls13, TlsVersion::Tls12]);
        assert_eq!(args.timeout, Some(Duration::from_secs(10)));
        assert_eq!(args.output, Some(PathBuf::from("report.json")));
        assert!(!args.yes);
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(Args::try_parse_from(["probe", "--tls-version", "1.7"]).is_err());
        assert!(Args::try_parse_from(["probe", "--timeout", "soon"]).is_err());
        assert!(Args::try_parse_from(["probe", "--yes", "--no-consent"]).is_err());
    }
}
