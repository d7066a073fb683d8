use std::path::PathBuf;

use thiserror::Error;

/// Failure to read or write the process-wide TLS configuration.
#[derive(Debug, Error)]
pub enum PreferenceError {
    #[error("preference store is unavailable: {0}")]
    Unavailable(String),

    #[error("preference `{0}` was set by the user and must not be changed")]
    UserSet(&'static str),
}

/// Anything that keeps the run from starting, or from handing the shared TLS
/// configuration back. Fatal to the whole run.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("cannot acquire TLS configuration: {0}")]
    Preferences(#[from] PreferenceError),

    #[error("invalid DNS host `{host}`")]
    DnsHost { host: String },

    #[error("failed to load CA bundle {path}: {source}")]
    CaBundle {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("CA bundle {path} holds no usable certificates: {source}")]
    CaBundleParse {
        path: PathBuf,
        #[source]
        source: openssl::error::ErrorStack,
    },

    #[error("no probe configurations to run")]
    NoConfigurations,

    #[error("TLS configuration was not restored: expected {expected}, found {found}")]
    RestoreMismatch { expected: String, found: String },
}

/// A probe request could not even be issued. Becomes a `ThrewException`
/// outcome for that probe.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("invalid target `{target}`: {source}")]
    InvalidTarget {
        target: String,
        #[source]
        source: url::ParseError,
    },

    #[error("target `{0}` has no host")]
    MissingHost(String),

    #[error("TLS setup failed: {0}")]
    Tls(#[from] openssl::error::ErrorStack),

    #[error("failed to build request: {0}")]
    Http(#[from] hyper::http::Error),
}

/// Certificate metadata could not be read. Recorded next to the probe
/// outcome, never in place of it.
#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("certificate {index} of the chain is not valid DER: {reason}")]
    Parse { index: usize, reason: String },

    #[error("certificate {index} has an unrepresentable validity period")]
    Validity { index: usize },

    #[error("fingerprint computation failed: {0}")]
    Digest(#[from] openssl::error::ErrorStack),
}

/// Configuration could not be loaded from file, environment or command line.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid YAML in {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid TLS version `{0}`")]
    TlsVersion(String),

    #[error("invalid duration `{0}`")]
    Duration(String),

    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// The telemetry sink did not accept a report. Logged and dropped.
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("HTTP delivery failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("telemetry endpoint rejected report: {status} - {body}")]
    Rejected { status: u16, body: String },

    #[error("failed to serialize report: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to compress report: {0}")]
    Compress(#[from] snap::Error),

    #[error("failed to write report to {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Formats an error with its whole `source()` chain.
pub fn report(mut err: &(dyn std::error::Error + 'static)) -> String {
    use std::fmt::Write;

    let mut s = format!("{}", err);
    while let Some(src) = err.source() {
        let _ = write!(s, "\n\nCaused by: {}", src);
        err = src;
    }
    s
}
