use std::time::Duration;

use bitflags::bitflags;
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

use super::classify::{ErrorClass, StatusCode};
use crate::config::probe_config::{ProbeConfig, TlsVersion};

/// How a probe ended. Exactly one per probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ProbeOutcome {
    #[serde(rename = "load")]
    Loaded,
    #[serde(rename = "error")]
    NetworkError,
    #[serde(rename = "abort")]
    Aborted,
    #[serde(rename = "timeout")]
    TimedOut,
    #[serde(rename = "exception")]
    ThrewException,
}

impl ProbeOutcome {
    pub fn event(self) -> &'static str {
        match self {
            ProbeOutcome::Loaded => "load",
            ProbeOutcome::NetworkError => "error",
            ProbeOutcome::Aborted => "abort",
            ProbeOutcome::TimedOut => "timeout",
            ProbeOutcome::ThrewException => "exception",
        }
    }
}

bitflags! {
    /// Coarse security classification of a connection.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SecurityState: u32 {
        const BROKEN = 0x1;
        const SECURE = 0x2;
        const INSECURE = 0x4;
    }
}

impl Serialize for SecurityState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.bits())
    }
}

/// One certificate of a presented or verified chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateRecord {
    pub common_name: Option<String>,
    pub issuer_organization: Option<String>,
    pub sha1_fingerprint: String,
    pub sha256_fingerprint: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    /// Only known for the last certificate of a chain.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_built_in_root: Option<bool>,
}

/// Whatever the connection exposed. Every field is best-effort.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<StatusCode>,

    #[serde(rename = "protocolVersion", skip_serializing_if = "Option::is_none")]
    pub tls_negotiated_version: Option<TlsVersion>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub security_state: Option<SecurityState>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_class: Option<ErrorClass>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<&'static str>,

    /// The TLS library's or socket's own description of the failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    /// Leaf first, root (or last available issuer) last.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate_chain: Option<Vec<CertificateRecord>>,

    /// Why part of the metadata could not be gathered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
}

impl ConnectionInfo {
    pub fn server_sha256_fingerprint(&self) -> Option<&str> {
        self.certificate_chain
            .as_ref()
            .and_then(|chain| chain.first())
            .map(|leaf| leaf.sha256_fingerprint.as_str())
    }

    pub fn is_built_in_root(&self) -> Option<bool> {
        self.certificate_chain
            .as_ref()
            .and_then(|chain| chain.last())
            .and_then(|root| root.is_built_in_root)
    }
}

/// The configuration a probe ran with, how it ended, and what it saw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    pub config: ProbeConfig,
    pub outcome: ProbeOutcome,
    pub info: ConnectionInfo,
    /// Description of a setup failure, for `ThrewException`.
    pub exception: Option<String>,
    pub elapsed: Duration,
}

impl ProbeResult {
    pub fn exception(config: ProbeConfig, description: String, elapsed: Duration) -> Self {
        ProbeResult {
            config,
            outcome: ProbeOutcome::ThrewException,
            info: ConnectionInfo::default(),
            exception: Some(description),
            elapsed,
        }
    }

    pub fn response_code(&self) -> u16 {
        self.info.http_status.unwrap_or(0)
    }
}
