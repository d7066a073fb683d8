pub mod client;

use std::borrow::Cow;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::config::probe_config::TlsVersion;
use crate::error::{self, ReportError};
use crate::http_probe::result::{ConnectionInfo, ProbeResult};
use crate::prefs::sandbox::Snapshot;
use crate::prefs::{FALLBACK_LIMIT_PREF, VERSION_MAX_PREF};
use client::ReportSink;

pub const DEFAULT_CHANNEL: &str = "tls13-middlebox-testing";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Started,
    Finished,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum AbortReason {
    /// A person had already chosen the TLS version preferences.
    UserOverride,
    Cancelled,
    /// The TLS configuration could not be acquired or handed back.
    SetupFailure,
}

/// Versions of the tool and the TLS stack that produced a report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeInfo {
    pub tool_version: String,
    pub tls_library: String,
}

impl RuntimeInfo {
    pub fn current() -> Self {
        RuntimeInfo {
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
            tls_library: openssl::version::version().to_string(),
        }
    }
}

/// Everything one run learned. Built up while probing, then handed to
/// `Reporter::submit` by value.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub id: Uuid,
    pub status: RunStatus,
    pub abort_reason: Option<AbortReason>,
    /// Missing only when the TLS configuration could not be read at all.
    pub snapshot: Option<Snapshot>,
    pub results: Vec<ProbeResult>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub runtime: RuntimeInfo,
}

impl RunReport {
    pub fn new(id: Uuid) -> Self {
        RunReport {
            id,
            status: RunStatus::Started,
            abort_reason: None,
            snapshot: None,
            results: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
            runtime: RuntimeInfo::current(),
        }
    }

    pub fn was_user_overridden(&self) -> bool {
        self.snapshot.is_some_and(|s| s.is_user_set())
    }

    pub fn finish(&mut self) {
        self.status = RunStatus::Finished;
        self.abort_reason = None;
        self.finished_at = Some(Utc::now());
    }

    pub fn abort(&mut self, reason: AbortReason) {
        self.status = RunStatus::Aborted;
        self.abort_reason = Some(reason);
        self.finished_at = Some(Utc::now());
    }

    /// The marker sent before probing starts.
    pub fn started_payload(&self) -> Result<Value, ReportError> {
        Ok(serde_json::to_value(StartedPayload {
            id: self.id,
            status: RunStatus::Started,
            started_at: self.started_at,
            runtime: &self.runtime,
        })?)
    }

    /// The final payload. Without `include_certificates`, chains and
    /// fingerprints are left out.
    pub fn payload(&self, include_certificates: bool) -> Result<Value, ReportError> {
        let snapshot = self.snapshot.as_ref();
        let preferences = (self.abort_reason == Some(AbortReason::UserOverride))
            .then_some(snapshot)
            .flatten()
            .map(|s| PreferencesPayload {
                max_version: PreferenceValue {
                    name: VERSION_MAX_PREF,
                    value: s.max_version,
                    is_userset: s.max_version_user_set,
                },
                fallback_limit: PreferenceValue {
                    name: FALLBACK_LIMIT_PREF,
                    value: s.fallback_limit,
                    is_userset: s.fallback_limit_user_set,
                },
            });

        let payload = FinalPayload {
            id: self.id,
            status: self.status,
            abort_reason: self.abort_reason,
            default_max_version: snapshot.map(|s| s.max_version),
            default_fallback_limit: snapshot.map(|s| s.fallback_limit),
            is_max_version_userset: snapshot.map(|s| s.max_version_user_set),
            is_fallback_limit_userset: snapshot.map(|s| s.fallback_limit_user_set),
            was_user_overridden: self.was_user_overridden(),
            preferences,
            started_at: self.started_at,
            finished_at: self.finished_at,
            runtime: &self.runtime,
            certificates_included: include_certificates,
            tests: self
                .results
                .iter()
                .map(|r| TestPayload::new(r, include_certificates))
                .collect(),
        };
        Ok(serde_json::to_value(payload)?)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StartedPayload<'a> {
    id: Uuid,
    status: RunStatus,
    started_at: DateTime<Utc>,
    runtime: &'a RuntimeInfo,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FinalPayload<'a> {
    id: Uuid,
    status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    abort_reason: Option<AbortReason>,
    default_max_version: Option<TlsVersion>,
    default_fallback_limit: Option<TlsVersion>,
    is_max_version_userset: Option<bool>,
    is_fallback_limit_userset: Option<bool>,
    was_user_overridden: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    preferences: Option<PreferencesPayload>,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    runtime: &'a RuntimeInfo,
    certificates_included: bool,
    tests: Vec<TestPayload<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PreferencesPayload {
    max_version: PreferenceValue,
    fallback_limit: PreferenceValue,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PreferenceValue {
    name: &'static str,
    value: TlsVersion,
    is_userset: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TestPayload<'a> {
    max_version: TlsVersion,
    fallback_limit: TlsVersion,
    website: &'a str,
    result: ResultPayload<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ResultPayload<'a> {
    event: &'static str,
    response_code: u16,
    elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    exception: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    server_sha256_fingerprint: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    is_built_in_root: Option<bool>,
    #[serde(flatten)]
    info: Cow<'a, ConnectionInfo>,
}

impl<'a> TestPayload<'a> {
    fn new(result: &'a ProbeResult, include_certificates: bool) -> Self {
        let (info, fingerprint) = if include_certificates {
            (
                Cow::Borrowed(&result.info),
                result.info.server_sha256_fingerprint(),
            )
        } else {
            let mut stripped = result.info.clone();
            stripped.certificate_chain = None;
            (Cow::Owned(stripped), None)
        };

        TestPayload {
            max_version: result.config.max_version,
            fallback_limit: result.config.fallback_limit,
            website: &result.config.host,
            result: ResultPayload {
                event: result.outcome.event(),
                response_code: result.response_code(),
                elapsed_ms: u64::try_from(result.elapsed.as_millis()).unwrap_or(u64::MAX),
                exception: result.exception.as_deref(),
                server_sha256_fingerprint: fingerprint,
                is_built_in_root: result.info.is_built_in_root(),
                info,
            },
        }
    }
}

/// Hands reports to every configured sink. A failing sink is logged and
/// skipped; nothing is retried.
pub struct Reporter {
    channel: String,
    sinks: Vec<Box<dyn ReportSink>>,
}

impl Reporter {
    pub fn new(channel: impl Into<String>, sinks: Vec<Box<dyn ReportSink>>) -> Self {
        Reporter {
            channel: channel.into(),
            sinks,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Sends the `started` marker to the sinks that track progress.
    pub async fn submit_started(&self, report: &RunReport) -> usize {
        let payload = match report.started_payload() {
            Ok(payload) => payload,
            Err(e) => {
                log::error!("Failed to build started report: {}", error::report(&e));
                return 0;
            }
        };
        let sinks = self.sinks.iter().filter(|s| s.streams_progress());
        self.deliver(sinks, report.id, &payload).await
    }

    /// Sends the final report. Returns how many sinks accepted it.
    pub async fn submit(&self, report: RunReport, include_certificates: bool) -> usize {
        let payload = match report.payload(include_certificates) {
            Ok(payload) => payload,
            Err(e) => {
                log::error!("Failed to build report {}: {}", report.id, error::report(&e));
                return 0;
            }
        };
        self.deliver(self.sinks.iter(), report.id, &payload).await
    }

    async fn deliver<'a>(
        &self,
        sinks: impl Iterator<Item = &'a Box<dyn ReportSink>>,
        id: Uuid,
        payload: &Value,
    ) -> usize {
        let mut delivered = 0;
        for sink in sinks {
            match sink.submit(&self.channel, id, payload).await {
                Ok(()) => {
                    log::info!("Report {} delivered to {}", id, sink.name());
                    delivered += 1;
                }
                Err(e) => log::error!(
                    "Failed to deliver report {} to {}: {}",
                    id,
                    sink.name(),
                    error::report(&e)
                ),
            }
        }
        delivered
    }
}
