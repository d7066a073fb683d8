use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use super::certs::{TrustAnchors, extract_chain};
use super::classify::{BINDING_ABORTED, NET_TIMEOUT, StatusCode, classify};
use super::result::{ConnectionInfo, ProbeOutcome, ProbeResult};
use super::transport::{Delivery, ProbeRequest, SessionInfo, Transport};
use crate::cancel::CancelToken;
use crate::config::probe_config::ProbeConfig;
use crate::error::report;
use crate::prefs::TlsSettings;

/// Reference per-probe timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Issues one request per configuration and turns whatever happens into a
/// `ProbeResult`.
pub struct ProbeRunner {
    transport: Arc<dyn Transport>,
    anchors: Arc<TrustAnchors>,
    timeout: Duration,
}

impl ProbeRunner {
    pub fn new(transport: Arc<dyn Transport>, anchors: Arc<TrustAnchors>, timeout: Duration) -> Self {
        ProbeRunner {
            transport,
            anchors,
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Runs a single probe under `settings`. Never fails: setup errors, panics,
    /// timeouts and cancellation all resolve to an outcome.
    pub async fn run(
        &self,
        config: &ProbeConfig,
        settings: TlsSettings,
        cancel: &CancelToken,
    ) -> ProbeResult {
        let start = Instant::now();

        let request = match ProbeRequest::new(config, settings) {
            Ok(request) => request,
            Err(e) => return ProbeResult::exception(config.clone(), report(&e), start.elapsed()),
        };

        let session = request.session.clone();
        let transport = Arc::clone(&self.transport);
        let mut handle = tokio::spawn(async move { transport.fetch(&request).await });

        let joined = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                handle.abort();
                log::warn!("Probe of {} cancelled", config.host);
                let info = self.connection_info(BINDING_ABORTED, session.latest().as_ref(), None);
                return self.finish(config, ProbeOutcome::Aborted, info, start);
            }
            joined = tokio::time::timeout(self.timeout, &mut handle) => joined,
        };

        let delivery = match joined {
            Err(_) => {
                handle.abort();
                log::debug!("Probe of {} timed out after {:?}", config.host, self.timeout);
                let info = self.connection_info(NET_TIMEOUT, session.latest().as_ref(), None);
                return self.finish(config, ProbeOutcome::TimedOut, info, start);
            }
            Ok(Err(join_error)) => {
                return ProbeResult::exception(config.clone(), join_error.to_string(), start.elapsed());
            }
            Ok(Ok(Err(request_error))) => {
                return ProbeResult::exception(config.clone(), report(&request_error), start.elapsed());
            }
            Ok(Ok(Ok(delivery))) => delivery,
        };

        match delivery {
            Delivery::Loaded(exchange) => {
                let info = self.connection_info(
                    StatusCode::OK,
                    Some(&exchange.session),
                    Some(exchange.http_status),
                );
                self.finish(config, ProbeOutcome::Loaded, info, start)
            }
            Delivery::Failed(failure) => {
                log::debug!("Probe of {} failed: {}", config.host, failure.message);
                let mut info = self.connection_info(failure.status, failure.session.as_ref(), None);
                info.error_message = Some(failure.message);
                self.finish(config, ProbeOutcome::NetworkError, info, start)
            }
            Delivery::Aborted(failure) => {
                let mut info = self.connection_info(failure.status, failure.session.as_ref(), None);
                info.error_message = Some(failure.message);
                self.finish(config, ProbeOutcome::Aborted, info, start)
            }
        }
    }

    fn finish(
        &self,
        config: &ProbeConfig,
        outcome: ProbeOutcome,
        info: ConnectionInfo,
        start: Instant,
    ) -> ProbeResult {
        ProbeResult {
            config: config.clone(),
            outcome,
            info,
            exception: None,
            elapsed: start.elapsed(),
        }
    }

    /// Collects everything the outcome exposed. Chain extraction problems end
    /// up in `diagnostic` and never change the outcome.
    fn connection_info(
        &self,
        status: StatusCode,
        session: Option<&SessionInfo>,
        http_status: Option<u16>,
    ) -> ConnectionInfo {
        let mut info = ConnectionInfo {
            http_status,
            status: Some(status),
            ..Default::default()
        };
        if !status.is_ok() {
            let (class, name) = classify(status);
            info.error_class = Some(class);
            info.error_code = Some(name);
        }

        let Some(session) = session else {
            return info;
        };
        info.tls_negotiated_version = session.negotiated_version;
        info.security_state = Some(session.security_state());
        info.diagnostic = session.diagnostic.clone();

        if !session.chain.is_empty() {
            match extract_chain(&session.chain, &self.anchors) {
                Ok(chain) => info.certificate_chain = Some(chain),
                Err(e) => {
                    log::warn!("Could not read certificate chain: {e}");
                    info.diagnostic = Some(report(&e));
                }
            }
        }
        info
    }
}
