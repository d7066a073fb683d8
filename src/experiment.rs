//! The probing pipeline: snapshot, then for each configuration apply, probe
//! and restore, strictly one probe at a time.

use thiserror::Error;

use crate::cancel::CancelToken;
use crate::config::probe_config::ConfigurationSet;
use crate::error::SetupError;
use crate::http_probe::probe::ProbeRunner;
use crate::http_probe::result::ProbeResult;
use crate::prefs::sandbox::PreferenceSandbox;
use crate::telemetry::{AbortReason, RunReport};

/// The run could not start, or could not hand the TLS configuration back.
/// Carries whatever was gathered so it can still be reported.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct RunFailure {
    #[source]
    pub error: SetupError,
    pub partial: RunReport,
}

pub struct Experiment {
    sandbox: PreferenceSandbox,
    runner: ProbeRunner,
    configurations: ConfigurationSet,
}

impl Experiment {
    pub fn new(
        sandbox: PreferenceSandbox,
        runner: ProbeRunner,
        configurations: ConfigurationSet,
    ) -> Self {
        Experiment {
            sandbox,
            runner,
            configurations,
        }
    }

    /// Runs every configuration into `report`. `progress` sees each result
    /// as soon as its preferences have been restored.
    ///
    /// When a person already chose either TLS preference, nothing is probed
    /// and nothing is written; the report comes back aborted.
    pub async fn run(
        &mut self,
        mut report: RunReport,
        cancel: &CancelToken,
        mut progress: impl FnMut(&ProbeResult),
    ) -> Result<RunReport, RunFailure> {
        let snapshot = match self.sandbox.snapshot() {
            Ok(snapshot) => snapshot,
            Err(e) => return Err(fail(report, e.into())),
        };
        report.snapshot = Some(snapshot);

        if snapshot.is_user_set() {
            log::warn!(
                "TLS version preferences were set by the user (max {}, fallback limit {}); not probing",
                snapshot.max_version,
                snapshot.fallback_limit
            );
            report.abort(AbortReason::UserOverride);
            return Ok(report);
        }

        let configurations = self.configurations.configurations();
        if configurations.is_empty() {
            return Err(fail(report, SetupError::NoConfigurations));
        }
        log::info!(
            "Running {} probes with a {:?} timeout",
            configurations.len(),
            self.runner.timeout()
        );

        let mut cancelled = false;
        for config in &configurations {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            let guard = match self.sandbox.apply(config, &snapshot) {
                Ok(guard) => guard,
                Err(e) => return Err(fail(report, e.into())),
            };
            let settings = match guard.settings() {
                Ok(settings) => settings,
                Err(e) => {
                    drop(guard);
                    return Err(fail(report, e.into()));
                }
            };

            let result = self.runner.run(config, settings, cancel).await;
            let restored = guard.restore();

            progress(&result);
            report.results.push(result);
            if let Err(e) = restored {
                return Err(fail(report, e.into()));
            }
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
        }

        match self.sandbox.current() {
            Ok(current) if current == snapshot.settings() => {}
            Ok(current) => {
                let error = SetupError::RestoreMismatch {
                    expected: format!("{:?}", snapshot.settings()),
                    found: format!("{current:?}"),
                };
                return Err(fail(report, error));
            }
            Err(e) => return Err(fail(report, e.into())),
        }

        if cancelled {
            log::warn!(
                "Run cancelled after {} of {} probes",
                report.results.len(),
                configurations.len()
            );
            report.abort(AbortReason::Cancelled);
        } else {
            report.finish();
        }
        Ok(report)
    }
}

fn fail(mut report: RunReport, error: SetupError) -> RunFailure {
    log::error!("Run {} failed: {}", report.id, error);
    report.abort(AbortReason::SetupFailure);
    RunFailure {
        error,
        partial: report,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::probe_config::{ProbeConfig, TlsVersion, UserPreferences};
    use crate::error::PreferenceError;
    use crate::http_probe::probe::DEFAULT_TIMEOUT;
    use crate::http_probe::probe::tests::{FakeTransport, Script, loaded, runner};
    use crate::http_probe::result::ProbeOutcome;
    use crate::prefs::sandbox::tests::RecordingStore;
    use crate::prefs::{TlsPref, TlsSettings};
    use crate::telemetry::RunStatus;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use uuid::Uuid;

    fn configurations(shuffle: bool) -> ConfigurationSet {
        ConfigurationSet::new(
            vec![
                ProbeConfig::new(TlsVersion::Tls13, TlsVersion::Tls13, "enabled.example.com")
                    .unwrap(),
                ProbeConfig::new(TlsVersion::Tls12, TlsVersion::Tls11, "control.example.com")
                    .unwrap(),
            ],
            shuffle,
        )
        .unwrap()
    }

    fn experiment(
        store: Arc<RecordingStore>,
        transport: Arc<FakeTransport>,
        timeout: Duration,
        shuffle: bool,
    ) -> Experiment {
        Experiment::new(
            PreferenceSandbox::new(store),
            runner(transport, timeout),
            configurations(shuffle),
        )
    }

    fn new_report() -> RunReport {
        RunReport::new(Uuid::new_v4())
    }

    #[tokio::test]
    async fn test_every_apply_is_restored_once() {
        let store = Arc::new(RecordingStore::default());
        let before = TlsSettings::read(store.as_ref()).unwrap();
        let transport = Arc::new(FakeTransport::new(Script::Deliver(loaded())));
        let mut experiment = experiment(store.clone(), transport.clone(), DEFAULT_TIMEOUT, false);

        let report = experiment
            .run(new_report(), &CancelToken::new(), |_| {})
            .await
            .unwrap();

        assert_eq!(report.status, RunStatus::Finished);
        assert_eq!(report.results.len(), 2);
        assert!(!report.was_user_overridden());

        // apply writes max then fallback, restore writes both back
        let writes = store.writes();
        assert_eq!(writes.len(), 8);
        for probe in writes.chunks(4) {
            assert_eq!(probe[2], (TlsPref::MaxVersion, before.max_version));
            assert_eq!(probe[3], (TlsPref::FallbackLimit, before.fallback_limit));
        }
        assert_eq!(TlsSettings::read(store.as_ref()).unwrap(), before);

        let seen = transport.seen();
        assert_eq!(seen[0].settings.max_version, TlsVersion::Tls13);
        assert_eq!(seen[0].settings.fallback_limit, TlsVersion::Tls13);
        assert_eq!(seen[1].settings.max_version, TlsVersion::Tls12);
        assert_eq!(seen[1].settings.fallback_limit, TlsVersion::Tls11);
    }

    #[tokio::test]
    async fn test_user_set_preferences_skip_probing() {
        let store = Arc::new(RecordingStore::with_user(UserPreferences {
            max_version: Some(TlsVersion::Tls12),
            fallback_limit: None,
        }));
        let transport = Arc::new(FakeTransport::new(Script::Deliver(loaded())));
        let mut experiment = experiment(store.clone(), transport.clone(), DEFAULT_TIMEOUT, true);

        let report = experiment
            .run(new_report(), &CancelToken::new(), |_| {})
            .await
            .unwrap();

        assert_eq!(report.status, RunStatus::Aborted);
        assert_eq!(report.abort_reason, Some(AbortReason::UserOverride));
        assert!(report.was_user_overridden());
        assert!(report.results.is_empty());
        assert!(store.writes().is_empty());
        assert!(transport.seen().is_empty());
    }

    #[tokio::test]
    async fn test_shuffled_run_covers_each_configuration_once() {
        let store = Arc::new(RecordingStore::default());
        let transport = Arc::new(FakeTransport::new(Script::Deliver(loaded())));
        let mut experiment = experiment(store, transport, DEFAULT_TIMEOUT, true);

        let mut order = Vec::new();
        let report = experiment
            .run(new_report(), &CancelToken::new(), |r| {
                order.push(r.config.host.clone())
            })
            .await
            .unwrap();

        assert_eq!(report.results.len(), 2);
        let hosts: HashSet<_> = report.results.iter().map(|r| r.config.host.clone()).collect();
        assert_eq!(hosts.len(), 2);
        assert!(hosts.contains("enabled.example.com"));
        assert!(hosts.contains("control.example.com"));

        // results keep issue order
        let reported: Vec<_> = report.results.iter().map(|r| r.config.host.clone()).collect();
        assert_eq!(order, reported);
    }

    #[tokio::test]
    async fn test_cancel_between_probes_keeps_partial_results() {
        let store = Arc::new(RecordingStore::default());
        let before = TlsSettings::read(store.as_ref()).unwrap();
        let transport = Arc::new(FakeTransport::new(Script::Deliver(loaded())));
        let mut experiment = experiment(store.clone(), transport.clone(), DEFAULT_TIMEOUT, false);
        let cancel = CancelToken::new();

        let report = experiment
            .run(new_report(), &cancel, |_| cancel.cancel())
            .await
            .unwrap();

        assert_eq!(report.status, RunStatus::Aborted);
        assert_eq!(report.abort_reason, Some(AbortReason::Cancelled));
        assert_eq!(report.results.len(), 1);
        assert_eq!(transport.seen().len(), 1);
        assert_eq!(TlsSettings::read(store.as_ref()).unwrap(), before);
    }

    #[tokio::test]
    async fn test_cancel_during_probe_restores_preferences() {
        let store = Arc::new(RecordingStore::default());
        let before = TlsSettings::read(store.as_ref()).unwrap();
        let transport = Arc::new(FakeTransport::new(Script::Hang));
        let mut experiment = experiment(store.clone(), transport, DEFAULT_TIMEOUT, false);
        let cancel = CancelToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let report = experiment.run(new_report(), &cancel, |_| {}).await.unwrap();

        assert_eq!(report.abort_reason, Some(AbortReason::Cancelled));
        assert_eq!(report.results.len(), 1);
        assert_eq!(report.results[0].outcome, ProbeOutcome::Aborted);
        assert_eq!(TlsSettings::read(store.as_ref()).unwrap(), before);
        assert_eq!(store.writes().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_are_recorded_and_restored() {
        let store = Arc::new(RecordingStore::default());
        let transport = Arc::new(FakeTransport::new(Script::Hang));
        let mut experiment =
            experiment(store.clone(), transport, Duration::from_millis(500), false);

        let report = experiment
            .run(new_report(), &CancelToken::new(), |_| {})
            .await
            .unwrap();

        assert_eq!(report.status, RunStatus::Finished);
        assert!(
            report
                .results
                .iter()
                .all(|r| r.outcome == ProbeOutcome::TimedOut)
        );
        assert_eq!(store.writes().len(), 8);
    }

    #[tokio::test]
    async fn test_failed_restore_is_fatal_but_keeps_results() {
        let store = Arc::new(RecordingStore {
            fail_writes_after: Some(2),
            ..Default::default()
        });
        let transport = Arc::new(FakeTransport::new(Script::Deliver(loaded())));
        let mut experiment = experiment(store.clone(), transport, DEFAULT_TIMEOUT, false);

        let failure = experiment
            .run(new_report(), &CancelToken::new(), |_| {})
            .await
            .unwrap_err();

        assert!(matches!(
            failure.error,
            SetupError::Preferences(PreferenceError::Unavailable(_))
        ));
        assert_eq!(failure.partial.status, RunStatus::Aborted);
        assert_eq!(failure.partial.abort_reason, Some(AbortReason::SetupFailure));
        assert_eq!(failure.partial.results.len(), 1);
    }

    #[tokio::test]
    async fn test_unreadable_store_fails_before_probing() {
        let store = Arc::new(RecordingStore::default());
        store.unavailable.store(true, Ordering::SeqCst);
        let transport = Arc::new(FakeTransport::new(Script::Deliver(loaded())));
        let mut experiment = experiment(store.clone(), transport.clone(), DEFAULT_TIMEOUT, false);

        let failure = experiment
            .run(new_report(), &CancelToken::new(), |_| {})
            .await
            .unwrap_err();

        assert!(failure.partial.snapshot.is_none());
        assert!(transport.seen().is_empty());
        assert!(store.writes().is_empty());
    }
}
