use std::sync::Arc;

use serde::Serialize;

use super::{PreferenceStore, TlsPref, TlsSettings};
use crate::config::probe_config::{ProbeConfig, TlsVersion};
use crate::error::PreferenceError;

/// The TLS configuration as it was before the run touched anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub max_version: TlsVersion,
    pub fallback_limit: TlsVersion,
    pub max_version_user_set: bool,
    pub fallback_limit_user_set: bool,
}

impl Snapshot {
    /// True when either value was chosen by a person. Such a run must not
    /// probe at all.
    pub fn is_user_set(&self) -> bool {
        self.max_version_user_set || self.fallback_limit_user_set
    }

    pub fn settings(&self) -> TlsSettings {
        TlsSettings {
            max_version: self.max_version,
            fallback_limit: self.fallback_limit,
        }
    }
}

/// Owns write access to the shared TLS configuration for the duration of a
/// run. An override borrows the sandbox mutably, so at most one probe can
/// hold the configuration at a time.
pub struct PreferenceSandbox {
    store: Arc<dyn PreferenceStore>,
}

impl PreferenceSandbox {
    pub fn new(store: Arc<dyn PreferenceStore>) -> Self {
        PreferenceSandbox { store }
    }

    /// Reads the current values and whether a person set them. Must happen
    /// before any `apply`.
    pub fn snapshot(&self) -> Result<Snapshot, PreferenceError> {
        Ok(Snapshot {
            max_version: self.store.get(TlsPref::MaxVersion)?,
            fallback_limit: self.store.get(TlsPref::FallbackLimit)?,
            max_version_user_set: self.store.is_user_set(TlsPref::MaxVersion)?,
            fallback_limit_user_set: self.store.is_user_set(TlsPref::FallbackLimit)?,
        })
    }

    /// Writes the probe's version window. The returned guard puts `snapshot`
    /// back when restored explicitly or, failing that, when dropped.
    pub fn apply(
        &mut self,
        config: &ProbeConfig,
        snapshot: &Snapshot,
    ) -> Result<Override<'_>, PreferenceError> {
        if snapshot.max_version_user_set {
            return Err(PreferenceError::UserSet(TlsPref::MaxVersion.name()));
        }
        if snapshot.fallback_limit_user_set {
            return Err(PreferenceError::UserSet(TlsPref::FallbackLimit.name()));
        }

        let guard = Override {
            store: self.store.as_ref(),
            snapshot: *snapshot,
            restored: false,
        };
        // An early return here drops the guard, which restores.
        guard.store.set(TlsPref::MaxVersion, config.max_version)?;
        guard
            .store
            .set(TlsPref::FallbackLimit, config.fallback_limit)?;
        Ok(guard)
    }

    pub fn current(&self) -> Result<TlsSettings, PreferenceError> {
        TlsSettings::read(self.store.as_ref())
    }
}

/// Writes both values even when the first write fails; reports the first error.
fn write_back(store: &dyn PreferenceStore, snapshot: &Snapshot) -> Result<(), PreferenceError> {
    let max = store.set(TlsPref::MaxVersion, snapshot.max_version);
    let limit = store.set(TlsPref::FallbackLimit, snapshot.fallback_limit);
    max.and(limit)
}

/// A probe's hold on the TLS configuration.
pub struct Override<'a> {
    store: &'a dyn PreferenceStore,
    snapshot: Snapshot,
    restored: bool,
}

impl Override<'_> {
    /// The window connections see while this override is held.
    pub fn settings(&self) -> Result<TlsSettings, PreferenceError> {
        TlsSettings::read(self.store)
    }

    /// Puts the snapshot back. Runs at most once per override; a failure is
    /// fatal to the run and is not retried on drop.
    pub fn restore(mut self) -> Result<(), PreferenceError> {
        self.restored = true;
        write_back(self.store, &self.snapshot)
    }
}

impl Drop for Override<'_> {
    fn drop(&mut self) {
        if self.restored {
            return;
        }
        self.restored = true;
        if let Err(e) = write_back(self.store, &self.snapshot) {
            log::error!("Failed to restore TLS preferences: {e}");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::probe_config::UserPreferences;
    use crate::prefs::MemoryPreferences;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Wraps a memory store and records every write.
    #[derive(Default)]
    pub(crate) struct RecordingStore {
        pub inner: MemoryPreferences,
        pub writes: Mutex<Vec<(TlsPref, TlsVersion)>>,
        pub fail_writes_after: Option<usize>,
        /// Index of the single write to refuse.
        pub refuse_write: Option<usize>,
        pub write_count: AtomicUsize,
        pub unavailable: AtomicBool,
    }

    impl RecordingStore {
        pub fn with_user(user: UserPreferences) -> Self {
            RecordingStore {
                inner: MemoryPreferences::new(TlsSettings::default(), user),
                ..Default::default()
            }
        }

        pub fn writes(&self) -> Vec<(TlsPref, TlsVersion)> {
            self.writes.lock().unwrap().clone()
        }
    }

    impl PreferenceStore for RecordingStore {
        fn get(&self, pref: TlsPref) -> Result<TlsVersion, PreferenceError> {
            if self.unavailable.load(Ordering::SeqCst) {
                return Err(PreferenceError::Unavailable("offline".to_string()));
            }
            self.inner.get(pref)
        }

        fn set(&self, pref: TlsPref, value: TlsVersion) -> Result<(), PreferenceError> {
            let n = self.write_count.fetch_add(1, Ordering::SeqCst);
            if self.fail_writes_after.is_some_and(|limit| n >= limit) || self.refuse_write == Some(n)
            {
                return Err(PreferenceError::Unavailable("write refused".to_string()));
            }
            self.writes.lock().unwrap().push((pref, value));
            self.inner.set(pref, value)
        }

        fn is_user_set(&self, pref: TlsPref) -> Result<bool, PreferenceError> {
            self.inner.is_user_set(pref)
        }
    }

    fn config() -> ProbeConfig {
        ProbeConfig::new(TlsVersion::Tls11, TlsVersion::Tls10, "legacy.example.com").unwrap()
    }

    #[test]
    fn test_apply_then_restore_returns_to_snapshot() {
        let store = Arc::new(RecordingStore::default());
        let mut sandbox = PreferenceSandbox::new(store.clone());
        let before = sandbox.snapshot().unwrap();

        let guard = sandbox.apply(&config(), &before).unwrap();
        let during = guard.settings().unwrap();
        assert_eq!(during.max_version, TlsVersion::Tls11);
        assert_eq!(during.fallback_limit, TlsVersion::Tls10);
        guard.restore().unwrap();

        assert_eq!(sandbox.snapshot().unwrap(), before);
        // two writes to apply, two to restore; nothing from drop
        assert_eq!(store.writes().len(), 4);
    }

    #[test]
    fn test_dropped_override_restores() {
        let store = Arc::new(RecordingStore::default());
        let mut sandbox = PreferenceSandbox::new(store.clone());
        let before = sandbox.snapshot().unwrap();
        {
            let _guard = sandbox.apply(&config(), &before).unwrap();
        }
        assert_eq!(sandbox.current().unwrap(), before.settings());
        assert_eq!(store.writes().len(), 4);
    }

    #[test]
    fn test_failed_apply_still_restores() {
        let store = Arc::new(RecordingStore {
            fail_writes_after: Some(1),
            ..Default::default()
        });
        let mut sandbox = PreferenceSandbox::new(store.clone());
        let before = sandbox.snapshot().unwrap();
        assert!(sandbox.apply(&config(), &before).is_err());
        // first write landed, the second and the restores were refused
        assert_eq!(store.writes(), vec![(TlsPref::MaxVersion, TlsVersion::Tls11)]);
        assert!(store.write_count.load(Ordering::SeqCst) >= 3);
    }

    #[test]
    fn test_refused_max_version_restore_still_restores_fallback_limit() {
        // writes 0 and 1 apply, write 2 is the max-version restore
        let store = Arc::new(RecordingStore {
            refuse_write: Some(2),
            ..Default::default()
        });
        let mut sandbox = PreferenceSandbox::new(store.clone());
        let before = sandbox.snapshot().unwrap();

        let guard = sandbox.apply(&config(), &before).unwrap();
        assert!(guard.restore().is_err());

        let after = sandbox.current().unwrap();
        assert_eq!(after.fallback_limit, before.fallback_limit);
        assert_eq!(after.max_version, TlsVersion::Tls11);
        assert_eq!(store.write_count.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_apply_refuses_user_set_snapshot() {
        let store = Arc::new(RecordingStore::with_user(UserPreferences {
            max_version: None,
            fallback_limit: Some(TlsVersion::Tls12),
        }));
        let mut sandbox = PreferenceSandbox::new(store.clone());
        let snapshot = sandbox.snapshot().unwrap();
        assert!(snapshot.is_user_set());
        assert!(matches!(
            sandbox.apply(&config(), &snapshot),
            Err(PreferenceError::UserSet(_))
        ));
        assert!(store.writes().is_empty());
    }
}
