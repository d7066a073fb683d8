//! The process-wide TLS version settings.
//!
//! Every connection the transport opens reads its protocol window from here,
//! so a value written for one probe affects anything else in flight. Only the
//! [`sandbox`] writes to it.

use std::sync::RwLock;

use crate::config::probe_config::{TlsVersion, UserPreferences};
use crate::error::PreferenceError;

pub mod sandbox;

pub const VERSION_MAX_PREF: &str = "security.tls.version.max";
pub const FALLBACK_LIMIT_PREF: &str = "security.tls.version.fallback-limit";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsPref {
    MaxVersion,
    FallbackLimit,
}

impl TlsPref {
    pub fn name(self) -> &'static str {
        match self {
            TlsPref::MaxVersion => VERSION_MAX_PREF,
            TlsPref::FallbackLimit => FALLBACK_LIMIT_PREF,
        }
    }

    fn index(self) -> usize {
        match self {
            TlsPref::MaxVersion => 0,
            TlsPref::FallbackLimit => 1,
        }
    }
}

/// Read/write access to the shared TLS configuration.
///
/// Values live on two branches: a default branch the tool may rewrite, and a
/// user branch holding values a person chose. `get` returns the user value
/// when present, `set` only ever writes the default branch.
pub trait PreferenceStore: Send + Sync {
    fn get(&self, pref: TlsPref) -> Result<TlsVersion, PreferenceError>;

    fn set(&self, pref: TlsPref, value: TlsVersion) -> Result<(), PreferenceError>;

    fn is_user_set(&self, pref: TlsPref) -> Result<bool, PreferenceError>;
}

/// The protocol window a connection should offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlsSettings {
    pub max_version: TlsVersion,
    pub fallback_limit: TlsVersion,
}

impl TlsSettings {
    pub fn read(store: &dyn PreferenceStore) -> Result<Self, PreferenceError> {
        Ok(TlsSettings {
            max_version: store.get(TlsPref::MaxVersion)?,
            fallback_limit: store.get(TlsPref::FallbackLimit)?,
        })
    }
}

#[derive(Debug)]
struct Branches {
    defaults: [TlsVersion; 2],
    user: [Option<TlsVersion>; 2],
}

/// In-process preference store.
#[derive(Debug)]
pub struct MemoryPreferences {
    branches: RwLock<Branches>,
}

impl MemoryPreferences {
    pub fn new(defaults: TlsSettings, user: UserPreferences) -> Self {
        MemoryPreferences {
            branches: RwLock::new(Branches {
                defaults: [defaults.max_version, defaults.fallback_limit],
                user: [user.max_version, user.fallback_limit],
            }),
        }
    }
}

impl Default for MemoryPreferences {
    fn default() -> Self {
        MemoryPreferences::new(TlsSettings::default(), UserPreferences::default())
    }
}

impl Default for TlsSettings {
    fn default() -> Self {
        TlsSettings {
            max_version: TlsVersion::Tls13,
            fallback_limit: TlsVersion::Tls12,
        }
    }
}

fn poisoned<T>(_: T) -> PreferenceError {
    PreferenceError::Unavailable("preference lock poisoned".to_string())
}

impl PreferenceStore for MemoryPreferences {
    fn get(&self, pref: TlsPref) -> Result<TlsVersion, PreferenceError> {
        let branches = self.branches.read().map_err(poisoned)?;
        let i = pref.index();
        Ok(branches.user[i].unwrap_or(branches.defaults[i]))
    }

    fn set(&self, pref: TlsPref, value: TlsVersion) -> Result<(), PreferenceError> {
        let mut branches = self.branches.write().map_err(poisoned)?;
        branches.defaults[pref.index()] = value;
        log::debug!("{} = {}", pref.name(), value.pref_value());
        Ok(())
    }

    fn is_user_set(&self, pref: TlsPref) -> Result<bool, PreferenceError> {
        let branches = self.branches.read().map_err(poisoned)?;
        Ok(branches.user[pref.index()].is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_branch_shadows_default() {
        let store = MemoryPreferences::new(
            TlsSettings::default(),
            UserPreferences {
                max_version: Some(TlsVersion::Tls12),
                fallback_limit: None,
            },
        );
        assert_eq!(store.get(TlsPref::MaxVersion).unwrap(), TlsVersion::Tls12);
        assert!(store.is_user_set(TlsPref::MaxVersion).unwrap());
        assert!(!store.is_user_set(TlsPref::FallbackLimit).unwrap());

        store.set(TlsPref::MaxVersion, TlsVersion::Tls11).unwrap();
        assert_eq!(store.get(TlsPref::MaxVersion).unwrap(), TlsVersion::Tls12);
    }

    #[test]
    fn test_set_writes_default_branch() {
        let store = MemoryPreferences::default();
        store.set(TlsPref::FallbackLimit, TlsVersion::Tls10).unwrap();
        let settings = TlsSettings::read(&store).unwrap();
        assert_eq!(settings.max_version, TlsVersion::Tls13);
        assert_eq!(settings.fallback_limit, TlsVersion::Tls10);
    }
}
