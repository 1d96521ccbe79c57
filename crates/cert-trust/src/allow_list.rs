//! Thumbprints the user explicitly chose to trust despite a failed verification.
//!
//! Two tiers: the permanent tier lives in the [`ConfigStore`] as comma separated lists and
//! survives restarts, the session tier is in memory only.

use core::fmt;
use std::collections::BTreeSet;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::config::{ConfigKeys, ConfigStore};
use crate::identity::IdentityCheck;
use crate::thumbprint::Thumbprint;

/// Context an approval is scoped to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AllowListKey {
    /// No identity was verified; keyed by the leaf's own thumbprint.
    Server(Thumbprint),
    /// One key per verified identity (hostname, email address, ...).
    Identity(String),
}

impl AllowListKey {
    /// Keys relevant for a check: one per identity, or the server key when there is none.
    pub fn for_check(identity: &IdentityCheck, leaf_thumbprint: &Thumbprint) -> Vec<Self> {
        if identity.is_empty() {
            vec![AllowListKey::Server(leaf_thumbprint.clone())]
        } else {
            identity.identities().iter().cloned().map(AllowListKey::Identity).collect()
        }
    }

    fn config_key(&self, keys: &ConfigKeys) -> String {
        match self {
            AllowListKey::Server(thumbprint) => keys.server_entry(thumbprint.as_str()),
            AllowListKey::Identity(identity) => keys.identity_entry(identity),
        }
    }
}

impl fmt::Display for AllowListKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllowListKey::Server(thumbprint) => write!(f, "server:{thumbprint}"),
            AllowListKey::Identity(identity) => write!(f, "param:{identity}"),
        }
    }
}

pub struct AllowList {
    store: Arc<dyn ConfigStore>,
    keys: ConfigKeys,
    session: DashMap<AllowListKey, BTreeSet<Thumbprint>>,
    // Serializes read-modify-write cycles on the permanent lists.
    permanent_write: Mutex<()>,
}

impl AllowList {
    pub fn new(store: Arc<dyn ConfigStore>, keys: ConfigKeys) -> Self {
        Self {
            store,
            keys,
            session: DashMap::new(),
            permanent_write: Mutex::new(()),
        }
    }

    /// True when `thumbprint` was approved for `key`, permanently or for this session.
    pub fn is_allowed(&self, key: &AllowListKey, thumbprint: &Thumbprint) -> bool {
        self.session
            .get(key)
            .is_some_and(|thumbprints| thumbprints.contains(thumbprint))
            || self.always_trusted(key).contains(thumbprint)
    }

    pub fn always_trusted(&self, key: &AllowListKey) -> BTreeSet<Thumbprint> {
        self.store
            .get_string(&key.config_key(&self.keys))
            .map(|value| parse_thumbprint_list(&value))
            .unwrap_or_default()
    }

    pub fn session_trusted(&self, key: &AllowListKey) -> BTreeSet<Thumbprint> {
        self.session.get(key).map(|entry| entry.clone()).unwrap_or_default()
    }

    /// Adds `thumbprint` to the persisted list of `key`.
    pub fn record_always(&self, key: &AllowListKey, thumbprint: &Thumbprint) -> anyhow::Result<()> {
        let _guard = self.permanent_write.lock();

        let mut thumbprints = self.always_trusted(key);

        if thumbprints.insert(thumbprint.clone()) {
            self.store
                .set_string(&key.config_key(&self.keys), &join_thumbprint_list(&thumbprints))?;
            info!(%key, %thumbprint, "Certificate permanently trusted");
        }

        Ok(())
    }

    /// Adds `thumbprint` to the in-memory list of `key`, forgotten on restart.
    pub fn record_session_only(&self, key: &AllowListKey, thumbprint: &Thumbprint) {
        if self.session.entry(key.clone()).or_default().insert(thumbprint.clone()) {
            info!(%key, %thumbprint, "Certificate trusted for this session");
        }
    }

    /// Withdraws a permanent approval; the entry disappears from the store once its list is empty.
    pub fn remove_always(&self, key: &AllowListKey, thumbprint: &Thumbprint) -> anyhow::Result<bool> {
        let _guard = self.permanent_write.lock();

        let mut thumbprints = self.always_trusted(key);

        if !thumbprints.remove(thumbprint) {
            return Ok(false);
        }

        let config_key = key.config_key(&self.keys);

        if thumbprints.is_empty() {
            self.store.remove_key(&config_key)?;
        } else {
            self.store.set_string(&config_key, &join_thumbprint_list(&thumbprints))?;
        }

        info!(%key, %thumbprint, "Permanent certificate approval removed");

        Ok(true)
    }
}

fn parse_thumbprint_list(value: &str) -> BTreeSet<Thumbprint> {
    value
        .split(',')
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .filter_map(|segment| match segment.parse() {
            Ok(thumbprint) => Some(thumbprint),
            Err(error) => {
                warn!(%error, "Ignoring malformed allow-list entry");
                None
            }
        })
        .collect()
}

fn join_thumbprint_list(thumbprints: &BTreeSet<Thumbprint>) -> String {
    thumbprints.iter().map(Thumbprint::as_str).collect::<Vec<_>>().join(",")
}
