use std::sync::Arc;

use crate::chain::CertificateChain;
use crate::config::{ConfigKeys, ConfigStore};

/// The user's answer to "do you trust this certificate?".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustVerdict {
    DoNotTrust,
    /// Remembered in the permanent allow-list.
    TrustAlways,
    /// Remembered until the process exits.
    TrustThisSessionOnly,
}

/// Asks a human whether an untrusted certificate chain should be accepted anyway.
///
/// Blocks the calling handshake until answered. Implementations own their UI timeout policy.
pub trait TrustPrompt: Send + Sync {
    fn prompt_user(&self, chain: &CertificateChain, reason: &str) -> TrustVerdict;
}

impl<F> TrustPrompt for F
where
    F: Fn(&CertificateChain, &str) -> TrustVerdict + Send + Sync,
{
    fn prompt_user(&self, chain: &CertificateChain, reason: &str) -> TrustVerdict {
        self(chain, reason)
    }
}

/// Prompt for processes without any user: always declines.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenyPrompt;

impl TrustPrompt for DenyPrompt {
    fn prompt_user(&self, _: &CertificateChain, reason: &str) -> TrustVerdict {
        debug!(reason, "No interactive prompt available, declining");
        TrustVerdict::DoNotTrust
    }
}

/// Wraps a prompt so that it declines without blocking while the headless flag is set.
pub(crate) struct HeadlessGate {
    inner: Arc<dyn TrustPrompt>,
    store: Arc<dyn ConfigStore>,
    flag_key: String,
}

impl HeadlessGate {
    pub(crate) fn new(inner: Arc<dyn TrustPrompt>, store: Arc<dyn ConfigStore>, keys: &ConfigKeys) -> Self {
        Self {
            inner,
            store,
            flag_key: keys.prompt_disabled(),
        }
    }
}

impl TrustPrompt for HeadlessGate {
    fn prompt_user(&self, chain: &CertificateChain, reason: &str) -> TrustVerdict {
        if self.store.get_bool(&self.flag_key, false) {
            debug!(reason, "Prompt disabled by configuration, declining");
            return TrustVerdict::DoNotTrust;
        }

        self.inner.prompt_user(chain, reason)
    }
}
