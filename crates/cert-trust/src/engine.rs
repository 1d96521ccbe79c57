//! The trust decision state machine.
//!
//! Order of evaluation for every call, never reordered:
//!
//! 1. operator "always trust" override
//! 2. chain completion
//! 3. default (platform) verification, with one remediation + retry on Windows
//! 4. identity matching; after a default failure only an email match accepts the chain
//! 5. allow-list lookup
//! 6. interactive prompt, whose verdict is recorded in the allow-list

use std::sync::Arc;

use rustls::crypto::CryptoProvider;

use crate::aia::{ChainCompleter, HttpIssuerFetcher, IssuerFetcher};
use crate::allow_list::{AllowList, AllowListKey};
use crate::anchors::{KeychainAnchors, NativeAnchors, TrustAnchorSource};
use crate::chain::{CertificateChain, subject_of};
use crate::config::{ConfigKeys, ConfigStore, TrustConf};
use crate::error::{NotTrusted, TrustError};
use crate::identity::{IdentityCheck, IdentityMatcher};
use crate::platform::Platform;
use crate::prompt::{HeadlessGate, TrustPrompt, TrustVerdict};
use crate::remediation::Remediation;
use crate::thumbprint::{Thumbprint, sha256_fingerprint};
use crate::verifier::ReloadableVerifier;

/// Which end of the connection presented the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerSide {
    /// We are the client, verifying a server certificate.
    Server,
    /// We are the server, verifying a client certificate.
    Client,
}

pub struct TrustEngine {
    keys: ConfigKeys,
    store: Arc<dyn ConfigStore>,
    completer: ChainCompleter,
    verifier: ReloadableVerifier,
    remediation: Option<Remediation>,
    allow_list: AllowList,
    prompt: HeadlessGate,
    platform: Platform,
}

impl TrustEngine {
    pub fn builder(conf: TrustConf, store: Arc<dyn ConfigStore>, prompt: Arc<dyn TrustPrompt>) -> TrustEngineBuilder {
        TrustEngineBuilder {
            conf,
            store,
            prompt,
            fetcher: None,
            anchors: None,
            platform: Platform::current(),
            provider: None,
        }
    }

    pub fn allow_list(&self) -> &AllowList {
        &self.allow_list
    }

    pub fn verifier(&self) -> &ReloadableVerifier {
        &self.verifier
    }

    pub fn chain_completer(&self) -> &ChainCompleter {
        &self.completer
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    /// Decides whether `chain` is trusted.
    ///
    /// May download issuer certificates, run an OS probe (Windows) and block on the
    /// interactive prompt. Safe to call concurrently.
    pub fn check_trusted(
        &self,
        chain: &CertificateChain,
        side: PeerSide,
        identity: &IdentityCheck,
    ) -> Result<(), NotTrusted> {
        if self.store.get_bool(&self.keys.always_trust_mode_enabled(), false) {
            warn!(subject = %subject_of(chain.leaf()), "Always-trust mode is enabled, certificate accepted without verification");
            return Ok(());
        }

        let chain = self.completer.complete(chain);

        let failure = match self.default_verify(&chain, side) {
            Ok(()) => {
                if identity.is_empty() {
                    debug!(?side, "Chain trusted by the default trust manager");
                    return Ok(());
                }

                match identity.verify(chain.leaf()) {
                    Ok(()) => {
                        debug!(?side, "Chain and identity verified");
                        return Ok(());
                    }
                    Err(mismatch) => TrustError::IdentityMismatch(mismatch),
                }
            }
            Err(error) => {
                debug!(?side, %error, "Default trust manager rejected the chain");

                // Only an email match accepts a chain the default trust manager rejected.
                if identity.matcher() == IdentityMatcher::Email
                    && !identity.is_empty()
                    && identity.verify(chain.leaf()).is_ok()
                {
                    debug!("Client email verified, accepting chain");
                    return Ok(());
                }

                TrustError::DefaultVerification(error)
            }
        };

        self.fallback(&chain, side, identity, failure)
    }

    fn default_verify(&self, chain: &CertificateChain, side: PeerSide) -> Result<(), rustls::Error> {
        let error = match self.verifier.verify(chain, side) {
            Ok(()) => return Ok(()),
            Err(error) => error,
        };

        let Some(remediation) = &self.remediation else {
            return Err(error);
        };

        debug!(%error, "Default verification failed, attempting root store remediation");

        if let Err(error) = remediation.remediate(chain.leaf(), &self.verifier) {
            warn!(error = format!("{:#}", anyhow::Error::new(error)), "Root store remediation failed");
        }

        self.verifier.verify(chain, side)
    }

    fn fallback(
        &self,
        chain: &CertificateChain,
        side: PeerSide,
        identity: &IdentityCheck,
        failure: TrustError,
    ) -> Result<(), NotTrusted> {
        let leaf = chain.leaf();
        let thumbprint = Thumbprint::of(leaf);
        let keys = AllowListKey::for_check(identity, &thumbprint);

        if keys.iter().any(|key| self.allow_list.is_allowed(key, &thumbprint)) {
            debug!(%thumbprint, "Certificate previously approved by the user");
            return Ok(());
        }

        let reason = prompt_reason(side, identity, &failure, leaf);

        match self.prompt.prompt_user(chain, &reason) {
            TrustVerdict::DoNotTrust => {
                info!(%thumbprint, "Certificate not trusted");
                Err(NotTrusted {
                    subject: subject_of(leaf),
                    cause: failure,
                })
            }
            TrustVerdict::TrustAlways => {
                for key in &keys {
                    if let Err(error) = self.allow_list.record_always(key, &thumbprint) {
                        error!(%key, error = format!("{error:#}"), "Failed to persist certificate approval");
                    }
                }
                Ok(())
            }
            TrustVerdict::TrustThisSessionOnly => {
                for key in &keys {
                    self.allow_list.record_session_only(key, &thumbprint);
                }
                Ok(())
            }
        }
    }
}

fn prompt_reason(
    side: PeerSide,
    identity: &IdentityCheck,
    failure: &TrustError,
    leaf: &rustls_pki_types::CertificateDer<'_>,
) -> String {
    let who = if identity.is_empty() {
        String::from("the server you are connecting to")
    } else {
        let names = identity.identities().iter().cloned().collect::<Vec<_>>().join(", ");
        match side {
            PeerSide::Server => format!("the server {names}"),
            PeerSide::Client => format!("the peer {names}"),
        }
    };

    let problem = match failure {
        TrustError::DefaultVerification(error) => format!("its certificate could not be verified ({error})"),
        TrustError::IdentityMismatch(_) => String::from("its certificate was issued for a different identity"),
    };

    format!(
        "Cannot establish a secure connection with {who}: {problem}.\nSubject: {}\nSHA-256 fingerprint: {}",
        subject_of(leaf),
        sha256_fingerprint(leaf),
    )
}

pub struct TrustEngineBuilder {
    conf: TrustConf,
    store: Arc<dyn ConfigStore>,
    prompt: Arc<dyn TrustPrompt>,
    fetcher: Option<Arc<dyn IssuerFetcher>>,
    anchors: Option<Arc<dyn TrustAnchorSource>>,
    platform: Platform,
    provider: Option<Arc<CryptoProvider>>,
}

impl TrustEngineBuilder {
    /// Issuer downloads; plain HTTP(S) by default.
    #[must_use]
    pub fn fetcher(mut self, fetcher: Arc<dyn IssuerFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Trust anchors of the default trust manager; platform-appropriate by default.
    #[must_use]
    pub fn anchors(mut self, anchors: Arc<dyn TrustAnchorSource>) -> Self {
        self.anchors = Some(anchors);
        self
    }

    /// Overrides the detected platform.
    #[must_use]
    pub fn platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    /// Crypto provider for signature checks; ring by default.
    #[must_use]
    pub fn crypto_provider(mut self, provider: Arc<CryptoProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn build(self) -> TrustEngine {
        let Self {
            conf,
            store,
            prompt,
            fetcher,
            anchors,
            platform,
            provider,
        } = self;

        let keys = conf.keys();

        let fetcher: Arc<dyn IssuerFetcher> = match fetcher {
            Some(fetcher) => fetcher,
            None => Arc::new(HttpIssuerFetcher::new(conf.aia_fetch_timeout())),
        };
        let completer = ChainCompleter::new(fetcher, conf.aia.max_hops, conf.aia_cache_ttl());

        let anchors: Arc<dyn TrustAnchorSource> = match (anchors, platform) {
            (Some(anchors), _) => anchors,
            (None, Platform::MacOs) => Arc::new(KeychainAnchors::new(
                conf.keychains.clone(),
                conf.keychain_export_timeout(),
            )),
            (None, Platform::Windows | Platform::Other) => Arc::new(NativeAnchors),
        };
        let provider = provider.unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()));
        let verifier = ReloadableVerifier::new(anchors, provider);

        let remediation = (platform == Platform::Windows && conf.remediation.enabled).then(|| {
            Remediation::new(
                conf.state_dir(),
                conf.remediation.command.clone(),
                conf.remediation_timeout(),
            )
        });

        let allow_list = AllowList::new(Arc::clone(&store), keys.clone());
        let prompt = HeadlessGate::new(prompt, Arc::clone(&store), &keys);

        TrustEngine {
            keys,
            store,
            completer,
            verifier,
            remediation,
            allow_list,
            prompt,
            platform,
        }
    }
}
