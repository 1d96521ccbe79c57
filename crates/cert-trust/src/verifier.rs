//! Default (platform) trust manager and its reloadable wrapper.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arc_swap::ArcSwap;
use rustls::RootCertStore;
use rustls::crypto::CryptoProvider;
use rustls::server::danger::ClientCertVerifier;
use rustls_pki_types::{CertificateDer, UnixTime};

use crate::anchors::TrustAnchorSource;
use crate::chain::CertificateChain;
use crate::engine::PeerSide;

/// Path validation against a fixed set of trust anchors (no identity check).
pub struct DefaultVerifier {
    generation: u64,
    roots: Arc<RootCertStore>,
    client_verifier: Option<Arc<dyn ClientCertVerifier>>,
    provider: Arc<CryptoProvider>,
}

impl DefaultVerifier {
    pub fn new(anchors: Vec<CertificateDer<'static>>, provider: Arc<CryptoProvider>, generation: u64) -> Self {
        let mut roots = RootCertStore::empty();
        let (added, ignored) = roots.add_parsable_certificates(anchors);

        if ignored > 0 {
            warn!(ignored, "Some trust anchors couldn't be parsed");
        }

        let roots = Arc::new(roots);

        let client_verifier = if roots.is_empty() {
            None
        } else {
            rustls::server::WebPkiClientVerifier::builder_with_provider(Arc::clone(&roots), Arc::clone(&provider))
                .build()
                .inspect_err(|error| warn!(%error, "Couldn't build client certificate verifier"))
                .ok()
        };

        debug!(generation, anchors = added, "Built default trust manager");

        Self {
            generation,
            roots,
            client_verifier,
            provider,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn anchor_count(&self) -> usize {
        self.roots.len()
    }

    pub fn verify(&self, chain: &CertificateChain, side: PeerSide) -> Result<(), rustls::Error> {
        let now = UnixTime::now();

        match side {
            PeerSide::Server => {
                let end_entity = rustls::server::ParsedCertificate::try_from(chain.leaf())?;

                rustls::client::verify_server_cert_signed_by_trust_anchor(
                    &end_entity,
                    &self.roots,
                    chain.intermediates(),
                    now,
                    self.provider.signature_verification_algorithms.all,
                )
            }
            PeerSide::Client => {
                let Some(client_verifier) = &self.client_verifier else {
                    return Err(rustls::Error::InvalidCertificate(rustls::CertificateError::UnknownIssuer));
                };

                client_verifier
                    .verify_client_cert(chain.leaf(), chain.intermediates(), now)
                    .map(|_| ())
            }
        }
    }
}

/// Holds the current [`DefaultVerifier`] behind an atomically swapped pointer.
///
/// Readers always observe a fully constructed instance; a reload builds the new one aside and
/// publishes it in a single store.
pub struct ReloadableVerifier {
    current: ArcSwap<DefaultVerifier>,
    source: Arc<dyn TrustAnchorSource>,
    provider: Arc<CryptoProvider>,
    next_generation: AtomicU64,
}

impl ReloadableVerifier {
    /// A failing initial load leaves an empty anchor set (every chain fails default verification).
    pub fn new(source: Arc<dyn TrustAnchorSource>, provider: Arc<CryptoProvider>) -> Self {
        let anchors = source.load().unwrap_or_else(|error| {
            error!(error = format!("{error:#}"), "Failed to load trust anchors");
            Vec::new()
        });

        Self {
            current: ArcSwap::from_pointee(DefaultVerifier::new(anchors, Arc::clone(&provider), 0)),
            source,
            provider,
            next_generation: AtomicU64::new(1),
        }
    }

    pub fn provider(&self) -> &Arc<CryptoProvider> {
        &self.provider
    }

    pub fn current(&self) -> Arc<DefaultVerifier> {
        self.current.load_full()
    }

    pub fn verify(&self, chain: &CertificateChain, side: PeerSide) -> Result<(), rustls::Error> {
        self.current.load().verify(chain, side)
    }

    /// Rebuilds the inner trust manager from freshly loaded anchors and swaps it in.
    pub fn reload(&self) -> anyhow::Result<()> {
        let anchors = self.source.load()?;
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);

        self.current
            .store(Arc::new(DefaultVerifier::new(anchors, Arc::clone(&self.provider), generation)));

        info!(generation, "Default trust manager reloaded");

        Ok(())
    }
}
