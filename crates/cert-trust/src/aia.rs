//! Chain completion through Authority Information Access (AIA) "CA Issuers" pointers.
//!
//! Servers regularly send their leaf certificate alone. When that happens, the issuer
//! certificates are downloaded from the URIs listed in the AIA extension, one hop at a
//! time, until a self-signed certificate or a certificate without usable AIA is reached.
//! Downloads (and download failures) are cached per URI for a bounded time.

use std::io::Read as _;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use dashmap::DashMap;
use rustls_pki_types::CertificateDer;
use x509_parser::extensions::{GeneralName, ParsedExtension};

use crate::chain::CertificateChain;

/// id-ad-caIssuers (RFC 5280, 4.2.2.1)
const CA_ISSUERS_OID: &str = "1.3.6.1.5.5.7.48.2";

/// Largest issuer certificate body accepted from an AIA location.
const MAX_ISSUER_SIZE: u64 = 64 * 1024;

type X509ParseError = x509_parser::nom::Err<x509_parser::error::X509Error>;

pub const DEFAULT_MAX_HOPS: usize = 10;
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(10 * 60);

/// Downloads raw issuer certificates from AIA locations.
///
/// Called synchronously from within certificate verification, typically on a handshake thread.
pub trait IssuerFetcher: Send + Sync {
    fn fetch(&self, uri: &str) -> anyhow::Result<Vec<u8>>;
}

/// [`IssuerFetcher`] over plain HTTP(S), using a blocking client so it can run inside rustls callbacks.
pub struct HttpIssuerFetcher {
    agent: ureq::Agent,
}

impl HttpIssuerFetcher {
    /// Without `timeout`, or with one too large to be represented, the transport defaults apply.
    pub fn new(timeout: Option<Duration>) -> Self {
        let mut builder = ureq::AgentBuilder::new();

        if let Some(timeout) = timeout.filter(|timeout| Instant::now().checked_add(*timeout).is_some()) {
            builder = builder.timeout(timeout);
        }

        Self { agent: builder.build() }
    }
}

impl Default for HttpIssuerFetcher {
    fn default() -> Self {
        Self::new(None)
    }
}

impl IssuerFetcher for HttpIssuerFetcher {
    fn fetch(&self, uri: &str) -> anyhow::Result<Vec<u8>> {
        let response = self
            .agent
            .get(uri)
            .call()
            .with_context(|| format!("GET {uri} failed"))?;

        let mut body = Vec::new();
        response
            .into_reader()
            .take(MAX_ISSUER_SIZE + 1)
            .read_to_end(&mut body)
            .context("failed to read response body")?;

        if body.len() as u64 > MAX_ISSUER_SIZE {
            anyhow::bail!("response body exceeds {MAX_ISSUER_SIZE} bytes");
        }

        Ok(body)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    #[error("download failed: {0}")]
    Download(String),
    #[error("downloaded data is not an X.509 certificate: {0}")]
    Parse(String),
}

#[derive(Clone)]
struct CacheEntry {
    outcome: Result<CertificateDer<'static>, FetchError>,
    /// `None` when the lifetime is too large to be represented: never expires.
    expires_at: Option<Instant>,
}

/// URI keyed cache of issuer downloads; expired entries are replaced on next access, never purged.
pub struct AiaCache {
    entries: DashMap<String, CacheEntry>,
    ttl: Duration,
}

impl AiaCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn get(&self, uri: &str, now: Instant) -> Option<Result<CertificateDer<'static>, FetchError>> {
        let entry = self.entries.get(uri)?;

        if entry.expires_at.is_none_or(|expires_at| now < expires_at) {
            Some(entry.outcome.clone())
        } else {
            None
        }
    }

    fn insert(&self, uri: &str, outcome: Result<CertificateDer<'static>, FetchError>, now: Instant) {
        let entry = CacheEntry {
            outcome,
            expires_at: now.checked_add(self.ttl),
        };

        self.entries.insert(uri.to_owned(), entry);
    }
}

/// Completes single-certificate chains by walking AIA "CA Issuers" URIs.
pub struct ChainCompleter {
    fetcher: Arc<dyn IssuerFetcher>,
    cache: AiaCache,
    max_hops: usize,
}

impl ChainCompleter {
    pub fn new(fetcher: Arc<dyn IssuerFetcher>, max_hops: usize, cache_ttl: Duration) -> Self {
        Self {
            fetcher,
            cache: AiaCache::new(cache_ttl),
            max_hops,
        }
    }

    pub fn cache(&self) -> &AiaCache {
        &self.cache
    }

    /// Returns the best chain obtainable; never fails.
    ///
    /// Chains with more than one entry and self-signed leaves are returned as is.
    pub fn complete(&self, chain: &CertificateChain) -> CertificateChain {
        if chain.len() > 1 {
            return chain.clone();
        }

        match is_self_signed(chain.leaf()) {
            Ok(false) => {}
            Ok(true) => {
                trace!("Self-signed leaf, nothing to complete");
                return chain.clone();
            }
            Err(error) => {
                debug!(%error, "Couldn't parse leaf certificate, skipping chain completion");
                return chain.clone();
            }
        }

        let mut completed = chain.clone();

        for hop in 0..self.max_hops {
            let uris = match ca_issuer_uris(completed.tail()) {
                Ok(uris) => uris,
                Err(error) => {
                    debug!(%error, hop, "Couldn't read AIA extension");
                    break;
                }
            };

            if uris.is_empty() {
                break;
            }

            let next = uris.iter().find_map(|uri| match self.issuer_at(uri) {
                Ok(issuer) if matches!(is_self_signed(&issuer), Ok(false)) => Some(issuer),
                Ok(_) => {
                    trace!(uri, "Issuer is self-signed, not appended");
                    None
                }
                Err(error) => {
                    debug!(uri, %error, "Couldn't obtain issuer certificate");
                    None
                }
            });

            match next {
                Some(issuer) => {
                    debug!(hop, "Appended issuer certificate to incomplete chain");
                    completed.push(issuer);
                }
                None => break,
            }
        }

        completed
    }

    fn issuer_at(&self, uri: &str) -> Result<CertificateDer<'static>, FetchError> {
        let now = Instant::now();

        if let Some(outcome) = self.cache.get(uri, now) {
            trace!(uri, "AIA cache hit");
            return outcome;
        }

        debug!(uri, "Fetch issuer certificate");

        let outcome = self
            .fetcher
            .fetch(uri)
            .map_err(|e| FetchError::Download(format!("{e:#}")))
            .and_then(|body| parse_issuer(&body));

        self.cache.insert(uri, outcome.clone(), now);

        outcome
    }
}

fn parse_issuer(body: &[u8]) -> Result<CertificateDer<'static>, FetchError> {
    let der = if body.trim_ascii_start().starts_with(b"-----BEGIN") {
        let mut reader = body;
        rustls_pemfile::certs(&mut reader)
            .next()
            .ok_or_else(|| FetchError::Parse(String::from("no certificate in PEM body")))?
            .map_err(|e| FetchError::Parse(e.to_string()))?
    } else {
        CertificateDer::from(body.to_vec())
    };

    x509_parser::parse_x509_certificate(&der).map_err(|e| FetchError::Parse(e.to_string()))?;

    Ok(der)
}

pub(crate) fn is_self_signed(cert: &CertificateDer<'_>) -> Result<bool, X509ParseError> {
    let (_, cert) = x509_parser::parse_x509_certificate(cert)?;
    Ok(cert.issuer().as_raw() == cert.subject().as_raw())
}

/// HTTP(S) "CA Issuers" locations of the AIA extension, in extension order.
///
/// Other schemes (LDAP, ...) are left to the platform's own resolution.
fn ca_issuer_uris(cert: &CertificateDer<'_>) -> Result<Vec<String>, X509ParseError> {
    let (_, cert) = x509_parser::parse_x509_certificate(cert)?;

    let mut uris = Vec::new();

    for extension in cert.extensions() {
        let ParsedExtension::AuthorityInfoAccess(aia) = extension.parsed_extension() else {
            continue;
        };

        for description in &aia.accessdescs {
            if description.access_method.to_id_string() != CA_ISSUERS_OID {
                continue;
            }

            if let GeneralName::URI(uri) = &description.access_location {
                if is_http_uri(uri) {
                    uris.push((*uri).to_owned());
                } else {
                    trace!(uri, "Skipping non-HTTP AIA location");
                }
            }
        }
    }

    Ok(uris)
}

fn is_http_uri(uri: &str) -> bool {
    let lower = uri.to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}
