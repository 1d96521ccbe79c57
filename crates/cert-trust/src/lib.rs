//! Certificate trust-decision engine.
//!
//! Decides whether a certificate chain presented during a TLS handshake should be
//! accepted. On top of the platform trust verification it completes chains sent
//! without their intermediates, consults a two-tier allow-list of user approved
//! thumbprints, verifies hostname or email identities and, on Windows, nudges the
//! OS root store into refreshing before giving up.
//!
//! The entry point is [`TrustEngine::check_trusted`]. [`tls`] adapts the engine
//! to rustls verifier traits.

#[macro_use]
extern crate tracing;

pub mod aia;
pub mod allow_list;
pub mod anchors;
pub mod chain;
pub mod config;
pub mod engine;
pub mod error;
pub mod identity;
pub mod platform;
pub mod prompt;
pub mod remediation;
pub mod subprocess;
pub mod thumbprint;
pub mod tls;
pub mod verifier;

pub use aia::{ChainCompleter, HttpIssuerFetcher, IssuerFetcher};
pub use allow_list::{AllowList, AllowListKey};
pub use chain::CertificateChain;
pub use config::{ConfigStore, JsonConfigStore, MemoryConfigStore, TrustConf};
pub use engine::{PeerSide, TrustEngine, TrustEngineBuilder};
pub use error::{NotTrusted, TrustError};
pub use identity::{IdentityCheck, IdentityMatcher, IdentityMismatch};
pub use platform::Platform;
pub use prompt::{TrustPrompt, TrustVerdict};
pub use thumbprint::Thumbprint;
