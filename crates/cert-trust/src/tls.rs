//! rustls verifiers backed by a [`TrustEngine`].
//!
//! Both verifiers run the full trust decision inside the handshake callback, which can block
//! on network I/O, a subprocess or the user. Drive such handshakes from a blocking context.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{DigitallySignedStruct, DistinguishedName, Error, SignatureScheme};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};

use crate::chain::CertificateChain;
use crate::engine::{PeerSide, TrustEngine};
use crate::identity::IdentityCheck;

fn handshake_chain(end_entity: &CertificateDer<'_>, intermediates: &[CertificateDer<'_>]) -> CertificateChain {
    let mut chain = CertificateChain::from_leaf(end_entity.clone().into_owned());

    for intermediate in intermediates {
        chain.push(intermediate.clone().into_owned());
    }

    chain
}

fn server_name_identity(server_name: &ServerName<'_>) -> IdentityCheck {
    match server_name {
        ServerName::DnsName(name) => {
            let name: &str = name.as_ref();
            IdentityCheck::hostnames([name])
        }
        ServerName::IpAddress(ip) => IdentityCheck::hostnames([IpAddr::from(*ip).to_string()]),
        _ => IdentityCheck::none(),
    }
}

/// Client-side verifier: checks the server chain and the server name it was requested for.
pub struct TrustEngineServerVerifier {
    engine: Arc<TrustEngine>,
    provider: Arc<CryptoProvider>,
    identity: Option<IdentityCheck>,
}

impl TrustEngineServerVerifier {
    pub fn new(engine: Arc<TrustEngine>) -> Self {
        let provider = Arc::clone(engine.verifier().provider());

        Self {
            engine,
            provider,
            identity: None,
        }
    }

    /// Verifies `identity` instead of the server name of the connection.
    #[must_use]
    pub fn with_identity(mut self, identity: IdentityCheck) -> Self {
        self.identity = Some(identity);
        self
    }
}

impl fmt::Debug for TrustEngineServerVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrustEngineServerVerifier")
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

impl ServerCertVerifier for TrustEngineServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        _: &[u8],
        _: UnixTime,
    ) -> Result<ServerCertVerified, Error> {
        let chain = handshake_chain(end_entity, intermediates);

        let identity = match &self.identity {
            Some(identity) => identity.clone(),
            None => server_name_identity(server_name),
        };

        self.engine.check_trusted(&chain, PeerSide::Server, &identity)?;

        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

/// Server-side verifier for mutually authenticated connections.
pub struct TrustEngineClientVerifier {
    engine: Arc<TrustEngine>,
    provider: Arc<CryptoProvider>,
    identity: IdentityCheck,
    mandatory: bool,
}

impl TrustEngineClientVerifier {
    /// Client certificates are mandatory and no identity is checked.
    pub fn new(engine: Arc<TrustEngine>) -> Self {
        let provider = Arc::clone(engine.verifier().provider());

        Self {
            engine,
            provider,
            identity: IdentityCheck::none(),
            mandatory: true,
        }
    }

    /// Identities the client certificate is expected to carry, such as email addresses.
    #[must_use]
    pub fn with_identity(mut self, identity: IdentityCheck) -> Self {
        self.identity = identity;
        self
    }

    #[must_use]
    pub fn optional(mut self) -> Self {
        self.mandatory = false;
        self
    }
}

impl fmt::Debug for TrustEngineClientVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrustEngineClientVerifier")
            .field("identity", &self.identity)
            .field("mandatory", &self.mandatory)
            .finish_non_exhaustive()
    }
}

impl ClientCertVerifier for TrustEngineClientVerifier {
    fn client_auth_mandatory(&self) -> bool {
        self.mandatory
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _: UnixTime,
    ) -> Result<ClientCertVerified, Error> {
        let chain = handshake_chain(end_entity, intermediates);

        self.engine.check_trusted(&chain, PeerSide::Client, &self.identity)?;

        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}
