use crate::identity::IdentityMismatch;

/// Why a chain was handed over to the allow-list and prompt fallback.
#[derive(Debug, thiserror::Error)]
pub enum TrustError {
    #[error("default trust verification failed")]
    DefaultVerification(#[source] rustls::Error),
    #[error(transparent)]
    IdentityMismatch(#[from] IdentityMismatch),
}

/// Terminal failure: the chain is not trusted and the handshake must fail.
#[derive(Debug, thiserror::Error)]
#[error("the peer provided certificate with subject <{subject}> is not trusted")]
pub struct NotTrusted {
    pub subject: String,
    #[source]
    pub cause: TrustError,
}

impl From<NotTrusted> for rustls::Error {
    fn from(error: NotTrusted) -> Self {
        rustls::Error::InvalidCertificate(rustls::CertificateError::Other(rustls::OtherError(
            std::sync::Arc::new(error),
        )))
    }
}
