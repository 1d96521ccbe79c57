use std::fmt::Write as _;

use rustls_pki_types::CertificateDer;

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("certificate chain is empty")]
    Empty,
    #[error("failed to read certificate number {idx} from PEM input")]
    Pem {
        idx: usize,
        #[source]
        source: std::io::Error,
    },
}

/// Ordered certificates: index 0 is the leaf, each following entry is the issuer of the previous one.
///
/// Never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateChain(Vec<CertificateDer<'static>>);

impl CertificateChain {
    pub fn new(certs: Vec<CertificateDer<'static>>) -> Result<Self, ChainError> {
        if certs.is_empty() {
            return Err(ChainError::Empty);
        }

        Ok(Self(certs))
    }

    pub fn from_leaf(leaf: CertificateDer<'static>) -> Self {
        Self(vec![leaf])
    }

    /// Reads every `CERTIFICATE` block of a PEM bundle, in order.
    pub fn from_pem(pem: &[u8]) -> Result<Self, ChainError> {
        let mut reader = pem;
        let mut certs = Vec::new();

        for (idx, cert) in rustls_pemfile::certs(&mut reader).enumerate() {
            certs.push(cert.map_err(|source| ChainError::Pem { idx, source })?);
        }

        Self::new(certs)
    }

    pub fn leaf(&self) -> &CertificateDer<'static> {
        &self.0[0]
    }

    pub fn intermediates(&self) -> &[CertificateDer<'static>] {
        &self.0[1..]
    }

    pub fn tail(&self) -> &CertificateDer<'static> {
        &self.0[self.0.len() - 1]
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always `false`, a chain holds at least its leaf.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CertificateDer<'static>> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[CertificateDer<'static>] {
        &self.0
    }

    pub(crate) fn push(&mut self, issuer: CertificateDer<'static>) {
        self.0.push(issuer);
    }

    pub fn into_vec(self) -> Vec<CertificateDer<'static>> {
        self.0
    }

    pub fn to_pem(&self) -> String {
        self.0.iter().map(|cert| cert_to_pem(cert)).collect::<Vec<_>>().join("\n")
    }
}

/// PEM-encodes a single DER certificate, 64 columns per line.
pub fn cert_to_pem(cert_der: &[u8]) -> String {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;

    let body = STANDARD.encode(cert_der);

    let mut out = String::from("-----BEGIN CERTIFICATE-----");

    for (idx, char) in body.chars().enumerate() {
        if idx % 64 == 0 {
            out.push('\n');
        }
        out.push(char);
    }

    // Writing into a String never fails.
    let _ = write!(out, "\n-----END CERTIFICATE-----\n");

    out
}

/// Short human readable name of a certificate, for logs and prompts.
pub fn subject_of(cert: &CertificateDer<'_>) -> String {
    match x509_parser::parse_x509_certificate(cert) {
        Ok((_, parsed)) => parsed.subject().to_string(),
        Err(_) => String::from("???"),
    }
}
