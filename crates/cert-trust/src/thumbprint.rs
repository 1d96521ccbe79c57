use core::fmt;
use core::str::FromStr;

use sha1::{Digest as _, Sha1};
use sha2::Sha256;

/// Lowercase hex SHA-1 digest of a certificate's DER encoding.
///
/// SHA-1 is kept so that allow-list entries persisted by earlier versions still match.
/// This is an opaque comparison key for previously approved exceptions, not a trust anchor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Thumbprint(String);

impl Thumbprint {
    pub const HEX_LEN: usize = 40;

    pub fn of(cert_der: &[u8]) -> Self {
        Self(hex::encode(Sha1::digest(cert_der)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Thumbprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid thumbprint `{value}`: expected {} hexadecimal characters", Thumbprint::HEX_LEN)]
pub struct InvalidThumbprint {
    value: String,
}

impl FromStr for Thumbprint {
    type Err = InvalidThumbprint;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();

        if s.len() != Self::HEX_LEN || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(InvalidThumbprint { value: s.to_owned() });
        }

        Ok(Self(s.to_ascii_lowercase()))
    }
}

/// Colon separated uppercase SHA-256 fingerprint, the form most certificate viewers display.
pub fn sha256_fingerprint(cert_der: &[u8]) -> String {
    Sha256::digest(cert_der)
        .iter()
        .map(|byte| format!("{byte:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}
