//! Identity verification against a certificate's subject alternative names.

use std::collections::BTreeSet;
use std::net::IpAddr;

use rustls_pki_types::CertificateDer;
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::GeneralName;

/// How candidate identities are compared with the certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityMatcher {
    /// Browser-compatible hostname rules against DNS/IP SANs, or the common name when no DNS SAN is present.
    Hostname,
    /// Case-insensitive equality with an RFC 822 SAN entry.
    Email,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("none of the identities {identities:?} matched the certificate with subject <{subject}>")]
pub struct IdentityMismatch {
    pub identities: Vec<String>,
    pub subject: String,
}

impl IdentityMatcher {
    /// Succeeds when any one of `identities` matches `cert`.
    pub fn verify(self, identities: &BTreeSet<String>, cert: &CertificateDer<'_>) -> Result<(), IdentityMismatch> {
        let mismatch = |subject: String| IdentityMismatch {
            identities: identities.iter().cloned().collect(),
            subject,
        };

        let Ok((_, cert)) = x509_parser::parse_x509_certificate(cert) else {
            return Err(mismatch(String::from("<unparsable certificate>")));
        };

        let matched = match self {
            IdentityMatcher::Hostname => {
                let names = CertNames::hostnames_of(&cert);
                identities.iter().any(|identity| names.matches_host(identity))
            }
            IdentityMatcher::Email => {
                let emails = san_entries(&cert, |name| match name {
                    GeneralName::RFC822Name(email) => Some((*email).to_owned()),
                    _ => None,
                });
                identities
                    .iter()
                    .any(|identity| emails.iter().any(|email| email.eq_ignore_ascii_case(identity)))
            }
        };

        if matched {
            trace!(matcher = ?self, "Identity matched");
            Ok(())
        } else {
            Err(mismatch(cert.subject().to_string()))
        }
    }
}

/// The identities a single `check_trusted` call verifies, and how.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityCheck {
    matcher: IdentityMatcher,
    identities: BTreeSet<String>,
}

impl IdentityCheck {
    /// No identity to verify: chain trust alone decides.
    pub fn none() -> Self {
        Self {
            matcher: IdentityMatcher::Hostname,
            identities: BTreeSet::new(),
        }
    }

    pub fn hostnames<I, S>(hostnames: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(IdentityMatcher::Hostname, hostnames)
    }

    pub fn emails<I, S>(emails: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(IdentityMatcher::Email, emails)
    }

    pub fn new<I, S>(matcher: IdentityMatcher, identities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            matcher,
            identities: identities.into_iter().map(Into::into).collect(),
        }
    }

    pub fn matcher(&self) -> IdentityMatcher {
        self.matcher
    }

    pub fn identities(&self) -> &BTreeSet<String> {
        &self.identities
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    pub fn verify(&self, cert: &CertificateDer<'_>) -> Result<(), IdentityMismatch> {
        self.matcher.verify(&self.identities, cert)
    }
}

struct CertNames {
    dns: Vec<String>,
    ips: Vec<IpAddr>,
}

impl CertNames {
    fn hostnames_of(cert: &X509Certificate<'_>) -> Self {
        let mut dns = san_entries(cert, |name| match name {
            GeneralName::DNSName(dns) => Some((*dns).to_owned()),
            _ => None,
        });

        let ips = san_entries(cert, |name| match name {
            GeneralName::IPAddress(bytes) => ip_from_bytes(bytes),
            _ => None,
        });

        // Common names are only considered when the certificate lists no DNS name.
        if dns.is_empty() {
            dns = cert
                .subject()
                .iter_common_name()
                .filter_map(|cn| cn.as_str().ok())
                .map(str::to_owned)
                .collect();
        }

        Self { dns, ips }
    }

    fn matches_host(&self, host: &str) -> bool {
        let host = host.trim_end_matches('.');

        let bare = host.trim_start_matches('[').trim_end_matches(']');

        if let Ok(ip) = bare.parse::<IpAddr>() {
            return self.ips.contains(&ip) || self.dns.iter().any(|name| name == bare);
        }

        self.dns.iter().any(|pattern| hostname_matches(pattern, host))
    }
}

fn san_entries<T>(cert: &X509Certificate<'_>, mut select: impl FnMut(&GeneralName<'_>) -> Option<T>) -> Vec<T> {
    match cert.subject_alternative_name() {
        Ok(Some(san)) => san.value.general_names.iter().filter_map(&mut select).collect(),
        Ok(None) => Vec::new(),
        Err(error) => {
            debug!(%error, "Invalid subject alternative name extension");
            Vec::new()
        }
    }
}

fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => <[u8; 4]>::try_from(bytes).ok().map(IpAddr::from),
        16 => <[u8; 16]>::try_from(bytes).ok().map(IpAddr::from),
        _ => None,
    }
}

/// Browser-compatible hostname matching.
///
/// Case-insensitive; a wildcard is only honored in the leftmost label and the pattern needs at
/// least two labels after it. A bare `*` label covers one or more host labels, a partial
/// wildcard (`w*`, `*w`, `w*w`) stays within a single label.
pub(crate) fn hostname_matches(pattern: &str, host: &str) -> bool {
    let pattern = pattern.trim_end_matches('.').to_ascii_lowercase();
    let host = host.trim_end_matches('.').to_ascii_lowercase();

    if pattern.is_empty() || host.is_empty() {
        return false;
    }

    let Some((first_label, suffix)) = pattern.split_once('.') else {
        return pattern == host;
    };

    if !first_label.contains('*') {
        return pattern == host;
    }

    if suffix.contains('*') || suffix.split('.').count() < 2 || first_label.matches('*').count() > 1 {
        return false;
    }

    let Some(host_prefix) = host.strip_suffix(suffix).and_then(|prefix| prefix.strip_suffix('.')) else {
        return false;
    };

    if host_prefix.is_empty() {
        return false;
    }

    if first_label == "*" {
        return true;
    }

    if host_prefix.contains('.') {
        return false;
    }

    let (before, after) = first_label.split_once('*').unwrap_or((first_label, ""));

    host_prefix.len() >= before.len() + after.len() && host_prefix.starts_with(before) && host_prefix.ends_with(after)
}
