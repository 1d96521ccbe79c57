#![allow(dead_code)]
#![allow(unreachable_pub)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::cast_possible_truncation)]

use std::collections::HashMap;
use std::io::{Read as _, Write as _};
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use cert_trust::{CertificateChain, IssuerFetcher, TrustVerdict};
use parking_lot::Mutex;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, CustomExtension, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, SanType,
};
use rustls_pki_types::CertificateDer;

const AIA_OID: &[u64] = &[1, 3, 6, 1, 5, 5, 7, 1, 1];
const CA_ISSUERS_OID_DER: &[u8] = &[0x06, 0x08, 0x2b, 0x06, 0x01, 0x05, 0x05, 0x07, 0x30, 0x02];

pub struct TestCert {
    pub cert: Certificate,
    pub key: KeyPair,
}

impl TestCert {
    pub fn der(&self) -> CertificateDer<'static> {
        self.cert.der().clone()
    }

    pub fn pem(&self) -> String {
        self.cert.pem()
    }
}

#[derive(Default)]
pub struct CertSpec<'a> {
    pub common_name: &'a str,
    pub dns_names: &'a [&'a str],
    pub emails: &'a [&'a str],
    pub ca: bool,
    pub ca_issuers: &'a [&'a str],
}

fn params(spec: &CertSpec<'_>) -> CertificateParams {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, spec.common_name);
    params.distinguished_name = dn;

    for dns_name in spec.dns_names {
        params
            .subject_alt_names
            .push(SanType::DnsName((*dns_name).try_into().unwrap()));
    }

    for email in spec.emails {
        params
            .subject_alt_names
            .push(SanType::Rfc822Name((*email).try_into().unwrap()));
    }

    if spec.ca {
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    } else {
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth, ExtendedKeyUsagePurpose::ClientAuth];
    }

    if !spec.ca_issuers.is_empty() {
        params
            .custom_extensions
            .push(CustomExtension::from_oid_content(AIA_OID, aia_extension_value(spec.ca_issuers)));
    }

    params
}

pub fn self_signed(spec: CertSpec<'_>) -> TestCert {
    let key = KeyPair::generate().unwrap();
    let cert = params(&spec).self_signed(&key).unwrap();
    TestCert { cert, key }
}

pub fn issued_by(spec: CertSpec<'_>, issuer: &TestCert) -> TestCert {
    let key = KeyPair::generate().unwrap();
    let cert = params(&spec).signed_by(&key, &issuer.cert, &issuer.key).unwrap();
    TestCert { cert, key }
}

pub fn root_ca(name: &str) -> TestCert {
    self_signed(CertSpec {
        common_name: name,
        ca: true,
        ..Default::default()
    })
}

/// Root, intermediate and a leaf for `dns_names` / `emails`, without any AIA pointer.
pub struct Pki {
    pub root: TestCert,
    pub intermediate: TestCert,
    pub leaf: TestCert,
}

impl Pki {
    pub fn new(dns_names: &[&str], emails: &[&str]) -> Self {
        let root = root_ca("Test Root CA");
        let intermediate = issued_by(
            CertSpec {
                common_name: "Test Intermediate CA",
                ca: true,
                ..Default::default()
            },
            &root,
        );
        let leaf = issued_by(
            CertSpec {
                common_name: "Test Leaf",
                dns_names,
                emails,
                ..Default::default()
            },
            &intermediate,
        );

        Self {
            root,
            intermediate,
            leaf,
        }
    }

    pub fn full_chain(&self) -> CertificateChain {
        CertificateChain::new(vec![self.leaf.der(), self.intermediate.der()]).unwrap()
    }

    pub fn leaf_only(&self) -> CertificateChain {
        CertificateChain::from_leaf(self.leaf.der())
    }
}

fn der_tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    let len = content.len();

    if len < 0x80 {
        out.push(len as u8);
    } else if len <= 0xff {
        out.extend_from_slice(&[0x81, len as u8]);
    } else {
        out.extend_from_slice(&[0x82, (len >> 8) as u8, len as u8]);
    }

    out.extend_from_slice(content);
    out
}

/// DER of `AuthorityInfoAccessSyntax` with one "CA Issuers" URI access description per entry.
fn aia_extension_value(uris: &[&str]) -> Vec<u8> {
    let mut descriptions = Vec::new();

    for uri in uris {
        let mut description = CA_ISSUERS_OID_DER.to_vec();
        // GeneralName uniformResourceIdentifier [6] IMPLICIT IA5String
        description.extend(der_tlv(0x86, uri.as_bytes()));
        descriptions.extend(der_tlv(0x30, &description));
    }

    der_tlv(0x30, &descriptions)
}

/// Serves fixed bodies per URI and counts how many times each URI was requested.
#[derive(Default)]
pub struct MapFetcher {
    bodies: HashMap<String, Vec<u8>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl MapFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, uri: &str, body: impl Into<Vec<u8>>) -> Self {
        self.bodies.insert(uri.to_owned(), body.into());
        self
    }

    pub fn calls(&self, uri: &str) -> usize {
        self.calls.lock().get(uri).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().values().sum()
    }
}

impl IssuerFetcher for MapFetcher {
    fn fetch(&self, uri: &str) -> anyhow::Result<Vec<u8>> {
        *self.calls.lock().entry(uri.to_owned()).or_default() += 1;

        match self.bodies.get(uri) {
            Some(body) => Ok(body.clone()),
            None => anyhow::bail!("404 for {uri}"),
        }
    }
}

/// Prompt answering with a fixed verdict and counting invocations.
pub struct CountingPrompt {
    verdict: TrustVerdict,
    calls: AtomicUsize,
    pub last_reason: Mutex<Option<String>>,
}

impl CountingPrompt {
    pub fn new(verdict: TrustVerdict) -> Arc<Self> {
        Arc::new(Self {
            verdict,
            calls: AtomicUsize::new(0),
            last_reason: Mutex::new(None),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl cert_trust::TrustPrompt for CountingPrompt {
    fn prompt_user(&self, _: &CertificateChain, reason: &str) -> TrustVerdict {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_reason.lock() = Some(reason.to_owned());
        self.verdict
    }
}

/// Answers `count` HTTP requests with `body`, then stops listening.
pub fn spawn_http_server(body: Vec<u8>, count: usize) -> SocketAddr {
    let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
    let addr = listener.local_addr().unwrap();

    thread::spawn(move || {
        for _ in 0..count {
            let Ok((mut stream, _)) = listener.accept() else {
                break;
            };

            let mut buf = [0u8; 1024];
            let mut req = Vec::new();
            loop {
                match stream.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        req.extend_from_slice(&buf[..n]);
                        if req.windows(4).any(|w| w == b"\r\n\r\n") {
                            break;
                        }
                    }
                }
            }

            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/pkix-cert\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            let _ = stream.write_all(head.as_bytes());
            let _ = stream.write_all(&body);
            let _ = stream.flush();
        }
    });

    addr
}
