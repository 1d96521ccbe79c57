//! Sources of trust anchors for the default trust manager.

use std::process::Command;
use std::time::Duration;

use anyhow::Context as _;
use camino::Utf8PathBuf;
use rustls_pki_types::CertificateDer;

use crate::subprocess::run_bounded;

/// Provides the root certificates a default trust manager is built from.
///
/// Called once at construction and again on every reload.
pub trait TrustAnchorSource: Send + Sync {
    fn load(&self) -> anyhow::Result<Vec<CertificateDer<'static>>>;
}

/// OS trust store, through `rustls-native-certs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeAnchors;

impl TrustAnchorSource for NativeAnchors {
    fn load(&self) -> anyhow::Result<Vec<CertificateDer<'static>>> {
        let result = rustls_native_certs::load_native_certs();

        for error in &result.errors {
            warn!(error = format!("{error:#}"), "Error when loading native certs");
        }

        if result.certs.is_empty() && !result.errors.is_empty() {
            anyhow::bail!("no native root certificate could be loaded");
        }

        Ok(result.certs)
    }
}

/// macOS keychains exported with `security find-certificate -a -p`.
#[derive(Debug, Clone)]
pub struct KeychainAnchors {
    keychains: Vec<Utf8PathBuf>,
    timeout: Duration,
}

impl KeychainAnchors {
    pub fn new(keychains: Vec<Utf8PathBuf>, timeout: Duration) -> Self {
        Self { keychains, timeout }
    }

    fn export(&self, keychain: &Utf8PathBuf) -> anyhow::Result<Vec<CertificateDer<'static>>> {
        let mut command = Command::new("security");
        command.args(["find-certificate", "-a", "-p", keychain.as_str()]);

        let output = run_bounded(command, self.timeout).context("failed to run security")?;

        match output.status {
            Some(status) if status.success() => {}
            Some(status) => anyhow::bail!("security exited with {status}"),
            None => anyhow::bail!("security did not complete within {:?}", self.timeout),
        }

        let mut reader = output.stdout.as_slice();

        rustls_pemfile::certs(&mut reader)
            .enumerate()
            .map(|(idx, cert)| cert.with_context(|| format!("failed to read exported certificate number {idx}")))
            .collect()
    }
}

impl TrustAnchorSource for KeychainAnchors {
    fn load(&self) -> anyhow::Result<Vec<CertificateDer<'static>>> {
        let mut anchors = Vec::new();

        for keychain in &self.keychains {
            match self.export(keychain) {
                Ok(certs) => {
                    debug!(%keychain, count = certs.len(), "Exported keychain certificates");
                    anchors.extend(certs);
                }
                Err(error) => warn!(%keychain, error = format!("{error:#}"), "Failed to export keychain"),
            }
        }

        if anchors.is_empty() {
            anyhow::bail!("no certificate could be exported from the system keychains");
        }

        Ok(anchors)
    }
}

/// PEM bundle on disk, re-read on every load.
#[derive(Debug, Clone)]
pub struct PemFileAnchors {
    path: Utf8PathBuf,
}

impl PemFileAnchors {
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl TrustAnchorSource for PemFileAnchors {
    fn load(&self) -> anyhow::Result<Vec<CertificateDer<'static>>> {
        let contents = std::fs::read(&self.path).with_context(|| format!("failed to read {}", self.path))?;
        let mut reader = contents.as_slice();

        rustls_pemfile::certs(&mut reader)
            .enumerate()
            .map(|(idx, cert)| cert.with_context(|| format!("failed to read certificate number {idx} of {}", self.path)))
            .collect()
    }
}

/// Fixed set of anchors.
#[derive(Debug, Clone, Default)]
pub struct StaticAnchors(pub Vec<CertificateDer<'static>>);

impl TrustAnchorSource for StaticAnchors {
    fn load(&self) -> anyhow::Result<Vec<CertificateDer<'static>>> {
        Ok(self.0.clone())
    }
}
