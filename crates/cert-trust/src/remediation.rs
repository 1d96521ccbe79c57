//! Windows root store refresh.
//!
//! Windows only downloads a root certificate into its trust store when something asks for it.
//! A root that a provisioning flow just introduced may therefore be invisible to the default
//! trust manager until the OS is prodded. The probe (by default `certutil -urlfetch -verify`
//! on the leaf) exists for that side effect only; its own verdict is ignored.

use std::io::Write as _;
use std::process::Command;
use std::time::Duration;

use camino::Utf8PathBuf;
use rustls_pki_types::CertificateDer;

use crate::chain::cert_to_pem;
use crate::subprocess::run_bounded;
use crate::verifier::ReloadableVerifier;

/// Replaced by the path of the temporary leaf certificate file in the probe command.
pub const CERT_PATH_PLACEHOLDER: &str = "{cert}";

#[derive(Debug, thiserror::Error)]
pub enum RemediationError {
    #[error("remediation command is empty")]
    EmptyCommand,
    #[error("couldn't write the certificate to a temporary file in {dir}")]
    TempFile {
        dir: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to run `{program}`")]
    Probe {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to reload the default trust manager")]
    Reload(#[source] anyhow::Error),
}

pub struct Remediation {
    state_dir: Utf8PathBuf,
    command: Vec<String>,
    timeout: Duration,
}

impl Remediation {
    pub fn new(state_dir: Utf8PathBuf, command: Vec<String>, timeout: Duration) -> Self {
        Self {
            state_dir,
            command,
            timeout,
        }
    }

    /// Probes the OS with `leaf`, then swaps in a freshly built default trust manager.
    ///
    /// The temporary certificate file is removed on every path; failing to remove it is only logged.
    pub fn remediate(&self, leaf: &CertificateDer<'_>, verifier: &ReloadableVerifier) -> Result<(), RemediationError> {
        let cert_file = self.write_cert_file(leaf)?;

        let result = self
            .probe(cert_file.path())
            .and_then(|()| verifier.reload().map_err(RemediationError::Reload));

        if let Err(error) = cert_file.close() {
            warn!(%error, "Couldn't delete temporary certificate file");
        }

        result
    }

    fn write_cert_file(&self, leaf: &CertificateDer<'_>) -> Result<tempfile::NamedTempFile, RemediationError> {
        let temp_file_error = |source| RemediationError::TempFile {
            dir: self.state_dir.clone(),
            source,
        };

        std::fs::create_dir_all(&self.state_dir).map_err(temp_file_error)?;

        let mut file = tempfile::Builder::new()
            .prefix("untrusted-")
            .suffix(".pem")
            .tempfile_in(&self.state_dir)
            .map_err(temp_file_error)?;

        file.write_all(cert_to_pem(leaf).as_bytes()).map_err(temp_file_error)?;
        file.flush().map_err(temp_file_error)?;

        Ok(file)
    }

    fn probe(&self, cert_path: &std::path::Path) -> Result<(), RemediationError> {
        let (program, args) = self.command.split_first().ok_or(RemediationError::EmptyCommand)?;
        let cert_path = cert_path.to_string_lossy();

        let mut command = Command::new(program);
        command.args(args.iter().map(|arg| arg.replace(CERT_PATH_PLACEHOLDER, &cert_path)));

        let output = run_bounded(command, self.timeout).map_err(|source| RemediationError::Probe {
            program: program.clone(),
            source,
        })?;

        match output.status {
            Some(status) => debug!(%program, %status, "Root store probe completed"),
            None => debug!(%program, "Root store probe killed after timeout"),
        }

        Ok(())
    }
}
