/// Operating system family, as far as trust handling is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    /// Root store is refreshed lazily; a failed verification triggers a remediation attempt.
    Windows,
    /// Default trust anchors are exported from the system keychains.
    MacOs,
    Other,
}

impl Platform {
    pub const fn current() -> Self {
        if cfg!(target_os = "windows") {
            Platform::Windows
        } else if cfg!(target_os = "macos") {
            Platform::MacOs
        } else {
            Platform::Other
        }
    }
}
