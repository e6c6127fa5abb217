//! Platform resolution — maps the host's reported OS / CPU strings onto the
//! per-target artifact names the backend build produces.

use std::fmt;

use crate::error::BridgeError;

/// Prefix shared by every bundled backend artifact.
pub const BINARY_PREFIX: &str = "beacon-backend";

/// Directory inside the resource bundle that holds the artifacts.
pub const BUNDLE_DIR: &str = "backend";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendOs {
    Linux,
    Darwin,
    Windows,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendArch {
    Amd64,
    Arm64,
}

impl BackendOs {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Linux => "linux",
            Self::Darwin => "darwin",
            Self::Windows => "windows",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        let os = raw.trim().to_lowercase();
        match os.as_str() {
            "linux" => Some(Self::Linux),
            "darwin" | "macos" | "mac os x" | "osx" => Some(Self::Darwin),
            // JVM 호스트는 "Windows 10", "Windows Server 2022" 형태로 보고함
            _ if os.starts_with("windows") => Some(Self::Windows),
            _ => None,
        }
    }
}

impl BackendArch {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Amd64 => "amd64",
            Self::Arm64 => "arm64",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "amd64" | "x86_64" | "x64" => Some(Self::Amd64),
            "arm64" | "aarch64" => Some(Self::Arm64),
            _ => None,
        }
    }
}

/// An (OS, architecture) pair identifying which precompiled backend to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BackendTarget {
    pub os: BackendOs,
    pub arch: BackendArch,
}

impl BackendTarget {
    pub fn new(os: BackendOs, arch: BackendArch) -> Self {
        Self { os, arch }
    }

    /// Resolve the target for the platform this process runs on.
    pub fn host() -> Result<Self, BridgeError> {
        resolve(std::env::consts::OS, std::env::consts::ARCH)
    }

    /// `beacon-backend-<os>-<arch>`, with `.exe` on Windows.
    pub fn file_name(&self) -> String {
        let suffix = if self.os == BackendOs::Windows { ".exe" } else { "" };
        format!(
            "{}-{}-{}{}",
            BINARY_PREFIX,
            self.os.as_str(),
            self.arch.as_str(),
            suffix
        )
    }

    /// Path of the artifact inside the resource bundle.
    pub fn resource_path(&self) -> String {
        format!("{}/{}", BUNDLE_DIR, self.file_name())
    }

    pub fn needs_exec_bit(&self) -> bool {
        self.os != BackendOs::Windows
    }
}

impl fmt::Display for BackendTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os.as_str(), self.arch.as_str())
    }
}

/// Map reported OS and CPU architecture strings to a [`BackendTarget`].
///
/// A mismatch is a deployment defect, so there is no fallback target.
pub fn resolve(os: &str, arch: &str) -> Result<BackendTarget, BridgeError> {
    match (BackendOs::parse(os), BackendArch::parse(arch)) {
        (Some(os), Some(arch)) => Ok(BackendTarget { os, arch }),
        _ => Err(BridgeError::UnsupportedPlatform {
            os: os.to_string(),
            arch: arch.to_string(),
        }),
    }
}
