//! Binary extraction — copies the backend for a target out of a bundle into a
//! writable runtime directory, skipping the write when an identical artifact is
//! already there.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use super::ResourceBundle;
use crate::error::BridgeError;
use crate::platform::BackendTarget;

/// Result of an extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extracted {
    pub path: PathBuf,
    /// `false` when the existing file already matched the bundled artifact.
    pub written: bool,
    /// Hex SHA-256 of the artifact.
    pub sha256: String,
}

pub fn extract(
    bundle: &dyn ResourceBundle,
    target: &BackendTarget,
    runtime_dir: &Path,
) -> Result<Extracted, BridgeError> {
    let resource = target.resource_path();
    let fail = |reason: String| BridgeError::ExtractionFailed {
        resource: resource.clone(),
        reason,
    };

    let bytes = bundle
        .read(&resource)
        .map_err(|e| fail(format!("read from {} failed: {}", bundle.describe(), e)))?
        .ok_or_else(|| fail(format!("not present in {}", bundle.describe())))?;
    let expected = sha256_hex(&bytes);

    fs::create_dir_all(runtime_dir)
        .map_err(|e| fail(format!("cannot create {}: {}", runtime_dir.display(), e)))?;

    let dest = runtime_dir.join(target.file_name());
    let up_to_date = match fs::read(&dest) {
        Ok(existing) => sha256_hex(&existing) == expected,
        Err(_) => false,
    };

    if up_to_date {
        tracing::debug!("Backend binary {} is up to date", dest.display());
    } else {
        // 같은 디렉터리에 임시 파일로 쓴 뒤 rename — 잘린 실행 파일이 남지 않도록
        let partial = runtime_dir.join(format!("{}.partial", target.file_name()));
        write_file(&partial, &bytes)
            .and_then(|_| fs::rename(&partial, &dest))
            .map_err(|e| {
                let _ = fs::remove_file(&partial);
                fail(format!("cannot write {}: {}", dest.display(), e))
            })?;
        tracing::info!(
            "Extracted {} ({} bytes, sha256 {}) to {}",
            resource,
            bytes.len(),
            &expected[..12],
            dest.display()
        );
    }

    if target.needs_exec_bit() {
        set_executable(&dest).map_err(|e| fail(format!("cannot chmod {}: {}", dest.display(), e)))?;
    }

    Ok(Extracted {
        path: dest,
        written: !up_to_date,
        sha256: expected,
    })
}

fn write_file(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

#[cfg(unix)]
fn set_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = fs::metadata(path)?.permissions();
    if perms.mode() & 0o777 != 0o755 {
        perms.set_mode(0o755);
        fs::set_permissions(path, perms)?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
