//! # Utility Module
//!
//! Output directory checks and process resource limits.

use std::fs::OpenOptions;
use std::path::Path;

use anyhow::{Result, anyhow};
#[cfg(unix)]
use tracing::info;
#[cfg(not(unix))]
use tracing::warn;

use crate::metadata::MetadataBackendKind;

/// Convert CLI metadata backend to internal enum. `None` selects the dry-run sink.
pub fn backend_from_cli(backend: crate::cli::MetadataBackend) -> Option<MetadataBackendKind> {
    match backend {
        crate::cli::MetadataBackend::Jsonl => Some(MetadataBackendKind::Jsonl),
        crate::cli::MetadataBackend::Csv => Some(MetadataBackendKind::Csv),
        crate::cli::MetadataBackend::Sqlite => Some(MetadataBackendKind::Sqlite),
        crate::cli::MetadataBackend::DryRun => None,
    }
}

/// Ensure output directory exists and is writable, warning on unsafe permissions.
pub fn ensure_output_dir(path: &Path) -> Result<()> {
    if path.exists() {
        if !std::fs::metadata(path)?.is_dir() {
            return Err(anyhow!(
                "output path is not a directory: {}",
                path.display()
            ));
        }
    } else {
        std::fs::create_dir_all(path)?;
    }

    let probe_path = path.join(".caseflow_write_probe");
    match OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&probe_path)
    {
        Ok(_) => {
            let _ = std::fs::remove_file(&probe_path);
        }
        Err(err) => {
            return Err(anyhow!(
                "output directory is not writable: {} ({})",
                path.display(),
                err
            ));
        }
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(path)?.permissions().mode();
        if mode & 0o002 != 0 {
            tracing::warn!("output directory is world-writable: {}", path.display());
        }
    }

    Ok(())
}

/// Sets the soft open-file limit. Streams, archives and the journal all
/// hold descriptors, so large worker pools may need more than the default.
pub fn apply_resource_limits(max_open_files: Option<u64>) -> Result<()> {
    #[cfg(unix)]
    {
        if let Some(open_files) = max_open_files {
            set_limit(libc::RLIMIT_NOFILE, open_files, "open file descriptors")?;
        }
    }
    #[cfg(not(unix))]
    {
        if max_open_files.is_some() {
            warn!("resource limits are only supported on Unix platforms");
        }
    }
    Ok(())
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
type Resource = libc::__rlimit_resource_t;
#[cfg(all(unix, not(all(target_os = "linux", target_env = "gnu"))))]
type Resource = libc::c_int;

#[cfg(unix)]
fn set_limit(resource: Resource, requested: u64, label: &str) -> Result<()> {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: `limit` is a valid, writable rlimit for the duration of the call.
    if unsafe { libc::getrlimit(resource, &mut limit) } != 0 {
        return Err(anyhow!(
            "getrlimit failed for {}: {}",
            label,
            std::io::Error::last_os_error()
        ));
    }

    let requested = requested as libc::rlim_t;
    let mut new_cur = requested;
    if requested > limit.rlim_max {
        tracing::warn!(
            "requested {} limit {} exceeds hard limit {}; using {}",
            label,
            requested,
            limit.rlim_max,
            limit.rlim_max
        );
        new_cur = limit.rlim_max;
    }

    let new_limit = libc::rlimit {
        rlim_cur: new_cur,
        rlim_max: limit.rlim_max,
    };
    // SAFETY: `new_limit` is a fully initialised rlimit.
    if unsafe { libc::setrlimit(resource, &new_limit) } != 0 {
        return Err(anyhow!(
            "setrlimit failed for {}: {}",
            label,
            std::io::Error::last_os_error()
        ));
    }
    info!("set {} limit to {}", label, new_cur);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_missing_output_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let out = dir.path().join("nested").join("out");
        ensure_output_dir(&out).expect("ensure");
        assert!(out.is_dir());
        assert!(!out.join(".caseflow_write_probe").exists());
    }

    #[test]
    fn rejects_a_file_as_output_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("plain");
        std::fs::write(&file, b"x").expect("write");
        assert!(ensure_output_dir(&file).is_err());
    }

    #[test]
    fn no_limit_is_a_no_op() {
        apply_resource_limits(None).expect("no-op");
    }
}
