use crc32fast::Hasher;
use std::fs;
use std::fs::File;
use std::io;
use std::io::Read;
use std::path::Path;
use std::path::PathBuf;
use tracing::debug;
use tracing::error;
use tracing::info;
use uuid::Uuid;
use zip::ZipArchive;
use zip::result::ZipError;

use crate::config::TamperConfig;
use crate::error::TamperError;
use crate::privileged::PollPolicy;
use crate::privileged::PrivilegedRunner;
use crate::privileged::run_privileged;

pub const HELPER_NAME: &str = "tcptester";

/// Bundle entry holding the helper build for `arch` (as in `std::env::consts::ARCH`).
pub fn payload_entry(arch: &str) -> Result<String, TamperError> {
    match arch {
        "x86_64" | "x86" | "aarch64" | "arm" => Ok(format!("{}_{}", HELPER_NAME, arch)),
        _ => Err(TamperError::UnsupportedArch {
            arch: arch.to_string(),
        }),
    }
}

fn file_crc32(path: &Path) -> Result<u32, TamperError> {
    let mut file = File::open(path)?;
    let mut hasher = Hasher::new();
    let mut buff = [0u8; 8192];
    loop {
        let n = file.read(&mut buff)?;
        if n == 0 {
            break;
        }
        hasher.update(&buff[..n]);
    }
    Ok(hasher.finalize())
}

/// Extract the helper for `arch` from `bundle` and put it at `dest` with privileges.
/// The payload is checked against the archive crc32 before and after the move, returns the crc32.
pub fn install_helper(
    runner: &mut dyn PrivilegedRunner,
    policy: &PollPolicy,
    bundle: &Path,
    dest: &Path,
    arch: &str,
) -> Result<u32, TamperError> {
    let entry = payload_entry(arch)?;
    let mut archive = ZipArchive::new(File::open(bundle)?)?;
    let mut payload = match archive.by_name(&entry) {
        Ok(p) => p,
        Err(ZipError::FileNotFound) => return Err(TamperError::PayloadNotFound { entry }),
        Err(e) => return Err(e.into()),
    };
    let expected = payload.crc32();

    let staged = std::env::temp_dir().join(format!("{}-{}", entry, Uuid::new_v4()));
    let mut out = File::create(&staged)?;
    io::copy(&mut payload, &mut out)?;
    out.sync_all()?;
    drop(out);
    let ret = place_helper(runner, policy, &staged, dest, expected);
    if let Err(e) = fs::remove_file(&staged) {
        debug!("remove staged helper {} failed: {}", staged.display(), e);
    }
    ret?;
    info!("helper {} installed to {}", entry, dest.display());
    Ok(expected)
}

fn place_helper(
    runner: &mut dyn PrivilegedRunner,
    policy: &PollPolicy,
    staged: &Path,
    dest: &Path,
    expected: u32,
) -> Result<(), TamperError> {
    let actual = file_crc32(staged)?;
    if actual != expected {
        error!("extracted helper {} is corrupt", staged.display());
        return Err(TamperError::PayloadChecksumMismatch { expected, actual });
    }
    let cmd = format!(
        "install -D -m 0755 '{}' '{}'",
        staged.display(),
        dest.display()
    );
    run_privileged(runner, &cmd, policy)?;
    let actual = file_crc32(dest)?;
    if actual != expected {
        error!("installed helper {} does not match the bundle", dest.display());
        return Err(TamperError::PayloadChecksumMismatch { expected, actual });
    }
    Ok(())
}

/// Make sure the helper binary exists, installing it from the configured bundle if needed.
pub fn ensure_helper(
    runner: &mut dyn PrivilegedRunner,
    config: &TamperConfig,
) -> Result<PathBuf, TamperError> {
    let dest = config.helper_path.clone();
    if dest.is_file() {
        debug!("helper found at {}", dest.display());
        return Ok(dest);
    }
    match &config.helper_bundle {
        Some(bundle) => {
            let policy = PollPolicy::from_config(config);
            install_helper(runner, &policy, bundle, &dest, std::env::consts::ARCH)?;
            Ok(dest)
        }
        None => Err(TamperError::HelperMissing {
            path: dest.display().to_string(),
        }),
    }
}
