use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

use nix::libc;
use tracing::{debug, warn};

use crate::Error;

/// Output files are created write-only and flipped readable once complete,
/// so a concurrent reader never observes partial data.
pub const WRITE_ONLY_MODE: u32 = 0o200;
pub const READABLE_MODE: u32 = 0o644;

/// Rename `src` to `dst`, creating intermediate directories. A rename across
/// filesystems falls back to copy-then-unlink.
pub fn rename_or_copy(src: &Path, dst: &Path) -> Result<(), Error> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }

    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::EXDEV) => {
            debug!(?src, ?dst, "rename crosses devices, copying");
            copy_then_unlink(src, dst)
        }
        Err(e) => Err(e.into()),
    }
}

/// Copy `src` to `dst` write-only, flip it readable, then unlink `src`.
pub fn copy_then_unlink(src: &Path, dst: &Path) -> Result<(), Error> {
    let mut input = File::open(src)?;
    let mut output = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(WRITE_ONLY_MODE)
        .open(dst)?;
    io::copy(&mut input, &mut output)?;
    drop(output);

    set_readable(dst)?;
    fs::remove_file(src)?;
    Ok(())
}

pub fn set_readable(path: &Path) -> Result<(), Error> {
    fs::set_permissions(path, fs::Permissions::from_mode(READABLE_MODE))?;
    Ok(())
}

/// Write the process PID file. Failure is reported but never fatal; some
/// deployments run without access to the run directory.
pub fn write_pid_file(program: &str, suffix: Option<&str>, port: u16) -> Option<PathBuf> {
    let path = match std::env::var_os("PID_FILE") {
        Some(p) => PathBuf::from(p),
        None => {
            let name = match suffix {
                Some(s) => format!("{program}-{s}-{port}"),
                None => format!("{program}-{port}"),
            };
            Path::new("/var/run").join(name)
        }
    };

    match fs::write(&path, format!("{}\n", std::process::id())) {
        Ok(()) => Some(path),
        Err(e) => {
            warn!("cannot write pid file {}: {e}", path.display());
            None
        }
    }
}

pub fn remove_pid_file(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        debug!("cannot remove pid file {}: {e}", path.display());
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    #[test]
    fn rename_within_device() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a");
        let dst = dir.path().join("sub/dir/b");
        fs::write(&src, b"payload").unwrap();

        rename_or_copy(&src, &dst).unwrap();

        assert!(!src.exists());
        assert_eq!(fs::read(&dst).unwrap(), b"payload");
    }

    #[test]
    fn copy_fallback_moves_content_and_unlinks() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a");
        let dst = dir.path().join("b");
        fs::write(&src, b"cross-device").unwrap();

        copy_then_unlink(&src, &dst).unwrap();

        assert!(!src.exists());
        assert_eq!(fs::read(&dst).unwrap(), b"cross-device");
        let mode = fs::metadata(&dst).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, READABLE_MODE);
    }
}
