use anyhow::{bail, Context, Result};
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

/// Switches the process's filesystem root.
///
/// Entering is one-way: nothing after a successful `enter` can address paths
/// outside the new root.
pub trait Confinement {
    fn enter(&mut self, root: &Path) -> Result<()>;
}

/// `chroot(2)` followed by `chdir("/")`. Requires root.
#[derive(Debug, Default)]
pub struct Chroot;

impl Confinement for Chroot {
    fn enter(&mut self, root: &Path) -> Result<()> {
        if !root.is_dir() {
            bail!("cannot chroot into {}: not a directory", root.display());
        }
        let c_root = CString::new(root.as_os_str().as_bytes())
            .with_context(|| format!("Invalid chroot path: {}", root.display()))?;
        // SAFETY: c_root is a valid NUL-terminated string for the duration of the call.
        if unsafe { libc::chroot(c_root.as_ptr()) } != 0 {
            return Err(std::io::Error::last_os_error())
                .with_context(|| format!("chroot into {} failed", root.display()));
        }
        std::env::set_current_dir("/").context("chdir to new root failed")?;
        Ok(())
    }
}
