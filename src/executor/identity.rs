//! User identities and the passwd database they are resolved from.

use crate::config::IdentityPolicy;
use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// The user a command runs as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub home: PathBuf,
}

impl Identity {
    pub fn root() -> Self {
        Self {
            name: "root".to_string(),
            uid: 0,
            gid: 0,
            home: PathBuf::from("/root"),
        }
    }

    /// The effective user of this process.
    pub fn current(passwd: &PasswdDb) -> Result<Self> {
        // SAFETY: geteuid/getegid cannot fail and touch no memory.
        let (uid, gid) = unsafe { (libc::geteuid(), libc::getegid()) };
        if let Some(identity) = passwd.by_uid(uid)? {
            return Ok(Self { gid, ..identity });
        }
        Ok(Self {
            name: std::env::var("USER").unwrap_or_else(|_| uid.to_string()),
            uid,
            gid,
            home: std::env::var_os("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/")),
        })
    }

    /// Whether running as this identity requires dropping privileges.
    pub fn differs_from_process(&self) -> bool {
        // SAFETY: see `current`.
        let (uid, gid) = unsafe { (libc::geteuid(), libc::getegid()) };
        self.uid != uid || self.gid != gid
    }

    /// Resolve the identity a stage's policy asks for.
    pub fn for_policy(policy: IdentityPolicy, build_user: &str, passwd: &PasswdDb) -> Result<Self> {
        match policy {
            IdentityPolicy::HostUser => Self::current(passwd),
            IdentityPolicy::Root | IdentityPolicy::Chroot => Ok(Self::root()),
            IdentityPolicy::BuildUser => match passwd.by_name(build_user)? {
                Some(identity) => Ok(identity),
                None => bail!(
                    "build user '{}' does not exist in {}",
                    build_user,
                    passwd.path().display()
                ),
            },
        }
    }
}

/// Read-only view of an `etc/passwd` file.
#[derive(Debug, Clone)]
pub struct PasswdDb {
    path: PathBuf,
}

impl PasswdDb {
    /// The host's `/etc/passwd`.
    pub fn host() -> Self {
        Self::in_root(Path::new("/"))
    }

    /// The passwd file of the filesystem tree rooted at `root`.
    pub fn in_root(root: &Path) -> Self {
        Self {
            path: root.join("etc/passwd"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Look up a user by login name.
    ///
    /// Returns:
    /// - Ok(Some(identity)) if the user is found
    /// - Ok(None) if the user or the file doesn't exist
    /// - Err if the file exists but is corrupted/unreadable
    pub fn by_name(&self, name: &str) -> Result<Option<Identity>> {
        self.find(|identity| identity.name == name)
    }

    pub fn by_uid(&self, uid: u32) -> Result<Option<Identity>> {
        self.find(|identity| identity.uid == uid)
    }

    fn find(&self, predicate: impl Fn(&Identity) -> bool) -> Result<Option<Identity>> {
        // File not existing is fine - the user just doesn't exist
        if !self.path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read passwd file at {}", self.path.display()))?;

        for line in content.lines() {
            if line.trim().is_empty() || line.starts_with('#') {
                continue;
            }
            let identity = parse_entry(line, &self.path)?;
            if predicate(&identity) {
                return Ok(Some(identity));
            }
        }
        Ok(None)
    }
}

fn parse_entry(line: &str, path: &Path) -> Result<Identity> {
    let parts: Vec<&str> = line.split(':').collect();
    if parts.len() < 6 {
        bail!(
            "Corrupted passwd file: malformed entry '{}' at {}",
            line,
            path.display()
        );
    }
    let uid: u32 = parts[2].parse().with_context(|| {
        format!(
            "Corrupted passwd file: invalid UID '{}' for user '{}' at {}",
            parts[2],
            parts[0],
            path.display()
        )
    })?;
    let gid: u32 = parts[3].parse().with_context(|| {
        format!(
            "Corrupted passwd file: invalid GID '{}' for user '{}' at {}",
            parts[3],
            parts[0],
            path.display()
        )
    })?;
    Ok(Identity {
        name: parts[0].to_string(),
        uid,
        gid,
        home: PathBuf::from(parts[5]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn rootfs_with_passwd(content: &str) -> TempDir {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("etc")).unwrap();
        fs::write(temp.path().join("etc/passwd"), content).unwrap();
        temp
    }

    #[test]
    fn test_by_name() {
        let root = rootfs_with_passwd(
            "root:x:0:0:root:/root:/bin/bash\nwander:x:1001:1001::/home/wander:/bin/bash\n",
        );
        let db = PasswdDb::in_root(root.path());

        let wander = db.by_name("wander").unwrap().unwrap();
        assert_eq!(wander.uid, 1001);
        assert_eq!(wander.gid, 1001);
        assert_eq!(wander.home, PathBuf::from("/home/wander"));

        assert_eq!(db.by_name("nonexistent").unwrap(), None);
    }

    #[test]
    fn test_by_uid() {
        let root = rootfs_with_passwd("root:x:0:0:root:/root:/bin/bash\n");
        let db = PasswdDb::in_root(root.path());
        assert_eq!(db.by_uid(0).unwrap().unwrap().name, "root");
        assert_eq!(db.by_uid(4242).unwrap(), None);
    }

    #[test]
    fn test_missing_passwd_is_not_an_error() {
        let temp = TempDir::new().unwrap();
        let db = PasswdDb::in_root(temp.path());
        assert_eq!(db.by_name("root").unwrap(), None);
    }

    #[test]
    fn test_corrupted_uid_fails() {
        let root = rootfs_with_passwd("wander:x:abc:1001::/home/wander:/bin/bash\n");
        let db = PasswdDb::in_root(root.path());
        let err = db.by_name("wander").unwrap_err();
        assert!(err.to_string().contains("invalid UID"), "{err}");
    }

    #[test]
    fn test_build_user_policy_requires_user() {
        let root = rootfs_with_passwd("root:x:0:0:root:/root:/bin/bash\n");
        let db = PasswdDb::in_root(root.path());
        assert!(Identity::for_policy(IdentityPolicy::BuildUser, "wander", &db).is_err());
        assert_eq!(
            Identity::for_policy(IdentityPolicy::Chroot, "wander", &db).unwrap(),
            Identity::root()
        );
    }

    #[test]
    fn test_current_identity_does_not_need_demotion() {
        let current = Identity::current(&PasswdDb::host()).unwrap();
        assert!(!current.differs_from_process());
    }
}
