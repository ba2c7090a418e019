//! Source archive extraction.
//!
//! Every archive is read twice. The first pass checks that no member, and
//! no link target, resolves outside the destination; only then does the
//! second pass write anything. A single top-level directory is stripped, so
//! `zlib-1.3.1/configure` lands at `<dest>/configure`.

use crate::error::BuildError;
use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Component, Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tar::{Archive, EntryType};
use tracing::debug;

/// Compression layer around a tarball, chosen by file-name suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Xz,
    Bzip2,
    Zstd,
}

impl Compression {
    pub fn detect(path: &Path) -> Self {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();
        if name.ends_with(".gz") || name.ends_with(".tgz") {
            Compression::Gzip
        } else if name.ends_with(".xz") || name.ends_with(".txz") {
            Compression::Xz
        } else if name.ends_with(".bz2") || name.ends_with(".tbz2") {
            Compression::Bzip2
        } else if name.ends_with(".zst") || name.ends_with(".tzst") {
            Compression::Zstd
        } else {
            Compression::None
        }
    }
}

fn open(path: &Path) -> io::Result<Archive<Box<dyn Read>>> {
    let file = BufReader::new(File::open(path)?);
    let reader: Box<dyn Read> = match Compression::detect(path) {
        Compression::None => Box::new(file),
        Compression::Gzip => Box::new(flate2::read::MultiGzDecoder::new(file)),
        Compression::Xz => Box::new(xz2::read::XzDecoder::new(file)),
        Compression::Bzip2 => Box::new(bzip2::read::MultiBzDecoder::new(file)),
        Compression::Zstd => Box::new(zstd::stream::Decoder::new(file)?),
    };
    Ok(Archive::new(reader))
}

/// Unpack `archive` into `dest`, replacing anything already there.
pub fn extract(archive: &Path, dest: &Path) -> Result<(), BuildError> {
    let strip = check_containment(archive, dest)?;

    let parent = dest.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|err| BuildError::io(parent, err))?;
    let staging = parent.join(tmp_name(".extract"));
    fs::create_dir_all(&staging).map_err(|err| BuildError::io(&staging, err))?;

    let unpacked = unpack(archive, &staging, dest);
    if let Err(err) = unpacked {
        let _ = fs::remove_dir_all(&staging);
        return Err(err);
    }

    let source = match &strip {
        Some(top) => staging.join(top),
        None => staging.clone(),
    };

    if dest.exists() {
        fs::remove_dir_all(dest).map_err(|err| BuildError::io(dest, err))?;
    }
    fs::rename(&source, dest).map_err(|err| BuildError::io(dest, err))?;
    if staging.exists() {
        let _ = fs::remove_dir_all(&staging);
    }
    debug!("extracted {} into {}", archive.display(), dest.display());
    Ok(())
}

fn unpack(archive: &Path, staging: &Path, dest: &Path) -> Result<(), BuildError> {
    let io_err = |err| BuildError::io(archive, err);
    let mut tar = open(archive).map_err(io_err)?;
    tar.set_preserve_permissions(true);
    for entry in tar.entries().map_err(io_err)? {
        let mut entry = entry.map_err(io_err)?;
        if !entry.unpack_in(staging).map_err(io_err)? {
            // tar refuses members it considers unsafe; never silently drop one.
            return Err(BuildError::PathTraversal {
                member: String::from_utf8_lossy(&entry.path_bytes()).into_owned(),
                destination: dest.to_path_buf(),
            });
        }
    }
    Ok(())
}

/// Symlink hops followed before a path is treated as a loop.
const MAX_LINK_HOPS: usize = 40;

/// Symlinks declared so far, keyed by their archive-relative location.
/// Each value is the link's parent joined with its raw target.
#[derive(Default)]
struct LinkTable {
    links: HashMap<PathBuf, PathBuf>,
}

impl LinkTable {
    /// Resolve `path` against the archive root, following declared links.
    /// `None` if it is absolute, climbs above the root or loops.
    fn resolve(&self, path: &Path) -> Option<PathBuf> {
        let mut pending: Vec<Component<'_>> = path.components().rev().collect();
        let mut out = PathBuf::new();
        let mut hops = 0;
        while let Some(component) = pending.pop() {
            match component {
                Component::Normal(part) => {
                    out.push(part);
                    if let Some(target) = self.links.get(&out) {
                        hops += 1;
                        if hops > MAX_LINK_HOPS {
                            return None;
                        }
                        out = PathBuf::new();
                        pending.extend(target.components().rev());
                    }
                }
                Component::CurDir => {}
                Component::ParentDir => {
                    if !out.pop() {
                        return None;
                    }
                }
                Component::RootDir | Component::Prefix(_) => return None,
            }
        }
        Some(out)
    }
}

/// Reject the archive if any member would land outside `dest`.
///
/// Member parents are resolved through symlinks declared earlier in the
/// archive. Returns the top-level directory that [`extract`] strips, if
/// any; every member and link target must then stay below it, since its
/// parent becomes the parent of `dest`.
pub fn check_containment(archive: &Path, dest: &Path) -> Result<Option<PathBuf>, BuildError> {
    let io_err = |err| BuildError::io(archive, err);
    let mut tar = open(archive).map_err(io_err)?;
    let mut table = LinkTable::default();
    let mut resolved = Vec::new();
    let mut tops = HashSet::new();
    let mut top_is_dir = true;

    for entry in tar.entries().map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        let member = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        let escape = || BuildError::PathTraversal {
            member: member.clone(),
            destination: dest.to_path_buf(),
        };

        let kind = entry.header().entry_type();
        let lexical = normalize(Path::new(&member)).ok_or_else(escape)?;
        let Some(name) = lexical.file_name() else {
            // `./` names the destination itself.
            if kind == EntryType::Directory {
                continue;
            }
            return Err(escape());
        };

        if let Some(Component::Normal(first)) = lexical.components().next() {
            tops.insert(PathBuf::from(first));
        }
        if lexical.components().count() == 1 && kind != EntryType::Directory {
            top_is_dir = false;
        }

        let parent = lexical.parent().unwrap_or_else(|| Path::new(""));
        let location = table.resolve(parent).ok_or_else(escape)?.join(name);
        resolved.push((member.clone(), table.resolve(&location).ok_or_else(escape)?));

        match kind {
            EntryType::Symlink => {
                let Some(target) = entry.link_name().map_err(io_err)? else {
                    continue;
                };
                let joined = location
                    .parent()
                    .unwrap_or_else(|| Path::new(""))
                    .join(&target);
                resolved.push((member.clone(), table.resolve(&joined).ok_or_else(escape)?));
                table.links.insert(location, joined);
            }
            EntryType::Link => {
                // Hard link targets name other members of the archive.
                if let Some(target) = entry.link_name().map_err(io_err)? {
                    resolved.push((member.clone(), table.resolve(&target).ok_or_else(escape)?));
                }
            }
            _ => {}
        }
    }

    let strip = match (tops.len(), top_is_dir) {
        (1, true) => tops.into_iter().next(),
        _ => None,
    };
    if let Some(top) = &strip {
        if let Some((member, _)) = resolved.iter().find(|(_, path)| !path.starts_with(top)) {
            return Err(BuildError::PathTraversal {
                member: member.clone(),
                destination: dest.to_path_buf(),
            });
        }
    }
    Ok(strip)
}

/// Lexically resolve `.` and `..`; `None` if the path is absolute or climbs above its root.
fn normalize(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    return None;
                }
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(out)
}

fn tmp_name(prefix: &str) -> String {
    let n = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("{prefix}-{}-{n}", std::process::id())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use std::io::Write;
    use tar::{Builder, Header};
    use tempfile::TempDir;
    use walkdir::WalkDir;

    fn file_header(name: &[u8], size: u64) -> Header {
        let mut header = Header::new_old();
        header.as_old_mut().name[..name.len()].copy_from_slice(name);
        header.set_size(size);
        header.set_mode(0o644);
        header.set_entry_type(EntryType::Regular);
        header.set_cksum();
        header
    }

    fn write_tar(path: &Path, members: &[(&str, &[u8])]) {
        let mut builder = Builder::new(File::create(path).unwrap());
        for (name, data) in members {
            let header = file_header(name.as_bytes(), data.len() as u64);
            builder.append(&header, *data).unwrap();
        }
        builder.finish().unwrap();
    }

    #[test]
    fn strips_single_top_level_directory() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("zlib-1.3.tar");
        write_tar(
            &archive,
            &[("zlib-1.3/README", b"zlib\n"), ("zlib-1.3/src/a.c", b"int a;\n")],
        );
        let dest = temp.path().join("sources/zlib-1.3.d");

        extract(&archive, &dest).unwrap();
        assert_eq!(fs::read(dest.join("README")).unwrap(), b"zlib\n");
        assert!(dest.join("src/a.c").is_file());
    }

    #[test]
    fn keeps_multiple_top_level_entries() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("flat.tar");
        write_tar(&archive, &[("a.txt", b"a"), ("b.txt", b"b")]);
        let dest = temp.path().join("flat.d");

        extract(&archive, &dest).unwrap();
        assert!(dest.join("a.txt").is_file());
        assert!(dest.join("b.txt").is_file());
    }

    #[test]
    fn replaces_existing_destination() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("pkg.tar");
        write_tar(&archive, &[("pkg/new", b"new")]);
        let dest = temp.path().join("pkg.d");
        fs::create_dir_all(&dest).unwrap();
        fs::write(dest.join("stale"), b"old").unwrap();

        extract(&archive, &dest).unwrap();
        assert!(dest.join("new").exists());
        assert!(!dest.join("stale").exists());
    }

    #[test]
    fn gzip_archives_are_detected() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("pkg.tar.gz");
        let encoder = GzEncoder::new(File::create(&archive).unwrap(), flate2::Compression::fast());
        let mut builder = Builder::new(encoder);
        let data = b"gz\n";
        builder
            .append(&file_header(b"pkg/file", data.len() as u64), &data[..])
            .unwrap();
        builder.into_inner().unwrap().finish().unwrap().flush().unwrap();

        let dest = temp.path().join("pkg.d");
        extract(&archive, &dest).unwrap();
        assert_eq!(fs::read(dest.join("file")).unwrap(), b"gz\n");
    }

    #[test]
    fn traversal_member_is_rejected_before_any_write() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("evil.tar");
        write_tar(
            &archive,
            &[("pkg/harmless.txt", b"ok"), ("pkg/../../escaped.txt", b"pwned")],
        );
        let dest = temp.path().join("root/sources/evil.d");

        let err = extract(&archive, &dest).unwrap_err();
        assert!(matches!(err, BuildError::PathTraversal { .. }), "{err}");
        assert!(!dest.exists());
        let written: Vec<_> = WalkDir::new(temp.path())
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(written, ["evil.tar"]);
    }

    #[test]
    fn absolute_member_is_rejected() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("abs.tar");
        write_tar(&archive, &[("/tmp/wander-abs-member", b"x")]);
        let err = extract(&archive, &temp.path().join("abs.d")).unwrap_err();
        assert!(matches!(err, BuildError::PathTraversal { .. }));
    }

    #[test]
    fn escaping_symlink_is_rejected() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("link.tar");
        let mut builder = Builder::new(File::create(&archive).unwrap());
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Symlink);
        header.set_size(0);
        header.set_mode(0o777);
        builder
            .append_link(&mut header, "pkg/etc", "../../../etc")
            .unwrap();
        builder.finish().unwrap();

        let err = extract(&archive, &temp.path().join("link.d")).unwrap_err();
        assert!(matches!(err, BuildError::PathTraversal { .. }));
    }

    fn append_symlink(builder: &mut Builder<File>, path: &str, target: &str) {
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Symlink);
        header.set_size(0);
        header.set_mode(0o777);
        builder.append_link(&mut header, path, target).unwrap();
    }

    #[test]
    fn link_to_stripped_directory_parent_is_rejected() {
        let temp = TempDir::new().unwrap();
        let sources = temp.path().join("sources");
        fs::create_dir_all(&sources).unwrap();
        fs::write(sources.join("other.tar.xz"), b"secret").unwrap();
        let archive = sources.join("pkg.tar");
        let mut builder = Builder::new(File::create(&archive).unwrap());
        builder.append(&file_header(b"pkg/file", 1), &b"x"[..]).unwrap();
        append_symlink(&mut builder, "pkg/up", "..");
        builder.finish().unwrap();

        let dest = sources.join("pkg.d");
        let err = extract(&archive, &dest).unwrap_err();
        assert!(matches!(err, BuildError::PathTraversal { .. }), "{err}");
        assert!(!dest.exists());
    }

    #[test]
    fn member_below_chained_links_is_rejected_before_any_write() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("chain.tar");
        let mut builder = Builder::new(File::create(&archive).unwrap());
        builder.append(&file_header(b"x/file", 1), &b"x"[..]).unwrap();
        builder.append(&file_header(b"y/file", 1), &b"y"[..]).unwrap();
        append_symlink(&mut builder, "x/a", "..");
        append_symlink(&mut builder, "x/b", "a/..");
        builder
            .append(&file_header(b"x/b/escaped.txt", 5), &b"pwned"[..])
            .unwrap();
        builder.finish().unwrap();

        let dest = temp.path().join("root/chain.d");
        let err = extract(&archive, &dest).unwrap_err();
        assert!(matches!(err, BuildError::PathTraversal { .. }), "{err}");
        assert!(!temp.path().join("root").exists());
        assert!(!temp.path().join("escaped.txt").exists());
    }

    #[test]
    fn contained_link_chain_is_allowed() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("ok.tar");
        let mut builder = Builder::new(File::create(&archive).unwrap());
        builder.append(&file_header(b"pkg/lib/real", 1), &b"x"[..]).unwrap();
        append_symlink(&mut builder, "pkg/lib64", "lib");
        append_symlink(&mut builder, "pkg/alias", "lib64/real");
        builder.finish().unwrap();

        let dest = temp.path().join("ok.d");
        extract(&archive, &dest).unwrap();
        assert_eq!(fs::read(dest.join("alias")).unwrap(), b"x");
    }

    #[test]
    fn contained_relative_symlink_is_allowed() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("ok.tar");
        let mut builder = Builder::new(File::create(&archive).unwrap());
        let data = b"x";
        builder
            .append(&file_header(b"pkg/lib/real", 1), &data[..])
            .unwrap();
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Symlink);
        header.set_size(0);
        header.set_mode(0o777);
        builder
            .append_link(&mut header, "pkg/lib/alias", "real")
            .unwrap();
        builder.finish().unwrap();

        let dest = temp.path().join("ok.d");
        extract(&archive, &dest).unwrap();
        assert_eq!(fs::read(dest.join("lib/alias")).unwrap(), b"x");
    }

    #[test]
    fn detects_compression_by_suffix() {
        assert_eq!(Compression::detect(Path::new("a.tar.xz")), Compression::Xz);
        assert_eq!(Compression::detect(Path::new("a.tgz")), Compression::Gzip);
        assert_eq!(Compression::detect(Path::new("a.tar.bz2")), Compression::Bzip2);
        assert_eq!(Compression::detect(Path::new("a.tar.zst")), Compression::Zstd);
        assert_eq!(Compression::detect(Path::new("a.tar")), Compression::None);
    }
}
