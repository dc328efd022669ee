use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use crate::error::{Error, ErrorKind, Result};

pub fn ensure_dir(p: &Path) -> Result<()> {
    fs::create_dir_all(p).map_err(|e| {
        Error::new(
            ErrorKind::Io,
            format!("failed to create dir {}: {e}", p.display()),
        )
    })
}

pub fn write_text(p: &Path, s: &str) -> Result<()> {
    if let Some(parent) = p.parent() {
        ensure_dir(parent)?;
    }
    fs::write(p, s)
        .map_err(|e| Error::new(ErrorKind::Io, format!("failed to write {}: {e}", p.display())))
}

pub fn write_json_pretty(p: &Path, v: &serde_json::Value) -> Result<()> {
    let s = serde_json::to_string_pretty(v)
        .map_err(|e| Error::msg(format!("json encode error: {e}")))?;
    write_text(p, &s)
}

/// Copy `src` to `dest` and give `dest` the same permission bits.
///
/// The bytes land in a hidden sibling of `dest` first and are renamed over
/// it, so a failed copy leaves any previous `dest` untouched. A symlinked
/// `dest` is written through: the link stays and its target is replaced.
pub fn stage_file(dest: &Path, src: &Path) -> Result<()> {
    let stage_err = |what: &str, p: &Path, e: io::Error| {
        Error::new(ErrorKind::Stage, format!("{what} {}: {e}", p.display()))
    };

    let resolved;
    let dest = match fs::symlink_metadata(dest) {
        Ok(meta) if meta.file_type().is_symlink() => {
            resolved = fs::canonicalize(dest)
                .map_err(|e| stage_err("failed to resolve symlink", dest, e))?;
            resolved.as_path()
        }
        _ => dest,
    };

    let mut input = fs::File::open(src).map_err(|e| stage_err("failed to open", src, e))?;
    let perms = input
        .metadata()
        .map_err(|e| stage_err("failed to stat", src, e))?
        .permissions();

    let parent = match dest.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| {
            Error::new(
                ErrorKind::Stage,
                format!("invalid destination path {}", dest.display()),
            )
        })?;

    let mut tmp = tempfile::Builder::new()
        .prefix(&format!(".{name}."))
        .suffix(".kforge-tmp")
        .tempfile_in(&parent)
        .map_err(|e| stage_err("failed to create temp file in", &parent, e))?;
    io::copy(&mut input, tmp.as_file_mut()).map_err(|e| stage_err("failed to write", dest, e))?;
    tmp.as_file()
        .set_permissions(perms)
        .map_err(|e| stage_err("failed to set permissions on", dest, e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| stage_err("failed to sync", dest, e))?;
    tmp.persist(dest)
        .map_err(|e| stage_err("failed to rename into", dest, e.error))?;
    Ok(())
}

/// Recursive copy that recreates symlinks instead of following them.
pub fn copy_dir_all_preserve_links(src: &Path, dst: &Path) -> Result<()> {
    ensure_dir(dst)?;
    for entry in walkdir::WalkDir::new(src) {
        let entry = entry.map_err(|e| Error::new(ErrorKind::Io, format!("walkdir error: {e}")))?;
        let p = entry.path();
        let rel = p
            .strip_prefix(src)
            .map_err(|e| Error::msg(format!("strip_prefix failed: {e}")))?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let out = dst.join(rel);
        if entry.file_type().is_dir() {
            ensure_dir(&out)?;
        } else if entry.file_type().is_symlink() {
            copy_symlink(p, &out)?;
        } else {
            if let Some(parent) = out.parent() {
                ensure_dir(parent)?;
            }
            fs::copy(p, &out).map_err(|e| {
                Error::new(
                    ErrorKind::Io,
                    format!("failed to copy {} -> {}: {e}", p.display(), out.display()),
                )
            })?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        ensure_dir(parent)?;
    }
    remove_path_if_exists(dst)?;
    let target = fs::read_link(src).map_err(|e| {
        Error::new(
            ErrorKind::Io,
            format!("failed to read symlink {}: {e}", src.display()),
        )
    })?;
    std::os::unix::fs::symlink(&target, dst).map_err(|e| {
        Error::new(
            ErrorKind::Io,
            format!(
                "failed to create symlink {} -> {}: {e}",
                dst.display(),
                target.display()
            ),
        )
    })
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, dst: &Path) -> Result<()> {
    fs::copy(src, dst)
        .map(|_| ())
        .map_err(|e| Error::new(ErrorKind::Io, format!("failed to copy {}: {e}", src.display())))
}

/// Removes a file, symlink or directory tree. Returns whether anything was there.
pub fn remove_path_if_exists(path: &Path) -> Result<bool> {
    match fs::symlink_metadata(path) {
        Ok(meta) => {
            let res = if meta.file_type().is_dir() {
                fs::remove_dir_all(path)
            } else {
                fs::remove_file(path)
            };
            res.map_err(|e| {
                Error::new(
                    ErrorKind::Io,
                    format!("failed to remove {}: {e}", path.display()),
                )
            })?;
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(Error::new(
            ErrorKind::Io,
            format!("failed to inspect {} before removal: {e}", path.display()),
        )),
    }
}

/// Looks `name` up in the working directory, then in each of `fallbacks`.
pub fn find(name: &str, fallbacks: &[PathBuf]) -> Result<PathBuf> {
    let direct = PathBuf::from(name);
    if fs::symlink_metadata(&direct).is_ok() {
        return Ok(direct);
    }
    for dir in fallbacks {
        let candidate = dir.join(name);
        if fs::symlink_metadata(&candidate).is_ok() {
            return Ok(candidate);
        }
    }
    let looked: Vec<String> = std::iter::once(".".to_string())
        .chain(fallbacks.iter().map(|p| p.display().to_string()))
        .collect();
    Err(Error::new(
        ErrorKind::FileNotFound,
        format!(
            "could not find file {name:?} (looked in {})",
            looked.join(", ")
        ),
    ))
}

pub fn sha256_file_hex(path: &Path) -> Result<String> {
    use sha2::{Digest, Sha256};

    let mut file = fs::File::open(path).map_err(|e| {
        Error::new(
            ErrorKind::Io,
            format!("failed to open {}: {e}", path.display()),
        )
    })?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 1024 * 256];
    loop {
        let n = file.read(&mut buf).map_err(|e| {
            Error::new(
                ErrorKind::Io,
                format!("failed to read {}: {e}", path.display()),
            )
        })?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn stage_file_copies_bytes_and_mode() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().expect("tempdir");
        let src = tmp.path().join("bzImage");
        fs::write(&src, b"kernel").expect("write src");
        fs::set_permissions(&src, fs::Permissions::from_mode(0o751)).expect("chmod");

        let dest = tmp.path().join("out").join("vmlinuz");
        ensure_dir(dest.parent().expect("parent")).expect("mkdir");
        fs::write(&dest, b"old kernel, longer than the new one").expect("write old");

        stage_file(&dest, &src).expect("stage");
        assert_eq!(fs::read(&dest).expect("read"), b"kernel");
        let mode = fs::metadata(&dest).expect("meta").permissions().mode() & 0o777;
        assert_eq!(mode, 0o751);

        let leftovers: Vec<_> = fs::read_dir(dest.parent().expect("parent"))
            .expect("read_dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".kforge-tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn stage_file_writes_through_symlinked_dest() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let src = tmp.path().join("bzImage");
        fs::write(&src, b"new").expect("write src");
        let boot = tmp.path().join("boot");
        ensure_dir(&boot).expect("mkdir");
        fs::write(boot.join("vmlinuz-6.1"), b"old").expect("write old");
        std::os::unix::fs::symlink("vmlinuz-6.1", boot.join("vmlinuz")).expect("symlink");

        stage_file(&boot.join("vmlinuz"), &src).expect("stage");

        let meta = fs::symlink_metadata(boot.join("vmlinuz")).expect("meta");
        assert!(meta.file_type().is_symlink());
        assert_eq!(fs::read(boot.join("vmlinuz-6.1")).expect("read"), b"new");
    }

    #[test]
    fn stage_file_missing_source_is_a_stage_error() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let err = stage_file(&tmp.path().join("vmlinuz"), &tmp.path().join("nope")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Stage);
        assert!(!tmp.path().join("vmlinuz").exists());
    }

    #[cfg(unix)]
    #[test]
    fn copy_dir_keeps_symlinks() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let src = tmp.path().join("src");
        ensure_dir(&src.join("kernel")).expect("mkdir");
        fs::write(src.join("kernel/foo.ko"), b"ko").expect("write");
        std::os::unix::fs::symlink("/usr/src/linux", src.join("build")).expect("symlink");

        let dst = tmp.path().join("dst");
        copy_dir_all_preserve_links(&src, &dst).expect("copy");
        assert_eq!(fs::read(dst.join("kernel/foo.ko")).expect("read"), b"ko");
        assert_eq!(
            fs::read_link(dst.join("build")).expect("readlink"),
            PathBuf::from("/usr/src/linux")
        );
    }

    #[test]
    fn find_falls_back_and_reports_missing() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::write(tmp.path().join("kforge-test-only.patch"), b"").expect("write");

        let found = find("kforge-test-only.patch", &[tmp.path().to_path_buf()]).expect("found");
        assert_eq!(found, tmp.path().join("kforge-test-only.patch"));

        let err = find("kforge-test-missing.patch", &[tmp.path().to_path_buf()]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FileNotFound);
    }
}
