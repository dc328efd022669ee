use std::fs;
use std::path::Component;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, ErrorKind, Result};

fn default_true() -> bool {
    true
}

fn default_dir() -> String {
    ".".into()
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum CleanMode {
    #[default]
    None,
    Build,
}

/// `[workspace]`: where sources are downloaded and unpacked.
///
/// Patches are discovered in `root_dir`; archives and extracted trees live in
/// `build_dir`. Both default to the working directory, which is what the
/// container image expects (`WORKDIR /usr/src`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_dir")]
    pub root_dir: String,
    #[serde(default = "default_dir")]
    pub build_dir: String,
    #[serde(default)]
    pub clean: CleanMode,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            root_dir: default_dir(),
            build_dir: default_dir(),
            clean: CleanMode::None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkspacePaths {
    pub root: PathBuf,
    pub build_dir: PathBuf,
}

impl WorkspacePaths {
    /// Absolute paths are used as-is, relative ones are rooted at the workspace root.
    pub fn resolve_config_path(&self, raw: &str) -> Result<PathBuf> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(Error::new(ErrorKind::Config, "empty path"));
        }
        let pb = PathBuf::from(raw);
        Ok(if pb.is_absolute() {
            pb
        } else {
            self.root.join(pb)
        })
    }

    pub fn resolve_under_build(&self, rel: &str) -> Result<PathBuf> {
        let rel = rel.trim();
        if rel.is_empty() {
            return Err(Error::new(ErrorKind::Config, "empty relative path"));
        }
        let rel_pb = Path::new(rel);
        if rel_pb.is_absolute()
            || rel_pb
                .components()
                .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(Error::new(
                ErrorKind::Config,
                format!("invalid relative path '{}' (must stay under build dir)", rel),
            ));
        }
        Ok(self.build_dir.join(rel_pb))
    }
}

pub fn load_paths(cfg: &WorkspaceConfig) -> Result<WorkspacePaths> {
    let cwd = std::env::current_dir().map_err(|e| Error::msg(format!("cwd error: {e}")))?;
    let root = resolve_user_path(&cwd, &cfg.root_dir)?;
    let build_dir = resolve_user_dir(&root, &cfg.build_dir)?;
    Ok(WorkspacePaths { root, build_dir })
}

pub fn init_dirs(cfg: &WorkspaceConfig) -> Result<WorkspacePaths> {
    let paths = load_paths(cfg)?;

    if cfg.clean == CleanMode::Build {
        safe_remove_dir_all(&paths.root, &paths.build_dir)?;
    }

    fs::create_dir_all(&paths.build_dir).map_err(|e| {
        Error::msg(format!(
            "failed to create build_dir {}: {e}",
            paths.build_dir.display()
        ))
    })?;

    Ok(paths)
}

fn resolve_user_dir(root: &Path, p: &str) -> Result<PathBuf> {
    let p = p.trim();
    if p.is_empty() {
        return Err(Error::new(ErrorKind::Config, "empty workspace dir"));
    }
    if Path::new(p)
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(Error::new(
            ErrorKind::Config,
            format!("invalid workspace dir '{}' (contains '..')", p),
        ));
    }
    let pb = PathBuf::from(p);
    Ok(if pb.is_absolute() { pb } else { root.join(pb) })
}

fn resolve_user_path(base: &Path, p: &str) -> Result<PathBuf> {
    let p = p.trim();
    if p.is_empty() {
        return Err(Error::new(ErrorKind::Config, "empty workspace path"));
    }
    let pb = PathBuf::from(p);
    Ok(if pb.is_absolute() { pb } else { base.join(pb) })
}

fn safe_remove_dir_all(root: &Path, dir: &Path) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    let root_can = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    let dir_can = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
    if dir_can == root_can || !dir_can.starts_with(&root_can) {
        return Err(Error::new(
            ErrorKind::Config,
            format!(
                "refusing to clean '{}' (must be a subdirectory of workspace root '{}')",
                dir_can.display(),
                root_can.display()
            ),
        ));
    }
    fs::remove_dir_all(&dir_can)
        .map_err(|e| Error::msg(format!("failed to remove dir {}: {e}", dir_can.display())))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths(root: &Path) -> WorkspacePaths {
        WorkspacePaths {
            root: root.to_path_buf(),
            build_dir: root.join("build"),
        }
    }

    #[test]
    fn resolves_relative_and_absolute_config_paths() {
        let ws = paths(Path::new("/srv/kforge"));
        assert_eq!(
            ws.resolve_config_path("patches/a.patch").expect("relative"),
            PathBuf::from("/srv/kforge/patches/a.patch")
        );
        assert_eq!(
            ws.resolve_config_path("/boot/vmlinuz").expect("absolute"),
            PathBuf::from("/boot/vmlinuz")
        );
    }

    #[test]
    fn build_relative_paths_cannot_escape() {
        let ws = paths(Path::new("/srv/kforge"));
        assert!(ws.resolve_under_build("../etc").is_err());
        assert!(ws.resolve_under_build("/etc").is_err());
        assert_eq!(
            ws.resolve_under_build("linux-6.6").expect("ok"),
            PathBuf::from("/srv/kforge/build/linux-6.6")
        );
    }

    #[test]
    fn cleaning_the_root_itself_is_refused() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let err = safe_remove_dir_all(tmp.path(), tmp.path()).unwrap_err();
        assert!(err.to_string().contains("refusing"), "unexpected err: {err}");
        assert!(tmp.path().exists());
    }

    #[test]
    fn cleaning_a_subdir_removes_it() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let sub = tmp.path().join("build");
        fs::create_dir_all(sub.join("linux-6.6")).expect("mkdir");
        safe_remove_dir_all(tmp.path(), &sub).expect("clean");
        assert!(!sub.exists());
    }
}
