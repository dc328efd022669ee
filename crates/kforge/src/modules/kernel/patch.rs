use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use serde::Deserialize;

use kforge_macros::Task;

use crate::config::ConfigDoc;
use crate::error::{Error, ErrorKind, Result};
use crate::executor::ExecCtx;
use crate::modules::kernel::KernelConfig;

fn default_true() -> bool {
    true
}

#[Task(
    id = "kernel.patch",
    module = "kernel",
    phase = "patch",
    provides = ["kernel:patched"],
    after = ["kernel:source"],
    default_label = "Apply patches"
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PatchTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for PatchTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl PatchTask {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let ws = ctx.workspace_paths_or_init(doc)?;
        let kernel = KernelConfig::load(doc)?;
        let src_dir = kernel.source_dir(&ws)?;
        let patches = discover_patches(&ws.root)?;
        if patches.is_empty() {
            ctx.log(&format!("no *.patch files in {}", ws.root.display()));
            return Ok(());
        }
        apply_patches(ctx, kernel.patch_program(), &src_dir, &patches)
    }
}

/// `*.patch` files directly inside `dir`, sorted by file name.
pub fn discover_patches(dir: &Path) -> Result<Vec<PathBuf>> {
    let rd = fs::read_dir(dir).map_err(|e| {
        Error::new(
            ErrorKind::Patch,
            format!("failed to list {}: {e}", dir.display()),
        )
    })?;
    let mut out = Vec::new();
    for entry in rd {
        let entry = entry.map_err(|e| Error::new(ErrorKind::Patch, format!("read_dir entry error: {e}")))?;
        let path = entry.path();
        let is_patch = path.extension().is_some_and(|e| e == "patch")
            && path.file_stem().is_some_and(|s| !s.is_empty());
        if is_patch && path.is_file() {
            out.push(path);
        }
    }
    out.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(out)
}

/// Feed each patch to `<program> -p1` inside `src_dir`, in order.
///
/// Stops at the first failure. Patches applied before it stay applied.
pub fn apply_patches(
    ctx: &ExecCtx,
    program: &str,
    src_dir: &Path,
    patches: &[PathBuf],
) -> Result<()> {
    for (i, patch) in patches.iter().enumerate() {
        let name = patch
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| patch.display().to_string());
        ctx.log(&format!("applying patch {name:?} ({}/{})", i + 1, patches.len()));

        let file = fs::File::open(patch).map_err(|e| {
            Error::new(
                ErrorKind::Patch,
                format!("failed to open patch {}: {e}", patch.display()),
            )
        })?;
        let mut cmd = Command::new(program);
        cmd.arg("-p1").current_dir(src_dir);
        ctx.run_cmd_with_stdin(cmd, Stdio::from(file), ErrorKind::Patch)
            .map_err(|e| e.context(format!("patch {name:?}")))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovers_only_patch_files_in_name_order() {
        let tmp = tempfile::tempdir().expect("tempdir");
        for name in ["0002-b.patch", "0001-a.patch", "notes.txt", "0003.patch.orig"] {
            fs::write(tmp.path().join(name), b"").expect("write");
        }
        fs::create_dir(tmp.path().join("dir.patch")).expect("mkdir");

        let names: Vec<String> = discover_patches(tmp.path())
            .expect("discover")
            .iter()
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .collect();
        assert_eq!(names, vec!["0001-a.patch", "0002-b.patch"]);
    }

    #[test]
    fn empty_patch_set_is_a_no_op() {
        let ctx = ExecCtx::new(false, std::sync::Arc::new(crate::executor::StdoutSink::default()));
        let tmp = tempfile::tempdir().expect("tempdir");
        apply_patches(&ctx, "/nonexistent/patch", tmp.path(), &[]).expect("no-op");
    }
}
