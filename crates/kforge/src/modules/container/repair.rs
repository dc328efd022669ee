use std::fs;
use std::path::Path;

use serde::Deserialize;

use kforge_macros::Task;

use crate::config::ConfigDoc;
use crate::error::{Error, ErrorKind, Result};
use crate::executor::ExecCtx;
use crate::modules::container::host_targets;
use crate::modules::kernel::KernelConfig;
use crate::modules::util::{copy_dir_all_preserve_links, remove_path_if_exists, stage_file};

fn default_true() -> bool {
    true
}

const NEW_TREE: &str = ".modules.kforge-new";
const OLD_TREE: &str = ".modules.kforge-old";

#[Task(
    id = "container.collect",
    module = "container",
    phase = "collect",
    provides = ["container:kernel-installed"],
    after = ["container:result"],
    default_label = "Install boot image"
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CollectTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for CollectTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl CollectTask {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let dir = ctx.scratch_dir()?;
        let (host_kernel, _, _) = host_targets(doc, ctx)?;
        stage_file(&host_kernel, &dir.join("vmlinuz"))?;
        ctx.log(&format!("installed {}", host_kernel.display()));
        Ok(())
    }
}

#[Task(
    id = "container.repair",
    module = "container",
    phase = "repair",
    provides = ["container:modules-installed"],
    after = ["container:kernel-installed"],
    default_label = "Install kernel modules"
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RepairTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for RepairTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl RepairTask {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let kernel = KernelConfig::load(doc)?;
        let dir = ctx.scratch_dir()?;
        let built = dir.join("lib").join("modules");
        if !kernel.modules {
            ctx.log("kernel.modules = false, leaving host modules untouched");
            return Ok(());
        }
        if !built.is_dir() {
            return Err(Error::new(
                ErrorKind::Stage,
                format!("container produced no module tree at {}", built.display()),
            ));
        }

        let pruned = prune_module_links(&built)?;
        ctx.log(&format!("removed {pruned} build/source link(s)"));

        let (_, host_lib, host) = host_targets(doc, ctx)?;
        replace_modules(&host_lib, &built, host.atomic_module_swap)?;
        ctx.log(&format!(
            "replaced {}",
            host_lib.join("modules").display()
        ));
        Ok(())
    }
}

/// Drop `<release>/build` and `<release>/source`; they point into a source
/// tree that only existed inside the container.
pub fn prune_module_links(modules_dir: &Path) -> Result<usize> {
    let mut removed = 0usize;
    let rd = fs::read_dir(modules_dir).map_err(|e| {
        Error::new(
            ErrorKind::Io,
            format!("failed to read {}: {e}", modules_dir.display()),
        )
    })?;
    for entry in rd {
        let entry = entry.map_err(|e| Error::new(ErrorKind::Io, format!("read_dir entry error: {e}")))?;
        let release = entry.path();
        if !release.is_dir() {
            continue;
        }
        for sub in ["build", "source"] {
            if remove_path_if_exists(&release.join(sub))? {
                removed += 1;
            }
        }
    }
    Ok(removed)
}

/// Put `new_tree` at `<lib>/modules`.
///
/// In atomic mode the new tree is copied next to the old one first and swapped
/// in with renames, so `<lib>/modules` always holds a complete tree. Otherwise
/// the old tree is deleted before copying.
pub fn replace_modules(lib: &Path, new_tree: &Path, atomic: bool) -> Result<()> {
    let target = lib.join("modules");
    if !atomic {
        remove_path_if_exists(&target)?;
        return copy_dir_all_preserve_links(new_tree, &target);
    }

    let staging = lib.join(NEW_TREE);
    let old = lib.join(OLD_TREE);
    remove_path_if_exists(&staging)?;
    remove_path_if_exists(&old)?;
    copy_dir_all_preserve_links(new_tree, &staging)?;

    let had_old = fs::symlink_metadata(&target).is_ok();
    if had_old {
        rename(&target, &old)?;
    }
    if let Err(e) = rename(&staging, &target) {
        if !had_old {
            return Err(e);
        }
        return Err(restore_old_tree(e, &old, &target));
    }
    if had_old {
        remove_path_if_exists(&old)?;
    }
    Ok(())
}

/// Move `old` back to `target` after a failed swap. The returned error says
/// whether that worked and, if not, where the previous tree was left.
fn restore_old_tree(swap_err: Error, old: &Path, target: &Path) -> Error {
    match fs::rename(old, target) {
        Ok(()) => swap_err.context("previous module tree restored"),
        Err(e) => swap_err.context(format!(
            "restoring the previous module tree also failed ({e}); it is still at {}",
            old.display()
        )),
    }
}

fn rename(from: &Path, to: &Path) -> Result<()> {
    fs::rename(from, to).map_err(|e| {
        Error::new(
            ErrorKind::Io,
            format!(
                "failed to rename {} -> {}: {e}",
                from.display(),
                to.display()
            ),
        )
    })
}
