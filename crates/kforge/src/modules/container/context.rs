use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Deserialize;
use toml::Value;

use kforge_macros::Task;

use crate::config::ConfigDoc;
use crate::error::{Error, ErrorKind, Result};
use crate::executor::ExecCtx;
use crate::modules::container::{
    BuilderSource, ContainerConfig, PatchesConfig, host_targets, search_dirs,
};
use crate::modules::kernel::KernelConfig;
use crate::modules::kernel::patch::discover_patches;
use crate::modules::util::{find, stage_file, write_text};

fn default_true() -> bool {
    true
}

/// Names of the files the context carries besides patches.
pub const BUILDER_BINARY: &str = "kforge";
pub const BUILDER_CONFIG: &str = "kforge.toml";
pub const OVERLAY_FRAGMENT: &str = "kforge-overlay.config";
const CARGO_TARGET_DIR: &str = ".cargo-target";

#[Task(
    id = "container.context",
    module = "container",
    phase = "context",
    provides = ["container:context"],
    after = ["container:runtime"],
    default_label = "Stage build context"
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ContextTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for ContextTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl ContextTask {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let cfg = ContainerConfig::load(doc)?;
        let kernel = KernelConfig::load(doc)?;
        let ws = ctx.workspace_paths_or_init(doc)?;

        // Resolve everything on the host side before creating anything.
        let patches = resolve_patches(doc, ctx)?;
        let (host_kernel, host_lib, _) = host_targets(doc, ctx)?;
        ctx.log(&format!("host kernel = {}", host_kernel.display()));
        ctx.log(&format!("host lib = {}", host_lib.display()));

        let scratch = tempfile::Builder::new()
            .prefix("kforge-rebuild")
            .tempdir_in(&cfg.scratch_parent)
            .map_err(|e| {
                Error::new(
                    ErrorKind::Io,
                    format!("failed to create build context under {}: {e}", cfg.scratch_parent),
                )
            })?;
        let dir = scratch.path().to_path_buf();
        ctx.set_scratch(scratch);
        ctx.log(&format!("build context = {}", dir.display()));

        stage_builder(ctx, &cfg, &dir)?;

        for p in &patches {
            let name = p.file_name().ok_or_else(|| {
                Error::new(ErrorKind::FileNotFound, format!("invalid patch path {}", p.display()))
            })?;
            stage_file(&dir.join(name), p)?;
        }
        ctx.log(&format!("staged {} patch(es)", patches.len()));

        let overlay = kernel.resolve_overlay(&ws)?;
        write_text(&dir.join(OVERLAY_FRAGMENT), &overlay.render())?;
        write_text(
            &dir.join(BUILDER_CONFIG),
            &builder_config(doc, &cfg.result_mount)?.to_toml_string()?,
        )?;
        if cfg.builder == BuilderSource::Cargo {
            write_text(&dir.join(".dockerignore"), &format!("{CARGO_TARGET_DIR}\n"))?;
        }
        Ok(())
    }
}

/// Declared patch names resolved through `find`, or every `*.patch` in the
/// workspace root when none are declared.
pub fn resolve_patches(doc: &ConfigDoc, ctx: &ExecCtx) -> Result<Vec<PathBuf>> {
    let cfg = PatchesConfig::load(doc)?;
    if cfg.files.is_empty() {
        let ws = ctx.workspace_paths_or_init(doc)?;
        return discover_patches(&ws.root);
    }
    let dirs = search_dirs(doc, ctx)?;
    cfg.files.iter().map(|f| find(f, &dirs)).collect()
}

fn stage_builder(ctx: &ExecCtx, cfg: &ContainerConfig, dir: &Path) -> Result<()> {
    let dest = dir.join(BUILDER_BINARY);
    let src = match cfg.builder {
        BuilderSource::CurrentExe => std::env::current_exe().map_err(|e| {
            Error::new(
                ErrorKind::Io,
                format!("failed to locate the running executable: {e}"),
            )
        })?,
        BuilderSource::Cargo => {
            let target_dir = dir.join(CARGO_TARGET_DIR);
            ctx.run_cmd(cargo_build_cmd(cfg, &target_dir), ErrorKind::ContainerBuild)
                .map_err(|e| e.context(format!("building {} for {}", cfg.cargo_package, cfg.cargo_target)))?;
            target_dir
                .join(&cfg.cargo_target)
                .join("release")
                .join(&cfg.cargo_package)
        }
    };
    stage_file(&dest, &src)?;
    ctx.log(&format!("builder binary {} -> {}", src.display(), dest.display()));
    Ok(())
}

/// Release build of the builder for the container target, independent of the
/// working directory.
pub fn cargo_build_cmd(cfg: &ContainerConfig, target_dir: &Path) -> Command {
    let mut cmd = Command::new(cfg.cargo_program());
    cmd.arg("build")
        .arg("--release")
        .arg("--manifest-path")
        .arg(&cfg.cargo_manifest)
        .arg("--target")
        .arg(&cfg.cargo_target)
        .arg("-p")
        .arg(&cfg.cargo_package)
        .arg("--target-dir")
        .arg(target_dir);
    cmd
}

/// The configuration the builder sees inside the container.
///
/// Only `[kernel]` carries over. Host paths mean nothing in the container, so
/// the overlay is shipped pre-merged as a fragment and the result dir points at
/// the mount.
pub fn builder_config(doc: &ConfigDoc, result_mount: &str) -> Result<ConfigDoc> {
    let mut kernel = doc
        .table_path("kernel")
        .cloned()
        .unwrap_or_default();
    kernel.remove("overlay");
    kernel.insert("builtin_overlay".into(), Value::Boolean(false));
    kernel.insert(
        "overlay_files".into(),
        Value::Array(vec![Value::String(OVERLAY_FRAGMENT.into())]),
    );
    kernel.insert("result_dir".into(), Value::String(result_mount.into()));

    let mut root = toml::value::Table::new();
    root.insert("kernel".into(), Value::Table(kernel));
    Ok(ConfigDoc {
        path: PathBuf::from(BUILDER_CONFIG),
        value: Value::Table(root),
    })
}
