use std::fs;
use std::io::Write;
use std::path::Path;

use serde::Deserialize;

use kforge_macros::Task;

use crate::config::ConfigDoc;
use crate::error::{Error, ErrorKind, Result};
use crate::executor::ExecCtx;
use crate::modules::kernel::{KernelConfig, Overlay, make_cmd};

fn default_true() -> bool {
    true
}

#[Task(
    id = "kernel.configure",
    module = "kernel",
    phase = "configure",
    provides = ["kernel:config"],
    after = ["kernel:patched"],
    default_label = "Configure kernel"
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConfigureTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for ConfigureTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl ConfigureTask {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let ws = ctx.workspace_paths_or_init(doc)?;
        let kernel = KernelConfig::load(doc)?;
        let src_dir = kernel.source_dir(&ws)?;
        let overlay = kernel.resolve_overlay(&ws)?;

        generate_baseline(ctx, &kernel, &src_dir)?;
        let config_file = src_dir.join(".config");
        apply_overlay(&config_file, &overlay)?;
        ctx.log(&format!(
            "appended {} overlay entries to {}",
            overlay.len(),
            config_file.display()
        ));
        normalize_config(ctx, &kernel, &src_dir)?;

        let final_cfg = fs::read_to_string(&config_file).map_err(|e| {
            Error::new(
                ErrorKind::Io,
                format!("failed to read {}: {e}", config_file.display()),
            )
        })?;
        log_unrealized(ctx, &kernel, &overlay, &final_cfg);
        Ok(())
    }
}

pub fn generate_baseline(ctx: &ExecCtx, kernel: &KernelConfig, src_dir: &Path) -> Result<()> {
    let mut cmd = make_cmd(kernel, src_dir);
    cmd.arg(&kernel.defconfig_target);
    ctx.run_cmd(cmd, ErrorKind::KernelConfig)
        .map_err(|e| e.context(format!("make {}", kernel.defconfig_target)))
}

/// Append one `NAME=VALUE` line per entry. kbuild keeps the last assignment,
/// so overlay values win over the baseline.
pub fn apply_overlay(config_file: &Path, overlay: &Overlay) -> Result<()> {
    let io_err = |e: std::io::Error| {
        Error::new(
            ErrorKind::Io,
            format!("failed to append to {}: {e}", config_file.display()),
        )
    };
    let mut f = fs::OpenOptions::new()
        .append(true)
        .open(config_file)
        .map_err(io_err)?;
    f.write_all(overlay.render().as_bytes()).map_err(io_err)?;
    f.flush().map_err(io_err)?;
    Ok(())
}

pub fn normalize_config(ctx: &ExecCtx, kernel: &KernelConfig, src_dir: &Path) -> Result<()> {
    let mut cmd = make_cmd(kernel, src_dir);
    cmd.arg(&kernel.normalize_target);
    ctx.run_cmd(cmd, ErrorKind::KernelConfig)
        .map_err(|e| e.context(format!("make {}", kernel.normalize_target)))
}

fn log_unrealized(ctx: &ExecCtx, kernel: &KernelConfig, overlay: &Overlay, final_cfg: &str) {
    let bad = overlay.unrealized(final_cfg);
    for e in &bad {
        ctx.log(&format!(
            "WARN: requested {} was not realized after {}",
            e.line(),
            kernel.normalize_target
        ));
    }
    if !bad.is_empty() {
        tracing::warn!(
            count = bad.len(),
            total = overlay.len(),
            "overlay entries dropped by the kernel config normalizer"
        );
    }
}
