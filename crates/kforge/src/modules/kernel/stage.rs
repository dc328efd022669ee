use std::path::Path;

use serde::Deserialize;
use serde_json::json;

use kforge_macros::Task;

use crate::config::ConfigDoc;
use crate::error::{ErrorKind, Result};
use crate::executor::ExecCtx;
use crate::modules::kernel::compile::identity_env;
use crate::modules::kernel::patch::discover_patches;
use crate::modules::kernel::{KernelConfig, make_cmd};
use crate::modules::util::{ensure_dir, sha256_file_hex, stage_file, write_json_pretty};

fn default_true() -> bool {
    true
}

pub const BUILD_INFO_FILE: &str = "build-info.json";

#[Task(
    id = "kernel.stage",
    module = "kernel",
    phase = "stage",
    provides = ["kernel:artifacts"],
    after = ["kernel:image"],
    default_label = "Stage artifacts"
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StageTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for StageTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl StageTask {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let ws = ctx.workspace_paths_or_init(doc)?;
        let kernel = KernelConfig::load(doc)?;
        let src_dir = kernel.source_dir(&ws)?;
        let result_dir = kernel.result_dir(&ws)?;
        ensure_dir(&result_dir)?;

        let image = src_dir.join(&kernel.image_path);
        let staged = result_dir.join("vmlinuz");
        stage_file(&staged, &image)?;
        ctx.log(&format!("{} -> {}", image.display(), staged.display()));

        if kernel.modules {
            install_modules(ctx, &kernel, &src_dir, &result_dir)?;
        }

        let patches: Vec<String> = discover_patches(&ws.root)?
            .iter()
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .collect();
        let overlay = kernel.resolve_overlay(&ws)?;
        let identity: serde_json::Map<String, serde_json::Value> = identity_env(&kernel.identity)
            .into_iter()
            .map(|(k, v)| (k.to_string(), json!(v)))
            .collect();
        let info = json!({
            "url": kernel.url,
            "image": "vmlinuz",
            "image_sha256": sha256_file_hex(&staged)?,
            "modules": kernel.modules,
            "overlay_entries": overlay.len(),
            "patches": patches,
            "identity": identity,
            "built_at": chrono::Utc::now().to_rfc3339(),
        });
        write_json_pretty(&result_dir.join(BUILD_INFO_FILE), &info)?;
        ctx.log(&format!("wrote {}", result_dir.join(BUILD_INFO_FILE).display()));
        Ok(())
    }
}

fn install_modules(
    ctx: &ExecCtx,
    kernel: &KernelConfig,
    src_dir: &Path,
    result_dir: &Path,
) -> Result<()> {
    let mut cmd = make_cmd(kernel, src_dir);
    cmd.arg("modules_install")
        .arg(format!("INSTALL_MOD_PATH={}", result_dir.display()));
    ctx.run_cmd(cmd, ErrorKind::Stage)
}
