//! Builder mode: fetch, patch, configure, compile and stage a kernel.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use kforge_macros::Module;

use crate::config::ConfigDoc;
use crate::error::{Error, ErrorKind, Result};
use crate::modules::ModuleConfig;
use crate::workspace::WorkspacePaths;

pub mod compile;
pub mod fetch;
pub mod kconfig;
pub mod overlay;
pub mod patch;
pub mod stage;

pub use compile::CompileTask;
pub use fetch::{ExtractTask, FetchTask};
pub use kconfig::ConfigureTask;
pub use overlay::Overlay;
pub use patch::PatchTask;
pub use stage::StageTask;

pub const DEFAULT_KERNEL_URL: &str =
    "https://cdn.kernel.org/pub/linux/kernel/v6.x/linux-6.6.58.tar.xz";

/// Archive suffixes `tar xf` can unpack, longest first.
pub const ARCHIVE_SUFFIXES: &[&str] = &[
    ".tar.xz", ".tar.gz", ".tar.bz2", ".tar.zst", ".tgz", ".tar",
];

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub user: String,
    pub host: String,
    /// Used verbatim when set; otherwise derived from `SOURCE_DATE_EPOCH` or now.
    pub timestamp: Option<String>,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            user: "kforge".into(),
            host: "kforge-builder".into(),
            timestamp: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub url: String,
    pub defconfig_target: String,
    pub normalize_target: String,
    pub image_target: String,
    /// Boot image path relative to the source tree.
    pub image_path: String,
    pub result_dir: String,
    /// 0 = detected CPU count.
    pub jobs: usize,
    #[serde(default = "default_true")]
    pub modules: bool,
    #[serde(default = "default_true")]
    pub builtin_overlay: bool,
    pub overlay_files: Vec<String>,
    pub overlay: BTreeMap<String, toml::Value>,
    pub identity: IdentityConfig,
    #[serde(default = "default_true")]
    pub reuse_archive: bool,
    pub patch_program: Option<String>,
    pub make_program: Option<String>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_KERNEL_URL.into(),
            defconfig_target: "defconfig".into(),
            normalize_target: "olddefconfig".into(),
            image_target: "bzImage".into(),
            image_path: "arch/x86/boot/bzImage".into(),
            result_dir: "/tmp/buildresult".into(),
            jobs: 0,
            modules: true,
            builtin_overlay: true,
            overlay_files: Vec::new(),
            overlay: BTreeMap::new(),
            identity: IdentityConfig::default(),
            reuse_archive: true,
            patch_program: None,
            make_program: None,
        }
    }
}

impl ModuleConfig for KernelConfig {
    fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            return Err(Error::new(ErrorKind::Config, "kernel.url must not be empty"));
        }
        source_dir_name(&archive_name(&self.url)?)?;
        for (what, v) in [
            ("kernel.defconfig_target", &self.defconfig_target),
            ("kernel.normalize_target", &self.normalize_target),
            ("kernel.image_target", &self.image_target),
            ("kernel.image_path", &self.image_path),
            ("kernel.result_dir", &self.result_dir),
        ] {
            if v.trim().is_empty() {
                return Err(Error::new(
                    ErrorKind::Config,
                    format!("{what} must not be empty"),
                ));
            }
        }
        for (name, value) in &self.overlay {
            Overlay::new().set_toml(name, value)?;
        }
        Ok(())
    }
}

impl KernelConfig {
    pub fn load(doc: &ConfigDoc) -> Result<Self> {
        let cfg: KernelConfig = doc.deserialize_path("kernel")?.unwrap_or_default();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn make_program(&self) -> &str {
        self.make_program
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or("make")
    }

    pub fn patch_program(&self) -> &str {
        self.patch_program
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or("patch")
    }

    pub fn archive_path(&self, ws: &WorkspacePaths) -> Result<PathBuf> {
        ws.resolve_under_build(&archive_name(&self.url)?)
    }

    pub fn source_dir(&self, ws: &WorkspacePaths) -> Result<PathBuf> {
        ws.resolve_under_build(&source_dir_name(&archive_name(&self.url)?)?)
    }

    pub fn result_dir(&self, ws: &WorkspacePaths) -> Result<PathBuf> {
        ws.resolve_config_path(&self.result_dir)
    }

    /// Built-in entries, then fragment files, then the `[kernel.overlay]` table.
    pub fn resolve_overlay(&self, ws: &WorkspacePaths) -> Result<Overlay> {
        let mut o = if self.builtin_overlay {
            overlay::builtin()?
        } else {
            Overlay::new()
        };
        for f in &self.overlay_files {
            let path = ws.resolve_config_path(f)?;
            let n = o.merge_fragment_file(&path)?;
            tracing::debug!(path = %path.display(), entries = n, "merged overlay fragment");
        }
        for (name, value) in &self.overlay {
            o.set_toml(name, value)?;
        }
        Ok(o)
    }
}

/// Last path segment of the source URL (or local path).
pub fn archive_name(url: &str) -> Result<String> {
    let trimmed = url.trim().trim_end_matches('/');
    let no_query = trimmed.split(['?', '#']).next().unwrap_or(trimmed);
    let name = no_query.rsplit('/').next().unwrap_or("").trim();
    if name.is_empty() || name == "." || name == ".." {
        return Err(Error::new(
            ErrorKind::Config,
            format!("cannot derive archive name from kernel.url '{url}'"),
        ));
    }
    Ok(name.to_string())
}

/// `linux-6.6.tar.xz` → `linux-6.6`.
pub fn source_dir_name(archive: &str) -> Result<String> {
    ARCHIVE_SUFFIXES
        .iter()
        .find_map(|s| archive.strip_suffix(s))
        .filter(|s| !s.is_empty())
        .map(ToOwned::to_owned)
        .ok_or_else(|| {
            Error::new(
                ErrorKind::Extract,
                format!(
                    "unsupported archive '{archive}' (expected one of {})",
                    ARCHIVE_SUFFIXES.join(", ")
                ),
            )
        })
}

pub(crate) fn make_cmd(cfg: &KernelConfig, dir: &Path) -> std::process::Command {
    let mut cmd = std::process::Command::new(cfg.make_program());
    cmd.current_dir(dir);
    cmd
}

#[Module(
    id = "kernel",
    config = KernelConfig,
    config_path = "kernel",
    tasks = [FetchTask, ExtractTask, PatchTask, ConfigureTask, CompileTask, StageTask]
)]
pub struct KernelModule;
