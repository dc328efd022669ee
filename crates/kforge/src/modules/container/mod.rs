//! Wrapper mode: run the builder inside a throwaway container and install its
//! output on the host.
//!
//! Every step works out of one ephemeral build context directory. It doubles as
//! the container's result mount, so the builder's `vmlinuz` and `lib/modules`
//! land in it directly.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use kforge_macros::Module;

use crate::config::ConfigDoc;
use crate::error::{Error, ErrorKind, Result};
use crate::executor::ExecCtx;
use crate::modules::ModuleConfig;
use crate::modules::util::find;

pub mod context;
pub mod dockerfile;
pub mod repair;
pub mod run;
pub mod runtime;

pub use context::ContextTask;
pub use dockerfile::DockerfileTask;
pub use repair::{CollectTask, RepairTask};
pub use run::{ImageTask, RunTask};
pub use runtime::DetectTask;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum BuilderSource {
    /// Build a static binary for `cargo_target` from `cargo_manifest`.
    #[default]
    Cargo,
    /// Copy the running executable. Only works when it is statically linked
    /// or the image's libc is at least as new as the host's.
    CurrentExe,
}

/// Manifest of this crate as it was built; `cargo -p` resolves the workspace from it.
pub const DEFAULT_CARGO_MANIFEST: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/Cargo.toml");

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Runtime to use as-is, skipping detection.
    pub executable: Option<String>,
    /// Probed in order on `PATH`.
    pub choices: Vec<String>,
    pub image_tag: String,
    pub base_image: String,
    pub packages: Vec<String>,
    /// Where the build context is mounted inside the container.
    pub result_mount: String,
    pub scratch_parent: String,
    pub builder: BuilderSource,
    pub cargo_target: String,
    pub cargo_package: String,
    pub cargo_manifest: String,
    /// `cargo` unless overridden.
    pub cargo_program: Option<String>,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            executable: None,
            // podman first: `docker` may be a thin podman wrapper.
            choices: vec!["podman".into(), "docker".into()],
            image_tag: "kforge-rebuild".into(),
            base_image: "debian:bookworm".into(),
            packages: [
                "build-essential",
                "bc",
                "bison",
                "flex",
                "kmod",
                "cpio",
                "libssl-dev",
                "libelf-dev",
                "libncurses-dev",
                "patch",
                "xz-utils",
                "ca-certificates",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            result_mount: "/tmp/buildresult".into(),
            scratch_parent: "/tmp".into(),
            builder: BuilderSource::Cargo,
            cargo_target: "x86_64-unknown-linux-musl".into(),
            cargo_package: "kforge".into(),
            cargo_manifest: DEFAULT_CARGO_MANIFEST.into(),
            cargo_program: None,
        }
    }
}

impl ModuleConfig for ContainerConfig {
    fn validate(&self) -> Result<()> {
        if self.executable.as_deref().is_some_and(|s| s.trim().is_empty()) {
            return Err(Error::new(
                ErrorKind::Config,
                "container.executable must not be empty when set",
            ));
        }
        if self.executable.is_none() && self.choices.iter().all(|c| c.trim().is_empty()) {
            return Err(Error::new(
                ErrorKind::Config,
                "container.choices must name at least one runtime",
            ));
        }
        if self.builder == BuilderSource::Cargo {
            for (what, v) in [
                ("container.cargo_target", &self.cargo_target),
                ("container.cargo_package", &self.cargo_package),
                ("container.cargo_manifest", &self.cargo_manifest),
            ] {
                if v.trim().is_empty() {
                    return Err(Error::new(
                        ErrorKind::Config,
                        format!("{what} must not be empty when container.builder = \"cargo\""),
                    ));
                }
            }
        }
        for (what, v) in [
            ("container.image_tag", &self.image_tag),
            ("container.base_image", &self.base_image),
            ("container.scratch_parent", &self.scratch_parent),
        ] {
            if v.trim().is_empty() {
                return Err(Error::new(
                    ErrorKind::Config,
                    format!("{what} must not be empty"),
                ));
            }
        }
        if !self.result_mount.starts_with('/') {
            return Err(Error::new(
                ErrorKind::Config,
                format!(
                    "container.result_mount must be absolute, got '{}'",
                    self.result_mount
                ),
            ));
        }
        Ok(())
    }
}

impl ContainerConfig {
    pub fn cargo_program(&self) -> &str {
        self.cargo_program
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or("cargo")
    }

    pub fn load(doc: &ConfigDoc) -> Result<Self> {
        let cfg: ContainerConfig = doc.deserialize_path("container")?.unwrap_or_default();
        cfg.validate()?;
        Ok(cfg)
    }
}

/// `[host]`: where collected artifacts are installed.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Existing boot image file to overwrite.
    pub kernel: String,
    /// Directory holding `modules/`.
    pub lib: String,
    #[serde(default = "default_true")]
    pub atomic_module_swap: bool,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            kernel: "vmlinuz".into(),
            lib: "lib".into(),
            atomic_module_swap: true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PatchesConfig {
    /// Patch file names to ship into the image. Empty = every `*.patch` in
    /// the workspace root.
    pub files: Vec<String>,
    /// Searched after the working directory.
    pub fallback_dir: Option<String>,
}

impl ModuleConfig for PatchesConfig {
    /// Declared names become `COPY <name> ...` lines and must be picked up by
    /// `*.patch` discovery inside the image.
    fn validate(&self) -> Result<()> {
        for f in &self.files {
            let name = Path::new(f.trim())
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            if !name.ends_with(".patch") || name == ".patch" {
                return Err(Error::new(
                    ErrorKind::Config,
                    format!("patches.files entry {f:?} must name a *.patch file"),
                ));
            }
            if name.chars().any(char::is_whitespace) {
                return Err(Error::new(
                    ErrorKind::Config,
                    format!("patches.files entry {f:?} must not contain whitespace"),
                ));
            }
        }
        Ok(())
    }
}

impl PatchesConfig {
    pub fn load(doc: &ConfigDoc) -> Result<Self> {
        let cfg: PatchesConfig = doc.deserialize_path("patches")?.unwrap_or_default();
        cfg.validate()?;
        Ok(cfg)
    }
}

/// Directories `find` searches after the working directory.
pub fn search_dirs(doc: &ConfigDoc, ctx: &ExecCtx) -> Result<Vec<PathBuf>> {
    let ws = ctx.workspace_paths_or_init(doc)?;
    let patches = PatchesConfig::load(doc)?;
    let mut out = Vec::new();
    if let Some(dir) = patches
        .fallback_dir
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        out.push(ws.resolve_config_path(dir)?);
    }
    out.push(PathBuf::from(env!("CARGO_MANIFEST_DIR")));
    Ok(out)
}

/// Host boot image and lib dir, looked up like patches are.
pub fn host_targets(doc: &ConfigDoc, ctx: &ExecCtx) -> Result<(PathBuf, PathBuf, HostConfig)> {
    let host: HostConfig = doc.deserialize_path("host")?.unwrap_or_default();
    let dirs = search_dirs(doc, ctx)?;
    let kernel = find(&host.kernel, &dirs)?;
    let lib = find(&host.lib, &dirs)?;
    Ok((kernel, lib, host))
}

#[Module(
    id = "container",
    config = ContainerConfig,
    config_path = "container",
    tasks = [
        DetectTask,
        ContextTask,
        DockerfileTask,
        ImageTask,
        RunTask,
        CollectTask,
        RepairTask
    ]
)]
pub struct ContainerModule;
