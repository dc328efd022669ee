use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use kforge_macros::Task;

use crate::config::ConfigDoc;
use crate::error::{Error, ErrorKind, Result};
use crate::executor::ExecCtx;
use crate::modules::container::ContainerConfig;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeFlavor {
    /// Rootless-capable; maps the invoking user into the container.
    Podman,
    Docker,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRuntime {
    pub executable: PathBuf,
    pub flavor: RuntimeFlavor,
}

impl ContainerRuntime {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        let executable = executable.into();
        let flavor = flavor_of(&executable);
        Self { executable, flavor }
    }

    pub fn name(&self) -> String {
        self.executable
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.executable.display().to_string())
    }
}

fn flavor_of(executable: &Path) -> RuntimeFlavor {
    match executable.file_name().and_then(OsStr::to_str) {
        Some("podman") => RuntimeFlavor::Podman,
        _ => RuntimeFlavor::Docker,
    }
}

/// An override is used verbatim. Otherwise the first of `choices` found on
/// `search_path` wins, with symlinks resolved so a `docker` -> `podman` link
/// is recognised as podman.
pub fn detect(
    override_exe: Option<&str>,
    choices: &[String],
    search_path: Option<&OsStr>,
) -> Result<ContainerRuntime> {
    if let Some(exe) = override_exe.map(str::trim).filter(|s| !s.is_empty()) {
        return Ok(ContainerRuntime::new(exe));
    }

    let cwd = std::env::current_dir()?;
    for choice in choices.iter().map(|c| c.trim()).filter(|c| !c.is_empty()) {
        let found = match search_path {
            Some(p) => which::which_in(choice, Some(p), &cwd),
            None => which::which(choice),
        };
        let Ok(path) = found else {
            tracing::debug!(runtime = choice, "not found on PATH");
            continue;
        };
        let resolved = path.canonicalize().map_err(|e| {
            Error::new(
                ErrorKind::RuntimeNotFound,
                format!("failed to resolve {}: {e}", path.display()),
            )
        })?;
        tracing::debug!(runtime = choice, path = %resolved.display(), "detected container runtime");
        return Ok(ContainerRuntime::new(resolved));
    }

    Err(Error::new(
        ErrorKind::RuntimeNotFound,
        format!("none of {choices:?} found in $PATH"),
    ))
}

#[Task(
    id = "container.detect",
    module = "container",
    phase = "detect",
    provides = ["container:runtime"],
    after = ["core.init"],
    default_label = "Detect container runtime"
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DetectTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for DetectTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl DetectTask {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let cfg = ContainerConfig::load(doc)?;
        let rt = detect(cfg.executable.as_deref(), &cfg.choices, None)?;
        ctx.log(&format!(
            "using {} ({:?})",
            rt.executable.display(),
            rt.flavor
        ));
        ctx.set_runtime(rt);
        Ok(())
    }
}
