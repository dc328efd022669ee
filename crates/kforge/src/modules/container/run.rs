use std::ffi::OsString;
use std::path::Path;
use std::process::Command;

use serde::Deserialize;

use kforge_macros::Task;

use crate::config::ConfigDoc;
use crate::error::{ErrorKind, Result};
use crate::executor::ExecCtx;
use crate::modules::container::ContainerConfig;
use crate::modules::container::runtime::{ContainerRuntime, RuntimeFlavor};

fn default_true() -> bool {
    true
}

pub fn build_args(image_tag: &str) -> Vec<OsString> {
    vec![
        "build".into(),
        "--rm=true".into(),
        format!("--tag={image_tag}").into(),
        ".".into(),
    ]
}

/// podman gets `--userns=keep-id` so files written to the mount stay owned by
/// the invoking user.
pub fn run_args(
    rt: &ContainerRuntime,
    context_dir: &Path,
    result_mount: &str,
    image_tag: &str,
) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["run".into()];
    if rt.flavor == RuntimeFlavor::Podman {
        args.push("--userns=keep-id".into());
    }
    args.push("--rm".into());
    args.push("--volume".into());
    let mut volume = context_dir.as_os_str().to_os_string();
    volume.push(format!(":{result_mount}:Z"));
    args.push(volume);
    args.push(image_tag.into());
    args
}

#[Task(
    id = "container.image",
    module = "container",
    phase = "image",
    provides = ["container:image"],
    after = ["container:dockerfile"],
    default_label = "Build container image"
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ImageTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for ImageTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl ImageTask {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let cfg = ContainerConfig::load(doc)?;
        let rt = ctx.runtime()?;
        let dir = ctx.scratch_dir()?;
        ctx.log(&format!("building {} image {}", rt.name(), cfg.image_tag));

        let mut cmd = Command::new(&rt.executable);
        cmd.current_dir(&dir).args(build_args(&cfg.image_tag));
        ctx.run_cmd(cmd, ErrorKind::ContainerBuild)
            .map_err(|e| e.context(format!("{} build", rt.name())))
    }
}

#[Task(
    id = "container.run",
    module = "container",
    phase = "run",
    provides = ["container:result"],
    after = ["container:image"],
    default_label = "Compile kernel in container"
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for RunTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl RunTask {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let cfg = ContainerConfig::load(doc)?;
        let rt = ctx.runtime()?;
        let dir = ctx.scratch_dir()?;

        let mut cmd = Command::new(&rt.executable);
        cmd.current_dir(&dir)
            .args(run_args(&rt, &dir, &cfg.result_mount, &cfg.image_tag));
        ctx.run_cmd(cmd, ErrorKind::ContainerRun)
            .map_err(|e| e.context(format!("{} run", rt.name())))
    }
}
