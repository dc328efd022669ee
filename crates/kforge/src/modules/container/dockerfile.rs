use serde::Deserialize;

use kforge_macros::Task;

use crate::config::ConfigDoc;
use crate::error::Result;
use crate::executor::ExecCtx;
use crate::modules::container::ContainerConfig;
use crate::modules::container::context::{BUILDER_BINARY, BUILDER_CONFIG, OVERLAY_FRAGMENT};
use crate::modules::kernel::patch::discover_patches;
use crate::modules::util::write_text;

fn default_true() -> bool {
    true
}

/// Where sources, patches and the builder config live inside the image.
pub const SRC_DIR: &str = "/usr/src";
const BUILDER_USER: &str = "builduser";

#[derive(Debug, Clone)]
pub struct DockerfileParams {
    pub base_image: String,
    pub packages: Vec<String>,
    pub patches: Vec<String>,
    pub uid: u32,
    pub gid: u32,
}

pub fn render(p: &DockerfileParams) -> String {
    let mut out = String::new();
    out.push_str(&format!("FROM {}\n\n", p.base_image));
    if !p.packages.is_empty() {
        out.push_str(&format!(
            "RUN apt-get update && apt-get install -y --no-install-recommends {}\n\n",
            p.packages.join(" ")
        ));
    }
    out.push_str(&format!("COPY {BUILDER_BINARY} /usr/bin/{BUILDER_BINARY}\n"));
    out.push_str(&format!("COPY {BUILDER_CONFIG} {SRC_DIR}/{BUILDER_CONFIG}\n"));
    out.push_str(&format!("COPY {OVERLAY_FRAGMENT} {SRC_DIR}/{OVERLAY_FRAGMENT}\n"));
    for patch in &p.patches {
        out.push_str(&format!("COPY {patch} {SRC_DIR}/{patch}\n"));
    }
    out.push('\n');
    out.push_str(&format!(
        "RUN echo '{BUILDER_USER}:x:{uid}:{gid}:nobody:/:/bin/sh' >> /etc/passwd && \\\n    chown -R {uid}:{gid} {SRC_DIR}\n\n",
        uid = p.uid,
        gid = p.gid
    ));
    out.push_str("ENV KFORGE_IN_CONTAINER=1\n");
    out.push_str(&format!("USER {BUILDER_USER}\n"));
    out.push_str(&format!("WORKDIR {SRC_DIR}\n"));
    out.push_str(&format!(
        "ENTRYPOINT [\"/usr/bin/{BUILDER_BINARY}\", \"build\", \"--config\", \"{SRC_DIR}/{BUILDER_CONFIG}\"]\n"
    ));
    out
}

#[cfg(unix)]
fn effective_ids() -> (u32, u32) {
    // SAFETY: geteuid/getegid have no preconditions and cannot fail.
    unsafe { (libc::geteuid(), libc::getegid()) }
}

#[cfg(not(unix))]
fn effective_ids() -> (u32, u32) {
    (0, 0)
}

#[Task(
    id = "container.dockerfile",
    module = "container",
    phase = "render",
    provides = ["container:dockerfile"],
    after = ["container:context"],
    default_label = "Render Dockerfile"
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DockerfileTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for DockerfileTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl DockerfileTask {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let cfg = ContainerConfig::load(doc)?;
        let dir = ctx.scratch_dir()?;
        let patches = discover_patches(&dir)?
            .iter()
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .collect();
        let (uid, gid) = effective_ids();
        let params = DockerfileParams {
            base_image: cfg.base_image,
            packages: cfg.packages,
            patches,
            uid,
            gid,
        };
        let path = dir.join("Dockerfile");
        write_text(&path, &render(&params))?;
        ctx.log(&format!("wrote {} (uid={uid} gid={gid})", path.display()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_patches_identity_and_entrypoint() {
        let out = render(&DockerfileParams {
            base_image: "debian:bookworm".into(),
            packages: vec!["bc".into(), "flex".into()],
            patches: vec!["0001-a.patch".into(), "0002-b.patch".into()],
            uid: 1000,
            gid: 100,
        });
        assert!(out.starts_with("FROM debian:bookworm\n"));
        assert!(out.contains("apt-get install -y --no-install-recommends bc flex\n"));
        assert!(out.contains("COPY 0001-a.patch /usr/src/0001-a.patch\nCOPY 0002-b.patch /usr/src/0002-b.patch\n"));
        assert!(out.contains("echo 'builduser:x:1000:100:nobody:/:/bin/sh' >> /etc/passwd"));
        assert!(out.contains("chown -R 1000:100 /usr/src"));
        assert!(out.contains("ENV KFORGE_IN_CONTAINER=1\nUSER builduser\nWORKDIR /usr/src\n"));
        assert!(out.ends_with(
            "ENTRYPOINT [\"/usr/bin/kforge\", \"build\", \"--config\", \"/usr/src/kforge.toml\"]\n"
        ));
    }

    #[test]
    fn no_packages_means_no_install_step() {
        let out = render(&DockerfileParams {
            base_image: "kforge/base".into(),
            packages: vec![],
            patches: vec![],
            uid: 0,
            gid: 0,
        });
        assert!(!out.contains("apt-get"));
        assert!(!out.contains(".patch"));
    }
}
