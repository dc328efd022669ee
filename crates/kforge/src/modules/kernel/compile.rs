use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use kforge_macros::Task;

use crate::config::ConfigDoc;
use crate::error::{ErrorKind, Result};
use crate::executor::ExecCtx;
use crate::modules::kernel::{IdentityConfig, KernelConfig, make_cmd};

fn default_true() -> bool {
    true
}

/// `date`-style UTC timestamp, as kbuild prints it in `uname -v`.
const TIMESTAMP_FORMAT: &str = "%a %b %e %H:%M:%S UTC %Y";

#[Task(
    id = "kernel.compile",
    module = "kernel",
    phase = "compile",
    provides = ["kernel:image"],
    after = ["kernel:config"],
    default_label = "Compile kernel"
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CompileTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for CompileTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl CompileTask {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let ws = ctx.workspace_paths_or_init(doc)?;
        let kernel = KernelConfig::load(doc)?;
        let src_dir = kernel.source_dir(&ws)?;
        compile(ctx, &kernel, &src_dir, effective_jobs(kernel.jobs))
    }
}

pub fn effective_jobs(configured: usize) -> usize {
    if configured > 0 {
        configured
    } else {
        num_cpus::get().max(1)
    }
}

/// The three `KBUILD_BUILD_*` variables for this build.
pub fn identity_env(identity: &IdentityConfig) -> [(&'static str, String); 3] {
    let epoch = std::env::var("SOURCE_DATE_EPOCH").ok();
    [
        ("KBUILD_BUILD_USER", identity.user.clone()),
        ("KBUILD_BUILD_HOST", identity.host.clone()),
        (
            "KBUILD_BUILD_TIMESTAMP",
            resolve_timestamp(identity.timestamp.as_deref(), epoch.as_deref(), Utc::now()),
        ),
    ]
}

/// Configured value, else `SOURCE_DATE_EPOCH`, else `now`.
pub fn resolve_timestamp(
    configured: Option<&str>,
    source_date_epoch: Option<&str>,
    now: DateTime<Utc>,
) -> String {
    if let Some(ts) = configured.map(str::trim).filter(|s| !s.is_empty()) {
        return ts.to_string();
    }
    let at = source_date_epoch
        .and_then(|s| s.trim().parse::<i64>().ok())
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .unwrap_or(now);
    at.format(TIMESTAMP_FORMAT).to_string()
}

/// `make <image> [modules] -j<jobs>` with the build identity in the environment.
pub fn compile(ctx: &ExecCtx, kernel: &KernelConfig, src_dir: &Path, jobs: usize) -> Result<()> {
    let mut cmd = make_cmd(kernel, src_dir);
    cmd.arg(&kernel.image_target);
    if kernel.modules {
        cmd.arg("modules");
    }
    cmd.arg(format!("-j{jobs}"));
    for (k, v) in identity_env(&kernel.identity) {
        ctx.log(&format!("{k}={v}"));
        cmd.env(k, v);
    }
    ctx.run_cmd(cmd, ErrorKind::Build)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).expect("ts")
    }

    #[test]
    fn configured_timestamp_wins() {
        assert_eq!(
            resolve_timestamp(Some("Thu Jan  1 00:00:00 UTC 1970"), Some("5"), now()),
            "Thu Jan  1 00:00:00 UTC 1970"
        );
    }

    #[test]
    fn source_date_epoch_is_formatted_like_date() {
        assert_eq!(
            resolve_timestamp(None, Some("86400"), now()),
            "Fri Jan  2 00:00:00 UTC 1970"
        );
    }

    #[test]
    fn falls_back_to_now() {
        assert_eq!(
            resolve_timestamp(Some("  "), Some("not-a-number"), now()),
            "Tue Nov 14 22:13:20 UTC 2023"
        );
    }

    #[test]
    fn zero_jobs_means_cpu_count() {
        assert_eq!(effective_jobs(3), 3);
        assert!(effective_jobs(0) >= 1);
    }
}
