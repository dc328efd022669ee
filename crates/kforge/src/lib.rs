//! Reproducible kernel builds, natively or inside a throwaway container.
//!
//! `kforge build` fetches a kernel source archive, applies `*.patch` files,
//! merges a config overlay onto the defconfig, compiles the boot image and
//! modules and stages them in a result directory. `kforge rebuild` runs that
//! same binary inside a podman/docker container and installs what it produced
//! on the host.

use std::sync::Arc;

pub mod config;
pub mod error;
pub mod executor;
pub mod log_sanitize;
pub mod modules;
pub mod planner;
pub mod workspace;

pub use error::{Error, ErrorKind, Result};
pub use modules::Mode;

use crate::config::ConfigDoc;
use crate::executor::{ExecCtx, ExecSink};

/// Plan and run every task for `mode`.
///
/// The rebuild context directory is removed before returning, whether or not
/// the run succeeded.
pub fn execute(doc: &ConfigDoc, mode: Mode, dry_run: bool, sink: Arc<dyn ExecSink>) -> Result<()> {
    let plan = modules::build_plan(doc, mode)?;
    let reg = executor::builtin_registry()?;
    let mut ctx = ExecCtx::new(dry_run, sink);
    let res = executor::execute_plan(doc, &plan, &reg, &mut ctx);
    ctx.discard_scratch();
    res
}
