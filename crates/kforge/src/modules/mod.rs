use crate::config::ConfigDoc;
use crate::error::Result;
use crate::planner::Plan;

pub mod container;
pub mod core;
pub mod kernel;
pub mod util;

pub trait Module {
    fn id(&self) -> &'static str;
    fn plan(&self, doc: &ConfigDoc, plan: &mut Plan) -> Result<()>;
}

/// Module-level validation run once while planning, before any task is added.
pub trait ModuleConfig {
    fn validate(&self) -> Result<()> {
        Ok(())
    }
}

/// Which half of the tool a plan is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Compile the kernel in the current environment (normally the container).
    Build,
    /// Drive a container build from the host and install its output.
    Rebuild,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Build => "build",
            Mode::Rebuild => "rebuild",
        }
    }
}

pub fn modules_for(mode: Mode) -> Vec<Box<dyn Module>> {
    match mode {
        Mode::Build => vec![Box::new(core::CoreModule), Box::new(kernel::KernelModule)],
        Mode::Rebuild => vec![
            Box::new(core::CoreModule),
            Box::new(container::ContainerModule),
        ],
    }
}

pub fn build_plan(doc: &ConfigDoc, mode: Mode) -> Result<Plan> {
    let mut plan = Plan::default();
    for m in modules_for(mode) {
        tracing::debug!(module = m.id(), mode = mode.as_str(), "planning");
        m.plan(doc, &mut plan)?;
    }
    Ok(plan)
}

/// Set inside the container image; selects builder mode when no subcommand is given.
pub const IN_CONTAINER_ENV: &str = "KFORGE_IN_CONTAINER";

impl Mode {
    /// Builder mode when the variable is set to anything but empty or `0`.
    pub fn from_env_value(v: Option<&str>) -> Mode {
        match v.map(str::trim) {
            Some(s) if !s.is_empty() && s != "0" => Mode::Build,
            _ => Mode::Rebuild,
        }
    }

    pub fn from_env() -> Mode {
        Mode::from_env_value(std::env::var(IN_CONTAINER_ENV).ok().as_deref())
    }
}
