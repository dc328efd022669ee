use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use kforge::config::ConfigDoc;
use kforge::{Mode, Result};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Build definition TOML (default: ./kforge.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Print the tasks that would run without executing them
    #[arg(long, global = true)]
    dry_run: bool,
    /// Container runtime to use instead of probing podman/docker on PATH
    #[arg(long, global = true, value_name = "EXE")]
    overwrite_container_executable: Option<String>,
    #[command(subcommand)]
    cmd: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Fetch, patch, configure, compile and stage a kernel here
    Build,
    /// Build the kernel in a container and install it on the host
    Rebuild,
    /// Print the ordered task plan
    Plan {
        #[arg(value_enum, default_value_t = PlanMode::Rebuild)]
        mode: PlanMode,
    },
    /// Print the fully-resolved TOML (after imports/extends)
    Resolve,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PlanMode {
    Build,
    Rebuild,
}

impl From<PlanMode> for Mode {
    fn from(m: PlanMode) -> Self {
        match m {
            PlanMode::Build => Mode::Build,
            PlanMode::Rebuild => Mode::Rebuild,
        }
    }
}

fn main() -> ExitCode {
    init_tracing();
    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error[{}]: {e}", e.kind());
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("KFORGE_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn run(args: Args) -> Result<()> {
    let mut doc = kforge::config::load_or_default(args.config.as_deref())?;
    if let Some(exe) = args.overwrite_container_executable.as_deref() {
        doc.set_path("container.executable", toml::Value::String(exe.to_string()))?;
    }

    match args.cmd {
        Some(Command::Build) => cmd_run(&doc, Mode::Build, args.dry_run),
        Some(Command::Rebuild) => cmd_run(&doc, Mode::Rebuild, args.dry_run),
        Some(Command::Plan { mode }) => cmd_plan(&doc, mode.into()),
        Some(Command::Resolve) => cmd_resolve(&doc),
        None => {
            let mode = Mode::from_env();
            tracing::info!(mode = mode.as_str(), "no subcommand given, selected from environment");
            cmd_run(&doc, mode, args.dry_run)
        }
    }
}

fn cmd_plan(doc: &ConfigDoc, mode: Mode) -> Result<()> {
    let plan = kforge::modules::build_plan(doc, mode)?;
    println!("{} plan ({} tasks)", mode.as_str(), plan.len());
    for (i, task) in plan.ordered()?.iter().enumerate() {
        println!(
            "{:>2}. {:<22}  {:<10} {:<10}  {}",
            i + 1,
            task.id,
            task.module,
            task.phase,
            task.label
        );
    }
    Ok(())
}

fn cmd_resolve(doc: &ConfigDoc) -> Result<()> {
    print!("{}", doc.to_toml_string()?);
    Ok(())
}

fn cmd_run(doc: &ConfigDoc, mode: Mode, dry_run: bool) -> Result<()> {
    tracing::debug!(config = %doc.path.display(), mode = mode.as_str(), dry_run, "starting");
    let sink = Arc::new(kforge::executor::StdoutSink::default());
    kforge::execute(doc, mode, dry_run, sink)
}
