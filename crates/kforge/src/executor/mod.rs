use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::io::{BufReader, Read};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex, mpsc};
use std::time::Instant;

use crate::config::ConfigDoc;
use crate::error::{Error, ErrorKind, Result};
use crate::log_sanitize::sanitize_log_line;
use crate::modules::container::runtime::ContainerRuntime;
use crate::planner::Plan;
use crate::workspace::{WorkspaceConfig, WorkspacePaths};

pub type TaskExecFn = fn(&ConfigDoc, &mut ExecCtx) -> Result<()>;

#[derive(Default)]
struct SharedExecState {
    workspace_paths: Mutex<Option<WorkspacePaths>>,
    // Ephemeral build context; removed from disk when the last ExecCtx clone drops.
    scratch: Mutex<Option<tempfile::TempDir>>,
    runtime: Mutex<Option<ContainerRuntime>>,
}

#[derive(Debug, Clone)]
pub enum ExecEvent {
    TaskStarted {
        id: String,
    },
    TaskLog {
        id: String,
        line: String,
    },
    TaskFinished {
        id: String,
        ok: bool,
        error: Option<String>,
        elapsed_ms: u128,
    },
    ExecutorDone {
        ok: bool,
        error: Option<String>,
    },
}

pub trait ExecSink: Send + Sync {
    fn emit(&self, ev: ExecEvent);
}

/// Prints events line by line and keeps the tail of each task's output so a
/// failure can be written to `build/error-logs/<timestamp>/<task>.log`.
#[derive(Default)]
pub struct StdoutSink {
    state: Mutex<StdoutSinkState>,
}

#[derive(Default)]
struct StdoutSinkState {
    started_at: Option<Instant>,
    tasks_started: usize,
    tasks_ok: usize,
    failed_tasks: Vec<String>,
    log_lines: usize,
    task_logs: BTreeMap<String, VecDeque<String>>,
    error_logs_dir: Option<PathBuf>,
    error_log_paths: Vec<PathBuf>,
}

const MAX_RETAINED_LINES: usize = 4000;

impl ExecSink for StdoutSink {
    fn emit(&self, ev: ExecEvent) {
        let Ok(mut s) = self.state.lock() else {
            return;
        };
        match ev {
            ExecEvent::TaskStarted { id } => {
                s.tasks_started += 1;
                s.started_at.get_or_insert_with(Instant::now);
                println!("RUN: {id}");
            }
            ExecEvent::TaskLog { id, line } => {
                s.log_lines += 1;
                let q = s.task_logs.entry(id.clone()).or_default();
                if q.len() >= MAX_RETAINED_LINES {
                    q.pop_front();
                }
                q.push_back(line.clone());
                println!("[{id}] {line}");
            }
            ExecEvent::TaskFinished {
                id,
                ok,
                error,
                elapsed_ms,
            } => {
                if ok {
                    s.tasks_ok += 1;
                    s.task_logs.remove(&id);
                    println!("DONE: {id} ({elapsed_ms}ms)");
                    return;
                }
                let err_text = error.unwrap_or_default();
                println!("FAIL: {id} ({elapsed_ms}ms) {err_text}");
                s.failed_tasks.push(id.clone());
                match write_task_error_log(&mut s, &id, &err_text, elapsed_ms) {
                    Ok(path) => println!("ERROR_LOG: {id} => {}", path.display()),
                    Err(e) => println!("WARN: failed to write task error log for {id}: {e}"),
                }
            }
            ExecEvent::ExecutorDone { ok, error } => {
                let wall = s.started_at.map(|t| t.elapsed()).unwrap_or_default();
                println!("SUMMARY:");
                println!("  status: {}", if ok { "ok" } else { "failed" });
                println!(
                    "  tasks: started={} ok={} failed={}",
                    s.tasks_started,
                    s.tasks_ok,
                    s.failed_tasks.len()
                );
                println!("  logs: {}", s.log_lines);
                println!("  elapsed: {}", format_elapsed_hms(wall.as_secs()));
                if !s.failed_tasks.is_empty() {
                    println!("  failed_tasks: {}", s.failed_tasks.join(", "));
                }
                for p in &s.error_log_paths {
                    println!("  error_log: {}", p.display());
                }
                if let Some(e) = error {
                    println!("  error: {e}");
                }
                *s = StdoutSinkState::default();
            }
        }
    }
}

#[derive(Clone)]
pub struct ExecCtx {
    pub dry_run: bool,
    pub sink: Arc<dyn ExecSink>,
    pub current_task_id: Option<String>,
    shared: Arc<SharedExecState>,
}

impl ExecCtx {
    pub fn new(dry_run: bool, sink: Arc<dyn ExecSink>) -> Self {
        Self {
            dry_run,
            sink,
            current_task_id: None,
            shared: Arc::new(SharedExecState::default()),
        }
    }

    pub fn set_task(&mut self, id: impl Into<String>) {
        self.current_task_id = Some(id.into());
    }

    pub fn set_workspace_paths(&self, paths: WorkspacePaths) {
        if let Ok(mut g) = self.shared.workspace_paths.lock() {
            *g = Some(paths);
        }
    }

    pub fn workspace_paths(&self) -> Option<WorkspacePaths> {
        self.shared
            .workspace_paths
            .lock()
            .ok()
            .and_then(|g| g.clone())
    }

    // Tasks may run without core.init (tests call them directly); cleaning is only
    // applied by core.init.
    pub fn workspace_paths_or_init(&self, doc: &ConfigDoc) -> Result<WorkspacePaths> {
        if let Some(p) = self.workspace_paths() {
            return Ok(p);
        }
        let ws: WorkspaceConfig = doc.deserialize_path("workspace")?.unwrap_or_default();
        let paths = crate::workspace::load_paths(&ws)?;
        self.set_workspace_paths(paths.clone());
        Ok(paths)
    }

    pub fn set_scratch(&self, dir: tempfile::TempDir) {
        if let Ok(mut g) = self.shared.scratch.lock() {
            *g = Some(dir);
        }
    }

    pub fn scratch_dir(&self) -> Result<PathBuf> {
        self.shared
            .scratch
            .lock()
            .ok()
            .and_then(|g| g.as_ref().map(|d| d.path().to_path_buf()))
            .ok_or_else(|| Error::msg("ephemeral build context has not been created"))
    }

    /// Remove the ephemeral build context now instead of when the context drops.
    pub fn discard_scratch(&self) {
        let dir = self.shared.scratch.lock().ok().and_then(|mut g| g.take());
        if let Some(dir) = dir {
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                tracing::warn!(path = %path.display(), "failed to remove build context: {e}");
            }
        }
    }

    pub fn set_runtime(&self, rt: ContainerRuntime) {
        if let Ok(mut g) = self.shared.runtime.lock() {
            *g = Some(rt);
        }
    }

    pub fn runtime(&self) -> Result<ContainerRuntime> {
        self.shared
            .runtime
            .lock()
            .ok()
            .and_then(|g| g.clone())
            .ok_or_else(|| Error::new(ErrorKind::RuntimeNotFound, "container runtime not detected"))
    }

    pub fn log(&self, msg: &str) {
        let id = self
            .current_task_id
            .clone()
            .unwrap_or_else(|| "<none>".into());
        self.sink.emit(ExecEvent::TaskLog {
            id,
            line: msg.to_string(),
        });
    }

    /// Run a child process with stdin closed, forwarding its output line by line.
    /// A non-zero exit becomes an error of `kind`.
    pub fn run_cmd(&self, cmd: Command, kind: ErrorKind) -> Result<()> {
        self.run_cmd_with_stdin(cmd, Stdio::null(), kind)
    }

    pub fn run_cmd_with_stdin(&self, mut cmd: Command, stdin: Stdio, kind: ErrorKind) -> Result<()> {
        let program = cmd.get_program().to_string_lossy().into_owned();
        let mut line = format!("SPAWN: {program}");
        for a in cmd.get_args() {
            line.push(' ');
            line.push_str(&a.to_string_lossy());
        }
        self.log(&line);
        tracing::debug!(dir = ?cmd.get_current_dir(), "spawning {program}");

        let mut child = cmd
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::new(kind, format!("failed to spawn `{program}`: {e}")))?;

        let (tx, rx) = mpsc::channel::<String>();
        if let Some(out) = child.stdout.take() {
            let tx = tx.clone();
            std::thread::spawn(move || read_output_stream(out, tx));
        }
        if let Some(err) = child.stderr.take() {
            let tx = tx.clone();
            std::thread::spawn(move || read_output_stream(err, tx));
        }
        drop(tx);

        for line in rx {
            let line = sanitize_log_line(&line);
            if !line.is_empty() {
                self.log(&line);
            }
        }

        let status = child
            .wait()
            .map_err(|e| Error::new(kind, format!("failed to wait for `{program}`: {e}")))?;
        if !status.success() {
            return Err(Error::new(kind, format!("`{program}` failed: {status}")));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct TaskRegistry {
    exec: BTreeMap<&'static str, TaskExecFn>,
}

impl TaskRegistry {
    pub fn add(&mut self, id: &'static str, f: TaskExecFn) -> Result<()> {
        if self.exec.contains_key(id) {
            return Err(Error::msg(format!("duplicate task executor for '{id}'")));
        }
        self.exec.insert(id, f);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<TaskExecFn> {
        self.exec.get(id).copied()
    }
}

pub trait ModuleExec {
    fn register_tasks(reg: &mut TaskRegistry) -> Result<()>;
}

/// Run every task in plan order, stopping at the first failure.
pub fn execute_plan(
    doc: &ConfigDoc,
    plan: &Plan,
    reg: &TaskRegistry,
    ctx: &mut ExecCtx,
) -> Result<()> {
    for task in plan.ordered()? {
        let Some(exec) = reg.get(&task.id) else {
            return Err(Error::msg(format!(
                "no executor registered for task '{}'",
                task.id
            )));
        };
        ctx.sink.emit(ExecEvent::TaskStarted {
            id: task.id.clone(),
        });
        ctx.set_task(task.id.clone());
        if ctx.dry_run {
            ctx.log(&format!(
                "DRY-RUN: {} ({}/{}) {}",
                task.id, task.module, task.phase, task.label
            ));
            ctx.sink.emit(ExecEvent::TaskFinished {
                id: task.id.clone(),
                ok: true,
                error: None,
                elapsed_ms: 0,
            });
            continue;
        }
        let start = Instant::now();
        let res = exec(doc, ctx);
        let elapsed_ms = start.elapsed().as_millis();
        match res {
            Ok(()) => ctx.sink.emit(ExecEvent::TaskFinished {
                id: task.id.clone(),
                ok: true,
                error: None,
                elapsed_ms,
            }),
            Err(e) => {
                ctx.sink.emit(ExecEvent::TaskFinished {
                    id: task.id.clone(),
                    ok: false,
                    error: Some(e.to_string()),
                    elapsed_ms,
                });
                let e = e.context(format!("task '{}' failed", task.id));
                ctx.sink.emit(ExecEvent::ExecutorDone {
                    ok: false,
                    error: Some(e.to_string()),
                });
                return Err(e);
            }
        }
    }
    ctx.sink.emit(ExecEvent::ExecutorDone {
        ok: true,
        error: None,
    });
    Ok(())
}

pub fn builtin_registry() -> Result<TaskRegistry> {
    let mut reg = TaskRegistry::default();
    reg.add("core.init", core_init)?;
    crate::modules::kernel::KernelModule::register_tasks(&mut reg)?;
    crate::modules::container::ContainerModule::register_tasks(&mut reg)?;
    Ok(reg)
}

fn core_init(doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
    let ws: WorkspaceConfig = doc.deserialize_path("workspace")?.unwrap_or_default();
    ctx.set_task("core.init");
    ctx.log(&format!("config = {}", doc.path.display()));
    ctx.log(&format!("workspace.root_dir = {}", ws.root_dir));
    ctx.log(&format!("workspace.build_dir = {}", ws.build_dir));
    if !ws.enabled {
        return Ok(());
    }

    let paths = crate::workspace::init_dirs(&ws)?;
    ctx.log(&format!("workspace.root = {}", paths.root.display()));
    ctx.log(&format!(
        "workspace.build_dir(abs) = {}",
        paths.build_dir.display()
    ));
    ctx.set_workspace_paths(paths);
    Ok(())
}

fn read_output_stream<R: Read>(reader: R, tx: mpsc::Sender<String>) {
    const MAX_PENDING_BYTES: usize = 16 * 1024;
    let mut r = BufReader::new(reader);
    let mut buf = [0u8; 8192];
    let mut pending = Vec::with_capacity(1024);

    let flush = |pending: &mut Vec<u8>| {
        if !pending.is_empty() {
            let _ = tx.send(String::from_utf8_lossy(pending).into_owned());
            pending.clear();
        }
    };

    loop {
        let n = match r.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        for &b in &buf[..n] {
            // `\r` splits progress-style output into separate lines.
            if b == b'\n' || b == b'\r' {
                flush(&mut pending);
            } else {
                pending.push(b);
                if pending.len() >= MAX_PENDING_BYTES {
                    flush(&mut pending);
                }
            }
        }
    }
    flush(&mut pending);
}

fn write_task_error_log(
    state: &mut StdoutSinkState,
    task_id: &str,
    error: &str,
    elapsed_ms: u128,
) -> Result<PathBuf> {
    let dir = match state.error_logs_dir.as_ref() {
        Some(d) => d.clone(),
        None => {
            let dir = std::env::current_dir()
                .unwrap_or_else(|_| PathBuf::from("."))
                .join("build")
                .join("error-logs")
                .join(chrono::Local::now().format("%Y%m%d-%H%M%S").to_string());
            fs::create_dir_all(&dir).map_err(|e| {
                Error::msg(format!(
                    "failed to create error logs dir {}: {e}",
                    dir.display()
                ))
            })?;
            state.error_logs_dir = Some(dir.clone());
            dir
        }
    };
    let path = dir.join(format!("{}.log", sanitize_filename_component(task_id)));

    let mut body = format!("task: {task_id}\nstatus: failed\nelapsed_ms: {elapsed_ms}\n");
    if !error.trim().is_empty() {
        body.push_str(&format!("error: {error}\n"));
    }
    body.push_str("\nlogs:\n");
    for line in state.task_logs.get(task_id).into_iter().flatten() {
        body.push_str(line);
        body.push('\n');
    }

    fs::write(&path, body).map_err(|e| {
        Error::msg(format!(
            "failed to write task error log {}: {e}",
            path.display()
        ))
    })?;
    state.error_log_paths.push(path.clone());
    Ok(path)
}

fn sanitize_filename_component(raw: &str) -> String {
    let out: String = raw
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '.' || ch == '_' || ch == '-' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if out.is_empty() { "task".into() } else { out }
}

fn format_elapsed_hms(total_secs: u64) -> String {
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Collects events for assertions.
    #[derive(Default)]
    pub(crate) struct MemorySink {
        pub events: Mutex<Vec<ExecEvent>>,
    }

    impl ExecSink for MemorySink {
        fn emit(&self, ev: ExecEvent) {
            if let Ok(mut g) = self.events.lock() {
                g.push(ev);
            }
        }
    }

    #[test]
    fn elapsed_is_formatted_as_hms() {
        assert_eq!(format_elapsed_hms(3725), "01:02:05");
    }

    #[test]
    fn task_ids_become_safe_file_names() {
        assert_eq!(sanitize_filename_component("kernel.patch"), "kernel.patch");
        assert_eq!(sanitize_filename_component("a/b c"), "a_b_c");
    }

    #[cfg(unix)]
    #[test]
    fn run_cmd_forwards_lines_and_maps_failure_kind() {
        let sink = Arc::new(MemorySink::default());
        let mut ctx = ExecCtx::new(false, sink.clone());
        ctx.set_task("t");

        let mut ok = Command::new("sh");
        ok.arg("-c").arg("echo one; echo two 1>&2");
        ctx.run_cmd(ok, ErrorKind::Build).expect("echo should succeed");

        let mut bad = Command::new("sh");
        bad.arg("-c").arg("exit 3");
        let err = ctx.run_cmd(bad, ErrorKind::Build).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Build);

        let lines: Vec<String> = sink
            .events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                ExecEvent::TaskLog { line, .. } => Some(line.clone()),
                _ => None,
            })
            .collect();
        assert!(lines.contains(&"one".to_string()));
        assert!(lines.contains(&"two".to_string()));
    }

    #[test]
    fn scratch_dir_is_removed_on_discard() {
        let ctx = ExecCtx::new(false, Arc::new(MemorySink::default()));
        assert!(ctx.scratch_dir().is_err());
        ctx.set_scratch(tempfile::tempdir().expect("tempdir"));
        let dir = ctx.scratch_dir().expect("scratch");
        assert!(dir.is_dir());
        ctx.discard_scratch();
        assert!(!dir.exists());
    }
}
