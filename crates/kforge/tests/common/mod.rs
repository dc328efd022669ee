#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use kforge::executor::{ExecEvent, ExecSink};

/// Keeps every event so tests can inspect task output.
#[derive(Default)]
pub struct RecordingSink {
    pub events: Mutex<Vec<ExecEvent>>,
}

impl ExecSink for RecordingSink {
    fn emit(&self, ev: ExecEvent) {
        if let Ok(mut g) = self.events.lock() {
            g.push(ev);
        }
    }
}

impl RecordingSink {
    pub fn finished(&self) -> Vec<(String, bool)> {
        self.events
            .lock()
            .expect("lock")
            .iter()
            .filter_map(|e| match e {
                ExecEvent::TaskFinished { id, ok, .. } => Some((id.clone(), *ok)),
                _ => None,
            })
            .collect()
    }

    pub fn log_lines(&self, task: &str) -> Vec<String> {
        self.events
            .lock()
            .expect("lock")
            .iter()
            .filter_map(|e| match e {
                ExecEvent::TaskLog { id, line } if id == task => Some(line.clone()),
                _ => None,
            })
            .collect()
    }
}

#[cfg(unix)]
pub fn write_script(path: &Path, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    fs::write(path, format!("#!/bin/sh\n{body}")).expect("write script");
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).expect("chmod script");
    path.to_path_buf()
}

/// Packs `<dir>/<name>/` (with a placeholder Makefile) into `<dir>/<name>.tar.gz`.
#[cfg(unix)]
pub fn make_source_archive(dir: &Path, name: &str) -> PathBuf {
    let tree = dir.join(name);
    fs::create_dir_all(&tree).expect("mkdir tree");
    fs::write(tree.join("Makefile"), "# placeholder\n").expect("write Makefile");
    let archive = dir.join(format!("{name}.tar.gz"));
    let status = std::process::Command::new("tar")
        .current_dir(dir)
        .arg("czf")
        .arg(&archive)
        .arg(name)
        .status()
        .expect("run tar");
    assert!(status.success(), "tar failed");
    fs::remove_dir_all(&tree).expect("remove tree");
    archive
}
