use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use serde::Deserialize;

use kforge_macros::Task;

use crate::config::ConfigDoc;
use crate::error::{Error, ErrorKind, Result};
use crate::executor::ExecCtx;
use crate::modules::kernel::KernelConfig;
use crate::modules::util::{ensure_dir, remove_path_if_exists};

fn default_true() -> bool {
    true
}

#[Task(
    id = "kernel.fetch",
    module = "kernel",
    phase = "fetch",
    provides = ["kernel:archive"],
    after = ["core.init"],
    default_label = "Download kernel source"
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetchTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for FetchTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl FetchTask {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let ws = ctx.workspace_paths_or_init(doc)?;
        let kernel = KernelConfig::load(doc)?;
        let archive = kernel.archive_path(&ws)?;

        ctx.log(&format!("kernel.url = {}", kernel.url));
        if kernel.reuse_archive && archive.is_file() {
            ctx.log(&format!("reusing existing archive {}", archive.display()));
            return Ok(());
        }
        let bytes = fetch(&kernel.url, &archive)?;
        ctx.log(&format!("downloaded {} ({bytes} bytes)", archive.display()));
        Ok(())
    }
}

/// Download `url` to `dest`. `file://` URLs and bare paths are copied.
///
/// The body is written to `<dest>.part` and renamed on success, so an
/// interrupted transfer never looks like a complete archive.
pub fn fetch(url: &str, dest: &Path) -> Result<u64> {
    let download_err = |msg: String| Error::new(ErrorKind::Download, msg);

    if let Some(parent) = dest.parent() {
        ensure_dir(parent)?;
    }
    let part = part_path(dest);

    let written = match local_source(url) {
        Some(src) => fs::copy(&src, &part).map_err(|e| {
            download_err(format!("failed to copy {} -> {}: {e}", src.display(), part.display()))
        })?,
        None => {
            let client = reqwest::blocking::Client::builder()
                .connect_timeout(Duration::from_secs(30))
                .build()
                .map_err(|e| download_err(format!("failed to build HTTP client: {e}")))?;
            let mut res = client
                .get(url)
                .send()
                .map_err(|e| download_err(format!("GET {url} failed: {e}")))?;
            if !res.status().is_success() {
                return Err(download_err(format!(
                    "unexpected HTTP status for {url}: {}",
                    res.status()
                )));
            }
            let mut out = fs::File::create(&part).map_err(|e| {
                download_err(format!("failed to create {}: {e}", part.display()))
            })?;
            let n = res.copy_to(&mut out).map_err(|e| {
                let _ = fs::remove_file(&part);
                download_err(format!("failed to read body of {url}: {e}"))
            })?;
            out.sync_all()
                .map_err(|e| download_err(format!("failed to sync {}: {e}", part.display())))?;
            n
        }
    };

    fs::rename(&part, dest).map_err(|e| {
        download_err(format!(
            "failed to move {} into place: {e}",
            part.display()
        ))
    })?;
    Ok(written)
}

fn local_source(url: &str) -> Option<PathBuf> {
    if let Some(rest) = url.strip_prefix("file://") {
        return Some(PathBuf::from(rest));
    }
    if url.contains("://") {
        None
    } else {
        Some(PathBuf::from(url))
    }
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    dest.with_file_name(name)
}

#[Task(
    id = "kernel.extract",
    module = "kernel",
    phase = "extract",
    provides = ["kernel:source"],
    after = ["kernel:archive"],
    default_label = "Unpack kernel source"
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExtractTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for ExtractTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl ExtractTask {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let ws = ctx.workspace_paths_or_init(doc)?;
        let kernel = KernelConfig::load(doc)?;
        let archive = kernel.archive_path(&ws)?;
        let src_dir = kernel.source_dir(&ws)?;
        extract(ctx, &archive, &src_dir)?;
        ctx.log(&format!("kernel source at {}", src_dir.display()));
        Ok(())
    }
}

/// Unpack `archive` next to itself and check that it produced `src_dir`.
/// A previous `src_dir` is removed first.
pub fn extract(ctx: &ExecCtx, archive: &Path, src_dir: &Path) -> Result<()> {
    if !archive.is_file() {
        return Err(Error::new(
            ErrorKind::Extract,
            format!("archive not found: {}", archive.display()),
        ));
    }
    if remove_path_if_exists(src_dir)
        .map_err(|e| Error::new(ErrorKind::Extract, e.to_string()))?
    {
        ctx.log(&format!("removed previous tree {}", src_dir.display()));
    }

    let dir = archive.parent().unwrap_or_else(|| Path::new("."));
    let mut cmd = Command::new("tar");
    cmd.current_dir(dir).arg("xf").arg(archive);
    ctx.run_cmd(cmd, ErrorKind::Extract)?;

    if !src_dir.is_dir() {
        return Err(Error::new(
            ErrorKind::Extract,
            format!(
                "{} did not unpack into {}",
                archive.display(),
                src_dir.display()
            ),
        ));
    }
    Ok(())
}
