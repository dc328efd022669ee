#![cfg(unix)]

mod common;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use common::{RecordingSink, write_script};
use kforge::config::ConfigDoc;
use kforge::{ErrorKind, Mode};

/// Plays both halves of a container runtime: `build` checks the context and
/// keeps a copy of it in `kept`, `run` writes what the in-container builder
/// would leave in the mount.
fn fake_podman(dir: &Path, calls: &Path, kept: &Path) -> PathBuf {
    fs::create_dir_all(dir).expect("mkdir bin");
    let body = format!(
        r#"echo "$@" >> "{calls}"
case "$1" in
  build)
    for f in Dockerfile kforge kforge.toml kforge-overlay.config; do
      test -f "$f" || {{ echo "missing $f" >&2; exit 3; }}
    done
    rm -rf "{kept}"
    cp -R . "{kept}"
    ;;
  run)
    for a in "$@"; do
      case "$a" in *:/tmp/buildresult:Z) vol="${{a%%:*}}" ;; esac
    done
    rel="$vol/lib/modules/6.6.58-kforge"
    mkdir -p "$rel/kernel/net"
    printf 'new-kernel' > "$vol/vmlinuz"
    printf 'ko' > "$rel/kernel/net/wg.ko"
    ln -s /usr/src/linux-6.6.58 "$rel/build"
    ln -s /usr/src/linux-6.6.58 "$rel/source"
    ;;
esac
"#,
        calls = calls.display(),
        kept = kept.display()
    );
    write_script(&dir.join("podman"), &body)
}

/// Writes a placeholder binary where `cargo build --target-dir D --target T -p P`
/// would put it.
const FAKE_CARGO: &str = r#"while [ $# -gt 0 ]; do
  case "$1" in
    --target) target="$2"; shift ;;
    --target-dir) dir="$2"; shift ;;
    -p) pkg="$2"; shift ;;
  esac
  shift
done
mkdir -p "$dir/$target/release"
printf 'static-builder' > "$dir/$target/release/$pkg"
chmod 0755 "$dir/$target/release/$pkg"
"#;

struct Host {
    tmp: tempfile::TempDir,
    calls: PathBuf,
    kept: PathBuf,
    doc: ConfigDoc,
}

impl Host {
    fn new() -> Self {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path();
        let calls = root.join("calls.log");
        let kept = root.join("kept-context");
        let podman = fake_podman(&root.join("bin"), &calls, &kept);
        let cargo = write_script(&root.join("bin/cargo"), FAKE_CARGO);

        fs::create_dir_all(root.join("ws")).expect("mkdir ws");
        fs::create_dir_all(root.join("scratch")).expect("mkdir scratch");
        fs::create_dir_all(root.join("patches")).expect("mkdir patches");
        fs::write(root.join("patches/0001-wg.patch"), "diff\n").expect("write patch");
        fs::create_dir_all(root.join("host/boot")).expect("mkdir boot");
        fs::write(root.join("host/boot/vmlinuz"), "old-kernel").expect("write kernel");
        fs::create_dir_all(root.join("host/lib/modules/6.1.0-old")).expect("mkdir modules");
        fs::write(root.join("host/lib/modules/6.1.0-old/stale.ko"), "").expect("write ko");

        let raw = format!(
            r#"
[workspace]
root_dir = "{ws}"

[container]
executable = "{podman}"
scratch_parent = "{scratch}"
cargo_program = "{cargo}"

[patches]
files = ["0001-wg.patch"]
fallback_dir = "{patches}"

[host]
kernel = "{kernel}"
lib = "{lib}"

[kernel.overlay]
CONFIG_WIREGUARD = "m"
"#,
            ws = root.join("ws").display(),
            podman = podman.display(),
            cargo = cargo.display(),
            scratch = root.join("scratch").display(),
            patches = root.join("patches").display(),
            kernel = root.join("host/boot/vmlinuz").display(),
            lib = root.join("host/lib").display(),
        );
        let doc = ConfigDoc::from_toml_str(&raw).expect("parse config");
        Self {
            tmp,
            calls,
            kept,
            doc,
        }
    }

    fn path(&self, rel: &str) -> PathBuf {
        self.tmp.path().join(rel)
    }

    fn scratch_entries(&self) -> usize {
        fs::read_dir(self.path("scratch")).expect("read scratch").count()
    }
}

#[test]
fn rebuild_installs_kernel_and_modules() {
    let host = Host::new();
    let sink = Arc::new(RecordingSink::default());
    kforge::execute(&host.doc, Mode::Rebuild, false, sink.clone()).expect("rebuild");

    assert_eq!(
        fs::read_to_string(host.path("host/boot/vmlinuz")).expect("kernel"),
        "new-kernel"
    );
    let rel = host.path("host/lib/modules/6.6.58-kforge");
    assert!(rel.join("kernel/net/wg.ko").is_file());
    assert!(fs::symlink_metadata(rel.join("build")).is_err());
    assert!(fs::symlink_metadata(rel.join("source")).is_err());
    assert!(!host.path("host/lib/modules/6.1.0-old").exists());

    let calls = fs::read_to_string(&host.calls).expect("calls");
    let calls: Vec<&str> = calls.lines().collect();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0], "build --rm=true --tag=kforge-rebuild .");
    assert!(calls[1].starts_with("run --userns=keep-id --rm --volume "));
    assert!(calls[1].ends_with(":/tmp/buildresult:Z kforge-rebuild"));

    assert_eq!(host.scratch_entries(), 0, "build context was not removed");
    assert_eq!(
        sink.finished().last(),
        Some(&("container.repair".to_string(), true))
    );
}

#[test]
fn context_carries_patches_and_merged_overlay() {
    let host = Host::new();
    let sink = Arc::new(RecordingSink::default());
    kforge::execute(&host.doc, Mode::Rebuild, false, sink).expect("rebuild");

    let ctx = &host.kept;
    assert_eq!(
        fs::read_to_string(ctx.join("0001-wg.patch")).expect("staged patch"),
        "diff\n"
    );
    assert_eq!(
        fs::read_to_string(ctx.join("kforge")).expect("builder"),
        "static-builder"
    );

    let dockerfile = fs::read_to_string(ctx.join("Dockerfile")).expect("Dockerfile");
    assert!(
        dockerfile.contains("COPY 0001-wg.patch /usr/src/0001-wg.patch\n"),
        "{dockerfile}"
    );
    assert!(dockerfile.contains("COPY kforge-overlay.config /usr/src/kforge-overlay.config\n"));

    let overlay = fs::read_to_string(ctx.join("kforge-overlay.config")).expect("overlay");
    assert!(overlay.lines().any(|l| l == "CONFIG_WIREGUARD=m"), "{overlay}");

    let builder_cfg = ConfigDoc::from_toml_str(
        &fs::read_to_string(ctx.join("kforge.toml")).expect("builder config"),
    )
    .expect("parse builder config");
    assert!(builder_cfg.value_path("host").is_none());
    assert_eq!(
        builder_cfg
            .value_path("kernel.result_dir")
            .and_then(toml::Value::as_str),
        Some("/tmp/buildresult")
    );
}

#[test]
fn failed_image_build_cleans_up_and_leaves_host_alone() {
    let host = Host::new();
    let mut doc = host.doc.clone();
    let stop = write_script(&host.path("bin/stop"), "exit 7\n");
    doc.set_path(
        "container.executable",
        toml::Value::String(stop.display().to_string()),
    )
    .expect("set");

    let sink = Arc::new(RecordingSink::default());
    let err = kforge::execute(&doc, Mode::Rebuild, false, sink.clone()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ContainerBuild);
    assert_eq!(
        sink.finished().last(),
        Some(&("container.image".to_string(), false))
    );
    assert_eq!(host.scratch_entries(), 0);
    assert_eq!(
        fs::read_to_string(host.path("host/boot/vmlinuz")).expect("kernel"),
        "old-kernel"
    );
    assert!(host.path("host/lib/modules/6.1.0-old/stale.ko").is_file());
}

#[test]
fn missing_runtime_stops_before_any_side_effect() {
    let host = Host::new();
    let mut doc = host.doc.clone();
    if let Some(container) = doc
        .value
        .get_mut("container")
        .and_then(toml::Value::as_table_mut)
    {
        container.remove("executable");
    }
    doc.set_path(
        "container.choices",
        toml::Value::Array(vec![toml::Value::String("kforge-no-such-runtime".into())]),
    )
    .expect("set");

    let sink = Arc::new(RecordingSink::default());
    let err = kforge::execute(&doc, Mode::Rebuild, false, sink).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RuntimeNotFound);
    assert_eq!(host.scratch_entries(), 0);
    assert!(!host.calls.exists());
}

#[test]
fn missing_host_kernel_is_reported_before_staging() {
    let host = Host::new();
    let mut doc = host.doc.clone();
    doc.set_path(
        "host.kernel",
        toml::Value::String(host.path("host/boot/nope").display().to_string()),
    )
    .expect("set");

    let sink = Arc::new(RecordingSink::default());
    let err = kforge::execute(&doc, Mode::Rebuild, false, sink).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FileNotFound);
    assert_eq!(host.scratch_entries(), 0);
    assert!(!host.calls.exists());
}
