#![cfg(unix)]

mod common;

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;

use common::{RecordingSink, make_source_archive, write_script};
use kforge::config::ConfigDoc;
use kforge::{ErrorKind, Mode};

/// Stands in for kbuild: honours the targets kforge drives and records the
/// identity environment it was given.
const FAKE_MAKE: &str = r#"set -e
install=""
dest=""
for a in "$@"; do
  case "$a" in
    defconfig) printf 'CONFIG_64BIT=y\nCONFIG_WERROR=y\n' > .config ;;
    olddefconfig) : ;;
    bzImage)
      mkdir -p arch/x86/boot
      printf 'bzImage-bytes' > arch/x86/boot/bzImage
      chmod 0751 arch/x86/boot/bzImage
      env | grep '^KBUILD_BUILD_' | sort > kbuild.env
      ;;
    modules_install) install=1 ;;
    INSTALL_MOD_PATH=*) dest="${a#INSTALL_MOD_PATH=}" ;;
  esac
done
if [ -n "$install" ]; then
  mkdir -p "$dest/lib/modules/6.6.0-kforge/kernel"
  printf 'ko' > "$dest/lib/modules/6.6.0-kforge/kernel/demo.ko"
fi
"#;

/// Appends each patch body to `applied.log`; refuses bodies containing BAD.
const FAKE_PATCH: &str = r#"body="$(cat)"
case "$body" in
  *BAD*) echo "1 out of 1 hunk FAILED" >&2; exit 1 ;;
esac
printf '%s\n' "$body" >> applied.log
"#;

fn builder_doc(tmp: &Path) -> ConfigDoc {
    let archive = make_source_archive(&tmp.join("mirror"), "linux-6.6");
    let make = write_script(&tmp.join("fake-make"), FAKE_MAKE);
    let patch = write_script(&tmp.join("fake-patch"), FAKE_PATCH);
    let raw = format!(
        r#"
[workspace]
root_dir = "{ws}"
build_dir = "build"

[kernel]
url = "file://{archive}"
result_dir = "{result}"
jobs = 2
builtin_overlay = false
make_program = "{make}"
patch_program = "{patch}"

[kernel.identity]
user = "ci"
host = "builder-01"
timestamp = "Thu Jan  1 00:00:00 UTC 1970"

[kernel.overlay]
CONFIG_IPV6 = "y"
CONFIG_WERROR = "n"
"#,
        ws = tmp.join("ws").display(),
        archive = archive.display(),
        result = tmp.join("result").display(),
        make = make.display(),
        patch = patch.display(),
    );
    fs::create_dir_all(tmp.join("ws")).expect("mkdir ws");
    ConfigDoc::from_toml_str(&raw).expect("parse config")
}

#[test]
fn builds_and_stages_a_kernel() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let doc = builder_doc(tmp.path());
    fs::write(tmp.path().join("ws/0001-first.patch"), "first\n").expect("write patch");

    let sink = Arc::new(RecordingSink::default());
    kforge::execute(&doc, Mode::Build, false, sink.clone()).expect("build");

    assert!(sink.finished().iter().all(|(_, ok)| *ok));
    assert_eq!(
        sink.finished().last().map(|(id, _)| id.as_str()),
        Some("kernel.stage")
    );

    let src = tmp.path().join("ws/build/linux-6.6");
    let config = fs::read_to_string(src.join(".config")).expect("read .config");
    assert!(config.lines().any(|l| l == "CONFIG_IPV6=y"));
    let last_werror = config
        .lines()
        .filter(|l| l.starts_with("CONFIG_WERROR="))
        .last();
    assert_eq!(last_werror, Some("CONFIG_WERROR=n"));

    assert_eq!(
        fs::read_to_string(src.join("applied.log")).expect("applied"),
        "first\n"
    );

    let env = fs::read_to_string(src.join("kbuild.env")).expect("kbuild env");
    assert!(env.contains("KBUILD_BUILD_USER=ci\n"));
    assert!(env.contains("KBUILD_BUILD_HOST=builder-01\n"));
    assert!(env.contains("KBUILD_BUILD_TIMESTAMP=Thu Jan  1 00:00:00 UTC 1970\n"));

    let result = tmp.path().join("result");
    let vmlinuz = result.join("vmlinuz");
    assert_eq!(fs::read(&vmlinuz).expect("vmlinuz"), b"bzImage-bytes");
    assert_eq!(
        fs::metadata(&vmlinuz).expect("meta").permissions().mode() & 0o777,
        0o751
    );
    assert!(result.join("lib/modules/6.6.0-kforge/kernel/demo.ko").is_file());

    let info: serde_json::Value = serde_json::from_str(
        &fs::read_to_string(result.join("build-info.json")).expect("build-info"),
    )
    .expect("json");
    assert_eq!(info["image"], "vmlinuz");
    assert_eq!(info["overlay_entries"], 2);
    assert_eq!(info["patches"], serde_json::json!(["0001-first.patch"]));
    assert_eq!(info["identity"]["KBUILD_BUILD_USER"], "ci");
}

#[test]
fn patch_failure_halts_before_configure() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let doc = builder_doc(tmp.path());
    let ws = tmp.path().join("ws");
    fs::write(ws.join("0001-good.patch"), "good\n").expect("write");
    fs::write(ws.join("0002-bad.patch"), "BAD\n").expect("write");
    fs::write(ws.join("0003-later.patch"), "later\n").expect("write");

    let sink = Arc::new(RecordingSink::default());
    let err = kforge::execute(&doc, Mode::Build, false, sink.clone()).unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Patch);
    assert!(err.to_string().contains("0002-bad.patch"), "unexpected err: {err}");
    assert_eq!(
        sink.finished().last(),
        Some(&("kernel.patch".to_string(), false))
    );
    assert!(!sink.finished().iter().any(|(id, _)| id == "kernel.configure"));

    let src = tmp.path().join("ws/build/linux-6.6");
    assert_eq!(
        fs::read_to_string(src.join("applied.log")).expect("applied"),
        "good\n"
    );
    assert!(!src.join(".config").exists());
    assert!(!tmp.path().join("result/vmlinuz").exists());
}

#[test]
fn modules_can_be_skipped() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let mut doc = builder_doc(tmp.path());
    doc.set_path("kernel.modules", toml::Value::Boolean(false))
        .expect("set");

    let sink = Arc::new(RecordingSink::default());
    kforge::execute(&doc, Mode::Build, false, sink).expect("build");

    let result = tmp.path().join("result");
    assert!(result.join("vmlinuz").is_file());
    assert!(!result.join("lib").exists());
}

#[test]
fn dry_run_touches_nothing() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let doc = builder_doc(tmp.path());

    let sink = Arc::new(RecordingSink::default());
    kforge::execute(&doc, Mode::Build, true, sink).expect("dry run");

    assert!(!tmp.path().join("ws/build").exists());
    assert!(!tmp.path().join("result").exists());
}
