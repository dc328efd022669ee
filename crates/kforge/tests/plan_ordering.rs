use kforge::config::ConfigDoc;
use kforge::modules::{Mode, build_plan};
use kforge::ErrorKind;

fn ordered_ids(doc: &ConfigDoc, mode: Mode) -> Vec<String> {
    build_plan(doc, mode)
        .expect("plan")
        .ordered()
        .expect("order")
        .iter()
        .map(|t| t.id.clone())
        .collect()
}

#[test]
fn builder_pipeline_order() {
    assert_eq!(
        ordered_ids(&ConfigDoc::empty(), Mode::Build),
        vec![
            "core.init",
            "kernel.fetch",
            "kernel.extract",
            "kernel.patch",
            "kernel.configure",
            "kernel.compile",
            "kernel.stage",
        ]
    );
}

#[test]
fn wrapper_pipeline_order() {
    assert_eq!(
        ordered_ids(&ConfigDoc::empty(), Mode::Rebuild),
        vec![
            "core.init",
            "container.detect",
            "container.context",
            "container.dockerfile",
            "container.image",
            "container.run",
            "container.collect",
            "container.repair",
        ]
    );
}

#[test]
fn every_step_is_planned_once() {
    let doc = ConfigDoc::empty();
    assert_eq!(build_plan(&doc, Mode::Build).expect("plan").len(), 7);
    assert_eq!(build_plan(&doc, Mode::Rebuild).expect("plan").len(), 8);
}

#[test]
fn step_labels_can_be_overridden() {
    let doc = ConfigDoc::from_toml_str("[kernel.steps.compile]\nlabel = \"bzImage + modules\"\n")
        .expect("parse");
    let plan = build_plan(&doc, Mode::Build).expect("plan");
    assert_eq!(
        plan.get("kernel.compile").map(|t| t.label.as_str()),
        Some("bzImage + modules")
    );
}

#[test]
fn disabling_a_step_is_a_config_error() {
    let doc = ConfigDoc::from_toml_str("[container.steps.repair]\nenabled = false\n").expect("parse");
    let err = build_plan(&doc, Mode::Rebuild).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);
    assert!(err.to_string().contains("container.steps.repair"), "unexpected err: {err}");
}

#[test]
fn unsupported_archive_suffix_fails_planning() {
    let doc = ConfigDoc::from_toml_str("[kernel]\nurl = \"https://example.org/linux-6.6.zip\"\n")
        .expect("parse");
    assert_eq!(
        build_plan(&doc, Mode::Build).unwrap_err().kind(),
        ErrorKind::Extract
    );
}
