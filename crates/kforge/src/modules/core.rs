use crate::config::ConfigDoc;
use crate::error::{Error, ErrorKind, Result};
use crate::modules::Module;
use crate::planner::{Plan, Task};

/// Top-level tables the tool understands. Anything else is most likely a typo
/// and would otherwise be silently ignored.
const KNOWN_TABLES: &[&str] = &["workspace", "kernel", "patches", "container", "host"];

pub struct CoreModule;

impl Module for CoreModule {
    fn id(&self) -> &'static str {
        "core"
    }

    fn plan(&self, doc: &ConfigDoc, plan: &mut Plan) -> Result<()> {
        if let Some(root) = doc.value.as_table() {
            for key in root.keys() {
                if !KNOWN_TABLES.contains(&key.as_str()) {
                    return Err(Error::new(
                        ErrorKind::Config,
                        format!(
                            "unknown config table '{key}'; expected one of: {}",
                            KNOWN_TABLES.join(", ")
                        ),
                    ));
                }
            }
        }

        plan.add(Task {
            id: "core.init".into(),
            label: "Init".into(),
            module: self.id().into(),
            phase: "init".into(),
            after: vec![],
            provides: vec!["core:initialized".into()],
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_tables_are_rejected() {
        let doc = ConfigDoc::from_toml_str("[kernal]\nurl = \"x\"\n").expect("parse");
        let err = CoreModule.plan(&doc, &mut Plan::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
        assert!(err.to_string().contains("kernal"));
    }
}
