// src/schema.rs

use std::{fs, path::Path};

use anyhow::Error;
use schemars::schema_for;

use crate::{settings::Settings, template::Template};

pub const TEMPLATE_SCHEMA_FILE: &str = "template.schema.json";
pub const SETTINGS_SCHEMA_FILE: &str = "settings.schema.json";

/// Write JSON schemas for template definitions and the settings file into
/// `out_dir`.
pub fn write_schema(out_dir: &Path) -> Result<(), Error> {
    fs::create_dir_all(out_dir)?;

    let template_schema = schema_for!(Template);
    fs::write(
        out_dir.join(TEMPLATE_SCHEMA_FILE),
        serde_json::to_string_pretty(&template_schema)?,
    )?;

    let settings_schema = schema_for!(Settings);
    fs::write(
        out_dir.join(SETTINGS_SCHEMA_FILE),
        serde_json::to_string_pretty(&settings_schema)?,
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use tempfile::TempDir;

    #[test]
    fn writes_both_schemas() {
        let dir = TempDir::new().unwrap();
        write_schema(dir.path()).unwrap();

        let template: Value = serde_json::from_str(
            &fs::read_to_string(dir.path().join(TEMPLATE_SCHEMA_FILE)).unwrap(),
        )
        .unwrap();
        assert_eq!(template["title"], "Template");
        assert!(template["properties"]["execution"].is_object());

        let settings: Value = serde_json::from_str(
            &fs::read_to_string(dir.path().join(SETTINGS_SCHEMA_FILE)).unwrap(),
        )
        .unwrap();
        assert!(settings["properties"]["plugin_instances"].is_object());
    }
}
