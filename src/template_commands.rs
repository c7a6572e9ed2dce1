use anyhow::{Result, bail};
use std::path::Path;
use tracing::info;

use crate::{scheduler::has_template_extension, template::Template};

/// Validate every template file in `path` (a file or a directory). Returns
/// the ids that loaded; fails when any file is invalid.
pub fn validate_templates(path: &Path) -> Result<Vec<String>> {
    if !path.exists() {
        bail!("Path does not exist: {}", path.display());
    }

    let files = if path.is_dir() {
        let mut files: Vec<_> = std::fs::read_dir(path)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && has_template_extension(p))
            .collect();
        files.sort();
        files
    } else {
        vec![path.to_path_buf()]
    };

    let mut ids = Vec::new();
    let mut failures = Vec::new();
    for file in files {
        match Template::load_from_file(&file) {
            Ok(template) => {
                info!("✅ {} ({})", template.id, file.display());
                ids.push(template.id);
            }
            Err(e) => failures.push(format!("{}: {e}", file.display())),
        }
    }

    if !failures.is_empty() {
        bail!("{} invalid template(s):\n{}", failures.len(), failures.join("\n"));
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn reports_valid_and_invalid_files() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("a.json"),
            r#"{ "id": "a", "execution": { "type": "api_text", "url": "https://a.example/" } }"#,
        )
        .unwrap();
        assert_eq!(validate_templates(dir.path()).unwrap(), vec!["a".to_string()]);

        fs::write(dir.path().join("b.yaml"), "id: b\nexecution:\n  type: chain\n").unwrap();
        let err = validate_templates(dir.path()).unwrap_err().to_string();
        assert!(err.contains("b.yaml"));
    }
}
