use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use regex::Regex;
use serde::Serialize;

/// One `uses:` entry from a workflow definition file.
#[derive(Debug, Serialize, PartialEq)]
pub struct ActionDependency {
    pub name: String,
    #[serde(rename = "ref")]
    pub version_ref: Option<String>,
    pub comment: Option<String>,
    pub file_name: String,
}

/// Collect `uses:` entries from every workflow file in `workflows_dir`.
///
/// This is a line scan, not a YAML parse: each `uses:` line is split on `@`
/// into name and ref, and a trailing `#` marks an inline comment. A missing
/// directory yields an empty inventory.
pub fn scan_action_dependencies(workflows_dir: &Path) -> Result<Vec<ActionDependency>> {
    if !workflows_dir.is_dir() {
        return Ok(Vec::new());
    }

    let uses_re = Regex::new(r"^\s*-?\s*uses:\s*(.+)$").expect("static regex");
    let mut dependencies = Vec::new();
    for entry in fs::read_dir(workflows_dir)
        .with_context(|| format!("Failed to read workflow dir {}", workflows_dir.display()))?
    {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() || !is_workflow_file(&path) {
            continue;
        }
        let file_name = entry.file_name().to_string_lossy().to_string();
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read workflow file {}", path.display()))?;
        for line in content.lines() {
            if let Some(captures) = uses_re.captures(line) {
                dependencies.push(parse_uses_value(&captures[1], &file_name));
            }
        }
    }
    Ok(dependencies)
}

fn is_workflow_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("yml") | Some("yaml")
    )
}

fn parse_uses_value(value: &str, file_name: &str) -> ActionDependency {
    let (target, comment) = match value.split_once('#') {
        Some((head, tail)) => (head, Some(tail.trim().to_string())),
        None => (value, None),
    };
    let target = target.trim().trim_matches(|c| c == '"' || c == '\'');
    let (name, version_ref) = match target.split_once('@') {
        Some((name, reference)) => (name.to_string(), Some(reference.to_string())),
        None => (target.to_string(), None),
    };
    ActionDependency {
        name,
        version_ref,
        comment,
        file_name: file_name.to_string(),
    }
}
