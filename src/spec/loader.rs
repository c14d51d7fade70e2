use anyhow::{Result, Context as AnyhowContext};
use std::fs;
use std::path::Path;
use crate::spec::FlowSpec;

pub fn load_flow_spec_from_yaml(file_path: &str) -> Result<FlowSpec> {
    let yaml_content = fs::read_to_string(file_path)
        .with_context(|| format!("Failed to read YAML file from {}", file_path))?;

    let spec: FlowSpec = serde_yaml::from_str(&yaml_content)
        .with_context(|| format!("Failed to deserialize YAML content from {}", file_path))?;

    Ok(spec)
}

pub fn load_flow_spec_from_json(file_path: &str) -> Result<FlowSpec> {
    let json_content = fs::read_to_string(file_path)
        .with_context(|| format!("Failed to read JSON file from {}", file_path))?;

    let spec: FlowSpec = serde_json::from_str(&json_content)
        .with_context(|| format!("Failed to deserialize JSON content from {}", file_path))?;

    Ok(spec)
}

/// Picks the format from the file extension; anything that is not `.json`
/// is read as YAML.
pub fn load_flow_spec(file_path: &str) -> Result<FlowSpec> {
    let is_json = Path::new(file_path)
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if is_json {
        load_flow_spec_from_json(file_path)
    } else {
        load_flow_spec_from_yaml(file_path)
    }
}
