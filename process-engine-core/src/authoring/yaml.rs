use super::dto::DefinitionDto;
use crate::definition::ProcessDefinition;
use anyhow::{Context, Result};
use std::path::Path;

/// Parse a YAML string into a DefinitionDto.
///
/// Validation is NOT performed here; `DefinitionDto::into_definition`
/// resolves names and validates the arena.
pub fn parse_definition_yaml(yaml_str: &str) -> Result<DefinitionDto> {
    let dto: DefinitionDto = serde_yaml::from_str(yaml_str)?;
    Ok(dto)
}

/// Parse and build a definition from a YAML file.
pub fn load_definition_file(path: &Path) -> Result<ProcessDefinition> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Reading {}", path.display()))?;
    let dto = parse_definition_yaml(&content)
        .with_context(|| format!("Parsing {}", path.display()))?;
    let definition = dto
        .into_definition()
        .with_context(|| format!("Building {}", path.display()))?;
    Ok(definition)
}
