// Input Loading
// Reads documents, engine config, executor scripts and --param flags

use std::collections::HashMap;
use std::path::Path;

use color_eyre::eyre::{bail, eyre, WrapErr};
use color_eyre::Result;

use pipeline_engine::testing::ScriptStep;
use pipeline_engine::{EngineConfig, GraphDocument, ParamValue};

pub fn load_document(path: &Path) -> Result<GraphDocument> {
    if !path.exists() {
        bail!("Pipeline file not found: {}", path.display());
    }
    let content = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("Failed to read {}", path.display()))?;

    let is_json = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let document = if is_json {
        GraphDocument::from_json(&content)
    } else {
        GraphDocument::from_yaml(&content)
    };
    document.map_err(|e| eyre!("{}: {}", path.display(), e))
}

/// Engine config from a YAML file, or defaults
pub fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    let Some(path) = path else {
        return Ok(EngineConfig::default());
    };
    let content = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("Failed to read config {}", path.display()))?;
    serde_yaml::from_str(&content).wrap_err_with(|| format!("Invalid config {}", path.display()))
}

/// Per-task scripts keyed by task or instance name
pub fn load_scripts(path: Option<&Path>) -> Result<HashMap<String, Vec<ScriptStep>>> {
    let Some(path) = path else {
        return Ok(HashMap::new());
    };
    let content = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("Failed to read script {}", path.display()))?;
    serde_yaml::from_str(&content).wrap_err_with(|| format!("Invalid script {}", path.display()))
}

/// Parse `name=value` flags; a value in brackets is a JSON array
pub fn parse_params(flags: &[String]) -> Result<HashMap<String, ParamValue>> {
    let mut params = HashMap::new();
    for flag in flags {
        let Some((name, value)) = flag.split_once('=') else {
            bail!("Invalid parameter format '{}'. Expected name=value", flag);
        };
        let value = if value.trim_start().starts_with('[') {
            let items: Vec<String> = serde_json::from_str(value)
                .wrap_err_with(|| format!("Parameter '{}' is not a JSON string array", name))?;
            ParamValue::Array(items)
        } else {
            ParamValue::String(value.to_string())
        };
        params.insert(name.to_string(), value);
    }
    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline_engine::testing::ScriptedStatus;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn temp_file(suffix: &str, content: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_yaml_document() {
        let file = temp_file(
            ".yaml",
            "apiVersion: tekton.dev/v1\nkind: Pipeline\nmetadata:\n  name: demo\nspec:\n  tasks:\n    - name: a\n      taskRef:\n        name: echo\n",
        );
        let doc = load_document(file.path()).unwrap();
        assert_eq!(doc.metadata.name.as_deref(), Some("demo"));
        assert_eq!(doc.graph().tasks.len(), 1);
    }

    #[test]
    fn test_load_json_document() {
        let file = temp_file(
            ".json",
            r#"{"apiVersion":"tekton.dev/v1","kind":"Pipeline","metadata":{"name":"demo"},"spec":{"tasks":[{"name":"a","taskRef":{"name":"echo"}}]}}"#,
        );
        let doc = load_document(file.path()).unwrap();
        assert_eq!(doc.graph().tasks[0].name, "a");
    }

    #[test]
    fn test_missing_document() {
        let err = load_document(Path::new("/nonexistent/pipeline.yaml")).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_load_config() {
        let file = temp_file(".yaml", "maxParallel: 4\nenableMatrix: false\n");
        let config = load_config(Some(file.path())).unwrap();
        assert_eq!(config.max_parallel, 4);
        assert!(!config.enable_matrix);
        assert!(config.enable_cel_guards);

        assert_eq!(load_config(None).unwrap(), EngineConfig::default());
    }

    #[test]
    fn test_load_scripts() {
        let file = temp_file(".yaml", "build:\n  - status: failed\n  - status: succeeded\n");
        let scripts = load_scripts(Some(file.path())).unwrap();
        assert_eq!(scripts["build"].len(), 2);
        assert_eq!(scripts["build"][0].status, ScriptedStatus::Failed);
    }

    #[test]
    fn test_parse_params() {
        let flags = vec![
            "env=prod".to_string(),
            "targets=[\"a\",\"b\"]".to_string(),
            "url=http://x?y=z".to_string(),
        ];
        let params = parse_params(&flags).unwrap();
        assert_eq!(params["env"], ParamValue::from("prod"));
        assert_eq!(params["targets"], ParamValue::from(vec!["a", "b"]));
        assert_eq!(params["url"], ParamValue::from("http://x?y=z"));

        assert!(parse_params(&["novalue".to_string()]).is_err());
    }
}
