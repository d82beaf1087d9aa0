//! Cloud assembly loading.
//!
//! An assembly directory contains a root `manifest.json` mapping artifact
//! identifiers to descriptors, one or more `*.template.json` stack templates
//! with a top-level `Resources` map, and `*.assets.json` manifests
//! enumerating file and docker-image assets. Loading happens once, before
//! any provider starts, so plain blocking reads are fine here.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;

use nimbus_core::EmulatorError;

/// A single declared resource entry.
#[derive(Debug, Clone)]
pub struct CfnResource {
    pub logical_id: String,
    pub resource_type: String,
    pub properties: Value,
    pub metadata: Option<Value>,
}

/// A file asset referenced by a template (function code, mostly).
#[derive(Debug, Clone)]
pub struct FileAsset {
    pub hash: String,
    pub path: PathBuf,
    pub packaging: Option<String>,
}

/// A docker-image asset.
#[derive(Debug, Clone)]
pub struct ImageAsset {
    pub hash: String,
    pub directory: PathBuf,
}

/// The parsed assembly: every resource across every stack template, plus the
/// asset records needed to locate function code.
#[derive(Debug, Default)]
pub struct Assembly {
    pub resources: Vec<CfnResource>,
    pub file_assets: Vec<FileAsset>,
    pub image_assets: Vec<ImageAsset>,
}

#[derive(Deserialize)]
struct Manifest {
    #[serde(default)]
    artifacts: BTreeMap<String, Artifact>,
}

#[derive(Deserialize)]
struct Artifact {
    #[serde(rename = "type")]
    artifact_type: String,
    #[serde(default)]
    properties: Option<ArtifactProperties>,
}

#[derive(Deserialize)]
struct ArtifactProperties {
    #[serde(rename = "templateFile")]
    template_file: Option<String>,
    file: Option<String>,
}

#[derive(Deserialize)]
struct Template {
    #[serde(rename = "Resources", default)]
    resources: BTreeMap<String, TemplateResource>,
}

#[derive(Deserialize)]
struct TemplateResource {
    #[serde(rename = "Type")]
    resource_type: String,
    #[serde(rename = "Properties", default)]
    properties: Value,
    #[serde(rename = "Metadata")]
    metadata: Option<Value>,
}

#[derive(Deserialize)]
struct AssetManifest {
    #[serde(default)]
    files: BTreeMap<String, FileAssetEntry>,
    #[serde(rename = "dockerImages", default)]
    docker_images: BTreeMap<String, ImageAssetEntry>,
}

#[derive(Deserialize)]
struct FileAssetEntry {
    source: FileAssetSource,
}

#[derive(Deserialize)]
struct FileAssetSource {
    path: String,
    packaging: Option<String>,
}

#[derive(Deserialize)]
struct ImageAssetEntry {
    source: ImageAssetSource,
}

#[derive(Deserialize)]
struct ImageAssetSource {
    directory: String,
}

/// Load an assembly directory.
pub fn load_assembly(dir: &Path) -> Result<Assembly, EmulatorError> {
    let manifest_path = dir.join("manifest.json");
    let manifest_text = std::fs::read_to_string(&manifest_path).map_err(|err| {
        EmulatorError::Configuration(format!(
            "cannot read {}: {err}",
            manifest_path.display()
        ))
    })?;
    let manifest: Manifest = serde_json::from_str(&manifest_text).map_err(|err| {
        EmulatorError::Configuration(format!("invalid manifest.json: {err}"))
    })?;

    let mut assembly = Assembly::default();
    for (artifact_id, artifact) in &manifest.artifacts {
        let Some(properties) = &artifact.properties else {
            continue;
        };
        match artifact.artifact_type.as_str() {
            "aws:cloudformation:stack" => {
                if let Some(template_file) = &properties.template_file {
                    load_template(&dir.join(template_file), &mut assembly)?;
                }
            }
            "cdk:asset-manifest" => {
                if let Some(file) = &properties.file {
                    load_asset_manifest(dir, &dir.join(file), &mut assembly)?;
                }
            }
            other => {
                tracing::debug!(artifact_id, artifact_type = other, "skipping artifact");
            }
        }
    }

    tracing::info!(
        resources = assembly.resources.len(),
        file_assets = assembly.file_assets.len(),
        image_assets = assembly.image_assets.len(),
        "assembly loaded"
    );
    Ok(assembly)
}

fn load_template(path: &Path, assembly: &mut Assembly) -> Result<(), EmulatorError> {
    let text = std::fs::read_to_string(path).map_err(|err| {
        EmulatorError::Configuration(format!("cannot read {}: {err}", path.display()))
    })?;
    let template: Template = serde_json::from_str(&text).map_err(|err| {
        EmulatorError::Configuration(format!("invalid template {}: {err}", path.display()))
    })?;

    for (logical_id, body) in template.resources {
        assembly.resources.push(CfnResource {
            logical_id,
            resource_type: body.resource_type,
            properties: body.properties,
            metadata: body.metadata,
        });
    }
    Ok(())
}

fn load_asset_manifest(
    assembly_dir: &Path,
    path: &Path,
    assembly: &mut Assembly,
) -> Result<(), EmulatorError> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) => {
            tracing::warn!(path = %path.display(), %err, "asset manifest missing, skipping");
            return Ok(());
        }
    };
    let manifest: AssetManifest = serde_json::from_str(&text).map_err(|err| {
        EmulatorError::Configuration(format!("invalid asset manifest {}: {err}", path.display()))
    })?;

    for (hash, entry) in manifest.files {
        assembly.file_assets.push(FileAsset {
            hash,
            path: assembly_dir.join(entry.source.path),
            packaging: entry.source.packaging,
        });
    }
    for (hash, entry) in manifest.docker_images {
        assembly.image_assets.push(ImageAsset {
            hash,
            directory: assembly_dir.join(entry.source.directory),
        });
    }
    Ok(())
}

impl Assembly {
    /// Find the file asset whose source path or hash appears in a code
    /// reference.
    pub fn file_asset_for(&self, reference: &str) -> Option<&FileAsset> {
        self.file_assets
            .iter()
            .find(|asset| reference.contains(&asset.hash) || reference.ends_with(&asset.hash))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write(dir: &Path, name: &str, value: &Value) {
        std::fs::write(dir.join(name), serde_json::to_string_pretty(value).unwrap()).unwrap();
    }

    #[test]
    fn loads_manifest_templates_and_assets() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "manifest.json",
            &json!({
                "version": "36.0.0",
                "artifacts": {
                    "app": {
                        "type": "aws:cloudformation:stack",
                        "properties": {"templateFile": "app.template.json"}
                    },
                    "app.assets": {
                        "type": "cdk:asset-manifest",
                        "properties": {"file": "app.assets.json"}
                    }
                }
            }),
        );
        write(
            dir.path(),
            "app.template.json",
            &json!({
                "Resources": {
                    "OrdersTable": {
                        "Type": "AWS::DynamoDB::Table",
                        "Properties": {"TableName": "orders"}
                    },
                    "Handler": {
                        "Type": "AWS::Lambda::Function",
                        "Properties": {"Handler": "index.handler", "Runtime": "nodejs18.x"},
                        "Metadata": {"aws:asset:path": "asset.abc123"}
                    }
                }
            }),
        );
        write(
            dir.path(),
            "app.assets.json",
            &json!({
                "files": {
                    "abc123": {
                        "source": {"path": "asset.abc123", "packaging": "zip"},
                        "destinations": {}
                    }
                },
                "dockerImages": {
                    "def456": {"source": {"directory": "asset.def456"}}
                }
            }),
        );

        let assembly = load_assembly(dir.path()).unwrap();
        assert_eq!(assembly.resources.len(), 2);
        assert_eq!(assembly.file_assets.len(), 1);
        assert_eq!(assembly.image_assets.len(), 1);

        let handler = assembly
            .resources
            .iter()
            .find(|r| r.logical_id == "Handler")
            .unwrap();
        assert_eq!(handler.resource_type, "AWS::Lambda::Function");
        assert!(handler.metadata.is_some());

        let asset = assembly.file_asset_for("asset.abc123").unwrap();
        assert_eq!(asset.packaging.as_deref(), Some("zip"));
    }

    #[test]
    fn missing_manifest_is_a_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_assembly(dir.path()).unwrap_err();
        match err {
            EmulatorError::Configuration(msg) => assert!(msg.contains("manifest.json")),
            other => panic!("expected Configuration, got {other}"),
        }
    }

    #[test]
    fn missing_asset_manifest_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "manifest.json",
            &json!({
                "artifacts": {
                    "app.assets": {
                        "type": "cdk:asset-manifest",
                        "properties": {"file": "gone.assets.json"}
                    }
                }
            }),
        );
        let assembly = load_assembly(dir.path()).unwrap();
        assert!(assembly.file_assets.is_empty());
    }
}
