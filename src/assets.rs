//! Function asset persistence and manifest resolution.
//!
//! One JSON document per asset under `{base}/functions/{id}.json`, written
//! atomically via temp + rename so a concurrent reader never observes a torn
//! document. Upload manifests are the ingestion shape: they may reference
//! on-disk source files and are parsed leniently (comments, trailing commas,
//! single quotes).

use crate::constants::DEFAULT_FUNCTION_NAME;
use crate::engine::LanguageId;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Mints a new time-ordered identifier.
pub fn mint_id() -> String {
    uuid::Uuid::now_v7().to_string()
}

// =============================================================================
// Persisted Shape
// =============================================================================

/// A persisted user function plus its dependencies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionAsset {
    /// UUIDv7 identifier, unique across the store.
    pub id: String,
    /// Guest language evaluating the source.
    pub language_id: LanguageId,
    /// Name of the guest entry point.
    #[serde(default = "default_function_name")]
    pub function_name: String,
    /// JS only: evaluate the source as a module and resolve the entry from
    /// the module namespace.
    #[serde(default)]
    pub js_eval_as_module: bool,
    /// Guest source text.
    pub source_code: String,
    /// Dependency name → source text.
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
}

fn default_function_name() -> String {
    DEFAULT_FUNCTION_NAME.to_string()
}

// =============================================================================
// Upload Manifest
// =============================================================================

/// Ingestion-only manifest shape. Unknown properties are ignored.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadManifest {
    /// Explicit id; the server mints one when absent.
    #[serde(default)]
    pub id: Option<String>,
    /// Guest language tag.
    pub language_id: String,
    /// Entry point override; defaults to `handler`.
    #[serde(default)]
    pub function_name: Option<String>,
    /// JS module evaluation flag.
    #[serde(default)]
    pub js_eval_as_module: Option<bool>,
    /// Inline source text. Exactly one of `source`/`sourceFile`.
    #[serde(default)]
    pub source: Option<String>,
    /// Path to a source file, resolved against the manifest's directory.
    #[serde(default)]
    pub source_file: Option<String>,
    /// Dependencies by name.
    #[serde(default)]
    pub dependencies: BTreeMap<String, DependencySpec>,
}

/// One dependency in a manifest: inline source or a file reference.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencySpec {
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub file: Option<String>,
}

/// Parses manifest text, tolerating comments, trailing commas, and
/// single-quoted strings.
pub fn parse_manifest(text: &str) -> Result<UploadManifest> {
    json5::from_str(text).map_err(|e| Error::InvalidManifest(e.to_string()))
}

/// Resolves a manifest into a persistable asset, reading referenced files
/// relative to `cwd` and minting an id when the manifest carries none.
pub fn resolve_manifest(cwd: &Path, manifest: &UploadManifest) -> Result<FunctionAsset> {
    let language_id = LanguageId::parse(&manifest.language_id)?;

    let source_code = match (&manifest.source, &manifest.source_file) {
        (Some(_), Some(_)) => {
            return Err(Error::InvalidManifest(
                "exactly one of source/sourceFile allowed".to_string(),
            ));
        }
        (Some(source), None) => source.clone(),
        (None, Some(file)) => read_source(cwd, file)?,
        (None, None) => {
            return Err(Error::InvalidManifest(
                "one of source/sourceFile required".to_string(),
            ));
        }
    };
    if source_code.trim().is_empty() {
        return Err(Error::InvalidManifest("source is empty".to_string()));
    }

    let mut dependencies = BTreeMap::new();
    for (name, spec) in &manifest.dependencies {
        let text = match (&spec.source, &spec.file) {
            (Some(source), _) => source.clone(),
            (None, Some(file)) => read_source(cwd, file)?,
            (None, None) => {
                return Err(Error::InvalidManifest(format!(
                    "dependency '{name}' needs source or file"
                )));
            }
        };
        dependencies.insert(name.clone(), text);
    }

    Ok(FunctionAsset {
        id: manifest.id.clone().unwrap_or_else(mint_id),
        language_id,
        function_name: manifest
            .function_name
            .clone()
            .unwrap_or_else(default_function_name),
        js_eval_as_module: manifest.js_eval_as_module.unwrap_or(false),
        source_code,
        dependencies,
    })
}

fn read_source(cwd: &Path, file: &str) -> Result<String> {
    let path = cwd.join(file);
    fs::read_to_string(&path)
        .map_err(|e| Error::InvalidManifest(format!("cannot read {}: {e}", path.display())))
}

// =============================================================================
// Store
// =============================================================================

/// Directory-backed store of function assets.
pub struct AssetStore {
    dir: PathBuf,
}

impl AssetStore {
    /// Opens (and creates) the store directory.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// The backing directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persists an asset atomically.
    pub fn save(&self, asset: &FunctionAsset) -> Result<()> {
        if !id_is_safe(&asset.id) {
            return Err(Error::StorageWriteFailed(format!(
                "unsafe asset id: {}",
                asset.id
            )));
        }
        let json = serde_json::to_vec_pretty(asset).map_err(|e| Error::Serialization(e.to_string()))?;
        let path = self.dir.join(format!("{}.json", asset.id));

        let temp_name = format!("tmp.{}", uuid::Uuid::now_v7());
        let temp_path = path.with_extension(temp_name);
        fs::write(&temp_path, &json).map_err(|e| Error::StorageWriteFailed(e.to_string()))?;
        fs::rename(&temp_path, &path).map_err(|e| {
            let _ = fs::remove_file(&temp_path);
            Error::StorageWriteFailed(e.to_string())
        })?;

        info!(id = %asset.id, language = %asset.language_id, "saved function asset");
        Ok(())
    }

    /// Loads an asset, or `None` when absent.
    pub fn load(&self, id: &str) -> Result<Option<FunctionAsset>> {
        if !id_is_safe(id) {
            return Ok(None);
        }
        let path = self.dir.join(format!("{id}.json"));
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let asset =
            serde_json::from_str(&text).map_err(|e| Error::Serialization(e.to_string()))?;
        Ok(Some(asset))
    }

    /// Lists all assets, ordered by id. Non-asset files are skipped.
    pub fn list(&self) -> Result<Vec<FunctionAsset>> {
        let mut assets = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match fs::read_to_string(&path)
                .map_err(Error::from)
                .and_then(|t| {
                    serde_json::from_str::<FunctionAsset>(&t)
                        .map_err(|e| Error::Serialization(e.to_string()))
                }) {
                Ok(asset) => assets.push(asset),
                Err(e) => debug!(path = %path.display(), error = %e, "skipping unreadable asset"),
            }
        }
        assets.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(assets)
    }
}

/// Ids become file names; restrict them to the UUID alphabet.
fn id_is_safe(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
