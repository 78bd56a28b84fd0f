use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bsp::{
    BuildTarget, BuildTargetEventKind, BuildTargetIdentifier, OutputPathsItem, SourceKitOptions,
    SourcesItem,
};
use crate::types::BspError;

/// Identity and canned build graph served by the default handlers.
///
/// Every answer is optional: a method whose answer is not configured replies
/// with a "not implemented" error instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    pub display_name: String,
    pub version: String,
    pub root_uri: String,
    pub language_ids: Vec<String>,
    pub index_store_path: Option<String>,
    pub index_database_path: Option<String>,
    /// Advertises pull-based `textDocument/sourceKitOptions` support.
    pub source_kit_options_provider: Option<bool>,
    pub targets: Option<Vec<BuildTarget>>,
    pub sources: Option<Vec<SourcesItem>>,
    pub output_paths: Option<Vec<OutputPathsItem>>,
    pub source_kit_options: Option<SourceKitOptions>,
    pub on_register: Option<OnRegister>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            display_name: "bspserver".into(),
            version: env!("CARGO_PKG_VERSION").into(),
            root_uri: String::new(),
            language_ids: Vec::new(),
            index_store_path: None,
            index_database_path: None,
            source_kit_options_provider: None,
            targets: None,
            sources: None,
            output_paths: None,
            source_kit_options: None,
            on_register: None,
        }
    }
}

/// Notification pushed when a client registers for changes to a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum OnRegister {
    /// `buildTarget/didChange` with one change entry for `target`.
    #[serde(rename_all = "camelCase")]
    BuildTargetDidChange {
        target: BuildTargetIdentifier,
        #[serde(default)]
        event_kind: Option<BuildTargetEventKind>,
        #[serde(default)]
        data: Option<Value>,
    },
    /// `build/sourceKitOptionsChanged` for the registered document.
    #[serde(rename_all = "camelCase")]
    SourceKitOptionsChanged {
        options: Vec<String>,
        #[serde(default)]
        working_directory: Option<String>,
    },
}

/// Load a server config from a JSON file on disk.
pub fn load_config(path: impl AsRef<Path>) -> Result<ServerConfig, BspError> {
    let path = path.as_ref();
    let data = std::fs::read(path)
        .map_err(|e| BspError::Config(format!("read {}: {}", path.display(), e)))?;
    parse_config(&data)
}

/// Parse a server config from raw JSON bytes.
pub fn parse_config(data: &[u8]) -> Result<ServerConfig, BspError> {
    let config: ServerConfig = serde_json::from_slice(data)?;
    validate_targets(&config)?;
    Ok(config)
}

/// Target ids must be unique and every dependency must name a known target.
fn validate_targets(config: &ServerConfig) -> Result<(), BspError> {
    let Some(targets) = &config.targets else {
        return Ok(());
    };

    let mut seen = std::collections::HashSet::new();
    for target in targets {
        if !seen.insert(&target.id.uri) {
            return Err(BspError::Config(format!(
                "duplicate target id \"{}\"",
                target.id.uri
            )));
        }
    }
    for target in targets {
        if let Some(dep) = target.dependencies.iter().find(|d| !seen.contains(&d.uri)) {
            return Err(BspError::Config(format!(
                "target \"{}\" depends on unknown target \"{}\"",
                target.id.uri, dep.uri
            )));
        }
    }
    Ok(())
}
