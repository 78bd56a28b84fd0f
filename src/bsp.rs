//! Typed payloads for the BSP methods this crate understands.
//!
//! Field names follow the protocol's camelCase JSON. Optional fields are
//! omitted on output when unset so that clients see exactly what a server
//! chose to advertise.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// BSP protocol version advertised in `build/initialize`.
pub const BSP_VERSION: &str = "2.0";

/// Method names.
pub mod method {
    pub const INITIALIZE: &str = "build/initialize";
    pub const INITIALIZED: &str = "build/initialized";
    pub const SHUTDOWN: &str = "build/shutdown";
    pub const EXIT: &str = "build/exit";
    pub const WORKSPACE_BUILD_TARGETS: &str = "workspace/buildTargets";
    pub const WORKSPACE_DID_CHANGE_WATCHED_FILES: &str = "workspace/didChangeWatchedFiles";
    pub const BUILD_TARGET_SOURCES: &str = "buildTarget/sources";
    pub const BUILD_TARGET_OUTPUT_PATHS: &str = "buildTarget/outputPaths";
    pub const BUILD_TARGET_DID_CHANGE: &str = "buildTarget/didChange";
    pub const REGISTER_FOR_CHANGES: &str = "textDocument/registerForChanges";
    pub const SOURCEKIT_OPTIONS: &str = "textDocument/sourceKitOptions";
    pub const SOURCEKIT_OPTIONS_CHANGED: &str = "build/sourceKitOptionsChanged";
}

// ── Lifecycle ──

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InitializeBuildParams {
    pub display_name: Option<String>,
    pub version: Option<String>,
    pub bsp_version: Option<String>,
    pub root_uri: Option<String>,
    pub capabilities: BuildClientCapabilities,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BuildClientCapabilities {
    pub language_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeBuildResult {
    pub display_name: String,
    pub version: String,
    pub bsp_version: String,
    pub root_uri: String,
    pub capabilities: BuildServerCapabilities,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<SourceKitInitializeData>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildServerCapabilities {
    pub language_ids: Vec<String>,
}

/// Server-specific `data` attached to the initialize result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceKitInitializeData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_database_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_store_path: Option<String>,
    /// Whether the server answers pull-based `textDocument/sourceKitOptions`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_kit_options_provider: Option<bool>,
}

impl SourceKitInitializeData {
    pub fn is_empty(&self) -> bool {
        self.index_database_path.is_none()
            && self.index_store_path.is_none()
            && self.source_kit_options_provider.is_none()
    }
}

// ── Build targets ──

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BuildTargetIdentifier {
    pub uri: String,
}

impl BuildTargetIdentifier {
    pub fn new(uri: impl Into<String>) -> Self {
        BuildTargetIdentifier { uri: uri.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildTarget {
    pub id: BuildTargetIdentifier,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_directory: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub capabilities: BuildTargetCapabilities,
    #[serde(default)]
    pub language_ids: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<BuildTargetIdentifier>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BuildTargetCapabilities {
    pub can_compile: bool,
    pub can_test: bool,
    pub can_run: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceBuildTargetsResult {
    pub targets: Vec<BuildTarget>,
}

/// Params shared by `buildTarget/sources` and `buildTarget/outputPaths`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetsParams {
    pub targets: Vec<BuildTargetIdentifier>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourcesResult {
    pub items: Vec<SourcesItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourcesItem {
    pub target: BuildTargetIdentifier,
    #[serde(default)]
    pub sources: Vec<SourceItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceItem {
    pub uri: String,
    /// 1 = file, 2 = directory.
    #[serde(default = "SourceItem::file_kind")]
    pub kind: u8,
    #[serde(default)]
    pub generated: bool,
}

impl SourceItem {
    fn file_kind() -> u8 {
        1
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputPathsResult {
    pub items: Vec<OutputPathsItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputPathsItem {
    pub target: BuildTargetIdentifier,
    #[serde(default)]
    pub output_paths: Vec<String>,
}

// ── Change notifications ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterAction {
    Register,
    Unregister,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterForChangesParams {
    pub uri: String,
    pub action: RegisterAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum BuildTargetEventKind {
    Created,
    Changed,
    Deleted,
}

impl TryFrom<u8> for BuildTargetEventKind {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(BuildTargetEventKind::Created),
            2 => Ok(BuildTargetEventKind::Changed),
            3 => Ok(BuildTargetEventKind::Deleted),
            other => Err(format!("unknown build target event kind {other}")),
        }
    }
}

impl From<BuildTargetEventKind> for u8 {
    fn from(kind: BuildTargetEventKind) -> Self {
        match kind {
            BuildTargetEventKind::Created => 1,
            BuildTargetEventKind::Changed => 2,
            BuildTargetEventKind::Deleted => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildTargetEvent {
    pub target: BuildTargetIdentifier,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<BuildTargetEventKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DidChangeBuildTargetParams {
    pub changes: Vec<BuildTargetEvent>,
}

// ── Compiler options ──

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceKitOptionsParams {
    pub text_document: TextDocumentIdentifier,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<BuildTargetIdentifier>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextDocumentIdentifier {
    pub uri: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceKitOptions {
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
}

/// Push-based settings update for one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceKitOptionsChangedParams {
    pub uri: String,
    pub updated_options: SourceKitOptions,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DidChangeWatchedFilesParams {
    pub changes: Vec<FileEvent>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEvent {
    pub uri: String,
    #[serde(rename = "type")]
    pub change_type: u8,
}
