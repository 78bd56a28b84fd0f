//! The base dispatch table every server starts from.
//!
//! Lifecycle methods always have a working default. Methods that need build
//! graph data are answered from [`ServerConfig`] when it carries that data, and
//! otherwise reply with a "not implemented" error that names the method.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::bsp::{
    BSP_VERSION, BuildServerCapabilities, BuildTargetEvent, BuildTargetEventKind,
    DidChangeWatchedFilesParams, InitializeBuildParams, InitializeBuildResult, OutputPathsResult,
    RegisterAction, RegisterForChangesParams, SourceKitInitializeData, SourceKitOptions,
    SourceKitOptionsParams, SourcesResult, TargetsParams, WorkspaceBuildTargetsResult, method,
};
use crate::loader::{OnRegister, ServerConfig};
use crate::server::{
    Client, FnNotificationHandler, FnRequestHandler, Handler, RequestHandler,
    TypedNotificationHandler, TypedRequestHandler,
};
use crate::types::RequestError;

/// Answers `build/initialize` with a result computed once from the config,
/// so repeated calls advertise identical capabilities.
struct Initialize {
    result: Value,
}

impl Initialize {
    fn new(config: &ServerConfig) -> Self {
        let data = SourceKitInitializeData {
            index_database_path: config.index_database_path.clone(),
            index_store_path: config.index_store_path.clone(),
            source_kit_options_provider: config.source_kit_options_provider,
        };
        let result = InitializeBuildResult {
            display_name: config.display_name.clone(),
            version: config.version.clone(),
            bsp_version: BSP_VERSION.into(),
            root_uri: config.root_uri.clone(),
            capabilities: BuildServerCapabilities {
                language_ids: config.language_ids.clone(),
            },
            data: (!data.is_empty()).then_some(data),
        };
        Initialize {
            result: serde_json::to_value(result).unwrap_or(json!({})),
        }
    }
}

#[async_trait]
impl RequestHandler for Initialize {
    async fn call(&self, params: Value, _client: Client) -> Result<Value, RequestError> {
        if let Ok(p) = serde_json::from_value::<InitializeBuildParams>(params) {
            let client_name = p.display_name.as_deref().unwrap_or("");
            let client_version = p.version.as_deref().unwrap_or("");
            tracing::info!(
                client_name,
                client_version,
                bsp_version = ?p.bsp_version,
                root_uri = ?p.root_uri,
                "initialize"
            );
        }
        Ok(self.result.clone())
    }
}

fn request(name: &'static str, handler: Arc<dyn RequestHandler>) -> (&'static str, Handler) {
    (name, Handler::Request(handler))
}

fn not_implemented(name: &'static str) -> (&'static str, Handler) {
    (name, Handler::Unimplemented)
}

fn noop(name: &'static str) -> (&'static str, Handler) {
    let handler = FnNotificationHandler::new(|_params: Value, _client: Client| async move { Ok(()) });
    (name, Handler::Notification(handler))
}

/// Keep items whose target was asked for, in config order.
fn requested<T>(items: &[T], asked: &TargetsParams, target_of: impl Fn(&T) -> &str) -> Vec<T>
where
    T: Clone,
{
    let asked: HashSet<&str> = asked.targets.iter().map(|t| t.uri.as_str()).collect();
    items
        .iter()
        .filter(|item| asked.contains(target_of(item)))
        .cloned()
        .collect()
}

/// Build the default table for `config`.
pub(crate) fn base_table(config: &ServerConfig) -> Vec<(&'static str, Handler)> {
    let mut table = vec![
        request(method::INITIALIZE, Arc::new(Initialize::new(config))),
        noop(method::INITIALIZED),
        request(
            method::SHUTDOWN,
            FnRequestHandler::new(|_params: Value, _client: Client| async move { Ok(json!({})) }),
        ),
        noop(method::EXIT),
        (
            method::WORKSPACE_DID_CHANGE_WATCHED_FILES,
            Handler::Notification(TypedNotificationHandler::new(
                |p: DidChangeWatchedFilesParams, _client: Client| async move {
                    tracing::debug!(changes = p.changes.len(), "watched files changed");
                    Ok(())
                },
            )),
        ),
        register_for_changes(config),
    ];

    table.push(match config.targets.clone() {
        Some(targets) => request(
            method::WORKSPACE_BUILD_TARGETS,
            FnRequestHandler::new(move |_params: Value, _client: Client| {
                let result = WorkspaceBuildTargetsResult {
                    targets: targets.clone(),
                };
                async move {
                    serde_json::to_value(result)
                        .map_err(|e| RequestError::internal(format!("encode targets: {}", e)))
                }
            }),
        ),
        None => not_implemented(method::WORKSPACE_BUILD_TARGETS),
    });

    table.push(match config.sources.clone() {
        Some(sources) => request(
            method::BUILD_TARGET_SOURCES,
            TypedRequestHandler::new(move |p: TargetsParams, _client: Client| {
                let items = requested(&sources, &p, |item| item.target.uri.as_str());
                async move { Ok(SourcesResult { items }) }
            }),
        ),
        None => not_implemented(method::BUILD_TARGET_SOURCES),
    });

    table.push(match config.output_paths.clone() {
        Some(outputs) => request(
            method::BUILD_TARGET_OUTPUT_PATHS,
            TypedRequestHandler::new(move |p: TargetsParams, _client: Client| {
                let items = requested(&outputs, &p, |item| item.target.uri.as_str());
                async move { Ok(OutputPathsResult { items }) }
            }),
        ),
        None => not_implemented(method::BUILD_TARGET_OUTPUT_PATHS),
    });

    table.push(match config.source_kit_options.clone() {
        Some(options) => request(
            method::SOURCEKIT_OPTIONS,
            TypedRequestHandler::new(move |p: SourceKitOptionsParams, _client: Client| {
                tracing::debug!(uri = %p.text_document.uri, "sourceKitOptions");
                let options = options.clone();
                async move { Ok(options) }
            }),
        ),
        None => not_implemented(method::SOURCEKIT_OPTIONS),
    });

    table
}

fn register_for_changes(config: &ServerConfig) -> (&'static str, Handler) {
    let on_register = config.on_register.clone();
    let handler = TypedNotificationHandler::new(move |p: RegisterForChangesParams, client: Client| {
        let on_register = on_register.clone();
        async move {
            tracing::debug!(uri = %p.uri, action = ?p.action, "registerForChanges");
            if p.action != RegisterAction::Register {
                return Ok(());
            }
            match on_register {
                Some(OnRegister::BuildTargetDidChange {
                    target,
                    event_kind,
                    data,
                }) => client.did_change_build_target(vec![BuildTargetEvent {
                    target,
                    kind: event_kind.or(Some(BuildTargetEventKind::Changed)),
                    data,
                }]),
                Some(OnRegister::SourceKitOptionsChanged {
                    options,
                    working_directory,
                }) => client.source_kit_options_changed(
                    p.uri,
                    SourceKitOptions {
                        options,
                        working_directory,
                    },
                ),
                None => Ok(()),
            }
        }
    });
    (method::REGISTER_FOR_CHANGES, Handler::Notification(handler))
}
