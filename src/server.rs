use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::io::{AsyncBufRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::bsp::{
    BuildTargetEvent, DidChangeBuildTargetParams, SourceKitOptions, SourceKitOptionsChangedParams,
    method,
};
use crate::defaults;
use crate::loader::{self, ServerConfig};
use crate::transport::Transport;
use crate::types::*;

/// Handler for a method that answers with a result.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn call(&self, params: Value, client: Client) -> Result<Value, RequestError>;
}

/// Handler for a method that produces no reply.
///
/// An error returned while serving a notification cannot be reported to the
/// peer and stops the serve loop.
#[async_trait]
pub trait NotificationHandler: Send + Sync {
    async fn call(&self, params: Value, client: Client) -> Result<(), RequestError>;
}

/// Wraps an async closure over raw params into a RequestHandler.
pub struct FnRequestHandler<F> {
    f: F,
}

impl<F, Fut> FnRequestHandler<F>
where
    F: Fn(Value, Client) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, RequestError>> + Send + 'static,
{
    pub fn new(f: F) -> Arc<dyn RequestHandler> {
        Arc::new(Self { f })
    }
}

#[async_trait]
impl<F, Fut> RequestHandler for FnRequestHandler<F>
where
    F: Fn(Value, Client) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, RequestError>> + Send + 'static,
{
    async fn call(&self, params: Value, client: Client) -> Result<Value, RequestError> {
        (self.f)(params, client).await
    }
}

/// Wraps an async closure over a typed params struct into a RequestHandler.
///
/// Params that do not match `P` are answered with an invalid-params error
/// before the closure runs.
pub struct TypedRequestHandler<F, P> {
    f: F,
    _params: PhantomData<fn(P)>,
}

impl<F, P, R, Fut> TypedRequestHandler<F, P>
where
    F: Fn(P, Client) -> Fut + Send + Sync + 'static,
    P: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = Result<R, RequestError>> + Send + 'static,
{
    pub fn new(f: F) -> Arc<dyn RequestHandler> {
        Arc::new(Self {
            f,
            _params: PhantomData,
        })
    }
}

#[async_trait]
impl<F, P, R, Fut> RequestHandler for TypedRequestHandler<F, P>
where
    F: Fn(P, Client) -> Fut + Send + Sync + 'static,
    P: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = Result<R, RequestError>> + Send + 'static,
{
    async fn call(&self, params: Value, client: Client) -> Result<Value, RequestError> {
        let params: P = decode_params(params)?;
        let result = (self.f)(params, client).await?;
        serde_json::to_value(result)
            .map_err(|e| RequestError::internal(format!("encode result: {}", e)))
    }
}

/// Wraps an async closure over raw params into a NotificationHandler.
pub struct FnNotificationHandler<F> {
    f: F,
}

impl<F, Fut> FnNotificationHandler<F>
where
    F: Fn(Value, Client) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), RequestError>> + Send + 'static,
{
    pub fn new(f: F) -> Arc<dyn NotificationHandler> {
        Arc::new(Self { f })
    }
}

#[async_trait]
impl<F, Fut> NotificationHandler for FnNotificationHandler<F>
where
    F: Fn(Value, Client) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), RequestError>> + Send + 'static,
{
    async fn call(&self, params: Value, client: Client) -> Result<(), RequestError> {
        (self.f)(params, client).await
    }
}

/// Typed counterpart of [`FnNotificationHandler`].
pub struct TypedNotificationHandler<F, P> {
    f: F,
    _params: PhantomData<fn(P)>,
}

impl<F, P, Fut> TypedNotificationHandler<F, P>
where
    F: Fn(P, Client) -> Fut + Send + Sync + 'static,
    P: DeserializeOwned + Send + 'static,
    Fut: Future<Output = Result<(), RequestError>> + Send + 'static,
{
    pub fn new(f: F) -> Arc<dyn NotificationHandler> {
        Arc::new(Self {
            f,
            _params: PhantomData,
        })
    }
}

#[async_trait]
impl<F, P, Fut> NotificationHandler for TypedNotificationHandler<F, P>
where
    F: Fn(P, Client) -> Fut + Send + Sync + 'static,
    P: DeserializeOwned + Send + 'static,
    Fut: Future<Output = Result<(), RequestError>> + Send + 'static,
{
    async fn call(&self, params: Value, client: Client) -> Result<(), RequestError> {
        let params: P = decode_params(params)?;
        (self.f)(params, client).await
    }
}

/// Missing or null params decode as an empty object.
fn decode_params<P: DeserializeOwned>(params: Value) -> Result<P, RequestError> {
    let params = if params.is_null() { json!({}) } else { params };
    serde_json::from_value(params)
        .map_err(|e| RequestError::invalid_params(format!("invalid params: {}", e)))
}

/// One entry of the dispatch table.
#[derive(Clone)]
pub enum Handler {
    Request(Arc<dyn RequestHandler>),
    Notification(Arc<dyn NotificationHandler>),
    /// Known method with no implementation. Requests get
    /// `'<method>' not implemented`; notifications are dropped.
    Unimplemented,
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Handler::Request(_) => f.write_str("Handler::Request"),
            Handler::Notification(_) => f.write_str("Handler::Notification"),
            Handler::Unimplemented => f.write_str("Handler::Unimplemented"),
        }
    }
}

/// Handle for pushing server-originated notifications to the peer.
///
/// Notifications are queued and written by the serve loop before the
/// response to the message whose handler queued them.
#[derive(Debug, Clone)]
pub struct Client {
    outbox: mpsc::UnboundedSender<Notification>,
}

impl Client {
    /// Queue a notification with arbitrary params.
    pub fn notify<P: Serialize>(&self, name: &str, params: &P) -> Result<(), RequestError> {
        let params = serde_json::to_value(params)
            .map_err(|e| RequestError::internal(format!("encode {} params: {}", name, e)))?;
        if self.outbox.send(Notification::new(name, Some(params))).is_err() {
            tracing::warn!(method = name, "server dropped; discarding notification");
        }
        Ok(())
    }

    /// Push `buildTarget/didChange`.
    pub fn did_change_build_target(&self, changes: Vec<BuildTargetEvent>) -> Result<(), RequestError> {
        self.notify(
            method::BUILD_TARGET_DID_CHANGE,
            &DidChangeBuildTargetParams { changes },
        )
    }

    /// Push updated compiler options for one document (push-based settings model).
    pub fn source_kit_options_changed(
        &self,
        uri: impl Into<String>,
        options: SourceKitOptions,
    ) -> Result<(), RequestError> {
        self.notify(
            method::SOURCEKIT_OPTIONS_CHANGED,
            &SourceKitOptionsChangedParams {
                uri: uri.into(),
                updated_options: options,
            },
        )
    }
}

/// Process-level lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Uninitialized,
    Initialized,
    ShuttingDown,
    Exited,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServerState::Uninitialized => "uninitialized",
            ServerState::Initialized => "initialized",
            ServerState::ShuttingDown => "shutting-down",
            ServerState::Exited => "exited",
        };
        f.write_str(name)
    }
}

/// The BSP server. Create with `ServerBuilder`, then `serve` a transport.
pub struct Server {
    table: HashMap<String, Handler>,
    state: ServerState,
    client: Client,
    outbox: mpsc::UnboundedReceiver<Notification>,
}

impl Server {
    /// Create a new server builder.
    pub fn builder() -> ServerBuilder {
        ServerBuilder::default()
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    /// True when `method` has an entry in the dispatch table.
    pub fn handles(&self, method: &str) -> bool {
        self.table.contains_key(method)
    }

    /// A handle for pushing notifications from outside a handler.
    pub fn client(&self) -> Client {
        self.client.clone()
    }

    /// Drain notifications queued since the last call, oldest first.
    pub fn take_notifications(&mut self) -> Vec<Notification> {
        let mut queued = Vec::new();
        while let Ok(notification) = self.outbox.try_recv() {
            queued.push(notification);
        }
        queued
    }

    /// Route one inbound message.
    ///
    /// Requests always yield exactly one response carrying the request's id.
    /// Notifications and inbound responses yield none. The only error is a
    /// failing notification handler.
    pub async fn dispatch(&mut self, message: Message) -> Result<Option<Response>, BspError> {
        if self.state == ServerState::Exited {
            tracing::debug!(method = ?message.method(), "ignoring message after exit");
            return Ok(None);
        }

        match message {
            Message::Request(req) => Ok(Some(self.handle_request(req).await)),
            Message::Notification(notification) => {
                self.handle_notification(notification).await?;
                Ok(None)
            }
            Message::Response(resp) => {
                tracing::warn!(id = %resp.id, "ignoring response; server issues no requests");
                Ok(None)
            }
        }
    }

    async fn handle_request(&mut self, req: Request) -> Response {
        tracing::debug!(method = %req.method, id = %req.id, state = %self.state, "request");

        if let Some(err) = self.gate_request(&req.method) {
            tracing::warn!(method = %req.method, id = %req.id, state = %self.state, "rejected request");
            return Response::error(req.id, err);
        }

        let Some(handler) = self.table.get(&req.method).cloned() else {
            return Response::error(req.id, RequestError::method_not_found(&req.method));
        };

        let params = req.params.unwrap_or(Value::Null);
        let outcome = match handler {
            Handler::Request(h) => h.call(params, self.client()).await,
            Handler::Notification(h) => h.call(params, self.client()).await.map(|()| Value::Null),
            Handler::Unimplemented => Err(RequestError::not_implemented(&req.method)),
        };

        match outcome {
            Ok(result) => {
                self.advance(&req.method);
                Response::ok(req.id, result)
            }
            Err(err) => {
                tracing::debug!(method = %req.method, id = %req.id, code = err.code, "request failed");
                Response::error(req.id, err)
            }
        }
    }

    async fn handle_notification(&mut self, notification: Notification) -> Result<(), BspError> {
        let Notification { method: name, params } = notification;
        tracing::debug!(method = %name, state = %self.state, "notification");

        if self.state == ServerState::Uninitialized && name != method::EXIT {
            tracing::warn!(method = %name, "dropping notification before initialize");
            return Ok(());
        }

        let handler = match self.table.get(&name) {
            Some(Handler::Unimplemented) | None => {
                tracing::debug!(method = %name, "no handler; dropping notification");
                return Ok(());
            }
            Some(handler) => handler.clone(),
        };

        let params = params.unwrap_or(Value::Null);
        let outcome = match handler {
            Handler::Notification(h) => h.call(params, self.client()).await,
            Handler::Request(h) => h.call(params, self.client()).await.map(|_| ()),
            Handler::Unimplemented => Ok(()),
        };

        match outcome {
            Ok(()) => {
                self.advance(&name);
                Ok(())
            }
            Err(source) => {
                tracing::error!(method = %name, error = %source, "notification handler failed");
                Err(BspError::NotificationFailed {
                    method: name,
                    source,
                })
            }
        }
    }

    /// Lifecycle policy for requests.
    fn gate_request(&self, name: &str) -> Option<RequestError> {
        match self.state {
            ServerState::Uninitialized if name != method::INITIALIZE && name != method::EXIT => {
                Some(RequestError::server_not_initialized())
            }
            ServerState::ShuttingDown if name != method::SHUTDOWN && name != method::EXIT => {
                Some(RequestError::invalid_request("server is shutting down"))
            }
            _ => None,
        }
    }

    fn advance(&mut self, name: &str) {
        let next = match (self.state, name) {
            (ServerState::Uninitialized, method::INITIALIZE) => ServerState::Initialized,
            (ServerState::Initialized, method::SHUTDOWN) => ServerState::ShuttingDown,
            (_, method::EXIT) => ServerState::Exited,
            (state, _) => state,
        };
        if next != self.state {
            tracing::info!(from = %self.state, to = %next, "lifecycle transition");
            self.state = next;
        }
    }

    /// Run the receive → dispatch → reply loop until exit or end of input.
    ///
    /// `build/exit` stops the loop once processed. Sent as a request it still
    /// gets its reply; sent as a notification nothing more is written.
    ///
    /// A peer closing either stream ends the loop cleanly. Framing violations
    /// and failing notification handlers end it with an error.
    pub async fn serve<R, W>(&mut self, transport: &mut Transport<R, W>) -> Result<(), BspError>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        tracing::info!(methods = self.table.len(), "serving");

        while self.state != ServerState::Exited {
            let Some(message) = transport.receive().await? else {
                tracing::info!("input closed by peer");
                return Ok(());
            };

            let reply = self.dispatch(message).await?;

            // After exit only the reply to an exit request goes out.
            let mut outgoing: Vec<Message> = if self.state == ServerState::Exited {
                Vec::new()
            } else {
                self.take_notifications()
                    .into_iter()
                    .map(Message::from)
                    .collect()
            };
            outgoing.extend(reply.map(Message::from));

            for message in &outgoing {
                match transport.send(message).await {
                    Ok(()) => {}
                    Err(TransportError::Closed) => {
                        tracing::info!("output closed by peer");
                        return Ok(());
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }

        tracing::info!("exit received");
        Ok(())
    }
}

/// Builder for constructing a Server.
///
/// Starts from the default table in [`defaults`](crate::defaults) and lets
/// callers replace individual methods. Registering the same method twice on
/// one builder is an error.
#[derive(Default)]
pub struct ServerBuilder {
    config: ServerConfig,
    handlers: Vec<(String, Handler)>,
}

impl ServerBuilder {
    /// Replace the whole config.
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Load the config from a JSON file.
    pub fn config_file(mut self, path: impl AsRef<std::path::Path>) -> Self {
        match loader::load_config(path) {
            Ok(config) => self.config = config,
            Err(e) => tracing::error!("load config file: {}", e),
        }
        self
    }

    /// Parse the config from raw JSON bytes.
    pub fn config_json(mut self, data: &[u8]) -> Self {
        match loader::parse_config(data) {
            Ok(config) => self.config = config,
            Err(e) => tracing::error!("parse config json: {}", e),
        }
        self
    }

    /// Set server display name and version.
    pub fn server_info(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.config.display_name = name.into();
        self.config.version = version.into();
        self
    }

    /// Set the advertised language ids.
    pub fn language_ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.language_ids = ids.into_iter().map(Into::into).collect();
        self
    }

    /// Register or replace a request handler.
    pub fn on_request(mut self, method: impl Into<String>, handler: Arc<dyn RequestHandler>) -> Self {
        self.handlers.push((method.into(), Handler::Request(handler)));
        self
    }

    /// Register or replace a notification handler.
    pub fn on_notification(
        mut self,
        method: impl Into<String>,
        handler: Arc<dyn NotificationHandler>,
    ) -> Self {
        self.handlers.push((method.into(), Handler::Notification(handler)));
        self
    }

    /// Build the server.
    pub fn build(self) -> Result<Server, BspError> {
        let mut table: HashMap<String, Handler> = defaults::base_table(&self.config)
            .into_iter()
            .map(|(name, handler)| (name.to_string(), handler))
            .collect();

        let mut registered = HashSet::new();
        for (name, handler) in self.handlers {
            if !registered.insert(name.clone()) {
                return Err(BspError::DuplicateMethod { method: name });
            }
            match table.entry(name) {
                Entry::Occupied(mut slot) => {
                    tracing::debug!(method = %slot.key(), "overriding default handler");
                    slot.insert(handler);
                }
                Entry::Vacant(slot) => {
                    slot.insert(handler);
                }
            }
        }

        let (sender, outbox) = mpsc::unbounded_channel();
        Ok(Server {
            table,
            state: ServerState::Uninitialized,
            client: Client { outbox: sender },
            outbox,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bsp::{BuildTargetEventKind, BuildTargetIdentifier, RegisterForChangesParams};

    const CONFIG: &str = r#"{
        "displayName": "test server",
        "version": "0.1",
        "rootUri": "blah",
        "languageIds": ["a", "b"],
        "indexStorePath": "some/index/store/path",
        "targets": [
            {
                "id": {"uri": "first_target"},
                "displayName": "First Target",
                "baseDirectory": "file:///some/dir",
                "tags": ["library", "test"],
                "capabilities": {"canCompile": true, "canTest": true, "canRun": false},
                "languageIds": ["a", "b"],
                "dependencies": []
            },
            {
                "id": {"uri": "second_target"},
                "displayName": "Second Target",
                "baseDirectory": "file:///some/dir",
                "tags": ["library", "test"],
                "capabilities": {"canCompile": true, "canTest": false, "canRun": false},
                "languageIds": ["a", "b"],
                "dependencies": [{"uri": "first_target"}]
            }
        ],
        "onRegister": {
            "kind": "buildTargetDidChange",
            "target": {"uri": "build://target/a"},
            "eventKind": 1,
            "data": {"key": "value"}
        }
    }"#;

    fn test_server() -> Server {
        Server::builder().config_json(CONFIG.as_bytes()).build().unwrap()
    }

    fn req(id: i64, method: &str, params: Option<Value>) -> Message {
        Request {
            id: RequestId::Number(id),
            method: method.into(),
            params,
        }
        .into()
    }

    fn note(method: &str, params: Option<Value>) -> Message {
        Notification::new(method, params).into()
    }

    async fn initialized_server() -> Server {
        let mut srv = test_server();
        srv.dispatch(req(0, method::INITIALIZE, Some(json!({}))))
            .await
            .unwrap()
            .unwrap();
        srv
    }

    fn frames(messages: &[Message]) -> Vec<u8> {
        let mut out = Vec::new();
        for msg in messages {
            let body = serde_json::to_string(msg).unwrap();
            out.extend(format!("Content-Length: {}\r\n\r\n{}", body.len(), body).into_bytes());
        }
        out
    }

    async fn run(srv: &mut Server, input: &[u8]) -> (Result<(), BspError>, Vec<Message>) {
        let mut transport = Transport::new(input, Vec::new());
        let outcome = srv.serve(&mut transport).await;
        let (_, written) = transport.into_inner();

        let mut replies = Vec::new();
        let mut reader = Transport::new(&written[..], Vec::new());
        while let Some(msg) = reader.receive().await.unwrap() {
            replies.push(msg);
        }
        (outcome, replies)
    }

    #[tokio::test]
    async fn test_initialize() {
        let mut srv = test_server();
        let resp = srv
            .dispatch(req(1, method::INITIALIZE, Some(json!({"displayName": "client"}))))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resp.id, RequestId::Number(1));
        let result = resp.result().unwrap();
        assert_eq!(result["bspVersion"], "2.0");
        assert_eq!(result["displayName"], "test server");
        assert_eq!(result["capabilities"]["languageIds"], json!(["a", "b"]));
        assert_eq!(result["data"]["indexStorePath"], "some/index/store/path");
        assert_eq!(srv.state(), ServerState::Initialized);
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let mut srv = test_server();
        let first = srv.dispatch(req(1, method::INITIALIZE, None)).await.unwrap().unwrap();
        let second = srv.dispatch(req(2, method::INITIALIZE, None)).await.unwrap().unwrap();
        assert_eq!(first.result(), second.result());
        assert_eq!(second.id, RequestId::Number(2));
    }

    #[tokio::test]
    async fn test_request_before_initialize_rejected() {
        let mut srv = test_server();
        let resp = srv
            .dispatch(req(5, method::WORKSPACE_BUILD_TARGETS, None))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resp.id, RequestId::Number(5));
        assert_eq!(resp.rpc_error().unwrap().code, ERR_CODE_NOT_INITIALIZED);
    }

    #[tokio::test]
    async fn test_build_targets() {
        let mut srv = initialized_server().await;
        let resp = srv
            .dispatch(req(2, method::WORKSPACE_BUILD_TARGETS, None))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resp.id, RequestId::Number(2));
        let targets = resp.result().unwrap()["targets"].as_array().unwrap().clone();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0]["id"]["uri"], "first_target");
        assert_eq!(targets[1]["id"]["uri"], "second_target");
        assert_eq!(targets[1]["dependencies"], json!([{"uri": "first_target"}]));
    }

    #[tokio::test]
    async fn test_unknown_request_method() {
        let mut srv = initialized_server().await;
        let resp = srv
            .dispatch(req(9, "unknown/method", Some(json!({}))))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resp.id, RequestId::Number(9));
        let err = resp.rpc_error().unwrap();
        assert_eq!(err.code, ERR_CODE_NO_METHOD);
        assert_eq!(err.message, "Method not found: unknown/method");
    }

    #[tokio::test]
    async fn test_unknown_notification_is_silent() {
        let mut srv = initialized_server().await;
        let resp = srv.dispatch(note("unknown/notification", None)).await.unwrap();
        assert!(resp.is_none());
        assert!(srv.take_notifications().is_empty());
    }

    #[tokio::test]
    async fn test_unimplemented_method_names_itself() {
        let mut srv = initialized_server().await;
        let resp = srv
            .dispatch(req(3, method::BUILD_TARGET_SOURCES, Some(json!({"targets": []}))))
            .await
            .unwrap()
            .unwrap();
        let err = resp.rpc_error().unwrap();
        assert_eq!(err.code, ERR_CODE_NO_METHOD);
        assert_eq!(err.message, "'buildTarget/sources' not implemented");
    }

    #[tokio::test]
    async fn test_register_for_changes_pushes_did_change() {
        let mut srv = initialized_server().await;
        let params = json!({"uri": "file:///a.swift", "action": "register"});
        let resp = srv
            .dispatch(note(method::REGISTER_FOR_CHANGES, Some(params)))
            .await
            .unwrap();
        assert!(resp.is_none());

        let pushed = srv.take_notifications();
        assert_eq!(pushed.len(), 1);
        assert_eq!(pushed[0].method, method::BUILD_TARGET_DID_CHANGE);
        let changes = pushed[0].params.as_ref().unwrap()["changes"].as_array().unwrap().clone();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0]["target"]["uri"], "build://target/a");
        assert_eq!(changes[0]["kind"], 1);
    }

    #[tokio::test]
    async fn test_register_for_changes_as_request_gets_null_result() {
        let mut srv = initialized_server().await;
        let params = json!({"uri": "file:///a.swift", "action": "unregister"});
        let resp = srv
            .dispatch(req(4, method::REGISTER_FOR_CHANGES, Some(params)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resp.result(), Some(&Value::Null));
        assert!(srv.take_notifications().is_empty());
    }

    #[tokio::test]
    async fn test_handler_error_maps_to_response() {
        let mut srv = Server::builder()
            .on_request(
                "custom/fail",
                FnRequestHandler::new(|_params: Value, _client: Client| async move {
                    Err::<Value, _>(RequestError::new(123, "unhandled method"))
                }),
            )
            .build()
            .unwrap();
        srv.dispatch(req(0, method::INITIALIZE, None)).await.unwrap();
        let resp = srv.dispatch(req(7, "custom/fail", None)).await.unwrap().unwrap();
        let err = resp.rpc_error().unwrap();
        assert_eq!((err.code, err.message.as_str()), (123, "unhandled method"));
        assert_eq!(resp.id, RequestId::Number(7));
    }

    #[tokio::test]
    async fn test_typed_handler_rejects_bad_shape() {
        let mut srv = initialized_server().await;
        let resp = srv
            .dispatch(req(8, method::BUILD_TARGET_SOURCES, Some(json!({"targets": "nope"}))))
            .await
            .unwrap()
            .unwrap();
        // Unconfigured sources answer "not implemented" regardless of shape.
        assert_eq!(resp.rpc_error().unwrap().code, ERR_CODE_NO_METHOD);

        let mut srv = Server::builder()
            .on_request(
                method::BUILD_TARGET_SOURCES,
                TypedRequestHandler::new(
                    |p: crate::bsp::TargetsParams, _client: Client| async move {
                        Ok(json!({"items": [], "asked": p.targets.len()}))
                    },
                ),
            )
            .build()
            .unwrap();
        srv.dispatch(req(0, method::INITIALIZE, None)).await.unwrap();
        let resp = srv
            .dispatch(req(8, method::BUILD_TARGET_SOURCES, Some(json!({"targets": "nope"}))))
            .await
            .unwrap()
            .unwrap();
        let err = resp.rpc_error().unwrap();
        assert_eq!(err.code, ERR_CODE_BAD_PARAMS);
        assert!(err.message.starts_with("invalid params"));
    }

    #[tokio::test]
    async fn test_override_default_handler() {
        let mut srv = Server::builder()
            .on_request(
                method::SHUTDOWN,
                FnRequestHandler::new(|_params: Value, _client: Client| async move {
                    Ok(json!({"bye": true}))
                }),
            )
            .build()
            .unwrap();
        srv.dispatch(req(0, method::INITIALIZE, None)).await.unwrap();
        let resp = srv.dispatch(req(1, method::SHUTDOWN, None)).await.unwrap().unwrap();
        assert_eq!(resp.result(), Some(&json!({"bye": true})));
        assert_eq!(srv.state(), ServerState::ShuttingDown);
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let handler = || {
            FnNotificationHandler::new(|_params: Value, _client: Client| async move { Ok(()) })
        };
        let result = Server::builder()
            .on_notification("custom/ping", handler())
            .on_notification("custom/ping", handler())
            .build();
        assert!(matches!(
            result,
            Err(BspError::DuplicateMethod { ref method }) if method == "custom/ping"
        ));
    }

    #[tokio::test]
    async fn test_failing_notification_is_fatal() {
        let mut srv = Server::builder()
            .on_notification(
                "custom/broken",
                TypedNotificationHandler::new(
                    |_p: RegisterForChangesParams, _client: Client| async move { Ok(()) },
                ),
            )
            .build()
            .unwrap();
        srv.dispatch(req(0, method::INITIALIZE, None)).await.unwrap();
        let err = srv
            .dispatch(note("custom/broken", Some(json!({"uri": 5}))))
            .await
            .unwrap_err();
        assert!(matches!(err, BspError::NotificationFailed { ref method, .. } if method == "custom/broken"));
    }

    #[tokio::test]
    async fn test_shutdown_then_requests_rejected() {
        let mut srv = initialized_server().await;
        let resp = srv.dispatch(req(1, method::SHUTDOWN, None)).await.unwrap().unwrap();
        assert_eq!(resp.result(), Some(&json!({})));
        assert_eq!(srv.state(), ServerState::ShuttingDown);

        let resp = srv
            .dispatch(req(2, method::WORKSPACE_BUILD_TARGETS, None))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resp.rpc_error().unwrap().code, ERR_CODE_INVALID_REQ);
    }

    #[tokio::test]
    async fn test_inbound_response_ignored() {
        let mut srv = initialized_server().await;
        let resp = srv
            .dispatch(Response::ok(RequestId::Number(1), json!(null)).into())
            .await
            .unwrap();
        assert!(resp.is_none());
    }

    #[tokio::test]
    async fn test_client_helpers_queue_in_order() {
        let mut srv = test_server();
        let client = srv.client();
        client
            .did_change_build_target(vec![BuildTargetEvent {
                target: BuildTargetIdentifier::new("t"),
                kind: Some(BuildTargetEventKind::Changed),
                data: None,
            }])
            .unwrap();
        client
            .source_kit_options_changed(
                "file:///a.swift",
                SourceKitOptions {
                    options: vec!["-O".into()],
                    working_directory: None,
                },
            )
            .unwrap();

        let queued = srv.take_notifications();
        assert_eq!(queued[0].method, method::BUILD_TARGET_DID_CHANGE);
        assert_eq!(queued[1].method, method::SOURCEKIT_OPTIONS_CHANGED);
        assert_eq!(
            queued[1].params.as_ref().unwrap()["updatedOptions"]["options"],
            json!(["-O"])
        );
    }

    // ── serve loop ──

    #[tokio::test]
    async fn test_serve_full_session() {
        let mut srv = test_server();
        let input = frames(&[
            req(1, method::INITIALIZE, Some(json!({}))),
            note(method::INITIALIZED, Some(json!({}))),
            req(2, method::WORKSPACE_BUILD_TARGETS, None),
            note(method::REGISTER_FOR_CHANGES, Some(json!({"uri": "file:///a", "action": "register"}))),
            req(3, method::SHUTDOWN, None),
            note(method::EXIT, None),
        ]);

        let (outcome, replies) = run(&mut srv, &input).await;
        outcome.unwrap();
        assert_eq!(srv.state(), ServerState::Exited);

        let ids: Vec<Option<&RequestId>> = replies.iter().map(Message::id).collect();
        assert_eq!(
            ids,
            vec![
                Some(&RequestId::Number(1)),
                Some(&RequestId::Number(2)),
                None,
                Some(&RequestId::Number(3)),
            ]
        );
        assert_eq!(replies[2].method(), Some(method::BUILD_TARGET_DID_CHANGE));
    }

    #[tokio::test]
    async fn test_serve_stops_at_exit_with_input_remaining() {
        let mut srv = test_server();
        let input = frames(&[
            req(1, method::INITIALIZE, None),
            note(method::EXIT, None),
            req(2, method::SHUTDOWN, None),
            req(3, method::WORKSPACE_BUILD_TARGETS, None),
        ]);

        let (outcome, replies) = run(&mut srv, &input).await;
        outcome.unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].id(), Some(&RequestId::Number(1)));
    }

    #[tokio::test]
    async fn test_exit_request_is_answered() {
        let mut srv = test_server();
        let input = frames(&[
            req(1, method::INITIALIZE, None),
            req(2, method::EXIT, None),
            req(3, method::SHUTDOWN, None),
        ]);

        let (outcome, replies) = run(&mut srv, &input).await;
        outcome.unwrap();
        assert_eq!(srv.state(), ServerState::Exited);
        let ids: Vec<Option<&RequestId>> = replies.iter().map(Message::id).collect();
        assert_eq!(ids, vec![Some(&RequestId::Number(1)), Some(&RequestId::Number(2))]);
    }

    #[tokio::test]
    async fn test_unimplemented_notification_keeps_serving() {
        let mut srv = Server::builder().build().unwrap();
        let input = frames(&[
            req(1, method::INITIALIZE, None),
            note(method::BUILD_TARGET_SOURCES, None),
            req(2, method::SHUTDOWN, None),
        ]);

        let (outcome, replies) = run(&mut srv, &input).await;
        outcome.unwrap();
        let ids: Vec<Option<&RequestId>> = replies.iter().map(Message::id).collect();
        assert_eq!(ids, vec![Some(&RequestId::Number(1)), Some(&RequestId::Number(2))]);
        assert_eq!(replies[1], Message::from(Response::ok(RequestId::Number(2), json!({}))));
        assert_eq!(srv.state(), ServerState::ShuttingDown);
    }

    #[tokio::test]
    async fn test_serve_ends_cleanly_on_eof() {
        let mut srv = test_server();
        let input = frames(&[req(1, method::INITIALIZE, None)]);
        let (outcome, replies) = run(&mut srv, &input).await;
        outcome.unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(srv.state(), ServerState::Initialized);
    }

    #[tokio::test]
    async fn test_serve_aborts_on_framing_violation() {
        let mut srv = test_server();
        let mut input = frames(&[req(1, method::INITIALIZE, None)]);
        input.extend_from_slice(b"X-Garbage: 1\r\n\r\n{}");
        let (outcome, replies) = run(&mut srv, &input).await;
        assert!(matches!(
            outcome,
            Err(BspError::Transport(TransportError::InvalidHeader(_)))
        ));
        assert_eq!(replies.len(), 1);
    }

    struct ClosedPipe;

    impl AsyncWrite for ClosedPipe {
        fn poll_write(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            _buf: &[u8],
        ) -> std::task::Poll<std::io::Result<usize>> {
            std::task::Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into()))
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_serve_ends_cleanly_when_output_closed() {
        let mut srv = test_server();
        let input = frames(&[
            req(1, method::INITIALIZE, None),
            req(2, method::WORKSPACE_BUILD_TARGETS, None),
        ]);
        let mut transport = Transport::new(&input[..], ClosedPipe);
        srv.serve(&mut transport).await.unwrap();
        assert_eq!(srv.state(), ServerState::Initialized);
    }

    #[tokio::test]
    async fn test_serve_preserves_request_order() {
        let mut srv = initialized_server().await;
        let input = frames(&[
            req(10, "nope/a", None),
            req(11, method::WORKSPACE_BUILD_TARGETS, None),
            note("nope/b", None),
            req(12, method::BUILD_TARGET_OUTPUT_PATHS, None),
        ]);
        let (outcome, replies) = run(&mut srv, &input).await;
        outcome.unwrap();
        let ids: Vec<RequestId> = replies.iter().filter_map(|m| m.id().cloned()).collect();
        assert_eq!(
            ids,
            vec![RequestId::Number(10), RequestId::Number(11), RequestId::Number(12)]
        );
        assert_eq!(replies.len(), 3);
    }
}
