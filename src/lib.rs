//! `bspserver`: a Rust library for building Build Server Protocol servers.
//!
//! Frames JSON-RPC messages with `Content-Length` headers over any async byte
//! stream, routes requests and notifications to typed handlers, and writes
//! responses and server-originated notifications back. A default table answers
//! the BSP lifecycle (`build/initialize`, `build/initialized`, `build/shutdown`,
//! `build/exit`) and serves build-graph queries from a JSON [`ServerConfig`].
//! Any method can be replaced per instance.
//!
//! # Quick start
//!
//! ```rust
//! use bspserver::{Client, Server, Transport, TypedRequestHandler, bsp};
//! use serde_json::json;
//!
//! # async fn run() -> Result<(), bspserver::BspError> {
//! let mut server = Server::builder()
//!     .server_info("my-build-server", "0.1.0")
//!     .language_ids(["swift"])
//!     .on_request(
//!         bsp::method::BUILD_TARGET_SOURCES,
//!         TypedRequestHandler::new(|p: bsp::TargetsParams, _client: Client| async move {
//!             Ok(json!({ "items": [], "requested": p.targets.len() }))
//!         }),
//!     )
//!     .build()?;
//!
//! // Serve over stdin/stdout until `build/exit` or end of input.
//! let mut transport = Transport::stdio();
//! server.serve(&mut transport).await?;
//! # Ok(())
//! # }
//! ```

pub mod bsp;
mod defaults;
pub mod loader;
pub mod server;
pub mod transport;
pub mod types;

// Re-export the most commonly used items at the crate root.
pub use loader::{OnRegister, ServerConfig, load_config, parse_config};
pub use server::{
    Client, FnNotificationHandler, FnRequestHandler, Handler, NotificationHandler, RequestHandler,
    Server, ServerBuilder, ServerState, TypedNotificationHandler, TypedRequestHandler,
};
pub use transport::Transport;
pub use types::{
    BspError, Message, Notification, Request, RequestError, RequestId, Response, ResponsePayload,
    RpcError, TransportError,
};
