//! Provider interfaces consumed by the core, plus default implementations
//! for hosts that do not need custom plumbing: a tokio task runner, a
//! reqwest HTTP client, an axum HTTP server and file/memory config stores.

mod axum_server;
mod config_store;
mod error;
mod reqwest_client;
mod task_runner;
mod traits;

pub use axum_server::AxumHttpServer;
pub use config_store::{FileConfigStore, MemoryConfigStore};
pub use error::ProviderError;
pub use reqwest_client::ReqwestHttpClient;
pub use task_runner::TokioTaskRunner;
pub use traits::{
    ConnectionState, DnsServiceDiscovery, HttpClient, HttpMethod, HttpResponse, HttpServer,
    IncomingRequest, Network, RequestHandler, RequestReply, TaskRunner, TaskRunnerExt, TlsStream,
    Wifi, WifiConnectDone,
};
