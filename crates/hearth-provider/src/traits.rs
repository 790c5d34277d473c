use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::error::ProviderError;

// ── Task runner ───────────────────────────────────────────────────────────────

/// The only asynchronous primitive the core uses. All library state
/// transitions happen inside tasks posted here.
pub trait TaskRunner: Send + Sync {
    fn post_delayed(&self, delay: Duration, task: Box<dyn FnOnce() + Send>);
}

pub trait TaskRunnerExt: TaskRunner {
    fn post(&self, task: impl FnOnce() + Send + 'static) {
        self.post_delayed(Duration::ZERO, Box::new(task));
    }

    fn post_after(&self, delay: Duration, task: impl FnOnce() + Send + 'static) {
        self.post_delayed(delay, Box::new(task));
    }
}

impl<T: TaskRunner + ?Sized> TaskRunnerExt for T {}

// ── Network ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Offline,
    Connecting,
    Connected,
    Failure,
}

/// Connectivity events and raw TLS sockets (used by the push notification
/// channel). The concrete TLS stream is the host's concern.
#[async_trait]
pub trait Network: Send + Sync {
    fn add_connection_changed_callback(&self, callback: Box<dyn Fn() + Send + Sync>);

    fn connection_state(&self) -> ConnectionState;

    async fn open_ssl_socket(
        &self,
        host: &str,
        port: u16,
    ) -> Result<Box<dyn TlsStream>, ProviderError>;
}

pub trait TlsStream:
    tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send
{
}

impl<T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send> TlsStream for T {}

// ── HTTP client ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Patch,
    Put,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Put => "PUT",
        }
    }
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status_code: u16,
    pub content_type: String,
    pub data: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (100..400).contains(&self.status_code)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn send_request(
        &self,
        method: HttpMethod,
        url: &str,
        headers: &[(String, String)],
        body: Option<Vec<u8>>,
    ) -> Result<HttpResponse, ProviderError>;
}

// ── HTTP server ───────────────────────────────────────────────────────────────

/// A request delivered to a registered path-prefix handler.
#[derive(Debug, Clone)]
pub struct IncomingRequest {
    pub path: String,
    /// Value of the `Authorization` header, empty when absent.
    pub auth_header: String,
    pub content_type: String,
    pub data: Vec<u8>,
    /// True when the request arrived over the TLS port.
    pub secure: bool,
}

/// One-shot reply with an HTTP status and a JSON body.
pub type RequestReply = Box<dyn FnOnce(u16, Value) + Send>;

pub type RequestHandler = Arc<dyn Fn(IncomingRequest, RequestReply) + Send + Sync>;

pub trait HttpServer: Send + Sync {
    /// Route plain-HTTP requests under `path_prefix` to `handler`.
    fn add_http_request_handler(&self, path_prefix: &str, handler: RequestHandler);

    /// Route HTTPS requests under `path_prefix` to `handler`.
    fn add_https_request_handler(&self, path_prefix: &str, handler: RequestHandler);

    /// Bound plain-HTTP port, 0 when disabled.
    fn http_port(&self) -> u16;

    /// Bound HTTPS port, 0 when disabled.
    fn https_port(&self) -> u16;

    /// SHA-256 fingerprint of the serving certificate; empty without TLS.
    fn certificate_fingerprint(&self) -> Vec<u8>;

    fn request_timeout(&self) -> Option<Duration> {
        None
    }
}

// ── DNS-SD ────────────────────────────────────────────────────────────────────

pub trait DnsServiceDiscovery: Send + Sync {
    fn publish_service(&self, service_type: &str, port: u16, txt_records: &[String]);

    fn stop_publishing(&self, service_type: &str);

    /// Stable identifier advertised in the `id` TXT field.
    fn id(&self) -> String;
}

// ── Wi-Fi ─────────────────────────────────────────────────────────────────────

/// Completion callback for [`Wifi::connect`].
pub type WifiConnectDone = Box<dyn FnOnce(Result<(), ProviderError>) + Send>;

pub trait Wifi: Send + Sync {
    fn connect(&self, ssid: &str, passphrase: &str, done: WifiConnectDone);

    fn start_access_point(&self, ssid: &str);

    fn stop_access_point(&self);

    fn is_wifi_24_supported(&self) -> bool {
        true
    }

    fn is_wifi_50_supported(&self) -> bool {
        false
    }

    fn connected_ssid(&self) -> String;
}
