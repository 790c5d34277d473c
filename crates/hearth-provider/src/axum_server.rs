use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::{Json, Router};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::error::ProviderError;
use crate::traits::{HttpServer, IncomingRequest, RequestHandler};

#[derive(Clone, Default)]
struct Handlers {
    routes: Arc<Mutex<Vec<(String, RequestHandler)>>>,
}

impl Handlers {
    fn add(&self, prefix: &str, handler: RequestHandler) {
        let mut routes = self.routes.lock().unwrap_or_else(|e| e.into_inner());
        routes.push((prefix.to_string(), handler));
        // Longest prefix wins.
        routes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
    }

    fn find(&self, path: &str) -> Option<RequestHandler> {
        self.routes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|(prefix, _)| path.starts_with(prefix.as_str()))
            .map(|(_, handler)| handler.clone())
    }
}

/// HTTP server provider backed by `axum`. Serves plain HTTP; when the
/// deployment terminates TLS in front of it, pass the certificate
/// fingerprint so pairing can attest the certificate.
pub struct AxumHttpServer {
    http_handlers: Handlers,
    https_handlers: Handlers,
    http_port: u16,
    https_port: u16,
    certificate_fingerprint: Vec<u8>,
}

impl AxumHttpServer {
    /// Bind `addr` and start serving in the background.
    pub async fn bind(addr: SocketAddr) -> Result<Self, ProviderError> {
        Self::bind_with_tls_front(addr, 0, Vec::new()).await
    }

    /// Bind `addr`, declaring an external TLS frontend reachable on
    /// `https_port` with the given certificate fingerprint. Requests are
    /// treated as secure when the frontend marks them with
    /// `X-Forwarded-Proto: https`.
    pub async fn bind_with_tls_front(
        addr: SocketAddr,
        https_port: u16,
        certificate_fingerprint: Vec<u8>,
    ) -> Result<Self, ProviderError> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let http_port = listener.local_addr()?.port();

        let server = AxumHttpServer {
            http_handlers: Handlers::default(),
            https_handlers: Handlers::default(),
            http_port,
            https_port,
            certificate_fingerprint,
        };

        let state = ServeState {
            http: server.http_handlers.clone(),
            https: server.https_handlers.clone(),
        };
        let app = Router::new()
            .fallback(any(dispatch))
            .with_state(state)
            .layer(TraceLayer::new_for_http());

        info!(port = http_port, "http server listening");
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                warn!(error = %e, "http server terminated");
            }
        });
        Ok(server)
    }
}

#[derive(Clone)]
struct ServeState {
    http: Handlers,
    https: Handlers,
}

async fn dispatch(
    State(state): State<ServeState>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    };
    let secure = header("x-forwarded-proto").eq_ignore_ascii_case("https");
    let path = uri.path().to_string();

    let handlers = if secure { &state.https } else { &state.http };
    let Some(handler) = handlers.find(&path) else {
        return (StatusCode::NOT_FOUND, Json(json!({"error": "notFound"}))).into_response();
    };

    let request = IncomingRequest {
        path,
        auth_header: header("authorization"),
        content_type: header("content-type"),
        data: body.to_vec(),
        secure,
    };

    let (tx, rx) = oneshot::channel::<(u16, serde_json::Value)>();
    let tx = Mutex::new(Some(tx));
    handler(
        request,
        Box::new(move |status, body| {
            if let Some(tx) = tx.lock().unwrap_or_else(|e| e.into_inner()).take() {
                let _ = tx.send((status, body));
            }
        }),
    );

    match rx.await {
        Ok((status, body)) => (
            StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            Json(body),
        )
            .into_response(),
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": "handler dropped the reply"})),
        )
            .into_response(),
    }
}

impl HttpServer for AxumHttpServer {
    fn add_http_request_handler(&self, path_prefix: &str, handler: RequestHandler) {
        self.http_handlers.add(path_prefix, handler);
    }

    fn add_https_request_handler(&self, path_prefix: &str, handler: RequestHandler) {
        self.https_handlers.add(path_prefix, handler);
    }

    fn http_port(&self) -> u16 {
        self.http_port
    }

    fn https_port(&self) -> u16 {
        self.https_port
    }

    fn certificate_fingerprint(&self) -> Vec<u8> {
        self.certificate_fingerprint.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::RequestReply;

    #[tokio::test]
    async fn routes_by_longest_prefix_and_replies() {
        let server = AxumHttpServer::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();

        server.add_http_request_handler(
            "/privet/",
            Arc::new(|_req: IncomingRequest, reply: RequestReply| {
                reply(200, json!({"which": "generic"}));
            }),
        );
        server.add_http_request_handler(
            "/privet/info",
            Arc::new(|_req: IncomingRequest, reply: RequestReply| {
                reply(200, json!({"which": "info"}));
            }),
        );

        let base = format!("http://127.0.0.1:{}", server.http_port());
        let info: serde_json::Value = reqwest::get(format!("{base}/privet/info"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(info["which"], "info");

        let generic: serde_json::Value = reqwest::get(format!("{base}/privet/v3/state"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(generic["which"], "generic");

        let missing = reqwest::get(format!("{base}/other")).await.unwrap();
        assert_eq!(missing.status().as_u16(), 404);
    }
}
