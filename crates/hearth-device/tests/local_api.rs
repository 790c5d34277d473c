//! End-to-end exercise of the local surface: a device wired with in-test
//! providers, paired over the Privet endpoints, then driven with commands.

use async_trait::async_trait;
use base64::prelude::*;
use hearth_device::{Device, Providers};
use hearth_privet::{KeyExchanger, Spake2Exchanger};
use hearth_provider::{
    ConnectionState, HttpClient, HttpMethod, HttpResponse, HttpServer, IncomingRequest,
    MemoryConfigStore, Network, ProviderError, RequestHandler, TaskRunner, TlsStream,
};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct ManualTaskRunner;

impl TaskRunner for ManualTaskRunner {
    fn post_delayed(&self, _delay: Duration, _task: Box<dyn FnOnce() + Send>) {}
}

struct NoHttpClient;

#[async_trait]
impl HttpClient for NoHttpClient {
    async fn send_request(
        &self,
        _method: HttpMethod,
        _url: &str,
        _headers: &[(String, String)],
        _body: Option<Vec<u8>>,
    ) -> Result<HttpResponse, ProviderError> {
        Err(ProviderError::Offline)
    }
}

struct OfflineNetwork;

#[async_trait]
impl Network for OfflineNetwork {
    fn add_connection_changed_callback(&self, _callback: Box<dyn Fn() + Send + Sync>) {}

    fn connection_state(&self) -> ConnectionState {
        ConnectionState::Connected
    }

    async fn open_ssl_socket(
        &self,
        _host: &str,
        _port: u16,
    ) -> Result<Box<dyn TlsStream>, ProviderError> {
        Err(ProviderError::NotSupported("tls"))
    }
}

/// Captures registered handlers so tests can inject requests directly.
#[derive(Default)]
struct FakeHttpServer {
    https_handlers: Mutex<Vec<(String, RequestHandler)>>,
}

impl FakeHttpServer {
    fn request(&self, path: &str, auth: &str, body: Value) -> (u16, Value) {
        let handler = {
            let handlers = self.https_handlers.lock().unwrap();
            handlers
                .iter()
                .find(|(prefix, _)| path.starts_with(prefix.as_str()))
                .map(|(_, handler)| handler.clone())
                .expect("no handler for path")
        };
        let request = IncomingRequest {
            path: path.to_string(),
            auth_header: auth.to_string(),
            content_type: "application/json".to_string(),
            data: body.to_string().into_bytes(),
            secure: true,
        };
        let result = Arc::new(Mutex::new(None));
        let result2 = result.clone();
        handler(
            request,
            Box::new(move |status, body| {
                *result2.lock().unwrap() = Some((status, body));
            }),
        );
        let out = result.lock().unwrap().take().expect("handler did not reply");
        out
    }
}

impl HttpServer for FakeHttpServer {
    fn add_http_request_handler(&self, _path_prefix: &str, _handler: RequestHandler) {}

    fn add_https_request_handler(&self, path_prefix: &str, handler: RequestHandler) {
        self.https_handlers
            .lock()
            .unwrap()
            .push((path_prefix.to_string(), handler));
    }

    fn http_port(&self) -> u16 {
        8080
    }

    fn https_port(&self) -> u16 {
        8443
    }

    fn certificate_fingerprint(&self) -> Vec<u8> {
        vec![0xab; 32]
    }
}

struct Fixture {
    device: Arc<Device>,
    server: Arc<FakeHttpServer>,
}

fn fixture() -> Fixture {
    let server = Arc::new(FakeHttpServer::default());
    let device = Device::create(Providers {
        task_runner: Arc::new(ManualTaskRunner),
        http_client: Arc::new(NoHttpClient),
        config_store: Some(Arc::new(MemoryConfigStore::with_defaults(|settings| {
            settings.name = "Lamp".to_string();
            settings.model_id = "AB123".to_string();
        }))),
        network: Some(Arc::new(OfflineNetwork)),
        http_server: Some(server.clone()),
        dns_sd: None,
        wifi: None,
    })
    .unwrap();
    Fixture { device, server }
}

/// Pair over the wire endpoints and return an owner Authorization header.
fn pair_for_owner(f: &Fixture) -> String {
    let code = Arc::new(Mutex::new(String::new()));
    let code2 = code.clone();
    f.device
        .on_pairing_changed(
            move |start| {
                *code2.lock().unwrap() = start.code.clone();
            },
            |_| {},
        )
        .into_iter()
        .for_each(|sub| sub.detach());

    let (status, start) = f.server.request(
        "/privet/v3/pairing/start",
        "",
        json!({"pairing": "pinCode", "crypto": "spake2-p224"}),
    );
    assert_eq!(status, 200, "{start}");
    let session_id = start["sessionId"].as_str().unwrap().to_string();

    let mut client = Spake2Exchanger::new(&code.lock().unwrap());
    let client_commitment = BASE64_STANDARD.encode(client.message());
    let (status, confirm) = f.server.request(
        "/privet/v3/pairing/confirm",
        "",
        json!({"sessionId": session_id, "clientCommitment": client_commitment}),
    );
    assert_eq!(status, 200, "{confirm}");

    // Verify the certificate attestation like a real client would.
    let device_msg = BASE64_STANDARD
        .decode(start["deviceCommitment"].as_str().unwrap())
        .unwrap();
    client.process_message(&device_msg).unwrap();
    let key = client.key().unwrap();
    let fingerprint = BASE64_STANDARD
        .decode(confirm["certFingerprint"].as_str().unwrap())
        .unwrap();
    assert_eq!(fingerprint, vec![0xab; 32]);
    let expected_signature = hearth_auth::hmac_sha256(&key, &fingerprint);
    assert_eq!(
        BASE64_STANDARD.decode(confirm["certSignature"].as_str().unwrap()).unwrap(),
        expected_signature
    );

    let auth_code = BASE64_STANDARD.encode(hearth_auth::hmac_sha256(&key, session_id.as_bytes()));
    let (status, auth) = f.server.request(
        "/privet/v3/auth",
        "",
        json!({"mode": "pairing", "authCode": auth_code, "requestedScope": "owner"}),
    );
    assert_eq!(status, 200, "{auth}");
    assert_eq!(auth["scope"], "owner");
    format!("Privet {}", auth["accessToken"].as_str().unwrap())
}

#[tokio::test]
async fn info_advertises_identity_without_auth() {
    let f = fixture();
    let (status, info) = f.server.request("/privet/info", "", json!({}));
    assert_eq!(status, 200);
    assert_eq!(info["name"], "Lamp");
    assert_eq!(info["modelManifestId"], "AB123");
    assert_eq!(info["endpoints"]["httpsPort"], 8443);
    assert_eq!(info["gcd"]["status"], "unconfigured");
}

#[tokio::test]
async fn paired_owner_runs_builtin_commands_over_privet() {
    let f = fixture();
    let header = pair_for_owner(&f);

    let (status, command) = f.server.request(
        "/privet/v3/commands/execute",
        &header,
        json!({
            "name": "device.setConfig",
            "parameters": {"name": "Renamed", "location": "porch"},
        }),
    );
    assert_eq!(status, 200, "{command}");
    assert_eq!(command["state"], "done");

    assert_eq!(f.device.settings().name, "Renamed");
    assert_eq!(f.device.settings().location, "porch");

    // The state endpoint reflects the change.
    let (status, state) = f.server.request("/privet/v3/state", &header, json!({}));
    assert_eq!(status, 200);
    assert_eq!(state["state"]["device"]["device"]["name"], "Renamed");
}

#[tokio::test]
async fn anonymous_viewer_cannot_change_config() {
    let f = fixture();
    let (status, auth) = f.server.request(
        "/privet/v3/auth",
        "",
        json!({"mode": "anonymous", "requestedScope": "auto"}),
    );
    assert_eq!(status, 200);
    assert_eq!(auth["scope"], "viewer");
    let header = format!("Privet {}", auth["accessToken"].as_str().unwrap());

    let (status, body) = f.server.request(
        "/privet/v3/commands/execute",
        &header,
        json!({"name": "device.setConfig", "parameters": {"name": "Hacked"}}),
    );
    assert_eq!(status, 403, "{body}");
    assert_eq!(f.device.settings().name, "Lamp");
}

#[tokio::test]
async fn command_defs_cover_builtin_traits() {
    let f = fixture();
    let header = pair_for_owner(&f);
    let (status, defs) = f.server.request("/privet/v3/commandDefs", &header, json!({}));
    assert_eq!(status, 200);
    for name in ["device", "privet", "_accessRevocationList"] {
        assert!(defs["commandDefs"][name].is_object(), "missing {name}");
    }
}
