use base64::prelude::*;
use hearth_provider::Network;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

/// Receiver side of notification-channel events, implemented by the sync
/// engine.
pub trait NotificationDelegate: Send + Sync {
    fn on_connected(&self, channel_name: &str);
    fn on_disconnected(&self);
    fn on_permanent_failure(&self);
    /// A command was created server-side. The payload may be empty when the
    /// command was too large for the channel; fetch then.
    fn on_command_created(&self, command: &Value);
    fn on_device_deleted(&self, cloud_id: &str);
}

pub trait NotificationChannel: Send + Sync {
    fn name(&self) -> &'static str;
    fn start(&self, delegate: Arc<dyn NotificationDelegate>);
    fn stop(&self);
    fn is_connected(&self) -> bool;
    /// Extra fields for the device resource `channel` object.
    fn add_channel_parameters(&self, _channel: &mut Map<String, Value>) {}
}

// ── Pull channel ──────────────────────────────────────────────────────────────

/// Default polling interval while no push channel is connected.
pub const ACTIVE_PULL_INTERVAL: Duration = Duration::from_secs(7);
/// Backup polling interval once push is up.
pub const BACKUP_PULL_INTERVAL: Duration = Duration::from_secs(30);

/// Periodic polling channel. Always available; the engine widens the
/// interval once the push channel connects.
pub struct PullChannel {
    interval: Mutex<Duration>,
    generation: AtomicU64,
    delegate: Mutex<Option<Weak<dyn NotificationDelegate>>>,
    runtime: tokio::runtime::Handle,
}

impl PullChannel {
    pub fn new(interval: Duration, runtime: tokio::runtime::Handle) -> Arc<PullChannel> {
        Arc::new(PullChannel {
            interval: Mutex::new(interval),
            generation: AtomicU64::new(0),
            delegate: Mutex::new(None),
            runtime,
        })
    }

    pub fn update_pull_interval(self: &Arc<Self>, interval: Duration) {
        *self.interval.lock().unwrap_or_else(|e| e.into_inner()) = interval;
        // Restart the timer loop so the new interval takes effect now.
        let delegate = self
            .delegate
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(delegate) = delegate.and_then(|weak| weak.upgrade()) {
            self.start(delegate);
        }
    }

    fn current_interval(&self) -> Duration {
        *self.interval.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl NotificationChannel for Arc<PullChannel> {
    fn name(&self) -> &'static str {
        "pull"
    }

    fn start(&self, delegate: Arc<dyn NotificationDelegate>) {
        *self.delegate.lock().unwrap_or_else(|e| e.into_inner()) =
            Some(Arc::downgrade(&delegate));
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let weak = Arc::downgrade(self);
        self.runtime.spawn(async move {
            loop {
                let (interval, delegate) = {
                    let Some(channel) = weak.upgrade() else { return };
                    if channel.generation.load(Ordering::SeqCst) != generation {
                        return;
                    }
                    let delegate = channel
                        .delegate
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .clone();
                    (channel.current_interval(), delegate)
                };
                tokio::time::sleep(interval).await;
                {
                    let Some(channel) = weak.upgrade() else { return };
                    if channel.generation.load(Ordering::SeqCst) != generation {
                        return;
                    }
                }
                let Some(delegate) = delegate.and_then(|weak| weak.upgrade()) else {
                    return;
                };
                debug!("pull channel tick");
                delegate.on_command_created(&Value::Object(Map::new()));
            }
        });
    }

    fn stop(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        *self.delegate.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    fn is_connected(&self) -> bool {
        true
    }
}

// ── Push channel ──────────────────────────────────────────────────────────────

/// XMPP-style push channel over a host-provided TLS socket. Authenticates
/// with the robot account's OAuth token and turns push stanzas into
/// delegate events.
pub struct PushChannel {
    endpoint: String,
    network: Arc<dyn Network>,
    connected: AtomicBool,
    generation: AtomicU64,
    credentials: Mutex<(String, String)>,
    runtime: tokio::runtime::Handle,
}

impl PushChannel {
    pub fn new(
        endpoint: String,
        network: Arc<dyn Network>,
        runtime: tokio::runtime::Handle,
    ) -> Arc<PushChannel> {
        Arc::new(PushChannel {
            endpoint,
            network,
            connected: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            credentials: Mutex::new((String::new(), String::new())),
            runtime,
        })
    }

    pub fn set_credentials(&self, account: &str, access_token: &str) {
        *self.credentials.lock().unwrap_or_else(|e| e.into_inner()) =
            (account.to_string(), access_token.to_string());
    }

    async fn run(
        self: Arc<Self>,
        generation: u64,
        delegate: Arc<dyn NotificationDelegate>,
    ) {
        let (host, port) = match self.endpoint.rsplit_once(':') {
            Some((host, port)) => match port.parse::<u16>() {
                Ok(port) => (host.to_string(), port),
                Err(_) => {
                    warn!(endpoint = %self.endpoint, "invalid push endpoint");
                    delegate.on_permanent_failure();
                    return;
                }
            },
            None => (self.endpoint.clone(), 5223),
        };

        let mut stream = match self.network.open_ssl_socket(&host, port).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "push channel socket failed");
                delegate.on_permanent_failure();
                return;
            }
        };

        let (account, token) = self
            .credentials
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let auth = BASE64_STANDARD.encode(format!("\0{account}\0{token}"));

        let open_stream = format!(
            "<stream:stream to=\"{host}\" xmlns=\"jabber:client\" \
             xmlns:stream=\"http://etherx.jabber.org/streams\" version=\"1.0\">"
        );
        let auth_stanza = format!(
            "<auth xmlns=\"urn:ietf:params:xml:ns:xmpp-sasl\" mechanism=\"X-OAUTH2\" \
             auth:service=\"oauth2\" xmlns:auth=\"http://www.google.com/talk/protocol/auth\">\
             {auth}</auth>"
        );

        let handshake = async {
            stream.write_all(open_stream.as_bytes()).await?;
            read_until(&mut *stream, "<stream:features").await?;
            stream.write_all(auth_stanza.as_bytes()).await?;
            let reply = read_until(&mut *stream, ">").await?;
            if !reply.contains("<success") {
                return Err(std::io::Error::other("authentication rejected"));
            }
            // Restart the stream, bind a resource and subscribe to push.
            stream.write_all(open_stream.as_bytes()).await?;
            read_until(&mut *stream, "<stream:features").await?;
            stream
                .write_all(
                    b"<iq type=\"set\" id=\"0\">\
                      <bind xmlns=\"urn:ietf:params:xml:ns:xmpp-bind\"/></iq>",
                )
                .await?;
            read_until(&mut *stream, "</iq>").await?;
            stream
                .write_all(
                    b"<iq type=\"set\" id=\"1\">\
                      <subscribe xmlns=\"google:push\"><item channel=\"clouddevices\" from=\"clouddevices.google.com\"/>\
                      </subscribe></iq>",
                )
                .await?;
            read_until(&mut *stream, "</iq>").await?;
            Ok::<(), std::io::Error>(())
        };

        if let Err(e) = handshake.await {
            warn!(error = %e, "push channel handshake failed");
            delegate.on_permanent_failure();
            return;
        }

        info!("push channel connected");
        self.connected.store(true, Ordering::SeqCst);
        delegate.on_connected("xmpp");

        let mut buffer = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            if self.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            match stream.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    buffer.extend_from_slice(&chunk[..n]);
                    while let Some(payload) = extract_push_payload(&mut buffer) {
                        dispatch_payload(&payload, &delegate);
                    }
                }
            }
        }

        self.connected.store(false, Ordering::SeqCst);
        if self.generation.load(Ordering::SeqCst) == generation {
            delegate.on_disconnected();
        }
    }
}

impl NotificationChannel for Arc<PushChannel> {
    fn name(&self) -> &'static str {
        "xmpp"
    }

    fn start(&self, delegate: Arc<dyn NotificationDelegate>) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let channel = self.clone();
        self.runtime.spawn(channel.run(generation, delegate));
    }

    fn stop(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

async fn read_until(
    stream: &mut (dyn hearth_provider::TlsStream),
    needle: &str,
) -> std::io::Result<String> {
    let mut collected = String::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::Error::other("stream closed during handshake"));
        }
        collected.push_str(&String::from_utf8_lossy(&chunk[..n]));
        if collected.contains(needle) {
            return Ok(collected);
        }
        if collected.len() > 64 * 1024 {
            return Err(std::io::Error::other("oversized handshake reply"));
        }
    }
}

/// Pull the JSON payload out of the next complete `<push:data>` element in
/// the buffer, if any. The data is base64 inside the element body.
fn extract_push_payload(buffer: &mut Vec<u8>) -> Option<String> {
    const OPEN: &[u8] = b"<push:data>";
    const CLOSE: &[u8] = b"</push:data>";
    let start = find_subslice(buffer, OPEN)?;
    let end = find_subslice(&buffer[start..], CLOSE)? + start;
    let inner: Vec<u8> = buffer[start + OPEN.len()..end]
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    buffer.drain(..end + CLOSE.len());
    let decoded = BASE64_STANDARD.decode(&inner).ok()?;
    Some(String::from_utf8_lossy(&decoded).into_owned())
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn dispatch_payload(payload: &str, delegate: &Arc<dyn NotificationDelegate>) {
    let Ok(value) = serde_json::from_str::<Value>(payload) else {
        warn!("unparseable push payload");
        return;
    };
    match value.get("type").and_then(Value::as_str) {
        Some("COMMAND_CREATED") => {
            let command = value.get("command").cloned().unwrap_or_default();
            delegate.on_command_created(&command);
        }
        Some("DEVICE_DELETED") => {
            let id = value
                .get("deviceId")
                .and_then(Value::as_str)
                .unwrap_or_default();
            delegate.on_device_deleted(id);
        }
        other => debug!(?other, "ignoring push notification"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_push_payloads_across_chunks() {
        let payload = BASE64_STANDARD.encode(r#"{"type":"COMMAND_CREATED"}"#);
        let mut buffer = format!("<message><push:data>{payload}</push:data></message>")
            .into_bytes();
        let extracted = extract_push_payload(&mut buffer).unwrap();
        assert_eq!(extracted, r#"{"type":"COMMAND_CREATED"}"#);
        // Second call finds nothing further.
        assert!(extract_push_payload(&mut buffer).is_none());
    }

    #[test]
    fn incomplete_elements_wait_for_more_data() {
        let mut buffer = b"<push:data>aGVsbG8".to_vec();
        assert!(extract_push_payload(&mut buffer).is_none());
        assert!(!buffer.is_empty());
    }
}
