use chrono::{DateTime, Duration, Utc};
use hearth_config::Config;
use hearth_domain::{Command, DeviceModel, ErrorInfo, ObserverList, Origin, Role, Subscription};
use hearth_provider::{HttpClient, HttpMethod, HttpResponse, Network};
use serde_json::{json, Map, Value};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration as StdDuration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::backoff::{BackoffEntry, BackoffPolicy};
use crate::error::CloudError;
use crate::notification::{
    NotificationChannel, NotificationDelegate, PullChannel, PushChannel, ACTIVE_PULL_INTERVAL,
    BACKUP_PULL_INTERVAL,
};

const DEFAULT_XMPP_ENDPOINT: &str = "talk.google.com:5223";

/// Delay between start-up and the first cloud reconciliation, giving local
/// handlers time to seed their state.
const CONNECT_DELAY: StdDuration = StdDuration::from_secs(5);

/// Externally observable state of the cloud connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcdState {
    Unconfigured,
    Connecting,
    Connected,
    InvalidCredentials,
}

impl GcdState {
    pub fn as_str(&self) -> &'static str {
        match self {
            GcdState::Unconfigured => "unconfigured",
            GcdState::Connecting => "connecting",
            GcdState::Connected => "connected",
            GcdState::InvalidCredentials => "invalidCredentials",
        }
    }
}

impl std::fmt::Display for GcdState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Credentials delivered out-of-band to register the device. Empty fields
/// fall back to the current settings.
#[derive(Debug, Clone, Default)]
pub struct RegistrationData {
    pub ticket_id: String,
    pub oauth_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub api_key: String,
    pub service_url: String,
    pub xmpp_endpoint: String,
}

impl RegistrationData {
    pub fn with_ticket(ticket_id: impl Into<String>) -> Self {
        RegistrationData {
            ticket_id: ticket_id.into(),
            ..Default::default()
        }
    }
}

struct EngineInner {
    gcd_state: GcdState,
    access_token: String,
    access_token_expiration: Option<DateTime<Utc>>,
    last_resource_timestamp: String,
    connected_to_cloud: bool,
    resource_update_in_flight: bool,
    resource_waiters: Vec<oneshot::Sender<Result<(), String>>>,
    fetch_in_flight: bool,
    fetch_queued: bool,
    state_publish_in_flight: bool,
    current_channel: &'static str,
    xmpp_endpoint: String,
    cloud_backoff: BackoffEntry,
    oauth_backoff: BackoffEntry,
}

/// The cloud registration & synchronization engine: OAuth2 token machine,
/// device-resource reconciliation, command fetch and state publication.
pub struct CloudEngine {
    weak_self: Weak<CloudEngine>,
    model: Arc<DeviceModel>,
    config: Arc<Config>,
    http: Arc<dyn HttpClient>,
    network: Option<Arc<dyn Network>>,
    runtime: tokio::runtime::Handle,
    inner: Mutex<EngineInner>,
    pull_channel: Mutex<Option<Arc<PullChannel>>>,
    push_channel: Mutex<Option<Arc<PushChannel>>>,
    on_state_changed: ObserverList<GcdState>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl CloudEngine {
    /// Must be called from within a tokio runtime.
    pub fn new(
        model: Arc<DeviceModel>,
        config: Arc<Config>,
        http: Arc<dyn HttpClient>,
        network: Option<Arc<dyn Network>>,
    ) -> Arc<CloudEngine> {
        let engine = Arc::new_cyclic(|weak: &Weak<CloudEngine>| CloudEngine {
            weak_self: weak.clone(),
            model,
            config,
            http,
            network,
            runtime: tokio::runtime::Handle::current(),
            inner: Mutex::new(EngineInner {
                gcd_state: GcdState::Unconfigured,
                access_token: String::new(),
                access_token_expiration: None,
                last_resource_timestamp: String::new(),
                connected_to_cloud: false,
                resource_update_in_flight: false,
                resource_waiters: Vec::new(),
                fetch_in_flight: false,
                fetch_queued: false,
                state_publish_in_flight: false,
                current_channel: "pull",
                xmpp_endpoint: DEFAULT_XMPP_ENDPOINT.to_string(),
                cloud_backoff: BackoffEntry::new(BackoffPolicy::default()),
                oauth_backoff: BackoffEntry::new(BackoffPolicy::default()),
            }),
            pull_channel: Mutex::new(None),
            push_channel: Mutex::new(None),
            on_state_changed: ObserverList::new(),
            subscriptions: Mutex::new(Vec::new()),
        });

        // Push state deltas and refreshed definitions whenever connected.
        let weak = engine.weak_self.clone();
        let sub = engine.model.on_state_changed(move |_| {
            if let Some(engine) = weak.upgrade() {
                if engine.is_connected_to_cloud() {
                    engine.publish_state_updates();
                }
            }
        });
        let weak = engine.weak_self.clone();
        let sub2 = engine.model.on_trait_defs_changed(move |_| {
            if let Some(engine) = weak.upgrade() {
                if engine.is_connected_to_cloud() {
                    engine.update_device_resource_deferred();
                }
            }
        });
        let mut subs = engine.subscriptions.lock().unwrap_or_else(|e| e.into_inner());
        subs.push(sub);
        subs.push(sub2);
        drop(subs);
        engine
    }

    /// Begin background synchronization if the device already holds
    /// registration credentials.
    pub fn start(self: &Arc<Self>) {
        if !self.have_registration_credentials() {
            return;
        }
        self.start_notification_channels();
        self.set_gcd_state(GcdState::Connecting);
        let engine = self.clone();
        self.runtime.spawn(async move {
            tokio::time::sleep(CONNECT_DELAY).await;
            engine.connect_to_cloud().await;
        });
    }

    pub fn gcd_state(&self) -> GcdState {
        self.lock().gcd_state
    }

    pub fn on_gcd_state_changed(
        &self,
        callback: impl Fn(&GcdState) + Send + Sync + 'static,
    ) -> Subscription {
        callback(&self.gcd_state());
        self.on_state_changed.add(callback)
    }

    pub fn is_connected_to_cloud(&self) -> bool {
        self.lock().connected_to_cloud
    }

    // ── Registration ──────────────────────────────────────────────────────

    /// Exchange a registration ticket for durable device credentials and
    /// connect.
    pub async fn register(self: &Arc<Self>, data: RegistrationData) -> Result<(), CloudError> {
        if self.have_registration_credentials() {
            return Err(CloudError::UnexpectedResponse(
                "device is already registered".to_string(),
            ));
        }

        // Commit service endpoints delivered with the ticket.
        {
            let mut tx = self.config.edit();
            if !data.oauth_url.is_empty() {
                tx.set_oauth_url(&data.oauth_url);
            }
            if !data.service_url.is_empty() {
                tx.set_service_url(&data.service_url);
            }
            if !data.client_id.is_empty() {
                tx.set_client_id(&data.client_id);
            }
            if !data.client_secret.is_empty() {
                tx.set_client_secret(&data.client_secret);
            }
            if !data.api_key.is_empty() {
                tx.set_api_key(&data.api_key);
            }
            tx.commit();
        }
        if !data.xmpp_endpoint.is_empty() {
            self.lock().xmpp_endpoint = data.xmpp_endpoint.clone();
        }

        let settings = self.config.settings();
        let ticket = &data.ticket_id;

        let patch_url = self.service_url(
            &format!("registrationTickets/{ticket}"),
            &[("key", &settings.api_key)],
        );
        let body = json!({
            "id": ticket,
            "oauthClientId": settings.client_id,
            "deviceDraft": self.build_device_resource(),
        });
        let reply = self.raw_json_request(HttpMethod::Patch, &patch_url, Some(body)).await?;
        expect_success(&reply)?;

        let finalize_url = self.service_url(
            &format!("registrationTickets/{ticket}/finalize"),
            &[("key", &settings.api_key)],
        );
        let reply = self
            .raw_json_request(HttpMethod::Post, &finalize_url, None)
            .await?;
        expect_success(&reply)?;

        let robot_account = reply
            .body
            .get("robotAccountEmail")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let auth_code = reply
            .body
            .get("robotAccountAuthorizationCode")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let device_draft = reply.body.get("deviceDraft").cloned().unwrap_or_default();
        let cloud_id = device_draft
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if robot_account.is_empty() || auth_code.is_empty() || cloud_id.is_empty() {
            return Err(CloudError::UnexpectedResponse(
                "device account missing in response".to_string(),
            ));
        }
        self.update_resource_timestamp(&device_draft);

        // Exchange the robot account's authorization code for tokens.
        let form = [
            ("code", auth_code.as_str()),
            ("client_id", settings.client_id.as_str()),
            ("client_secret", settings.client_secret.as_str()),
            ("redirect_uri", "oob"),
            ("scope", "https://www.googleapis.com/auth/clouddevices"),
            ("grant_type", "authorization_code"),
        ];
        let reply = self.oauth_request(&form).await?;
        let access_token = reply
            .body
            .get("access_token")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let refresh_token = reply
            .body
            .get("refresh_token")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let expires_in = reply.body.get("expires_in").and_then(Value::as_i64).unwrap_or(0);
        if access_token.is_empty() || refresh_token.is_empty() || expires_in <= 0 {
            return Err(CloudError::UnexpectedResponse(
                "device access_token missing in response".to_string(),
            ));
        }

        {
            let mut inner = self.lock();
            inner.access_token = access_token;
            inner.access_token_expiration = Some(Utc::now() + Duration::seconds(expires_in));
        }
        let mut tx = self.config.edit();
        tx.set_cloud_id(&cloud_id)
            .set_robot_account(&robot_account)
            .set_refresh_token(&refresh_token);
        tx.commit();

        info!(cloud_id = %cloud_id, "device registered");
        self.start_notification_channels();
        self.set_gcd_state(GcdState::Connecting);
        let engine = self.clone();
        self.runtime.spawn(async move {
            engine.connect_to_cloud().await;
        });
        Ok(())
    }

    // ── Token machine ─────────────────────────────────────────────────────

    async fn ensure_access_token(self: &Arc<Self>) -> Result<(), CloudError> {
        let expired = {
            let inner = self.lock();
            inner.access_token.is_empty()
                || inner
                    .access_token_expiration
                    .map_or(true, |at| at <= Utc::now())
        };
        if expired {
            self.refresh_access_token().await?;
        }
        Ok(())
    }

    /// Exchange the refresh token for a fresh access token, retrying
    /// transport failures under the OAuth backoff.
    pub async fn refresh_access_token(self: &Arc<Self>) -> Result<(), CloudError> {
        loop {
            if !self.have_registration_credentials() {
                return Err(CloudError::NotRegistered);
            }
            let wait = {
                let inner = self.lock();
                inner
                    .oauth_backoff
                    .should_reject_request()
                    .then(|| inner.oauth_backoff.time_until_release())
            };
            if let Some(wait) = wait {
                debug!(?wait, "refresh delayed by backoff");
                tokio::time::sleep(wait).await;
            }

            let settings = self.config.settings();
            let form = [
                ("refresh_token", settings.refresh_token.as_str()),
                ("client_id", settings.client_id.as_str()),
                ("client_secret", settings.client_secret.as_str()),
                ("grant_type", "refresh_token"),
            ];
            match self.oauth_request(&form).await {
                Err(CloudError::Transport(e)) => {
                    warn!(error = %e, "token refresh transport failure");
                    self.lock().oauth_backoff.inform_of_request(false);
                    continue;
                }
                Err(e) => return Err(e),
                Ok(reply) => {
                    self.lock().oauth_backoff.inform_of_request(true);
                    let access_token = reply
                        .body
                        .get("access_token")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    let expires_in =
                        reply.body.get("expires_in").and_then(Value::as_i64).unwrap_or(0);
                    if access_token.is_empty() || expires_in <= 0 {
                        return Err(CloudError::UnexpectedResponse(
                            "access token unavailable".to_string(),
                        ));
                    }
                    info!(expires_in, "access token refreshed");
                    {
                        let mut inner = self.lock();
                        inner.access_token = access_token.clone();
                        inner.access_token_expiration =
                            Some(Utc::now() + Duration::seconds(expires_in));
                    }
                    // A disconnected push channel means stale credentials;
                    // retry with the fresh token.
                    let push = self.push_channel.lock().unwrap_or_else(|e| e.into_inner()).clone();
                    if let Some(push) = push {
                        if !NotificationChannel::is_connected(&push) {
                            push.set_credentials(
                                &self.config.settings().robot_account,
                                &access_token,
                            );
                            NotificationChannel::start(&push, self.as_delegate());
                        }
                    }
                    return Ok(());
                }
            }
        }
    }

    /// One OAuth form POST, with `invalid_grant` handling.
    async fn oauth_request(
        self: &Arc<Self>,
        form: &[(&str, &str)],
    ) -> Result<JsonReply, CloudError> {
        let url = build_url(&self.config.settings().oauth_url, "token", &[]);
        let body = encode_form(form).into_bytes();
        let headers = vec![(
            "Content-Type".to_string(),
            "application/x-www-form-urlencoded".to_string(),
        )];
        let response = self
            .http
            .send_request(HttpMethod::Post, &url, &headers, Some(body))
            .await
            .map_err(|e| CloudError::Transport(e.to_string()))?;
        let reply = parse_json_response(&response)?;
        if reply.status >= 400 {
            let code = reply
                .body
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unexpected_response")
                .to_string();
            let message = reply
                .body
                .get("error_description")
                .and_then(Value::as_str)
                .unwrap_or("unexpected OAuth error")
                .to_string();
            if code == "invalid_grant" {
                info!("the device's registration has been revoked");
                self.mark_unregistered();
            }
            return Err(CloudError::OAuth { code, message });
        }
        Ok(reply)
    }

    // ── Authorized cloud requests ─────────────────────────────────────────

    /// Send an authorized JSON request, recovering transient failures:
    /// 401 refreshes the token, 5xx and rate limiting retry under backoff.
    pub async fn cloud_request(
        self: &Arc<Self>,
        method: HttpMethod,
        url: &str,
        body: Option<&Value>,
    ) -> Result<Value, CloudError> {
        loop {
            if !self.have_registration_credentials() {
                return Err(CloudError::NotRegistered);
            }
            let wait = {
                let inner = self.lock();
                inner
                    .cloud_backoff
                    .should_reject_request()
                    .then(|| inner.cloud_backoff.time_until_release())
            };
            if let Some(wait) = wait {
                debug!(?wait, "cloud request delayed by backoff");
                tokio::time::sleep(wait).await;
            }

            self.ensure_access_token().await?;

            let headers = vec![
                (
                    "Authorization".to_string(),
                    format!("Bearer {}", self.lock().access_token),
                ),
                ("Content-Type".to_string(), "application/json".to_string()),
            ];
            let payload = body.map(|b| b.to_string().into_bytes());
            let response = match self
                .http
                .send_request(method, url, &headers, payload)
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    warn!(error = %e, url, "cloud request transport failure");
                    self.retry_backoff();
                    continue;
                }
            };

            if response.status_code == 401 {
                self.lock().cloud_backoff.inform_of_request(true);
                self.lock().access_token.clear();
                self.refresh_access_token().await?;
                continue;
            }
            if response.status_code >= 500 {
                debug!(status = response.status_code, "server failure, will retry");
                self.retry_backoff();
                continue;
            }

            let reply = match parse_json_response(&response) {
                Ok(reply) => reply,
                Err(e) => {
                    self.lock().cloud_backoff.inform_of_request(true);
                    return Err(e);
                }
            };
            if reply.status >= 400 {
                let error = parse_server_error(&reply.body);
                if reply.status == 403 && error.has_server_code("rateLimitExceeded") {
                    debug!("rate limited, will retry");
                    self.retry_backoff();
                    continue;
                }
                self.lock().cloud_backoff.inform_of_request(true);
                return Err(error);
            }

            self.lock().cloud_backoff.inform_of_request(true);
            self.set_gcd_state(GcdState::Connected);
            return Ok(reply.body);
        }
    }

    fn retry_backoff(&self) {
        self.set_gcd_state(GcdState::Connecting);
        self.lock().cloud_backoff.inform_of_request(false);
    }

    // ── Device resource ───────────────────────────────────────────────────

    /// Upload the current device resource. Concurrent callers coalesce onto
    /// the in-flight update; their turn comes when it finishes.
    pub async fn update_device_resource(self: &Arc<Self>) -> Result<(), CloudError> {
        let (tx, rx) = oneshot::channel();
        let start_worker = {
            let mut inner = self.lock();
            inner.resource_waiters.push(tx);
            if inner.resource_update_in_flight {
                false
            } else {
                inner.resource_update_in_flight = true;
                true
            }
        };
        if start_worker {
            let engine = self.clone();
            self.runtime.spawn(async move {
                engine.run_resource_updates().await;
            });
        }
        match rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(message)) => Err(CloudError::UnexpectedResponse(message)),
            Err(_) => Err(CloudError::UnexpectedResponse(
                "resource update abandoned".to_string(),
            )),
        }
    }

    pub fn update_device_resource_deferred(self: &Arc<Self>) {
        let engine = self.clone();
        self.runtime.spawn(async move {
            if let Err(e) = engine.update_device_resource().await {
                warn!(error = %e, "device resource update failed");
            }
        });
    }

    async fn run_resource_updates(self: &Arc<Self>) {
        loop {
            let waiters = {
                let mut inner = self.lock();
                if inner.resource_waiters.is_empty() {
                    inner.resource_update_in_flight = false;
                    return;
                }
                std::mem::take(&mut inner.resource_waiters)
            };
            let outcome = self.do_resource_update().await.map_err(|e| e.to_string());
            for waiter in waiters {
                let _ = waiter.send(outcome.clone());
            }
        }
    }

    async fn do_resource_update(self: &Arc<Self>) -> Result<(), CloudError> {
        loop {
            let timestamp = self.lock().last_resource_timestamp.clone();
            if timestamp.is_empty() {
                // Learn the server-side timestamp before the first PUT.
                let info = self
                    .cloud_request(HttpMethod::Get, &self.device_url("", &[]), None)
                    .await?;
                if !self.update_resource_timestamp(&info) {
                    return Err(CloudError::UnexpectedResponse(
                        "device resource timestamp is missing".to_string(),
                    ));
                }
                continue;
            }

            let resource = self.build_device_resource();
            let url = self.device_url("", &[("lastUpdateTimeMs", &timestamp)]);
            match self
                .cloud_request(HttpMethod::Put, &url, Some(&resource))
                .await
            {
                Ok(info) => {
                    self.update_resource_timestamp(&info);
                    return Ok(());
                }
                Err(e) if e.has_server_code("invalid_last_update_time_ms") => {
                    // Out of date: refetch the timestamp and retry.
                    self.lock().last_resource_timestamp.clear();
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn update_resource_timestamp(&self, device_info: &Value) -> bool {
        // Newly created devices may only have "creationTimeMs".
        let timestamp = device_info
            .get("lastUpdateTimeMs")
            .or_else(|| device_info.get("creationTimeMs"))
            .and_then(value_as_string);
        match timestamp {
            Some(timestamp) => {
                self.lock().last_resource_timestamp = timestamp;
                true
            }
            None => {
                warn!("device resource timestamp is missing");
                false
            }
        }
    }

    /// The device resource uploaded to the cloud.
    fn build_device_resource(&self) -> Value {
        let settings = self.config.settings();
        let mut resource = Map::new();
        if !settings.cloud_id.is_empty() {
            resource.insert("id".to_string(), json!(settings.cloud_id));
        }
        resource.insert("name".to_string(), json!(settings.name));
        if !settings.description.is_empty() {
            resource.insert("description".to_string(), json!(settings.description));
        }
        if !settings.location.is_empty() {
            resource.insert("location".to_string(), json!(settings.location));
        }
        resource.insert("modelManifestId".to_string(), json!(settings.model_id));

        let mut channel = Map::new();
        channel.insert(
            "supportedType".to_string(),
            json!(self.lock().current_channel),
        );
        resource.insert("channel".to_string(), Value::Object(channel));
        resource.insert("commandDefs".to_string(), self.command_defs());
        resource.insert("state".to_string(), self.model.state_json());
        Value::Object(resource)
    }

    /// Per-trait command definitions, without the state sections.
    fn command_defs(&self) -> Value {
        let mut out = Map::new();
        if let Value::Object(traits) = self.model.traits_json() {
            for (name, definition) in traits {
                if let Some(commands) = definition.get("commands") {
                    out.insert(name, commands.clone());
                }
            }
        }
        Value::Object(out)
    }

    // ── Connect & commands ────────────────────────────────────────────────

    /// Push the device resource, reconcile outstanding commands, and flush
    /// pending state.
    pub async fn connect_to_cloud(self: &Arc<Self>) {
        self.lock().connected_to_cloud = false;
        if !self.have_registration_credentials() {
            return;
        }
        if let Err(e) = self.update_device_resource().await {
            warn!(error = %e, "initial device resource update failed");
            return;
        }
        info!("device connected to cloud server");
        self.lock().connected_to_cloud = true;

        match self.fetch_commands().await {
            Ok(commands) => self.process_initial_command_list(&commands).await,
            Err(e) => warn!(error = %e, "initial command fetch failed"),
        }
        // Anything that changed while the resource update was in flight.
        self.publish_state_updates();
    }

    async fn fetch_commands(self: &Arc<Self>) -> Result<Vec<Value>, CloudError> {
        {
            let mut inner = self.lock();
            inner.fetch_in_flight = true;
            inner.fetch_queued = false;
        }
        let url = self.service_url(
            "commands/queue",
            &[("deviceId", &self.config.settings().cloud_id)],
        );
        let result = self.cloud_request(HttpMethod::Get, &url, None).await;
        let run_queued = {
            let mut inner = self.lock();
            inner.fetch_in_flight = false;
            std::mem::take(&mut inner.fetch_queued)
        };
        if run_queued {
            self.fetch_and_publish_commands();
        }
        result.map(|json| {
            json.get("commands")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default()
        })
    }

    /// Pull the command queue and publish new commands locally. A request
    /// issued while one is in flight coalesces into exactly one follow-up.
    pub fn fetch_and_publish_commands(self: &Arc<Self>) {
        {
            let mut inner = self.lock();
            if inner.fetch_in_flight {
                inner.fetch_queued = true;
                return;
            }
        }
        let engine = self.clone();
        self.runtime.spawn(async move {
            match engine.fetch_commands().await {
                Ok(commands) => {
                    for command in &commands {
                        engine.publish_command(command);
                    }
                }
                Err(e) => warn!(error = %e, "command fetch failed"),
            }
        });
    }

    /// First reconciliation after connect: commands stuck in
    /// `inProgress|paused|error` are aborted server-side, the rest are
    /// published locally.
    async fn process_initial_command_list(self: &Arc<Self>, commands: &[Value]) {
        for command in commands {
            let state = command.get("state").and_then(Value::as_str).unwrap_or_default();
            if matches!(state, "inProgress" | "paused" | "error") {
                let Some(id) = command.get("id").and_then(Value::as_str) else {
                    warn!("limbo command with no id");
                    continue;
                };
                let mut patch = command.clone();
                patch["state"] = json!("aborted");
                let url = self.service_url(&format!("commands/{id}"), &[]);
                if let Err(e) = self
                    .cloud_request(HttpMethod::Put, &url, Some(&patch))
                    .await
                {
                    warn!(error = %e, id, "failed to abort limbo command");
                }
            } else {
                self.publish_command(command);
            }
        }
    }

    /// Insert a cloud command into the local queue, mirroring its lifecycle
    /// back to the server. Unparseable commands are aborted server-side.
    pub fn publish_command(self: &Arc<Self>, command: &Value) {
        let id = command.get("id").and_then(Value::as_str).map(str::to_string);
        if let Some(id) = &id {
            if self.model.find_command(id).is_some() {
                return;
            }
        }
        match self.model.add_command(command, Origin::Cloud, Role::Owner) {
            Ok(id) => {
                info!(id = %id, "new cloud command");
                if let Some(command) = self.model.find_command(&id) {
                    self.attach_cloud_proxy(&command);
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to parse a cloud command");
                if let Some(id) = id {
                    self.notify_command_aborted(&id, ErrorInfo::from(&e));
                }
            }
        }
    }

    /// Mirror local command changes to `PATCH commands/{id}`.
    fn attach_cloud_proxy(self: &Arc<Self>, command: &Arc<Command>) {
        let weak_engine = self.weak_self.clone();
        let weak_command = Arc::downgrade(command);
        command
            .observe(move |_event| {
                let (Some(engine), Some(command)) =
                    (weak_engine.upgrade(), weak_command.upgrade())
                else {
                    return;
                };
                let mut patch = json!({
                    "state": command.state().as_str(),
                    "progress": Value::Object(command.progress()),
                    "results": Value::Object(command.results()),
                });
                if let Some(error) = command.error() {
                    patch["error"] = json!(error);
                }
                let url = engine.service_url(&format!("commands/{}", command.id()), &[]);
                let engine2 = engine.clone();
                engine.runtime.spawn(async move {
                    if let Err(e) = engine2
                        .cloud_request(HttpMethod::Patch, &url, Some(&patch))
                        .await
                    {
                        warn!(error = %e, "failed to patch cloud command");
                    }
                });
            })
            .detach();
    }

    fn notify_command_aborted(self: &Arc<Self>, id: &str, error: ErrorInfo) {
        let url = self.service_url(&format!("commands/{id}"), &[]);
        let body = json!({"state": "aborted", "error": error});
        let engine = self.clone();
        self.runtime.spawn(async move {
            if let Err(e) = engine.cloud_request(HttpMethod::Put, &url, Some(&body)).await {
                warn!(error = %e, "failed to abort command");
            }
        });
    }

    // ── State publication ─────────────────────────────────────────────────

    /// Drain the state-change log into one `patchState` POST. Only one POST
    /// is in flight at a time; further changes re-trigger after it lands.
    pub fn publish_state_updates(self: &Arc<Self>) {
        {
            let inner = self.lock();
            if inner.state_publish_in_flight || !inner.connected_to_cloud {
                return;
            }
        }
        let (update_id, changes) = self.model.drain_state_changes();
        if changes.is_empty() {
            return;
        }

        let patches: Vec<Value> = changes
            .into_iter()
            .map(|change| {
                json!({
                    "timeMs": change.timestamp.timestamp_millis().to_string(),
                    "patch": Value::Object(change.changed_properties),
                })
            })
            .collect();
        let body = json!({
            "requestTimeMs": Utc::now().timestamp_millis().to_string(),
            "patches": patches,
        });

        self.lock().state_publish_in_flight = true;
        let engine = self.clone();
        self.runtime.spawn(async move {
            let url = engine.device_url("patchState", &[]);
            match engine.cloud_request(HttpMethod::Post, &url, Some(&body)).await {
                Ok(_) => {
                    engine.lock().state_publish_in_flight = false;
                    engine.model.notify_state_updated_on_server(update_id);
                    // Changes may have queued while this POST was in flight.
                    engine.publish_state_updates();
                }
                Err(e) => {
                    warn!(error = %e, "failed to update device state");
                    engine.lock().state_publish_in_flight = false;
                }
            }
        });
    }

    // ── Notification channels ─────────────────────────────────────────────

    fn start_notification_channels(self: &Arc<Self>) {
        let delegate = self.as_delegate();

        let mut pull_guard = self.pull_channel.lock().unwrap_or_else(|e| e.into_inner());
        match pull_guard.as_ref() {
            Some(pull) => pull.update_pull_interval(ACTIVE_PULL_INTERVAL),
            None => {
                let pull = PullChannel::new(ACTIVE_PULL_INTERVAL, self.runtime.clone());
                NotificationChannel::start(&pull, delegate.clone());
                *pull_guard = Some(pull);
            }
        }
        drop(pull_guard);
        self.lock().current_channel = "pull";

        let Some(network) = &self.network else {
            debug!("no network provider, running on polling only");
            return;
        };
        let settings = self.config.settings();
        if settings.robot_account.is_empty() {
            return;
        }
        let endpoint = self.lock().xmpp_endpoint.clone();
        let mut push_guard = self.push_channel.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(push) = push_guard.as_ref() {
            NotificationChannel::stop(push);
        }
        let push = PushChannel::new(endpoint, network.clone(), self.runtime.clone());
        push.set_credentials(&settings.robot_account, &self.lock().access_token);
        NotificationChannel::start(&push, delegate);
        *push_guard = Some(push);
    }

    fn stop_notification_channels(&self) {
        if let Some(pull) = self
            .pull_channel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            NotificationChannel::stop(&pull);
        }
        if let Some(push) = self
            .push_channel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            NotificationChannel::stop(&push);
        }
    }

    fn as_delegate(self: &Arc<Self>) -> Arc<dyn NotificationDelegate> {
        self.clone()
    }

    // ── Credentials & state ───────────────────────────────────────────────

    pub fn have_registration_credentials(&self) -> bool {
        let settings = self.config.settings();
        !settings.refresh_token.is_empty()
            && !settings.cloud_id.is_empty()
            && !settings.robot_account.is_empty()
    }

    /// Wipe credentials after the server revoked or deleted the device.
    fn mark_unregistered(&self) {
        if !self.have_registration_credentials() {
            self.set_gcd_state(GcdState::InvalidCredentials);
            return;
        }
        info!("device is unregistered from the cloud, deleting credentials");
        self.lock().connected_to_cloud = false;

        let mut tx = self.config.edit();
        tx.set_cloud_id("").set_robot_account("").set_refresh_token("");
        tx.commit();

        self.stop_notification_channels();
        self.set_gcd_state(GcdState::InvalidCredentials);
    }

    fn set_gcd_state(&self, state: GcdState) {
        let changed = {
            let mut inner = self.lock();
            if inner.gcd_state == state {
                false
            } else {
                debug!(from = %inner.gcd_state, to = %state, "gcd state change");
                inner.gcd_state = state;
                true
            }
        };
        if changed {
            self.on_state_changed.notify(&state);
        }
    }

    // ── URLs & raw requests ───────────────────────────────────────────────

    fn service_url(&self, subpath: &str, params: &[(&str, &str)]) -> String {
        build_url(&self.config.settings().service_url, subpath, params)
    }

    fn device_url(&self, subpath: &str, params: &[(&str, &str)]) -> String {
        let settings = self.config.settings();
        let path = if subpath.is_empty() {
            format!("devices/{}", settings.cloud_id)
        } else {
            format!("devices/{}/{subpath}", settings.cloud_id)
        };
        build_url(&settings.service_url, &path, params)
    }

    async fn raw_json_request(
        &self,
        method: HttpMethod,
        url: &str,
        body: Option<Value>,
    ) -> Result<JsonReply, CloudError> {
        let headers = vec![("Content-Type".to_string(), "application/json".to_string())];
        let response = self
            .http
            .send_request(method, url, &headers, body.map(|b| b.to_string().into_bytes()))
            .await
            .map_err(|e| CloudError::Transport(e.to_string()))?;
        parse_json_response(&response)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EngineInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl NotificationDelegate for CloudEngine {
    fn on_connected(&self, channel_name: &str) {
        info!(channel = channel_name, "notification channel established");
        let Some(engine) = self.weak_self.upgrade() else { return };
        if let Some(pull) = engine
            .pull_channel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
        {
            pull.update_pull_interval(BACKUP_PULL_INTERVAL);
        }
        engine.lock().current_channel = "xmpp";

        if !engine.is_connected_to_cloud() {
            return;
        }
        // Tell the server about the new channel, then do one final poll to
        // close the race with commands created before the subscription.
        let engine2 = engine.clone();
        engine.runtime.spawn(async move {
            if engine2.update_device_resource().await.is_ok() {
                engine2.fetch_and_publish_commands();
            }
        });
    }

    fn on_disconnected(&self) {
        info!("notification channel disconnected");
        let Some(engine) = self.weak_self.upgrade() else { return };
        if !engine.have_registration_credentials() || !engine.is_connected_to_cloud() {
            return;
        }
        if let Some(pull) = engine
            .pull_channel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
        {
            pull.update_pull_interval(ACTIVE_PULL_INTERVAL);
        }
        engine.lock().current_channel = "pull";
        engine.update_device_resource_deferred();
    }

    fn on_permanent_failure(&self) {
        warn!("failed to establish notification channel");
        let Some(engine) = self.weak_self.upgrade() else { return };
        let engine2 = engine.clone();
        engine.runtime.spawn(async move {
            // A refresh against revoked credentials flips the engine to
            // InvalidCredentials.
            let _ = engine2.refresh_access_token().await;
        });
    }

    fn on_command_created(&self, command: &Value) {
        let Some(engine) = self.weak_self.upgrade() else { return };
        if !engine.is_connected_to_cloud() {
            return;
        }
        if command.as_object().is_some_and(|o| !o.is_empty()) {
            engine.publish_command(command);
            return;
        }
        // Payload too large for the channel, or a pull tick: go fetch.
        engine.fetch_and_publish_commands();
    }

    fn on_device_deleted(&self, cloud_id: &str) {
        let Some(engine) = self.weak_self.upgrade() else { return };
        if cloud_id != engine.config.settings().cloud_id {
            warn!(cloud_id, "unexpected device deletion notification");
            return;
        }
        engine.mark_unregistered();
    }
}

impl hearth_privet::CloudDelegate for CloudEngine {
    fn cloud_id(&self) -> String {
        self.config.settings().cloud_id
    }

    fn connection_status(&self) -> String {
        match self.gcd_state() {
            GcdState::Unconfigured => "unconfigured",
            GcdState::Connecting => "connecting",
            GcdState::Connected => "online",
            GcdState::InvalidCredentials => "invalidCredentials",
        }
        .to_string()
    }

    fn register(&self, ticket_id: &str, done: Box<dyn FnOnce(Result<(), String>) + Send>) {
        let Some(engine) = self.weak_self.upgrade() else {
            done(Err("engine is gone".to_string()));
            return;
        };
        let data = RegistrationData::with_ticket(ticket_id);
        engine.runtime.clone().spawn(async move {
            done(engine.register(data).await.map_err(|e| e.to_string()));
        });
    }
}

// ── Wire helpers ──────────────────────────────────────────────────────────────

struct JsonReply {
    status: u16,
    body: Value,
}

fn parse_json_response(response: &HttpResponse) -> Result<JsonReply, CloudError> {
    let content_type = response
        .content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim();
    if content_type != "application/json" && content_type != "text/plain" {
        return Err(CloudError::UnexpectedResponse(format!(
            "unexpected response content type: {content_type}"
        )));
    }
    let body: Value = serde_json::from_slice(&response.data)
        .map_err(|e| CloudError::UnexpectedResponse(format!("bad JSON in response: {e}")))?;
    Ok(JsonReply {
        status: response.status_code,
        body,
    })
}

fn expect_success(reply: &JsonReply) -> Result<(), CloudError> {
    if reply.status >= 400 {
        return Err(parse_server_error(&reply.body));
    }
    Ok(())
}

/// Extract the first structured error of a cloud error reply.
fn parse_server_error(body: &Value) -> CloudError {
    let first = body
        .get("error")
        .and_then(|e| e.get("errors"))
        .and_then(Value::as_array)
        .and_then(|list| list.first());
    match first {
        Some(error) => CloudError::Server {
            code: error
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or("unexpected_response")
                .to_string(),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unexpected cloud error")
                .to_string(),
        },
        None => CloudError::UnexpectedResponse("unexpected cloud error".to_string()),
    }
}

fn value_as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn build_url(base: &str, subpath: &str, params: &[(&str, &str)]) -> String {
    let mut url = base.to_string();
    if !url.ends_with('/') && !subpath.is_empty() {
        url.push('/');
    }
    url.push_str(subpath);
    if !params.is_empty() {
        url.push('?');
        url.push_str(&encode_form(
            &params.iter().map(|(k, v)| (*k, *v)).collect::<Vec<_>>(),
        ));
    }
    url
}

fn encode_form(fields: &[(&str, &str)]) -> String {
    fields
        .iter()
        .map(|(k, v)| format!("{}={}", urlencode(k), urlencode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

fn urlencode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            b' ' => out.push('+'),
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use hearth_provider::ProviderError;
    use serde_json::json;

    struct Rule {
        method: HttpMethod,
        url_contains: String,
        status: u16,
        body: Value,
        remaining: Option<u32>,
    }

    #[derive(Default)]
    struct FakeHttpClient {
        rules: Mutex<Vec<Rule>>,
        requests: Mutex<Vec<(HttpMethod, String, Value)>>,
    }

    impl FakeHttpClient {
        fn on(&self, method: HttpMethod, url_contains: &str, status: u16, body: Value) {
            self.rules.lock().unwrap().push(Rule {
                method,
                url_contains: url_contains.to_string(),
                status,
                body,
                remaining: None,
            });
        }

        fn on_once(&self, method: HttpMethod, url_contains: &str, status: u16, body: Value) {
            self.rules.lock().unwrap().insert(0, Rule {
                method,
                url_contains: url_contains.to_string(),
                status,
                body,
                remaining: Some(1),
            });
        }

        fn requests(&self) -> Vec<(HttpMethod, String, Value)> {
            self.requests.lock().unwrap().clone()
        }

        fn saw(&self, method: HttpMethod, url_fragment: &str) -> bool {
            self.requests()
                .iter()
                .any(|(m, url, _)| *m == method && url.contains(url_fragment))
        }
    }

    #[async_trait]
    impl HttpClient for FakeHttpClient {
        async fn send_request(
            &self,
            method: HttpMethod,
            url: &str,
            _headers: &[(String, String)],
            body: Option<Vec<u8>>,
        ) -> Result<HttpResponse, ProviderError> {
            let body_json = body
                .and_then(|b| serde_json::from_slice(&b).ok())
                .unwrap_or(Value::Null);
            self.requests
                .lock()
                .unwrap()
                .push((method, url.to_string(), body_json));

            let mut rules = self.rules.lock().unwrap();
            let found = rules.iter_mut().find(|r| {
                r.method == method
                    && url.contains(&r.url_contains)
                    && r.remaining.map_or(true, |n| n > 0)
            });
            match found {
                Some(rule) => {
                    if let Some(n) = &mut rule.remaining {
                        *n -= 1;
                    }
                    Ok(HttpResponse {
                        status_code: rule.status,
                        content_type: "application/json".to_string(),
                        data: rule.body.to_string().into_bytes(),
                    })
                }
                None => Ok(HttpResponse {
                    status_code: 404,
                    content_type: "application/json".to_string(),
                    data: json!({"error": {"errors": [{"reason": "notFound", "message": "no rule"}]}})
                        .to_string()
                        .into_bytes(),
                }),
            }
        }
    }

    struct Fixture {
        engine: Arc<CloudEngine>,
        http: Arc<FakeHttpClient>,
        config: Arc<Config>,
        model: Arc<DeviceModel>,
    }

    fn fixture(registered: bool) -> Fixture {
        let config = Arc::new(Config::new(None));
        config.load().unwrap();
        {
            let mut tx = config.edit();
            tx.set_name("Lamp")
                .set_client_id("CLIENT_ID")
                .set_client_secret("CLIENT_SECRET")
                .set_api_key("TEST_API_KEY")
                .set_oauth_url("https://accounts/")
                .set_service_url("https://service/");
            if registered {
                tx.set_cloud_id("CLOUD_ID")
                    .set_robot_account("robot@example.com")
                    .set_refresh_token("REFRESH_TOKEN");
            }
            tx.commit();
        }

        let model = DeviceModel::new();
        model
            .load_traits(&json!({
                "t1": {
                    "commands": {"c": {"minimalRole": "user"}},
                    "state": {"p": {"type": "integer"}}
                }
            }))
            .unwrap();
        model.add_component("", "comp1", vec!["t1".into()]).unwrap();

        let http = Arc::new(FakeHttpClient::default());
        let engine = CloudEngine::new(model.clone(), config.clone(), http.clone(), None);
        Fixture {
            engine,
            http,
            config,
            model,
        }
    }

    async fn wait_until(mut predicate: impl FnMut() -> bool) {
        for _ in 0..200 {
            if predicate() {
                return;
            }
            tokio::time::sleep(StdDuration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn registration_happy_path() {
        let f = fixture(false);
        f.http.on(
            HttpMethod::Patch,
            "registrationTickets/TICKET_ID?key=TEST_API_KEY",
            200,
            json!({}),
        );
        f.http.on(
            HttpMethod::Post,
            "registrationTickets/TICKET_ID/finalize?key=TEST_API_KEY",
            200,
            json!({
                "robotAccountEmail": "robot@example.com",
                "robotAccountAuthorizationCode": "AUTH_CODE",
                "deviceDraft": {"id": "CLOUD_ID", "lastUpdateTimeMs": "10000"},
            }),
        );
        f.http.on(
            HttpMethod::Post,
            "accounts/token",
            200,
            json!({
                "access_token": "ACCESS_TOKEN",
                "refresh_token": "REFRESH_TOKEN",
                "expires_in": 3600,
            }),
        );
        f.http.on(
            HttpMethod::Put,
            "devices/CLOUD_ID",
            200,
            json!({"lastUpdateTimeMs": "10001"}),
        );
        f.http
            .on(HttpMethod::Get, "commands/queue", 200, json!({"commands": []}));

        f.engine
            .register(RegistrationData::with_ticket("TICKET_ID"))
            .await
            .unwrap();

        let settings = f.config.settings();
        assert_eq!(settings.cloud_id, "CLOUD_ID");
        assert_eq!(settings.refresh_token, "REFRESH_TOKEN");
        assert_eq!(settings.robot_account, "robot@example.com");

        // The spawned connect cycle lands in Connected.
        wait_until(|| f.engine.gcd_state() == GcdState::Connected).await;
        assert!(f.http.saw(HttpMethod::Put, "devices/CLOUD_ID?lastUpdateTimeMs=10000"));
        assert!(f.http.saw(HttpMethod::Get, "commands/queue?deviceId=CLOUD_ID"));
    }

    #[tokio::test]
    async fn expired_token_is_refreshed_on_401() {
        let f = fixture(true);
        f.http.on_once(
            HttpMethod::Get,
            "devices/CLOUD_ID",
            401,
            json!({}),
        );
        f.http.on(
            HttpMethod::Post,
            "accounts/token",
            200,
            json!({"access_token": "FRESH", "expires_in": 3600}),
        );
        f.http.on(
            HttpMethod::Get,
            "devices/CLOUD_ID",
            200,
            json!({"lastUpdateTimeMs": "1"}),
        );

        let result = f
            .engine
            .cloud_request(HttpMethod::Get, &f.engine.device_url("", &[]), None)
            .await
            .unwrap();
        assert_eq!(result["lastUpdateTimeMs"], "1");
        // Initial refresh (empty token) + the 401-triggered one.
        assert!(f.http.saw(HttpMethod::Post, "accounts/token"));
    }

    #[tokio::test]
    async fn invalid_grant_wipes_credentials() {
        let f = fixture(true);
        f.http.on(
            HttpMethod::Post,
            "accounts/token",
            400,
            json!({"error": "invalid_grant"}),
        );

        let err = f.engine.refresh_access_token().await.unwrap_err();
        assert!(matches!(err, CloudError::OAuth { code, .. } if code == "invalid_grant"));
        assert_eq!(f.engine.gcd_state(), GcdState::InvalidCredentials);
        let settings = f.config.settings();
        assert!(settings.refresh_token.is_empty());
        assert!(settings.cloud_id.is_empty());
        assert!(settings.robot_account.is_empty());
    }

    #[tokio::test]
    async fn server_errors_are_retried_with_backoff() {
        let f = fixture(true);
        f.http.on(
            HttpMethod::Post,
            "accounts/token",
            200,
            json!({"access_token": "TOKEN", "expires_in": 3600}),
        );
        f.http
            .on_once(HttpMethod::Get, "devices/CLOUD_ID", 500, json!({}));
        f.http.on(
            HttpMethod::Get,
            "devices/CLOUD_ID",
            200,
            json!({"lastUpdateTimeMs": "1"}),
        );

        let result = f
            .engine
            .cloud_request(HttpMethod::Get, &f.engine.device_url("", &[]), None)
            .await
            .unwrap();
        assert_eq!(result["lastUpdateTimeMs"], "1");
        assert_eq!(f.engine.gcd_state(), GcdState::Connected);
    }

    #[tokio::test]
    async fn initial_reconciliation_aborts_limbo_commands() {
        let f = fixture(true);
        f.http.on(
            HttpMethod::Post,
            "accounts/token",
            200,
            json!({"access_token": "TOKEN", "expires_in": 3600}),
        );
        f.http.on(
            HttpMethod::Get,
            "devices/CLOUD_ID",
            200,
            json!({"lastUpdateTimeMs": "1"}),
        );
        f.http
            .on(HttpMethod::Put, "devices/CLOUD_ID", 200, json!({"lastUpdateTimeMs": "2"}));
        f.http.on(
            HttpMethod::Get,
            "commands/queue",
            200,
            json!({"commands": [
                {"id": "limbo-1", "name": "t1.c", "state": "inProgress"},
                {"id": "fresh-2", "name": "t1.c", "state": "queued"},
            ]}),
        );
        f.http
            .on(HttpMethod::Put, "commands/limbo-1", 200, json!({}));

        f.engine.connect_to_cloud().await;

        // The limbo command was aborted server-side, not queued locally.
        wait_until(|| f.http.saw(HttpMethod::Put, "commands/limbo-1")).await;
        let (_, _, body) = f
            .http
            .requests()
            .into_iter()
            .find(|(m, url, _)| *m == HttpMethod::Put && url.contains("commands/limbo-1"))
            .unwrap();
        assert_eq!(body["state"], "aborted");
        assert!(f.model.find_command("limbo-1").is_none());

        // The queued command was published locally with its server id.
        let fresh = f.model.find_command("fresh-2").unwrap();
        assert_eq!(fresh.origin(), Origin::Cloud);
    }

    #[tokio::test]
    async fn state_changes_are_published_and_acked() {
        let f = fixture(true);
        f.http.on(
            HttpMethod::Post,
            "accounts/token",
            200,
            json!({"access_token": "TOKEN", "expires_in": 3600}),
        );
        f.http.on(
            HttpMethod::Get,
            "devices/CLOUD_ID",
            200,
            json!({"lastUpdateTimeMs": "1"}),
        );
        f.http
            .on(HttpMethod::Put, "devices/CLOUD_ID", 200, json!({"lastUpdateTimeMs": "2"}));
        f.http
            .on(HttpMethod::Get, "commands/queue", 200, json!({"commands": []}));
        f.http
            .on(HttpMethod::Post, "patchState", 200, json!({}));

        f.engine.connect_to_cloud().await;

        let acked = Arc::new(Mutex::new(0u64));
        let acked2 = acked.clone();
        let _sub = f.model.on_server_state_ack(move |id| {
            *acked2.lock().unwrap() = *id;
        });

        f.model
            .set_state_property("comp1", "t1.p", json!(7))
            .unwrap();

        wait_until(|| f.http.saw(HttpMethod::Post, "patchState")).await;
        let (_, _, body) = f
            .http
            .requests()
            .into_iter()
            .find(|(m, url, _)| *m == HttpMethod::Post && url.contains("patchState"))
            .unwrap();
        assert_eq!(body["patches"][0]["patch"]["t1"]["p"], 7);
        assert!(body["requestTimeMs"].is_string());

        wait_until(|| *acked.lock().unwrap() > 0).await;
    }

    #[tokio::test]
    async fn device_deleted_notification_invalidates_credentials() {
        let f = fixture(true);

        NotificationDelegate::on_device_deleted(f.engine.as_ref(), "SOMEONE_ELSE");
        assert!(f.engine.have_registration_credentials());

        NotificationDelegate::on_device_deleted(f.engine.as_ref(), "CLOUD_ID");
        assert!(!f.engine.have_registration_credentials());
        assert_eq!(f.engine.gcd_state(), GcdState::InvalidCredentials);
    }

    #[tokio::test]
    async fn rejects_requests_without_credentials() {
        let f = fixture(false);
        let err = f
            .engine
            .cloud_request(HttpMethod::Get, "https://service/devices/x", None)
            .await
            .unwrap_err();
        assert!(matches!(err, CloudError::NotRegistered));
    }
}
