use chrono::{DateTime, Duration, Utc};
use hearth_config::Config;
use hearth_domain::{ObserverList, Subscription};
use hearth_provider::{ConnectionState, Network, TaskRunner, TaskRunnerExt, Wifi};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration as StdDuration;
use tracing::{debug, info, warn};

use crate::ssid::{generate_ssid, DiscoveryFlags};

const MONITOR_OFFLINE_DEADLINE_SECONDS: i64 = 2 * 60;
const BOOTSTRAP_FALLBACK: StdDuration = StdDuration::from_secs(10 * 60);
const CONNECT_TIMEOUT: StdDuration = StdDuration::from_secs(3 * 60);
const CONNECT_START_DELAY: StdDuration = StdDuration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapState {
    Disabled,
    Bootstrapping,
    Connecting,
    Monitoring,
}

/// Progress of the most recent Wi-Fi credential setup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WifiSetupState {
    Idle,
    InProgress,
    Success,
    Error(String),
}

impl WifiSetupState {
    pub fn as_status_str(&self) -> &'static str {
        match self {
            WifiSetupState::Idle => "idle",
            WifiSetupState::InProgress => "inProgress",
            WifiSetupState::Success => "success",
            WifiSetupState::Error(_) => "error",
        }
    }
}

struct WifiInner {
    state: BootstrapState,
    setup_state: WifiSetupState,
    hosted_ssid: String,
    monitor_until: Option<DateTime<Utc>>,
    /// Bumped on every state change; posted tasks carry the epoch they were
    /// scheduled under and become no-ops once it moves on.
    epoch: u64,
}

/// Drives monitor → bootstrap → connect → monitor for Wi-Fi onboarding.
pub struct WifiBootstrapManager {
    config: Arc<Config>,
    task_runner: Arc<dyn TaskRunner>,
    network: Arc<dyn Network>,
    wifi: Arc<dyn Wifi>,
    inner: Mutex<WifiInner>,
    on_state_changed: ObserverList<BootstrapState>,
}

impl WifiBootstrapManager {
    pub fn new(
        config: Arc<Config>,
        task_runner: Arc<dyn TaskRunner>,
        network: Arc<dyn Network>,
        wifi: Arc<dyn Wifi>,
    ) -> Arc<WifiBootstrapManager> {
        Arc::new(WifiBootstrapManager {
            config,
            task_runner,
            network,
            wifi,
            inner: Mutex::new(WifiInner {
                state: BootstrapState::Disabled,
                setup_state: WifiSetupState::Idle,
                hosted_ssid: String::new(),
                monitor_until: None,
                epoch: 0,
            }),
            on_state_changed: ObserverList::new(),
        })
    }

    pub fn start(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.network
            .add_connection_changed_callback(Box::new(move || {
                if let Some(manager) = Weak::upgrade(&weak) {
                    manager.on_connectivity_changed();
                }
            }));

        if self.config.settings().last_configured_ssid.is_empty() {
            self.start_bootstrapping();
        } else {
            self.start_monitoring();
        }
    }

    pub fn state(&self) -> BootstrapState {
        self.lock().state
    }

    pub fn setup_state(&self) -> WifiSetupState {
        self.lock().setup_state.clone()
    }

    /// SSID of the bootstrap access point while one is up.
    pub fn hosted_ssid(&self) -> String {
        self.lock().hosted_ssid.clone()
    }

    pub fn connected_ssid(&self) -> String {
        let from_driver = self.wifi.connected_ssid();
        if from_driver.is_empty() {
            self.config.settings().last_configured_ssid
        } else {
            from_driver
        }
    }

    pub fn on_state_changed(
        &self,
        callback: impl Fn(&BootstrapState) + Send + Sync + 'static,
    ) -> Subscription {
        self.on_state_changed.add(callback)
    }

    /// Accept credentials from the setup endpoint. The connect attempt is
    /// deferred slightly so the HTTP response can flush before the network
    /// flips.
    pub fn configure_credentials(self: &Arc<Self>, ssid: &str, passphrase: &str) {
        self.lock().setup_state = WifiSetupState::InProgress;
        let ssid = ssid.to_string();
        let passphrase = passphrase.to_string();
        let weak = Arc::downgrade(self);
        self.task_runner.post_after(CONNECT_START_DELAY, move || {
            if let Some(manager) = Weak::upgrade(&weak) {
                manager.start_connecting(&ssid, &passphrase);
            }
        });
    }

    fn start_bootstrapping(self: &Arc<Self>) {
        if self.network.connection_state() == ConnectionState::Connected {
            // Some other interface is online; no need for an access point.
            self.start_monitoring();
            return;
        }

        self.update_state(BootstrapState::Bootstrapping);

        let settings = self.config.settings();
        if !settings.last_configured_ssid.is_empty() {
            // Periodically tear the AP down to probe whether the configured
            // network came back.
            self.post_guarded(BOOTSTRAP_FALLBACK, |manager| {
                debug!("bootstrap window elapsed, probing the configured network");
                manager.start_monitoring();
            });
        }

        let ssid = generate_ssid(
            &settings.name,
            &settings.model_id,
            DiscoveryFlags {
                needs_wifi: true,
                needs_registration: settings.cloud_id.is_empty(),
            },
        );
        info!(%ssid, "starting bootstrap access point");
        self.lock().hosted_ssid = ssid.clone();
        self.wifi.start_access_point(&ssid);
    }

    fn start_monitoring(self: &Arc<Self>) {
        self.update_state(BootstrapState::Monitoring);

        if self.network.connection_state() == ConnectionState::Connected {
            self.lock().monitor_until = None;
            return;
        }

        let deadline = {
            let mut inner = self.lock();
            *inner.monitor_until.get_or_insert_with(|| {
                Utc::now() + Duration::seconds(MONITOR_OFFLINE_DEADLINE_SECONDS)
            })
        };
        let remaining = (deadline - Utc::now())
            .to_std()
            .unwrap_or(StdDuration::ZERO);
        debug!(?remaining, "offline, monitoring until the deadline");
        self.post_guarded(remaining, |manager| {
            warn!("spent too long offline, entering bootstrap mode");
            manager.start_bootstrapping();
        });
    }

    fn start_connecting(self: &Arc<Self>, ssid: &str, passphrase: &str) {
        info!(%ssid, "attempting wi-fi connection");
        self.update_state(BootstrapState::Connecting);

        self.post_guarded(CONNECT_TIMEOUT, |manager| {
            manager.on_connect_error("connection attempt timed out");
        });

        let weak = Arc::downgrade(self);
        let epoch = self.lock().epoch;
        let connected_ssid = ssid.to_string();
        self.wifi.connect(
            ssid,
            passphrase,
            Box::new(move |result| {
                let Some(manager) = Weak::upgrade(&weak) else {
                    return;
                };
                if manager.lock().epoch != epoch {
                    return;
                }
                match result {
                    Ok(()) => manager.on_connect_success(&connected_ssid),
                    Err(e) => manager.on_connect_error(&e.to_string()),
                }
            }),
        );
    }

    fn on_connect_success(self: &Arc<Self>, ssid: &str) {
        info!(%ssid, "wi-fi connected");
        let mut tx = self.config.edit();
        tx.set_last_configured_ssid(ssid);
        tx.commit();
        self.lock().setup_state = WifiSetupState::Success;
        self.start_monitoring();
    }

    fn on_connect_error(self: &Arc<Self>, message: &str) {
        warn!(message, "failed to connect to the provided network");
        self.lock().setup_state = WifiSetupState::Error(message.to_string());
        self.start_bootstrapping();
    }

    fn on_connectivity_changed(self: &Arc<Self>) {
        let state = self.state();
        let connected = self.network.connection_state() == ConnectionState::Connected;
        if connected {
            self.lock().monitor_until = None;
        }
        if state == BootstrapState::Monitoring || (state != BootstrapState::Disabled && connected) {
            self.start_monitoring();
        }
    }

    /// Leave the current state: cancel its pending tasks and undo its side
    /// effects.
    fn update_state(&self, new_state: BootstrapState) {
        let old_state = {
            let mut inner = self.lock();
            inner.epoch += 1;
            let old = inner.state;
            inner.state = new_state;
            if old == BootstrapState::Bootstrapping {
                inner.hosted_ssid.clear();
            }
            old
        };
        if old_state == BootstrapState::Bootstrapping {
            self.wifi.stop_access_point();
        }
        debug!(?old_state, ?new_state, "wi-fi bootstrap state change");
        self.on_state_changed.notify(&new_state);
    }

    fn post_guarded(
        self: &Arc<Self>,
        delay: StdDuration,
        task: impl FnOnce(&Arc<Self>) + Send + 'static,
    ) {
        let weak = Arc::downgrade(self);
        let epoch = self.lock().epoch;
        self.task_runner.post_after(delay, move || {
            let Some(manager) = Weak::upgrade(&weak) else {
                return;
            };
            if manager.lock().epoch == epoch {
                task(&manager);
            }
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, WifiInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use hearth_provider::{ProviderError, TlsStream, WifiConnectDone};
    use std::collections::VecDeque;

    /// Task runner that queues posted tasks for manual, deterministic
    /// execution.
    #[derive(Default)]
    struct FakeTaskRunner {
        tasks: Mutex<VecDeque<(StdDuration, Box<dyn FnOnce() + Send>)>>,
    }

    impl FakeTaskRunner {
        /// Run every queued task with a delay within `up_to`.
        fn run_due(&self, up_to: StdDuration) {
            loop {
                let task = {
                    let mut tasks = self.tasks.lock().unwrap();
                    let index = tasks.iter().position(|(delay, _)| *delay <= up_to);
                    index.and_then(|i| tasks.remove(i))
                };
                match task {
                    Some((_, task)) => task(),
                    None => break,
                }
            }
        }
    }

    impl TaskRunner for FakeTaskRunner {
        fn post_delayed(&self, delay: StdDuration, task: Box<dyn FnOnce() + Send>) {
            self.tasks.lock().unwrap().push_back((delay, task));
        }
    }

    struct FakeNetwork {
        state: Mutex<ConnectionState>,
        callbacks: Mutex<Vec<Box<dyn Fn() + Send + Sync>>>,
    }

    impl FakeNetwork {
        fn new(state: ConnectionState) -> Self {
            FakeNetwork {
                state: Mutex::new(state),
                callbacks: Mutex::new(Vec::new()),
            }
        }

        fn set_state(&self, state: ConnectionState) {
            *self.state.lock().unwrap() = state;
            let callbacks = self.callbacks.lock().unwrap();
            for cb in callbacks.iter() {
                cb();
            }
        }
    }

    #[async_trait]
    impl Network for FakeNetwork {
        fn add_connection_changed_callback(&self, callback: Box<dyn Fn() + Send + Sync>) {
            self.callbacks.lock().unwrap().push(callback);
        }

        fn connection_state(&self) -> ConnectionState {
            *self.state.lock().unwrap()
        }

        async fn open_ssl_socket(
            &self,
            _host: &str,
            _port: u16,
        ) -> Result<Box<dyn TlsStream>, ProviderError> {
            Err(ProviderError::NotSupported("tls"))
        }
    }

    #[derive(Default)]
    struct FakeWifi {
        access_points: Mutex<Vec<String>>,
        stopped: Mutex<usize>,
        pending_connect: Mutex<Option<(String, WifiConnectDone)>>,
    }

    impl Wifi for FakeWifi {
        fn connect(&self, ssid: &str, _passphrase: &str, done: WifiConnectDone) {
            *self.pending_connect.lock().unwrap() = Some((ssid.to_string(), done));
        }

        fn start_access_point(&self, ssid: &str) {
            self.access_points.lock().unwrap().push(ssid.to_string());
        }

        fn stop_access_point(&self) {
            *self.stopped.lock().unwrap() += 1;
        }

        fn connected_ssid(&self) -> String {
            String::new()
        }
    }

    struct Fixture {
        manager: Arc<WifiBootstrapManager>,
        runner: Arc<FakeTaskRunner>,
        network: Arc<FakeNetwork>,
        wifi: Arc<FakeWifi>,
        config: Arc<Config>,
    }

    fn fixture(last_ssid: &str, network_state: ConnectionState) -> Fixture {
        let config = Arc::new(Config::new(None));
        config.load().unwrap();
        let mut tx = config.edit();
        tx.set_name("Lamp").set_last_configured_ssid(last_ssid);
        tx.commit();

        let runner = Arc::new(FakeTaskRunner::default());
        let network = Arc::new(FakeNetwork::new(network_state));
        let wifi = Arc::new(FakeWifi::default());
        let manager = WifiBootstrapManager::new(
            config.clone(),
            runner.clone(),
            network.clone(),
            wifi.clone(),
        );
        Fixture {
            manager,
            runner,
            network,
            wifi,
            config,
        }
    }

    #[test]
    fn configured_device_starts_monitoring() {
        let f = fixture("homenet", ConnectionState::Connected);
        f.manager.start();
        assert_eq!(f.manager.state(), BootstrapState::Monitoring);
        assert!(f.wifi.access_points.lock().unwrap().is_empty());
    }

    #[test]
    fn unconfigured_device_starts_bootstrapping() {
        let f = fixture("", ConnectionState::Offline);
        f.manager.start();
        assert_eq!(f.manager.state(), BootstrapState::Bootstrapping);

        let aps = f.wifi.access_points.lock().unwrap();
        assert_eq!(aps.len(), 1);
        assert!(aps[0].starts_with("Lamp."), "{}", aps[0]);
        assert!(aps[0].ends_with("prv"), "{}", aps[0]);
    }

    #[test]
    fn offline_monitoring_falls_back_to_bootstrap_after_deadline() {
        let f = fixture("homenet", ConnectionState::Offline);
        f.manager.start();
        assert_eq!(f.manager.state(), BootstrapState::Monitoring);

        // The two-minute deadline elapses.
        f.runner.run_due(StdDuration::from_secs(121));
        assert_eq!(f.manager.state(), BootstrapState::Bootstrapping);
        assert_eq!(f.wifi.access_points.lock().unwrap().len(), 1);
    }

    #[test]
    fn reconnect_before_deadline_cancels_the_fallback() {
        let f = fixture("homenet", ConnectionState::Offline);
        f.manager.start();

        f.network.set_state(ConnectionState::Connected);
        assert_eq!(f.manager.state(), BootstrapState::Monitoring);

        // The stale deadline task runs but must be a no-op now.
        f.runner.run_due(StdDuration::from_secs(121));
        assert_eq!(f.manager.state(), BootstrapState::Monitoring);
        assert!(f.wifi.access_points.lock().unwrap().is_empty());
    }

    #[test]
    fn credentials_drive_connecting_then_monitoring() {
        let f = fixture("", ConnectionState::Offline);
        f.manager.start();

        f.manager.configure_credentials("homenet", "hunter2");
        assert_eq!(f.manager.setup_state(), WifiSetupState::InProgress);
        f.runner.run_due(StdDuration::from_secs(2));
        assert_eq!(f.manager.state(), BootstrapState::Connecting);

        let (ssid, done) = f.wifi.pending_connect.lock().unwrap().take().unwrap();
        assert_eq!(ssid, "homenet");
        done(Ok(()));

        assert_eq!(f.manager.state(), BootstrapState::Monitoring);
        assert_eq!(f.manager.setup_state(), WifiSetupState::Success);
        assert_eq!(f.config.settings().last_configured_ssid, "homenet");
    }

    #[test]
    fn failed_connect_returns_to_bootstrapping_with_error() {
        let f = fixture("", ConnectionState::Offline);
        f.manager.start();
        f.manager.configure_credentials("homenet", "wrong");
        f.runner.run_due(StdDuration::from_secs(2));

        let (_, done) = f.wifi.pending_connect.lock().unwrap().take().unwrap();
        done(Err(ProviderError::Transport("bad passphrase".into())));

        assert_eq!(f.manager.state(), BootstrapState::Bootstrapping);
        assert!(matches!(f.manager.setup_state(), WifiSetupState::Error(_)));
    }

    #[test]
    fn connect_timeout_is_cancelled_by_success() {
        let f = fixture("", ConnectionState::Offline);
        f.manager.start();
        f.manager.configure_credentials("homenet", "hunter2");
        f.runner.run_due(StdDuration::from_secs(2));

        let (_, done) = f.wifi.pending_connect.lock().unwrap().take().unwrap();
        done(Ok(()));
        assert_eq!(f.manager.setup_state(), WifiSetupState::Success);

        // The three-minute timeout fires later; it must not flip the state.
        f.runner.run_due(StdDuration::from_secs(200));
        assert_eq!(f.manager.setup_state(), WifiSetupState::Success);
    }
}
