//! Tunnel Lifecycle Controller
//!
//! Owns a tunnel session from start to stop: generates configurations,
//! drives the adapter, reacts to connection test results, rotates keys
//! and publishes every status transition.
//!
//! # Usage
//!
//! ```rust,ignore
//! let deps = ControllerDependencies::new(settings, adapter, Arc::new(server_list));
//! let controller = TunnelController::new(deps);
//!
//! let mut events = controller.subscribe();
//! controller.start().await?;
//!
//! controller.stop(StopReason::UserInitiated).await;
//! ```
//!
//! # Concurrency
//!
//! Every reconfiguration (start, stop, rekey, fix, server change,
//! sleep/wake) runs under one async lifecycle lock. Test results are
//! consumed one at a time by a single task.

use crate::adapter::TunnelAdapter;
use crate::bandwidth::BandwidthAnalyzer;
use crate::error::{AdapterError, TunnelError};
use crate::health::{ErrorStore, TunnelHealth};
use crate::keys::{KeyStore, MemoryKeyStore};
use crate::latency::{LatencyMeter, LatencyReporter, TcpLatencyMeter};
use crate::messages::{AppMessage, encode_bool};
use crate::notifications::{LogNotifications, Notifications};
use crate::rekey::{KeyRotation, Rekey};
use crate::selection::{
    DeviceManagement, SelectedServer, SelectedServerStore, ServerInfo, ServerSelectionMethod,
    ServerSelector,
};
use crate::settings::TunnelSettings;
use crate::status::{ConnectionStatus, StatusBroadcaster, StatusEvent};
use crate::telemetry::{EventSink, TelemetryEvent, TracingEventSink};
use crate::tester::{
    ConnectionTester, InterfaceResolver, Prober, SystemInterfaces, TcpProber, TestReport, TestResult,
};
use async_trait::async_trait;
use chrono::Utc;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Why a session is being stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    UserInitiated,
    /// Another tunnel configuration took over
    Superseded,
    /// State reset requested by the app
    ResetAllState,
    /// Recovery failed
    ConnectionFailure,
}

/// Options for starting a session
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Replace the stored server choice before connecting
    pub selected_server: Option<SelectedServer>,
    /// Override the key validity before connecting
    pub key_validity: Option<Duration>,
    /// Fail the start with [`TunnelError::SimulatedFailure`]
    pub simulate_failure: bool,
}

/// Collaborators and state objects a controller is built from
pub struct ControllerDependencies {
    pub settings: TunnelSettings,
    pub adapter: Arc<dyn TunnelAdapter>,
    pub devices: Arc<dyn DeviceManagement>,
    pub keys: Arc<dyn KeyStore>,
    pub selected_server: Arc<SelectedServerStore>,
    pub prober: Arc<dyn Prober>,
    pub interfaces: Arc<dyn InterfaceResolver>,
    pub latency: Arc<dyn LatencyMeter>,
    pub notifications: Arc<dyn Notifications>,
    pub events: Arc<dyn EventSink>,
    pub status: Arc<StatusBroadcaster>,
    pub health: Arc<TunnelHealth>,
    pub errors: Arc<ErrorStore>,
}

impl ControllerDependencies {
    /// Dependencies with in-memory stores, TCP probing over live
    /// interfaces and log-based notifications and telemetry
    pub fn new(
        settings: TunnelSettings,
        adapter: Arc<dyn TunnelAdapter>,
        devices: Arc<dyn DeviceManagement>,
    ) -> Self {
        let keys = Arc::new(MemoryKeyStore::new(settings.keys.validity()));
        let latency = Arc::new(TcpLatencyMeter::new(&settings.latency));
        Self {
            settings,
            adapter,
            devices,
            keys,
            selected_server: Arc::new(SelectedServerStore::new()),
            prober: Arc::new(TcpProber),
            interfaces: Arc::new(SystemInterfaces),
            latency,
            notifications: Arc::new(LogNotifications),
            events: Arc::new(TracingEventSink),
            status: Arc::new(StatusBroadcaster::new()),
            health: Arc::new(TunnelHealth::new()),
            errors: Arc::new(ErrorStore::new()),
        }
    }
}

struct SessionState {
    status: ConnectionStatus,
    last_server: Option<ServerInfo>,
}

struct Inner {
    settings: TunnelSettings,
    adapter: Arc<dyn TunnelAdapter>,
    selector: ServerSelector,
    selected_server: Arc<SelectedServerStore>,
    rotation: KeyRotation,
    tester: ConnectionTester,
    tester_results: Mutex<Option<mpsc::UnboundedReceiver<TestReport>>>,
    result_loop: Mutex<Option<JoinHandle<()>>>,
    bandwidth: Mutex<BandwidthAnalyzer>,
    latency: LatencyReporter,
    notifications: Arc<dyn Notifications>,
    events: Arc<dyn EventSink>,
    status: Arc<StatusBroadcaster>,
    health: Arc<TunnelHealth>,
    errors: Arc<ErrorStore>,
    state: Mutex<SessionState>,
    lifecycle: tokio::sync::Mutex<()>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Inner {
    fn current_status(&self) -> ConnectionStatus {
        lock(&self.state).status
    }

    fn set_status(&self, status: ConnectionStatus) {
        lock(&self.state).status = status;
        self.status.publish_status(status);
    }

    fn set_connected_now(&self) {
        self.set_status(ConnectionStatus::Connected { since: Utc::now() });
    }

    fn last_server(&self) -> Option<ServerInfo> {
        lock(&self.state).last_server.clone()
    }

    fn current_selection(&self) -> ServerSelectionMethod {
        self.selected_server.get().selection_method()
    }

    fn report(&self, error: &TunnelError) {
        self.events.fire(TelemetryEvent::Tunnel(error.clone()));
    }

    fn record(&self, error: &TunnelError) {
        self.errors.record(error);
        self.report(error);
    }

    async fn adapter_call<T, F>(&self, operation: &'static str, call: F) -> Result<T, AdapterError>
    where
        F: Future<Output = Result<T, AdapterError>>,
    {
        let timeout = self.settings.timeouts.adapter();
        tokio::time::timeout(timeout, call)
            .await
            .map_err(|_| AdapterError::Timeout { operation, timeout })?
    }

    fn ensure_result_loop(self: &Arc<Self>) {
        let Some(mut results) = lock(&self.tester_results).take() else {
            return;
        };

        let weak: Weak<Inner> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            while let Some(report) = results.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                // Queued before the last stop or restart.
                if !inner.tester.is_current(&report) {
                    debug!(result = ?report.result, "Dropping stale connection test result");
                    continue;
                }
                inner.handle_test_result(report.result).await;
            }
            debug!("Connection test result loop finished");
        });

        *lock(&self.result_loop) = Some(handle);
    }

    /// Generate a configuration with `method` and swap it into the adapter
    async fn update_locked(&self, method: ServerSelectionMethod, reassert: bool) -> Result<(), TunnelError> {
        let (configuration, server) = self.selector
            .generate(&method)
            .await
            .map_err(TunnelError::CouldNotGenerateTunnelConfiguration)?;

        lock(&self.state).last_server = Some(server.clone());
        self.status.publish_server(&server);
        lock(&self.bandwidth).reset();

        if reassert {
            self.set_status(ConnectionStatus::Reasserting);
        }

        self.adapter_call("update", self.adapter.update(&configuration, reassert)).await?;
        info!(server = %server.name, reassert, "Tunnel configuration updated");

        self.adapter_started(false);
        Ok(())
    }

    /// Mark the session connected and make sure the tester runs.
    ///
    /// A resumed session keeps its status and connection time.
    fn adapter_started(&self, resumed: bool) {
        if !resumed && !matches!(self.current_status(), ConnectionStatus::Connected { .. }) {
            self.set_connected_now();
        }

        match self.adapter.interface_name() {
            Some(interface) => {
                if let Err(e) = self.tester.start(&interface) {
                    warn!("Connection tester not started: {}", e);
                }
            }
            None => warn!("Adapter reported no interface, connection tester not started"),
        }
    }

    async fn start_locked(self: &Arc<Self>, options: StartOptions) -> Result<(), TunnelError> {
        if self.current_status().is_session_active() {
            return Err(TunnelError::AlreadyStarted);
        }

        self.ensure_result_loop();

        if let Some(selected) = options.selected_server {
            self.selected_server.set(selected);
        }
        if let Some(validity) = options.key_validity {
            self.rotation.set_key_validity(Some(validity));
        }

        info!(selection = %self.current_selection(), "Starting tunnel");
        self.set_status(ConnectionStatus::Connecting);
        self.health.set_connectivity_issues(false);
        self.errors.clear();

        match self.connect(options.simulate_failure).await {
            Ok(server) => {
                info!(server = %server.name, "Tunnel started");
                self.events.fire(TelemetryEvent::ActiveUser);
                Ok(())
            }
            Err(e) => {
                error!("Tunnel failed to start: {}", e);
                self.record(&e);
                self.set_status(ConnectionStatus::Disconnected);
                Err(e)
            }
        }
    }

    async fn connect(&self, simulate_failure: bool) -> Result<ServerInfo, TunnelError> {
        if simulate_failure {
            return Err(TunnelError::SimulatedFailure);
        }

        if self.rotation.is_expired() {
            debug!("Key expired before start, rotating");
            self.rotation.key_store().reset_current_key_pair();
        }

        let (configuration, server) = self.selector
            .generate(&self.current_selection())
            .await
            .map_err(TunnelError::CouldNotGenerateTunnelConfiguration)?;

        self.adapter_call("start", self.adapter.start(&configuration)).await?;

        lock(&self.state).last_server = Some(server.clone());
        self.status.publish_server(&server);
        lock(&self.bandwidth).reset();

        self.adapter_started(false);
        Ok(server)
    }

    async fn stop_locked(&self, reason: StopReason) {
        if self.current_status() == ConnectionStatus::Disconnected {
            debug!(?reason, "Tunnel already stopped");
            return;
        }

        info!(?reason, "Stopping tunnel");
        self.set_status(ConnectionStatus::Disconnecting);

        self.tester.stop();
        self.latency.stop();
        self.rotation.cancel_retry();

        if let Err(e) = self.adapter_call("stop", self.adapter.stop()).await {
            warn!("Adapter did not stop cleanly: {}", e);
        }

        lock(&self.bandwidth).reset();
        self.health.set_connectivity_issues(false);
        self.set_status(ConnectionStatus::Disconnected);

        if reason == StopReason::Superseded {
            self.notifications.show_superseded();
        }
    }

    async fn rekey_locked(self: &Arc<Self>, reassert: bool) -> Result<(), TunnelError> {
        if !self.current_status().is_session_active() {
            debug!("No active session, skipping rekey");
            return Ok(());
        }

        self.rotation.cancel_retry();
        let pair = self.rotation.key_store().reset_current_key_pair();
        info!(public_key = %pair.public, "Rekeying");

        match self.update_locked(self.current_selection(), reassert).await {
            Ok(()) => {
                self.events.fire(TelemetryEvent::RekeyCompleted);
                self.tester.test_immediately().await;
                Ok(())
            }
            Err(e) => {
                warn!("Rekey failed: {}", e);
                self.report(&e);

                let weak = Arc::downgrade(self);
                self.rotation.schedule_retry(async move {
                    if let Some(inner) = weak.upgrade() {
                        if let Err(e) = Rekey::rekey(&TunnelController { inner }).await {
                            debug!("Rekey retry failed: {}", e);
                        }
                    }
                });
                Err(e)
            }
        }
    }

    /// Rotate right away if the key expired, whatever the traffic
    async fn rekey_if_expired_locked(self: &Arc<Self>) {
        if !self.rotation.is_expired() {
            return;
        }

        info!("Key expired, rekeying");
        // Failures are reported and retried by the rekey itself.
        let _ = self.rekey_locked(false).await;
    }

    async fn fix_tunnel(self: &Arc<Self>) {
        let _guard = self.lifecycle.lock().await;
        if !self.current_status().is_session_active() {
            return;
        }

        let method = match self.last_server() {
            Some(server) => ServerSelectionMethod::AvoidServer(server.name),
            None => {
                warn!("No previous server to avoid, fixing with automatic selection");
                ServerSelectionMethod::Automatic
            }
        };

        info!(%method, "Attempting to fix the tunnel");
        match self.update_locked(method, true).await {
            Ok(()) => self.rekey_if_expired_locked().await,
            Err(e) => {
                warn!("Failed to fix the tunnel: {}", e);
                self.report(&e);
            }
        }
    }

    fn start_latency_reporter(&self) {
        let target = self.last_server()
            .and_then(|server| Some((server.endpoint?.addr, server.name)));
        let Some((ip, server)) = target else {
            warn!("No server address, latency reporter not started");
            self.latency.stop();
            return;
        };

        let network_type = self.tester
            .direct_interface()
            .map_or("unknown", |i| i.connection_type());
        self.latency.start(ip, server, network_type);
    }

    async fn stop_with_error(&self, error: TunnelError) {
        let _guard = self.lifecycle.lock().await;
        if !self.current_status().is_session_active() {
            return;
        }

        error!("Stopping tunnel: {}", error);
        self.record(&error);
        self.stop_locked(StopReason::ConnectionFailure).await;
    }

    async fn handle_test_result(self: &Arc<Self>, result: TestResult) {
        if !self.current_status().is_session_active() {
            debug!(?result, "Ignoring connection test result without a session");
            return;
        }

        match result {
            TestResult::Connected => {
                self.health.set_connectivity_issues(false);
                self.update_bandwidth_and_rekey().await;
                self.start_latency_reporter();
            }
            TestResult::Reconnected => {
                self.health.set_connectivity_issues(false);
                self.notifications.show_reconnected();
                if self.current_status() == ConnectionStatus::Reasserting {
                    self.set_connected_now();
                }
                self.update_bandwidth_and_rekey().await;
                self.start_latency_reporter();
            }
            TestResult::Disconnected { failure_count } => {
                self.health.set_connectivity_issues(true);
                lock(&self.bandwidth).reset();
                self.latency.stop();

                if failure_count == 1 {
                    self.notifications.show_reconnecting();
                    self.set_status(ConnectionStatus::Reasserting);
                    self.fix_tunnel().await;
                } else {
                    self.notifications.show_connection_failure();
                    self.stop_with_error(TunnelError::CouldNotFixConnection).await;
                }
            }
        }
    }

    async fn update_bandwidth_and_rekey(self: &Arc<Self>) {
        match self.adapter_call("byte_counters", self.adapter.byte_counters()).await {
            Ok((rx, tx)) => lock(&self.bandwidth).record(rx, tx),
            Err(e) => {
                debug!("Could not read byte counters: {}", e);
                lock(&self.bandwidth).prevent_idle();
            }
        }

        let idle = lock(&self.bandwidth).is_idle();
        if !idle {
            return;
        }

        let controller = TunnelController { inner: Arc::clone(self) };
        if let Err(e) = self.rotation.rekey_if_expired(&controller).await {
            debug!("Opportunistic rekey failed: {}", e);
        }
    }
}

/// Tunnel lifecycle controller
#[derive(Clone)]
pub struct TunnelController {
    inner: Arc<Inner>,
}

impl TunnelController {
    /// Create a controller; no session is started
    pub fn new(deps: ControllerDependencies) -> Self {
        let settings = deps.settings;
        let (tester, tester_results) =
            ConnectionTester::new(settings.tester.clone(), deps.prober, deps.interfaces);
        let selector = ServerSelector::new(
            deps.devices,
            Arc::clone(&deps.keys),
            settings.timeouts.registration(),
        );

        let inner = Inner {
            adapter: deps.adapter,
            selector,
            selected_server: deps.selected_server,
            rotation: KeyRotation::new(deps.keys, settings.keys.clone()),
            tester,
            tester_results: Mutex::new(Some(tester_results)),
            result_loop: Mutex::new(None),
            bandwidth: Mutex::new(BandwidthAnalyzer::new(settings.idle)),
            latency: LatencyReporter::new(deps.latency, Arc::clone(&deps.events), settings.latency.interval()),
            notifications: deps.notifications,
            events: deps.events,
            status: deps.status,
            health: deps.health,
            errors: deps.errors,
            state: Mutex::new(SessionState {
                status: ConnectionStatus::Disconnected,
                last_server: None,
            }),
            lifecycle: tokio::sync::Mutex::new(()),
            settings,
        };

        Self { inner: Arc::new(inner) }
    }

    /// Start a session with the stored server selection
    pub async fn start(&self) -> Result<(), TunnelError> {
        self.start_with_options(StartOptions::default()).await
    }

    pub async fn start_with_options(&self, options: StartOptions) -> Result<(), TunnelError> {
        let _guard = self.inner.lifecycle.lock().await;
        self.inner.start_locked(options).await
    }

    /// Stop the session. Stopping a stopped tunnel does nothing.
    pub async fn stop(&self, reason: StopReason) {
        let _guard = self.inner.lifecycle.lock().await;
        self.inner.stop_locked(reason).await;
    }

    /// Rotate the key and apply a configuration for it without reasserting
    pub async fn rekey(&self) -> Result<(), TunnelError> {
        self.rekey_with(false).await
    }

    /// Rotate the key, reconfiguring in place with the same selection.
    ///
    /// A failed rotation arms a retry, which never reasserts.
    pub async fn rekey_with(&self, reassert: bool) -> Result<(), TunnelError> {
        let _guard = self.inner.lifecycle.lock().await;
        self.inner.rekey_locked(reassert).await
    }

    /// Fail over away from the current server
    pub async fn fix_tunnel(&self) {
        self.inner.fix_tunnel().await;
    }

    /// Host is going to sleep
    pub async fn sleep(&self) {
        let _guard = self.inner.lifecycle.lock().await;
        debug!("Sleeping, pausing connection tests");
        self.inner.tester.stop();
    }

    /// Host woke up
    pub async fn wake(&self) {
        let _guard = self.inner.lifecycle.lock().await;
        if self.inner.current_status().is_session_active() {
            debug!("Woke up, resuming connection tests");
            self.inner.adapter_started(true);
            self.inner.rekey_if_expired_locked().await;
        }
    }

    /// Change the stored server choice, reconfiguring a live session
    pub async fn set_selected_server(&self, selected: SelectedServer) -> Result<(), TunnelError> {
        let _guard = self.inner.lifecycle.lock().await;
        if self.inner.selected_server.get() == selected {
            debug!(?selected, "Server already selected");
            return Ok(());
        }
        self.inner.selected_server.set(selected);

        if !self.inner.current_status().is_session_active() {
            return Ok(());
        }

        let method = self.inner.current_selection();
        self.inner.update_locked(method, true).await.inspect_err(|e| {
            warn!("Could not switch servers: {}", e);
            self.inner.report(e);
        })?;
        self.inner.rekey_if_expired_locked().await;
        Ok(())
    }

    /// Selection method the stored server choice implies
    pub fn current_selection(&self) -> ServerSelectionMethod {
        self.inner.current_selection()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.current_status()
    }

    pub fn last_server(&self) -> Option<ServerInfo> {
        self.inner.last_server()
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.errors.last_error()
    }

    pub fn is_having_connectivity_issues(&self) -> bool {
        self.inner.health.is_having_connectivity_issues()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.inner.status.subscribe()
    }

    /// Re-publish the current status and server
    pub fn request_status_update(&self) {
        self.inner.status.rebroadcast();
    }

    /// Expire the key, clear the server choice and stop without an error
    pub async fn reset_all_state(&self) {
        let _guard = self.inner.lifecycle.lock().await;
        info!("Resetting all state");
        self.inner.rotation.key_store().reset_current_key_pair();
        self.inner.selected_server.set(SelectedServer::Automatic);
        self.inner.errors.clear();
        self.inner.stop_locked(StopReason::ResetAllState).await;
    }

    /// Handle a raw app message, returning the response payload if any
    pub async fn handle_app_message(&self, bytes: &[u8]) -> Option<Vec<u8>> {
        let message = match AppMessage::decode(bytes) {
            Ok(message) => message,
            Err(e) => {
                warn!("Ignoring app message: {}", e);
                return None;
            }
        };

        debug!(?message, "App message");
        match message {
            AppMessage::ExpireKey => {
                self.inner.rotation.key_store().update_current_key_pair(Utc::now());
                if let Err(e) = self.rekey().await {
                    warn!("Rekey after expiring the key failed: {}", e);
                }
                None
            }
            AppMessage::GetLastError => self.last_error().map(String::into_bytes),
            AppMessage::GetRuntimeConfiguration => {
                self.inner.adapter.runtime_configuration().await.map(String::into_bytes)
            }
            AppMessage::IsHavingConnectivityIssues => {
                Some(encode_bool(self.is_having_connectivity_issues()))
            }
            AppMessage::SetSelectedServer(name) => {
                let selected = name.map_or(SelectedServer::Automatic, SelectedServer::Endpoint);
                // Failures are already reported.
                let _ = self.set_selected_server(selected).await;
                None
            }
            AppMessage::GetServerLocation => self.last_server().map(|s| s.location.into_bytes()),
            AppMessage::GetServerAddress => self.last_server()
                .and_then(|s| s.endpoint)
                .map(|e| e.addr.to_string().into_bytes()),
            AppMessage::SetKeyValidity(validity) => {
                self.inner.rotation.set_key_validity(validity);
                None
            }
            AppMessage::ResetAllState => {
                self.reset_all_state().await;
                None
            }
            AppMessage::TriggerTestNotification => {
                self.inner.notifications.show_test();
                None
            }
        }
    }
}

#[async_trait]
impl Rekey for TunnelController {
    async fn rekey(&self) -> Result<(), TunnelError> {
        TunnelController::rekey(self).await
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.result_loop).take() {
            handle.abort();
        }
    }
}
