//! Fakes shared by the unit tests

use crate::adapter::TunnelAdapter;
use crate::config::{Endpoint, InterfaceConfiguration, PeerConfiguration, TunnelConfiguration};
use crate::error::{AdapterError, RegistrationError};
use crate::keys::{KeyPair, PrivateKey, PublicKey};
use crate::latency::LatencyMeter;
use crate::notifications::Notifications;
use crate::selection::{DeviceManagement, Registration, ServerInfo, ServerSelectionMethod};
use crate::telemetry::{EventSink, TelemetryEvent};
use crate::tester::{InterfaceResolver, NetworkInterface, ProbeInterfaces, ProbeRoute, Prober, TesterError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Poll `condition` on the (usually paused) tokio clock
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..600 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("condition not met within 60s");
}

/// Adapter that records calls
pub struct FakeAdapter {
    interface: String,
    calls: Mutex<Vec<String>>,
    start_error: Mutex<Option<AdapterError>>,
    running: AtomicBool,
    bytes: AtomicU64,
    traffic_per_read: AtomicU64,
}

impl FakeAdapter {
    pub fn new(interface: &str) -> Self {
        Self {
            interface: interface.to_string(),
            calls: Mutex::new(Vec::new()),
            start_error: Mutex::new(None),
            running: AtomicBool::new(false),
            bytes: AtomicU64::new(0),
            traffic_per_read: AtomicU64::new(0),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn fail_start(&self, error: AdapterError) {
        *self.start_error.lock().unwrap() = Some(error);
    }

    /// Bytes added to both counters on every read
    pub fn set_traffic_per_read(&self, bytes: u64) {
        self.traffic_per_read.store(bytes, Ordering::SeqCst);
    }
}

#[async_trait]
impl TunnelAdapter for FakeAdapter {
    async fn start(&self, _configuration: &TunnelConfiguration) -> Result<(), AdapterError> {
        if let Some(error) = self.start_error.lock().unwrap().take() {
            return Err(error);
        }
        self.calls.lock().unwrap().push("start".into());
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<(), AdapterError> {
        self.calls.lock().unwrap().push("stop".into());
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn update(&self, _configuration: &TunnelConfiguration, reassert: bool) -> Result<(), AdapterError> {
        let call = if reassert { "update(reassert)" } else { "update" };
        self.calls.lock().unwrap().push(call.into());
        Ok(())
    }

    async fn byte_counters(&self) -> Result<(u64, u64), AdapterError> {
        let step = self.traffic_per_read.load(Ordering::SeqCst);
        let total = self.bytes.fetch_add(step, Ordering::SeqCst) + step;
        Ok((total, total))
    }

    fn interface_name(&self) -> Option<String> {
        self.running.load(Ordering::SeqCst).then(|| self.interface.clone())
    }

    async fn runtime_configuration(&self) -> Option<String> {
        self.running.load(Ordering::SeqCst).then(|| format!("interface {}", self.interface))
    }
}

struct FakeServer {
    name: String,
    public_key: PublicKey,
    endpoint: Endpoint,
}

/// Registration collaborator over a fixed server list.
///
/// Server `i` is at `192.0.2.(i + 1):51820` in "Location <name>".
pub struct FakeDeviceManager {
    servers: Vec<FakeServer>,
    failures: Mutex<VecDeque<RegistrationError>>,
    key_expiry: Mutex<Option<DateTime<Utc>>>,
    delay: Mutex<Option<Duration>>,
    last_method: Mutex<Option<ServerSelectionMethod>>,
}

impl FakeDeviceManager {
    pub fn with_servers(names: &[&str]) -> Self {
        let servers = names.iter()
            .enumerate()
            .map(|(i, name)| FakeServer {
                name: name.to_string(),
                public_key: PrivateKey::generate().public_key(),
                endpoint: Endpoint::ipv4(192, 0, 2, i as u8 + 1, 51820),
            })
            .collect();

        Self {
            servers,
            failures: Mutex::new(VecDeque::new()),
            key_expiry: Mutex::new(None),
            delay: Mutex::new(None),
            last_method: Mutex::new(None),
        }
    }

    /// Fail the next registration with `error`
    pub fn fail_next(&self, error: RegistrationError) {
        self.failures.lock().unwrap().push_back(error);
    }

    pub fn set_key_expiry(&self, expiry: Option<DateTime<Utc>>) {
        *self.key_expiry.lock().unwrap() = expiry;
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn last_method(&self) -> Option<ServerSelectionMethod> {
        self.last_method.lock().unwrap().clone()
    }

    fn pick(&self, method: &ServerSelectionMethod) -> Result<&FakeServer, RegistrationError> {
        let first = self.servers.first().ok_or(RegistrationError::NoServerListFound);
        match method {
            ServerSelectionMethod::Automatic => first,
            ServerSelectionMethod::PreferredServer(name) => self.servers.iter()
                .find(|s| &s.name == name)
                .ok_or_else(|| RegistrationError::UnknownServer(name.clone())),
            ServerSelectionMethod::AvoidServer(name) => self.servers.iter()
                .find(|s| &s.name != name)
                .map_or(first, Ok),
        }
    }
}

#[async_trait]
impl DeviceManagement for FakeDeviceManager {
    async fn generate_configuration(
        &self,
        method: &ServerSelectionMethod,
        key_pair: &KeyPair,
    ) -> Result<Registration, RegistrationError> {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        *self.last_method.lock().unwrap() = Some(method.clone());
        if let Some(error) = self.failures.lock().unwrap().pop_front() {
            return Err(error);
        }

        let server = self.pick(method)?;
        let configuration = TunnelConfiguration {
            name: server.name.clone(),
            interface: InterfaceConfiguration {
                private_key: key_pair.private.clone(),
                addresses: vec!["10.64.0.2/32".parse().map_err(|_| RegistrationError::CouldNotGetInterfaceAddressRange)?],
                dns: vec![IpAddr::V4(Ipv4Addr::new(10, 64, 0, 1))],
                listen_port: None,
            },
            peers: vec![PeerConfiguration::new(server.public_key.clone(), server.endpoint)],
        };

        Ok(Registration {
            configuration,
            server: ServerInfo {
                name: server.name.clone(),
                location: format!("Location {}", server.name),
                endpoint: Some(server.endpoint),
                public_key: server.public_key.to_base64(),
            },
            key_expires_at: *self.key_expiry.lock().unwrap(),
        })
    }
}

/// Prober with scripted outcomes.
///
/// Each test pops one `(tunnel, direct)` pair; once the script is empty
/// both probes succeed.
#[derive(Default)]
pub struct FakeProber {
    tunnel: Mutex<VecDeque<bool>>,
    direct: Mutex<VecDeque<bool>>,
    tunnel_delay: Mutex<Option<Duration>>,
    probes: AtomicUsize,
}

impl FakeProber {
    pub fn healthy() -> Self {
        Self::default()
    }

    pub fn push(&self, tunnel_ok: bool, direct_ok: bool) {
        self.tunnel.lock().unwrap().push_back(tunnel_ok);
        self.direct.lock().unwrap().push_back(direct_ok);
    }

    pub fn set_tunnel_delay(&self, delay: Duration) {
        *self.tunnel_delay.lock().unwrap() = Some(delay);
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Prober for FakeProber {
    async fn probe(&self, route: &ProbeRoute, _endpoint: &str) -> bool {
        self.probes.fetch_add(1, Ordering::SeqCst);

        if route.is_tunnel() {
            let delay = *self.tunnel_delay.lock().unwrap();
            let ok = self.tunnel.lock().unwrap().pop_front().unwrap_or(true);
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            ok
        } else {
            self.direct.lock().unwrap().pop_front().unwrap_or(true)
        }
    }
}

/// Resolver that knows a fixed set of interface names
pub struct FakeInterfaces {
    names: Vec<String>,
}

impl FakeInterfaces {
    pub fn new(names: &[&str]) -> Self {
        Self {
            names: names.iter().map(|n| n.to_string()).collect(),
        }
    }
}

impl InterfaceResolver for FakeInterfaces {
    fn resolve(&self, tunnel_interface: &str) -> Result<ProbeInterfaces, TesterError> {
        if !self.names.iter().any(|n| n == tunnel_interface) {
            return Err(TesterError::InterfaceNotFound(tunnel_interface.to_string()));
        }

        Ok(ProbeInterfaces {
            tunnel: NetworkInterface {
                name: tunnel_interface.to_string(),
                addresses: vec![IpAddr::V4(Ipv4Addr::new(10, 64, 0, 2))],
            },
            direct: NetworkInterface {
                name: "eth0".to_string(),
                addresses: vec![IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20))],
            },
        })
    }
}

/// Latency meter with a fixed answer that records what it measured
pub struct FakeLatencyMeter {
    latency: Mutex<Option<Duration>>,
    measured: Mutex<Vec<IpAddr>>,
}

impl FakeLatencyMeter {
    pub fn new(latency: Duration) -> Self {
        Self {
            latency: Mutex::new(Some(latency)),
            measured: Mutex::new(Vec::new()),
        }
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock().unwrap() = latency;
    }

    pub fn measured(&self) -> Vec<IpAddr> {
        self.measured.lock().unwrap().clone()
    }
}

#[async_trait]
impl LatencyMeter for FakeLatencyMeter {
    async fn measure(&self, ip: IpAddr) -> Option<Duration> {
        self.measured.lock().unwrap().push(ip);
        *self.latency.lock().unwrap()
    }
}

/// Records reportable event names
#[derive(Default)]
pub struct RecordingEventSink {
    names: Mutex<Vec<&'static str>>,
}

impl RecordingEventSink {
    pub fn names(&self) -> Vec<&'static str> {
        self.names.lock().unwrap().clone()
    }
}

impl EventSink for RecordingEventSink {
    fn fire(&self, event: TelemetryEvent) {
        if let Some(event) = event.reportable() {
            self.names.lock().unwrap().push(event.name);
        }
    }
}

/// Records which notifications were shown
#[derive(Default)]
pub struct RecordingNotifications {
    shown: Mutex<Vec<&'static str>>,
}

impl RecordingNotifications {
    pub fn shown(&self) -> Vec<&'static str> {
        self.shown.lock().unwrap().clone()
    }

    fn push(&self, name: &'static str) {
        self.shown.lock().unwrap().push(name);
    }
}

impl Notifications for RecordingNotifications {
    fn show_reconnecting(&self) {
        self.push("reconnecting");
    }

    fn show_reconnected(&self) {
        self.push("reconnected");
    }

    fn show_connection_failure(&self) {
        self.push("connection_failure");
    }

    fn show_superseded(&self) {
        self.push("superseded");
    }

    fn show_test(&self) {
        self.push("test");
    }
}
