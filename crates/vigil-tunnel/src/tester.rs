//! Connection Tester
//!
//! Periodically checks that traffic really flows through the tunnel by
//! opening two TCP connections to the same endpoint at the same time:
//! one bound to the tunnel interface and one bound to a physical
//! interface. Comparing the two tells a broken tunnel apart from a
//! network that is simply down.
//!
//! | tunnel | direct | result |
//! |--------|--------|--------|
//! | ok     | any    | `Connected`, or `Reconnected` after failures |
//! | fail   | ok     | `Disconnected(failure_count)` |
//! | fail   | fail   | nothing reported |

use crate::settings::TesterSettings;
use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use sysinfo::Networks;
use tokio::net::TcpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Outcome of one conclusive test
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestResult {
    Connected,
    /// Connected again after at least one failure
    Reconnected,
    /// Consecutive tunnel-only failures so far
    Disconnected { failure_count: u32 },
}

/// A result stamped with the tester run it came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestReport {
    pub result: TestResult,
    pub epoch: u64,
}

/// Classify a pair of probe outcomes.
///
/// Returns the result to report and the new failure count, or `None`
/// when both probes failed and nothing can be concluded.
pub fn classify(tunnel_ok: bool, direct_ok: bool, failure_count: u32) -> Option<(TestResult, u32)> {
    match (tunnel_ok, direct_ok) {
        (true, _) if failure_count > 0 => Some((TestResult::Reconnected, 0)),
        (true, _) => Some((TestResult::Connected, 0)),
        (false, true) => {
            let failure_count = failure_count.saturating_add(1);
            Some((TestResult::Disconnected { failure_count }, failure_count))
        }
        (false, false) => None,
    }
}

/// A network interface and its addresses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInterface {
    pub name: String,
    pub addresses: Vec<IpAddr>,
}

impl NetworkInterface {
    /// Coarse link type from the interface name: `wifi`, `cellular`,
    /// `ethernet` or `unknown`
    pub fn connection_type(&self) -> &'static str {
        let name = self.name.as_str();
        if name.starts_with("wl") || name.starts_with("wifi") {
            "wifi"
        } else if name.starts_with("ww") || name.starts_with("pdp_ip") || name.starts_with("rmnet") {
            "cellular"
        } else if name.starts_with("eth") || name.starts_with("en") {
            "ethernet"
        } else {
            "unknown"
        }
    }

    fn address_for(&self, target: &SocketAddr) -> Option<IpAddr> {
        self.addresses.iter()
            .copied()
            .find(|a| a.is_ipv4() == target.is_ipv4())
    }
}

/// Interfaces the two probes are bound to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeInterfaces {
    pub tunnel: NetworkInterface,
    /// Physical interface the direct probe is pinned to, never the tunnel
    pub direct: NetworkInterface,
}

/// Which side of the comparison a probe is on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeRoute {
    Tunnel(NetworkInterface),
    Direct(NetworkInterface),
}

impl ProbeRoute {
    pub fn is_tunnel(&self) -> bool {
        matches!(self, ProbeRoute::Tunnel(_))
    }

    fn interface(&self) -> &NetworkInterface {
        match self {
            ProbeRoute::Tunnel(interface) | ProbeRoute::Direct(interface) => interface,
        }
    }
}

/// Opens a single connection over a route
#[async_trait]
pub trait Prober: Send + Sync {
    /// Whether `endpoint` (host:port) accepted a connection over `route`
    async fn probe(&self, route: &ProbeRoute, endpoint: &str) -> bool;
}

/// Looks up the interfaces to probe over
pub trait InterfaceResolver: Send + Sync {
    fn resolve(&self, tunnel_interface: &str) -> Result<ProbeInterfaces, TesterError>;
}

/// Tester errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TesterError {
    #[error("Network interface not found: {0}")]
    InterfaceNotFound(String),

    #[error("No physical interface outside of {0} to compare against")]
    NoPhysicalInterface(String),
}

/// TCP connect prober bound to an interface
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpProber;

impl TcpProber {
    async fn connect(route: &ProbeRoute, endpoint: &str) -> std::io::Result<()> {
        let target = tokio::net::lookup_host(endpoint)
            .await?
            .next()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "endpoint did not resolve"))?;

        let socket = if target.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };

        Self::bind(&socket, route.interface(), &target)?;

        let stream = socket.connect(target).await?;
        debug!(local = ?stream.local_addr().ok(), %target, "Probe connected");
        Ok(())
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn bind(socket: &TcpSocket, interface: &NetworkInterface, target: &SocketAddr) -> std::io::Result<()> {
        match socket.bind_device(Some(interface.name.as_bytes())) {
            Ok(()) => Ok(()),
            // Binding to a device needs privileges; the address still pins the route.
            Err(e) => {
                debug!(interface = %interface.name, "bind_device failed ({}), binding to address", e);
                Self::bind_address(socket, interface, target)
            }
        }
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    fn bind(socket: &TcpSocket, interface: &NetworkInterface, target: &SocketAddr) -> std::io::Result<()> {
        Self::bind_address(socket, interface, target)
    }

    fn bind_address(socket: &TcpSocket, interface: &NetworkInterface, target: &SocketAddr) -> std::io::Result<()> {
        let addr = interface.address_for(target).ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                format!("{} has no address in the target's family", interface.name),
            )
        })?;
        socket.bind(SocketAddr::new(addr, 0))
    }
}

#[async_trait]
impl Prober for TcpProber {
    async fn probe(&self, route: &ProbeRoute, endpoint: &str) -> bool {
        match Self::connect(route, endpoint).await {
            Ok(()) => true,
            Err(e) => {
                debug!(tunnel = route.is_tunnel(), "Probe to {} failed: {}", endpoint, e);
                false
            }
        }
    }
}

/// Name prefixes of bridges, container links and other tunnels
const VIRTUAL_PREFIXES: &[&str] = &[
    "lo", "docker", "br-", "bridge", "veth", "virbr", "vmnet", "vboxnet", "tun", "tap", "wg",
    "utun", "ipsec", "zt", "tailscale", "cni", "flannel", "cali", "kube", "lxc", "lxd",
    "podman", "awdl", "llw", "anpi", "gif", "stf",
];

/// Name prefixes of physical links, most preferred first
const PHYSICAL_PREFIXES: &[&str] = &["eth", "en", "wl", "ww"];

fn is_virtual(name: &str) -> bool {
    VIRTUAL_PREFIXES.iter().any(|prefix| name.starts_with(prefix))
}

fn physical_rank(name: &str) -> usize {
    PHYSICAL_PREFIXES.iter()
        .position(|prefix| name.starts_with(prefix))
        .unwrap_or(PHYSICAL_PREFIXES.len())
}

/// Pick the interface the direct probe is bound to.
///
/// Candidates must not be the tunnel, must not look virtual and need a
/// routable address. The interface carrying the default route wins,
/// then physical links by kind, then by name.
pub fn select_direct_interface(
    tunnel_interface: &str,
    default_route: Option<&str>,
    candidates: impl IntoIterator<Item = NetworkInterface>,
) -> Option<NetworkInterface> {
    let mut usable: Vec<NetworkInterface> = candidates.into_iter()
        .filter(|i| i.name != tunnel_interface && !is_virtual(&i.name))
        .map(|mut i| {
            i.addresses.retain(|a| !a.is_loopback() && !a.is_unspecified());
            i
        })
        .filter(|i| !i.addresses.is_empty())
        .collect();

    usable.sort_by(|a, b| {
        let a_default = Some(a.name.as_str()) == default_route;
        let b_default = Some(b.name.as_str()) == default_route;
        b_default.cmp(&a_default)
            .then_with(|| physical_rank(&a.name).cmp(&physical_rank(&b.name)))
            .then_with(|| a.name.cmp(&b.name))
    });

    usable.into_iter().next()
}

/// Interface of the lowest-metric IPv4 default route in a
/// `/proc/net/route` table, skipping `exclude`
pub fn default_route_interface(route_table: &str, exclude: &str) -> Option<String> {
    route_table.lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let (iface, destination, metric, mask) =
                (fields.first()?, fields.get(1)?, fields.get(6)?, fields.get(7)?);
            let is_default = *destination == "00000000" && *mask == "00000000";
            (is_default && *iface != exclude).then(|| (metric.parse::<u32>().unwrap_or(u32::MAX), iface.to_string()))
        })
        .min()
        .map(|(_, iface)| iface)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn system_default_route(exclude: &str) -> Option<String> {
    let table = std::fs::read_to_string("/proc/net/route").ok()?;
    default_route_interface(&table, exclude)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn system_default_route(_exclude: &str) -> Option<String> {
    None
}

/// Resolves interfaces from the live system
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemInterfaces;

impl InterfaceResolver for SystemInterfaces {
    fn resolve(&self, tunnel_interface: &str) -> Result<ProbeInterfaces, TesterError> {
        let networks = Networks::new_with_refreshed_list();

        let interfaces: Vec<NetworkInterface> = networks.list()
            .iter()
            .map(|(name, data)| NetworkInterface {
                name: name.clone(),
                addresses: data.ip_networks().iter().map(|n| n.addr).collect(),
            })
            .collect();

        let tunnel = interfaces.iter()
            .find(|i| i.name == tunnel_interface)
            .cloned()
            .ok_or_else(|| TesterError::InterfaceNotFound(tunnel_interface.to_string()))?;

        let default_route = system_default_route(tunnel_interface);
        let direct = select_direct_interface(tunnel_interface, default_route.as_deref(), interfaces)
            .ok_or_else(|| TesterError::NoPhysicalInterface(tunnel_interface.to_string()))?;
        debug!(tunnel = %tunnel.name, direct = %direct.name, ?default_route, "Resolved probe interfaces");

        Ok(ProbeInterfaces { tunnel, direct })
    }
}

struct TesterCore {
    settings: TesterSettings,
    prober: Arc<dyn Prober>,
    resolver: Arc<dyn InterfaceResolver>,
    results: mpsc::UnboundedSender<TestReport>,
    running: AtomicBool,
    /// Bumped on every start and stop; stale tests compare against it
    epoch: AtomicU64,
    failure_count: AtomicU32,
    interfaces: Mutex<Option<ProbeInterfaces>>,
    schedule: Mutex<Option<JoinHandle<()>>>,
}

impl TesterCore {
    fn interfaces(&self) -> MutexGuard<'_, Option<ProbeInterfaces>> {
        self.interfaces.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn schedule(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.schedule.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cancel_schedule(&self) {
        if let Some(handle) = self.schedule().take() {
            handle.abort();
        }
    }

    async fn run_test(&self) {
        let epoch = self.epoch.load(Ordering::SeqCst);
        let Some(interfaces) = self.interfaces().clone() else {
            return;
        };

        let timeout = self.settings.timeout();
        let endpoint = self.settings.endpoint.as_str();
        let tunnel_route = ProbeRoute::Tunnel(interfaces.tunnel);
        let direct_route = ProbeRoute::Direct(interfaces.direct);

        let (tunnel, direct) = tokio::join!(
            tokio::time::timeout(timeout, self.prober.probe(&tunnel_route, endpoint)),
            tokio::time::timeout(timeout, self.prober.probe(&direct_route, endpoint)),
        );
        let tunnel_ok = tunnel.unwrap_or(false);
        let direct_ok = direct.unwrap_or(false);

        if !self.running.load(Ordering::SeqCst) || self.epoch.load(Ordering::SeqCst) != epoch {
            debug!("Discarding connection test result from a stopped tester");
            return;
        }

        let failures = self.failure_count.load(Ordering::SeqCst);
        match classify(tunnel_ok, direct_ok, failures) {
            Some((result, failures)) => {
                self.failure_count.store(failures, Ordering::SeqCst);
                debug!(tunnel_ok, direct_ok, ?result, "Connection test finished");
                if self.results.send(TestReport { result, epoch }).is_err() {
                    warn!("Connection test result receiver is gone");
                }
            }
            None => debug!("Both probes failed, connection test inconclusive"),
        }
    }
}

fn spawn_schedule(core: &Arc<TesterCore>, first_test: Instant) -> JoinHandle<()> {
    let core = Arc::clone(core);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(first_test, core.settings.interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            if !core.running.load(Ordering::SeqCst) {
                break;
            }
            core.run_test().await;
        }
    })
}

/// Periodic tunnel connectivity tester
pub struct ConnectionTester {
    core: Arc<TesterCore>,
}

impl ConnectionTester {
    /// Create a stopped tester and the receiver its results are delivered to
    pub fn new(
        settings: TesterSettings,
        prober: Arc<dyn Prober>,
        resolver: Arc<dyn InterfaceResolver>,
    ) -> (Self, mpsc::UnboundedReceiver<TestReport>) {
        let (results, receiver) = mpsc::unbounded_channel();
        let core = TesterCore {
            settings,
            prober,
            resolver,
            results,
            running: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            failure_count: AtomicU32::new(0),
            interfaces: Mutex::new(None),
            schedule: Mutex::new(None),
        };

        (Self { core: Arc::new(core) }, receiver)
    }

    /// Start testing over `interface_name`.
    ///
    /// The first test runs right away. Starting a running tester is a no-op.
    pub fn start(&self, interface_name: &str) -> Result<(), TesterError> {
        if self.core.running.load(Ordering::SeqCst) {
            debug!("Connection tester already running");
            return Ok(());
        }

        let interfaces = self.core.resolver.resolve(interface_name)?;
        *self.core.interfaces() = Some(interfaces);
        self.core.failure_count.store(0, Ordering::SeqCst);
        self.core.epoch.fetch_add(1, Ordering::SeqCst);
        self.core.running.store(true, Ordering::SeqCst);

        self.core.cancel_schedule();
        *self.core.schedule() = Some(spawn_schedule(&self.core, Instant::now()));

        info!(interface = interface_name, interval = ?self.core.settings.interval(), "Connection tester started");
        Ok(())
    }

    /// Stop testing. Results of tests still in flight are discarded.
    pub fn stop(&self) {
        self.core.epoch.fetch_add(1, Ordering::SeqCst);
        if self.core.running.swap(false, Ordering::SeqCst) {
            info!("Connection tester stopped");
        }
        self.core.cancel_schedule();
    }

    /// Run one test now, then resume the regular schedule
    pub async fn test_immediately(&self) {
        if !self.core.running.load(Ordering::SeqCst) {
            return;
        }

        self.core.cancel_schedule();
        self.core.run_test().await;

        if self.core.running.load(Ordering::SeqCst) {
            let next = Instant::now() + self.core.settings.interval();
            *self.core.schedule() = Some(spawn_schedule(&self.core, next));
        }
    }

    pub fn is_running(&self) -> bool {
        self.core.running.load(Ordering::SeqCst)
    }

    /// Whether `report` belongs to the current run. Reports queued before
    /// a stop or restart are stale.
    pub fn is_current(&self, report: &TestReport) -> bool {
        self.is_running() && report.epoch == self.core.epoch.load(Ordering::SeqCst)
    }

    /// Physical interface the direct probe is bound to
    pub fn direct_interface(&self) -> Option<NetworkInterface> {
        self.core.interfaces().as_ref().map(|i| i.direct.clone())
    }

    /// Consecutive tunnel-only failures
    pub fn failure_count(&self) -> u32 {
        self.core.failure_count.load(Ordering::SeqCst)
    }
}

impl Drop for ConnectionTester {
    fn drop(&mut self) {
        self.core.cancel_schedule();
    }
}
