//! Server Latency Reporter
//!
//! While connection tests pass, periodically measures how long the
//! connected server takes to answer and reports it as telemetry. The
//! reporter follows the server: starting it for a new address restarts
//! it, starting it for the same address does nothing.

use crate::settings::LatencySettings;
use crate::telemetry::{EventSink, TelemetryEvent};
use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Measures the round trip to a server
#[async_trait]
pub trait LatencyMeter: Send + Sync {
    /// Time to reach `ip`, or `None` when it could not be measured
    async fn measure(&self, ip: IpAddr) -> Option<Duration>;
}

/// Measures TCP connect time to a fixed server port
#[derive(Debug, Clone, Copy)]
pub struct TcpLatencyMeter {
    port: u16,
    timeout: Duration,
}

impl TcpLatencyMeter {
    pub fn new(settings: &LatencySettings) -> Self {
        Self {
            port: settings.port,
            timeout: settings.timeout(),
        }
    }
}

#[async_trait]
impl LatencyMeter for TcpLatencyMeter {
    async fn measure(&self, ip: IpAddr) -> Option<Duration> {
        let target = SocketAddr::new(ip, self.port);
        let started = Instant::now();

        match tokio::time::timeout(self.timeout, TcpStream::connect(target)).await {
            Ok(Ok(_)) => Some(started.elapsed()),
            Ok(Err(e)) => {
                debug!(%target, "Latency measurement failed: {}", e);
                None
            }
            Err(_) => {
                debug!(%target, "Latency measurement timed out");
                None
            }
        }
    }
}

struct Running {
    ip: IpAddr,
    task: JoinHandle<()>,
}

/// Periodic latency reporter for the connected server
pub struct LatencyReporter {
    meter: Arc<dyn LatencyMeter>,
    events: Arc<dyn EventSink>,
    interval: Duration,
    running: Mutex<Option<Running>>,
}

impl LatencyReporter {
    pub fn new(meter: Arc<dyn LatencyMeter>, events: Arc<dyn EventSink>, interval: Duration) -> Self {
        Self {
            meter,
            events,
            interval,
            running: Mutex::new(None),
        }
    }

    fn running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Report latency to `ip` every interval, the first one right away.
    ///
    /// Already reporting for `ip` is a no-op; another address restarts.
    pub fn start(&self, ip: IpAddr, server: String, network_type: &'static str) {
        let mut running = self.running();
        if let Some(current) = running.as_ref() {
            if current.ip == ip && !current.task.is_finished() {
                return;
            }
        }
        if let Some(previous) = running.take() {
            previous.task.abort();
        }

        let meter = Arc::clone(&self.meter);
        let events = Arc::clone(&self.events);
        let period = self.interval;
        info!(%ip, %server, "Starting latency reporter");

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                interval.tick().await;
                let Some(latency) = meter.measure(ip).await else {
                    continue;
                };

                let ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
                events.fire(TelemetryEvent::ReportLatency {
                    ms,
                    server: server.clone(),
                    network_type,
                });
            }
        });

        *running = Some(Running { ip, task });
    }

    /// Stop reporting. Safe to call when not started.
    pub fn stop(&self) {
        if let Some(running) = self.running().take() {
            running.task.abort();
            debug!(ip = %running.ip, "Latency reporter stopped");
        }
    }

    pub fn is_started(&self) -> bool {
        self.running().as_ref().is_some_and(|r| !r.task.is_finished())
    }

    /// Address currently being measured
    pub fn current_ip(&self) -> Option<IpAddr> {
        self.running().as_ref().map(|r| r.ip)
    }
}

impl Drop for LatencyReporter {
    fn drop(&mut self) {
        if let Some(running) = self.running().take() {
            running.task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeLatencyMeter, RecordingEventSink, wait_until};
    use std::net::Ipv4Addr;

    const SERVER_X: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1));
    const SERVER_Y: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 2));

    fn reporter() -> (LatencyReporter, Arc<FakeLatencyMeter>, Arc<RecordingEventSink>) {
        let meter = Arc::new(FakeLatencyMeter::new(Duration::from_millis(42)));
        let events = Arc::new(RecordingEventSink::default());
        let reporter = LatencyReporter::new(meter.clone(), events.clone(), Duration::from_secs(60));
        (reporter, meter, events)
    }

    #[tokio::test(start_paused = true)]
    async fn test_reports_right_away_and_every_interval() {
        let (reporter, meter, events) = reporter();

        reporter.start(SERVER_X, "X".into(), "ethernet");
        wait_until(|| events.names() == vec!["vpn_latency"]).await;

        tokio::time::sleep(Duration::from_secs(60)).await;
        wait_until(|| meter.measured().len() == 2).await;
        assert_eq!(meter.measured(), vec![SERVER_X, SERVER_X]);

        reporter.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_address_keeps_running() {
        let (reporter, meter, _events) = reporter();

        reporter.start(SERVER_X, "X".into(), "ethernet");
        wait_until(|| meter.measured().len() == 1).await;

        reporter.start(SERVER_X, "X".into(), "ethernet");
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(meter.measured().len(), 1);
        assert_eq!(reporter.current_ip(), Some(SERVER_X));

        reporter.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_address_restarts() {
        let (reporter, meter, _events) = reporter();

        reporter.start(SERVER_X, "X".into(), "ethernet");
        wait_until(|| meter.measured().len() == 1).await;

        reporter.start(SERVER_Y, "Y".into(), "ethernet");
        wait_until(|| meter.measured().len() == 2).await;

        assert_eq!(meter.measured(), vec![SERVER_X, SERVER_Y]);
        assert_eq!(reporter.current_ip(), Some(SERVER_Y));
        reporter.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_ends_reporting() {
        let (reporter, meter, _events) = reporter();

        reporter.start(SERVER_X, "X".into(), "ethernet");
        wait_until(|| meter.measured().len() == 1).await;
        reporter.stop();
        reporter.stop();

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(meter.measured().len(), 1);
        assert!(!reporter.is_started());
        assert_eq!(reporter.current_ip(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_measurement_is_not_reported() {
        let (reporter, meter, events) = reporter();
        meter.set_latency(None);

        reporter.start(SERVER_X, "X".into(), "wifi");
        wait_until(|| meter.measured().len() == 1).await;

        assert!(events.names().is_empty());
        reporter.stop();
    }
}
