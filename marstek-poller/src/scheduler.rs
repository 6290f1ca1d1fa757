//! Poll scheduler
//!
//! Drives poll cycles on a fixed interval until the stop flag is raised,
//! then marks every battery offline. All exchanges run sequentially on the
//! one leased socket.

use futures::FutureExt;
use std::net::SocketAddrV4;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::config::PollerConfig;
use crate::error::Result;
use crate::lease::{BindRetry, SocketLease};
use crate::poll::Poller;
use crate::publisher::Publisher;
use crate::registry::DeviceRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

/// Stop request shared with the signal handler; written once, read by the loop
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Timing and socket settings of the scheduler
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub interval: Duration,
    pub stop_check: Duration,
    pub bind_addr: SocketAddrV4,
    pub bind_retry: BindRetry,
    pub socket_per_cycle: bool,
}

impl SchedulerSettings {
    pub fn from_config(config: &PollerConfig) -> Self {
        Self {
            interval: config.polling.interval(),
            stop_check: config.polling.stop_check(),
            bind_addr: config.api.bind_addr(),
            bind_retry: config.api.bind_retry(),
            socket_per_cycle: config.polling.socket_per_cycle,
        }
    }
}

pub struct Scheduler<P> {
    settings: SchedulerSettings,
    registry: DeviceRegistry,
    poller: Poller,
    publisher: P,
    lease: Option<SocketLease>,
    state: SchedulerState,
}

impl<P: Publisher> Scheduler<P> {
    pub fn new(settings: SchedulerSettings, registry: DeviceRegistry, poller: Poller, publisher: P) -> Self {
        Self {
            settings,
            registry,
            poller,
            publisher,
            lease: None,
            state: SchedulerState::Idle,
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Binds the protocol port and announces the batteries
    ///
    /// A `BindConflict` here is fatal for the caller: nothing can be polled
    /// without the fixed port.
    pub async fn start(&mut self) -> Result<()> {
        if self.state != SchedulerState::Idle {
            debug!("start ignored in state {:?}", self.state);
            return Ok(());
        }

        self.lease = Some(SocketLease::acquire(self.settings.bind_addr, self.settings.bind_retry).await?);
        for device in self.registry.devices() {
            self.publisher.publish_discovery_metadata(device);
        }

        self.state = SchedulerState::Running;
        info!(
            "Starting polling loop (interval: {:?}, {} batteries)",
            self.settings.interval,
            self.registry.len()
        );
        Ok(())
    }

    /// One poll cycle followed by publication; returns the number of batteries polled
    pub async fn run_cycle(&mut self) -> Result<usize> {
        if self.lease.as_ref().map_or(true, |l| !l.is_active()) {
            self.lease = Some(SocketLease::acquire(self.settings.bind_addr, self.settings.bind_retry).await?);
        }

        let results = match &self.lease {
            Some(lease) => {
                let socket = lease.socket()?;
                self.poller.poll_once(socket, &mut self.registry).await
            }
            None => Vec::new(),
        };

        for (device, result) in &results {
            self.publisher.publish_state(device, result);
            self.publisher.publish_availability(device, result.is_online());
        }

        if self.settings.socket_per_cycle {
            if let Some(lease) = self.lease.as_mut() {
                lease.release();
            }
        }

        let online = results.iter().filter(|(_, r)| r.is_online()).count();
        debug!("Poll cycle done: {}/{} batteries online", online, results.len());
        Ok(results.len())
    }

    /// Polls until `stop` is raised, then runs [`Scheduler::stop`]
    pub async fn run(&mut self, stop: &StopFlag) {
        while self.state == SchedulerState::Running && !stop.is_stop_requested() {
            match AssertUnwindSafe(self.run_cycle()).catch_unwind().await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => error!("Polling error, cycle skipped: {}", e),
                Err(_) => error!("Poll cycle panicked, cycle skipped"),
            }

            if !self.sleep_interval(stop).await {
                break;
            }
        }
        self.stop();
    }

    /// Sleeps one interval in slices; false when a stop was requested meanwhile
    async fn sleep_interval(&self, stop: &StopFlag) -> bool {
        let deadline = Instant::now() + self.settings.interval;
        loop {
            if stop.is_stop_requested() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            tokio::time::sleep((deadline - now).min(self.settings.stop_check)).await;
        }
    }

    /// Marks every battery offline and releases the socket. Idempotent.
    pub fn stop(&mut self) {
        if self.state == SchedulerState::Stopped {
            return;
        }
        info!("Stopping poller...");
        self.state = SchedulerState::Stopping;

        for device in self.registry.devices() {
            self.publisher.publish_availability(device, false);
        }
        self.registry.mark_all_offline();

        if let Some(mut lease) = self.lease.take() {
            lease.release();
        }
        self.state = SchedulerState::Stopped;
        info!("Poller stopped, {} batteries marked offline", self.registry.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::TopicScheme;
    use crate::exchange::ExchangePolicy;
    use crate::publisher::MqttPublisher;
    use crate::registry::Device;
    use marstek_devkit::{FakeDevice, MockMqttClient, ReplyBuilder, TestHarness};
    use std::net::Ipv4Addr;

    fn settings(socket_per_cycle: bool) -> SchedulerSettings {
        SchedulerSettings {
            interval: Duration::from_millis(100),
            stop_check: Duration::from_millis(10),
            bind_addr: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0),
            bind_retry: BindRetry { attempts: 1, delay: Duration::from_millis(10) },
            socket_per_cycle,
        }
    }

    fn poller() -> Poller {
        Poller::new(
            ExchangePolicy {
                timeout: Duration::from_millis(150),
                max_attempts: 2,
                backoff: Duration::from_millis(10),
            },
            Duration::ZERO,
        )
    }

    fn device(name: &str, fake: &FakeDevice) -> Device {
        let id = name.to_lowercase().replace(' ', "_");
        Device::new(name, fake.addr(), id.clone(), format!("marstek_{id}_soc"))
    }

    fn scheduler(
        harness: &TestHarness,
        devices: Vec<Device>,
        socket_per_cycle: bool,
    ) -> Scheduler<MqttPublisher<MockMqttClient>> {
        Scheduler::new(
            settings(socket_per_cycle),
            DeviceRegistry::new(devices),
            poller(),
            MqttPublisher::new(harness.mqtt_client.clone(), TopicScheme::new("homeassistant", "marstek")),
        )
    }

    #[tokio::test]
    async fn test_lifecycle_publishes_and_marks_offline() {
        let harness = TestHarness::new();
        let a = FakeDevice::responsive(ReplyBuilder::es_get_mode(87, "Auto", 120, 0)).await.unwrap();
        let c = FakeDevice::silent().await.unwrap();
        let mut scheduler = scheduler(&harness, vec![device("Fase A", &a), device("Fase C", &c)], false);

        assert_eq!(scheduler.state(), SchedulerState::Idle);
        scheduler.start().await.unwrap();
        assert_eq!(scheduler.state(), SchedulerState::Running);
        harness.assert_retained("homeassistant/sensor/fase_a_soc/config").unwrap();

        assert_eq!(scheduler.run_cycle().await.unwrap(), 2);
        harness.assert_availability("fase_a", "online").unwrap();
        harness.assert_availability("fase_c", "offline").unwrap();
        assert_eq!(harness.last_state("fase_a").unwrap().unwrap()["soc"], 87);
        assert!(harness.last_state("fase_c").unwrap().is_none());

        scheduler.stop();
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
        harness.assert_availability("fase_a", "offline").unwrap();
        harness.assert_availability("fase_c", "offline").unwrap();
        assert!(scheduler.registry().devices().iter().all(|d| !d.is_online()));

        let published = harness.mqtt_client.get_published_messages().len();
        scheduler.stop();
        assert_eq!(harness.mqtt_client.get_published_messages().len(), published);
    }

    #[tokio::test]
    async fn test_run_until_stop_flag() {
        let harness = TestHarness::new();
        let a = FakeDevice::responsive(ReplyBuilder::es_get_mode(60, "Auto", 0, 0)).await.unwrap();
        let b = FakeDevice::responsive(ReplyBuilder::es_get_mode(70, "Manual", 0, 0)).await.unwrap();
        let mut scheduler = scheduler(&harness, vec![device("Fase A", &a), device("Fase B", &b)], true);
        scheduler.start().await.unwrap();

        let stop = StopFlag::new();
        let trigger = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(350)).await;
            trigger.request_stop();
        });

        let started = Instant::now();
        scheduler.run(&stop).await;

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
        assert!(a.request_ids().len() >= 2);
        assert!(b.request_ids().len() >= 2);
        assert_eq!(harness.availability_history("fase_a").last().map(String::as_str), Some("offline"));
        assert_eq!(harness.availability_history("fase_b").last().map(String::as_str), Some("offline"));
        assert!(harness.availability_history("fase_b").contains(&"online".to_string()));
    }

    #[tokio::test]
    async fn test_stop_during_long_interval_is_prompt() {
        let harness = TestHarness::new();
        let a = FakeDevice::responsive(ReplyBuilder::es_get_mode(60, "Auto", 0, 0)).await.unwrap();
        let mut scheduler = scheduler(&harness, vec![device("Fase A", &a)], false);
        scheduler.settings.interval = Duration::from_secs(30);
        scheduler.start().await.unwrap();

        let stop = StopFlag::new();
        let trigger = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.request_stop();
        });

        let started = Instant::now();
        scheduler.run(&stop).await;

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(a.request_ids().len(), 1);
        harness.assert_availability("fase_a", "offline").unwrap();
    }

    #[tokio::test]
    async fn test_start_fails_on_busy_port() {
        let harness = TestHarness::new();
        let holder = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = holder.local_addr().unwrap().port();

        let mut scheduler = scheduler(&harness, Vec::new(), false);
        scheduler.settings.bind_addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, port);

        let err = scheduler.start().await.unwrap_err();
        assert!(matches!(err, crate::error::PollerError::BindConflict { .. }));
        assert_eq!(scheduler.state(), SchedulerState::Idle);
    }

    #[tokio::test]
    async fn test_cycle_skipped_when_port_is_taken_mid_run() {
        let harness = TestHarness::new();
        let a = FakeDevice::responsive(ReplyBuilder::es_get_mode(60, "Auto", 0, 0)).await.unwrap();

        // reserve a port, then free it so start() can bind it
        let port = std::net::UdpSocket::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        let mut scheduler = scheduler(&harness, vec![device("Fase A", &a)], true);
        scheduler.settings.bind_addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, port);
        scheduler.start().await.unwrap();
        scheduler.run_cycle().await.unwrap();

        // socket was released after the cycle; a foreign process grabs the port
        let holder = std::net::UdpSocket::bind(("127.0.0.1", port)).unwrap();
        assert!(scheduler.run_cycle().await.is_err());
        assert_eq!(a.request_ids().len(), 1);

        drop(holder);
        scheduler.run_cycle().await.unwrap();
        assert_eq!(a.request_ids().len(), 2);
        assert_eq!(scheduler.state(), SchedulerState::Running);
    }

    #[tokio::test]
    async fn test_broker_outage_does_not_stop_polling() {
        let harness = TestHarness::new();
        let a = FakeDevice::responsive(ReplyBuilder::es_get_mode(60, "Auto", 0, 0)).await.unwrap();
        let mut scheduler = scheduler(&harness, vec![device("Fase A", &a)], false);
        scheduler.start().await.unwrap();
        harness.mqtt_client.set_offline(true);

        assert_eq!(scheduler.run_cycle().await.unwrap(), 1);
        scheduler.stop();

        assert!(harness.mqtt_client.rejected_count() >= 3);
        assert_eq!(a.request_ids().len(), 1);
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
    }

    /// Publisher whose first state publication panics
    #[derive(Default)]
    struct PanickingPublisher {
        fired: AtomicBool,
        states: std::sync::atomic::AtomicUsize,
    }

    impl Publisher for PanickingPublisher {
        fn publish_state(&self, _device: &Device, _result: &crate::poll::PollResult) {
            if !self.fired.swap(true, Ordering::SeqCst) {
                panic!("publisher failure");
            }
            self.states.fetch_add(1, Ordering::SeqCst);
        }

        fn publish_availability(&self, _device: &Device, _online: bool) {}

        fn publish_discovery_metadata(&self, _device: &Device) {}
    }

    #[tokio::test]
    async fn test_run_survives_a_panicking_cycle() {
        let a = FakeDevice::responsive(ReplyBuilder::es_get_mode(60, "Auto", 0, 0)).await.unwrap();
        let mut scheduler = Scheduler::new(
            settings(true),
            DeviceRegistry::new(vec![device("Fase A", &a)]),
            poller(),
            PanickingPublisher::default(),
        );
        scheduler.start().await.unwrap();

        let stop = StopFlag::new();
        let trigger = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(350)).await;
            trigger.request_stop();
        });
        scheduler.run(&stop).await;

        assert_eq!(scheduler.state(), SchedulerState::Stopped);
        assert!(scheduler.publisher.fired.load(Ordering::SeqCst));
        assert!(scheduler.publisher.states.load(Ordering::SeqCst) >= 1);
        assert!(a.request_ids().len() >= 2);
    }

    #[tokio::test]
    async fn test_run_keeps_polling_after_failed_cycles() {
        let harness = TestHarness::new();
        let a = Arc::new(FakeDevice::responsive(ReplyBuilder::es_get_mode(60, "Auto", 0, 0)).await.unwrap());

        let port = std::net::UdpSocket::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        let mut scheduler = scheduler(&harness, vec![device("Fase A", &a)], true);
        scheduler.settings.bind_addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, port);
        scheduler.start().await.unwrap();

        let stop = StopFlag::new();
        let trigger = stop.clone();
        let device = Arc::clone(&a);
        // after the first poll, hold the port for a few intervals, then give it back
        let intruder = tokio::spawn(async move {
            while device.request_ids().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            let holder = loop {
                match std::net::UdpSocket::bind(("127.0.0.1", port)) {
                    Ok(socket) => break socket,
                    Err(_) => tokio::time::sleep(Duration::from_millis(5)).await,
                }
            };
            tokio::time::sleep(Duration::from_millis(300)).await;
            let polled_while_held = device.request_ids().len();
            drop(holder);
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.request_stop();
            polled_while_held
        });

        scheduler.run(&stop).await;
        let polled_while_held = intruder.await.unwrap();

        assert_eq!(polled_while_held, 1);
        assert!(a.request_ids().len() > polled_while_held);
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
        harness.assert_availability("fase_a", "offline").unwrap();
    }
}
