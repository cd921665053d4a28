#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use lumen_core::protocol::pkt_type;
use lumen_core::Target;
use lumen_net::fake::{FakeDevice, MemoryNetwork};
use lumen_net::{Config, FindOptions, Sender};
use tracing_subscriber::EnvFilter;

pub fn init_logs() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn config() -> Config {
    Config {
        message_timeout_secs: 1.0,
        find_timeout_secs: 2.0,
        ..Config::default()
    }
}

pub struct Lan {
    pub sender: Sender,
    pub network: Arc<MemoryNetwork>,
    pub devices: Vec<Arc<FakeDevice>>,
}

impl Lan {
    pub fn new(count: u8, config: Config) -> Self {
        init_logs();
        let devices: Vec<_> = (1..=count).map(FakeDevice::numbered).collect();
        let (sender, network) = MemoryNetwork::with_sender(devices.clone(), config);
        Self {
            sender,
            network,
            devices,
        }
    }

    pub fn targets(&self) -> Vec<Target> {
        self.devices.iter().map(|d| d.target()).collect()
    }

    pub async fn discover(&self) {
        self.sender
            .find_devices(FindOptions::new(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(self.sender.found().len(), self.devices.len());
    }

    /// GetService packets seen across all devices.
    pub fn discovery_rounds(&self) -> usize {
        self.devices
            .iter()
            .map(|d| d.count_received(pkt_type::GET_SERVICE))
            .sum()
    }
}
