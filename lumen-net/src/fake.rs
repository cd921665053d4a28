//! In-memory network of fake devices for exercising the engine without
//! sockets.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use lumen_core::protocol::pkt_type;
use lumen_core::{Codec, FrameCodec, Packet, Payload, Service, Target, DEFAULT_PORT};
use tokio::time::Instant;
use tracing::trace;

use crate::config::Config;
use crate::sender::{Sender, WeakSender};
use crate::socket::DatagramSocket;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Debug, Default)]
struct DeviceState {
    power: u16,
    label: String,
    offline: bool,
    drop_acks: bool,
    drop_replies: bool,
    reply_delay: Duration,
    received: Vec<(Instant, Packet)>,
}

/// A device that answers service, power, label and echo messages.
#[derive(Debug)]
pub struct FakeDevice {
    target: Target,
    addr: SocketAddr,
    state: Mutex<DeviceState>,
}

impl FakeDevice {
    pub fn new(target: Target, addr: SocketAddr) -> Arc<Self> {
        Arc::new(Self {
            target,
            addr,
            state: Mutex::new(DeviceState::default()),
        })
    }

    /// Serial d073d50000NN at 10.0.0.NN.
    pub fn numbered(n: u8) -> Arc<Self> {
        Self::new(
            Target::new([0xd0, 0x73, 0xd5, 0x00, 0x00, n]),
            SocketAddr::new(IpAddr::from([10, 0, 0, n]), DEFAULT_PORT),
        )
    }

    pub fn target(&self) -> Target {
        self.target
    }

    pub fn serial(&self) -> String {
        self.target.serial()
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn set_label(&self, label: &str) {
        lock(&self.state).label = label.to_string();
    }

    pub fn power(&self) -> u16 {
        lock(&self.state).power
    }

    /// An offline device neither records nor answers anything.
    pub fn set_offline(&self, offline: bool) {
        lock(&self.state).offline = offline;
    }

    pub fn set_drop_acks(&self, drop: bool) {
        lock(&self.state).drop_acks = drop;
    }

    pub fn set_drop_replies(&self, drop: bool) {
        lock(&self.state).drop_replies = drop;
    }

    pub fn set_reply_delay(&self, delay: Duration) {
        lock(&self.state).reply_delay = delay;
    }

    pub fn reply_delay(&self) -> Duration {
        lock(&self.state).reply_delay
    }

    pub fn received(&self) -> Vec<Packet> {
        lock(&self.state).received.iter().map(|(_, p)| p.clone()).collect()
    }

    pub fn received_at(&self) -> Vec<(Instant, Packet)> {
        lock(&self.state).received.clone()
    }

    /// Received packets of one type.
    pub fn count_received(&self, pkt_type: u16) -> usize {
        lock(&self.state)
            .received
            .iter()
            .filter(|(_, p)| p.header.pkt_type == pkt_type)
            .count()
    }

    /// Everything except discovery.
    pub fn count_non_discovery(&self) -> usize {
        lock(&self.state)
            .received
            .iter()
            .filter(|(_, p)| p.header.pkt_type != pkt_type::GET_SERVICE)
            .count()
    }

    /// Handle one packet, returning the frames the device sends back.
    pub fn respond(&self, packet: &Packet) -> Vec<Packet> {
        let mut st = lock(&self.state);
        if st.offline {
            return Vec::new();
        }
        if packet.header.target.map_or(false, |t| t != self.target) {
            return Vec::new();
        }
        st.received.push((Instant::now(), packet.clone()));

        let h = &packet.header;
        let mut out = Vec::new();
        if h.ack_required && !st.drop_acks {
            out.push(Packet::reply_to(h, self.target, Payload::Acknowledgement));
        }
        if st.drop_replies {
            return out;
        }
        let reply = match &packet.payload {
            Payload::GetService => Some(Payload::StateService {
                service: Service::Udp,
                port: u32::from(self.addr.port()),
            }),
            Payload::GetPower => Some(Payload::StatePower { level: st.power }),
            Payload::SetPower { level } => {
                let old = st.power;
                st.power = *level;
                h.res_required.then_some(Payload::StatePower { level: old })
            }
            Payload::GetLabel => Some(Payload::StateLabel {
                label: st.label.clone(),
            }),
            Payload::EchoRequest { echoing } => Some(Payload::EchoResponse {
                echoing: echoing.clone(),
            }),
            _ => None,
        };
        out.extend(reply.map(|payload| Packet::reply_to(h, self.target, payload)));
        out
    }
}

/// Routes datagrams from one sender to fake devices and their replies back.
/// An address ending in .255 reaches every device on that port.
pub struct MemoryNetwork {
    devices: Mutex<Vec<Arc<FakeDevice>>>,
    client: Mutex<Option<WeakSender>>,
    codec: FrameCodec,
    sent: Mutex<Vec<(SocketAddr, Packet)>>,
}

impl MemoryNetwork {
    pub fn new(devices: Vec<Arc<FakeDevice>>) -> Arc<Self> {
        Arc::new(Self {
            devices: Mutex::new(devices),
            client: Mutex::new(None),
            codec: FrameCodec,
            sent: Mutex::new(Vec::new()),
        })
    }

    /// A network plus a sender attached to it.
    pub fn with_sender(devices: Vec<Arc<FakeDevice>>, config: Config) -> (Sender, Arc<Self>) {
        let network = Self::new(devices);
        let sender = Sender::new(network.clone(), config);
        network.attach(&sender);
        (sender, network)
    }

    /// Replies go to this sender.
    pub fn attach(&self, sender: &Sender) {
        *lock(&self.client) = Some(sender.downgrade());
    }

    pub fn add_device(&self, device: Arc<FakeDevice>) {
        lock(&self.devices).push(device);
    }

    pub fn remove_device(&self, target: &Target) {
        lock(&self.devices).retain(|d| d.target() != *target);
    }

    /// Every datagram the sender wrote, with its destination.
    pub fn sent(&self) -> Vec<(SocketAddr, Packet)> {
        lock(&self.sent).clone()
    }

    fn deliver(&self, reply: Packet, from: SocketAddr, delay: Duration) {
        let Some(client) = lock(&self.client).clone() else {
            return;
        };
        let bytes = match self.codec.encode(&reply) {
            Ok(bytes) => bytes,
            Err(e) => {
                trace!(error = %e, "fake device reply failed to encode");
                return;
            }
        };
        if delay.is_zero() {
            if let Some(sender) = client.upgrade() {
                sender.received_data(&bytes, from);
            }
            return;
        }
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(sender) = client.upgrade() {
                sender.received_data(&bytes, from);
            }
        });
    }
}

fn is_broadcast(addr: &SocketAddr) -> bool {
    match addr.ip() {
        IpAddr::V4(ip) => ip.is_broadcast() || ip.octets()[3] == 255,
        IpAddr::V6(_) => false,
    }
}

impl DatagramSocket for MemoryNetwork {
    fn send_to<'a>(&'a self, bytes: &'a [u8], addr: SocketAddr) -> BoxFuture<'a, io::Result<()>> {
        let packet = match self.codec.decode(bytes) {
            Ok(packet) => packet,
            Err(e) => {
                let err = io::Error::new(io::ErrorKind::InvalidData, e);
                return futures::future::ready(Err(err)).boxed();
            }
        };
        lock(&self.sent).push((addr, packet.clone()));

        let devices: Vec<Arc<FakeDevice>> = lock(&self.devices)
            .iter()
            .filter(|d| {
                d.addr() == addr || (is_broadcast(&addr) && d.addr().port() == addr.port())
            })
            .cloned()
            .collect();
        for device in devices {
            let delay = device.reply_delay();
            for reply in device.respond(&packet) {
                self.deliver(reply, device.addr(), delay);
            }
        }
        futures::future::ready(Ok(())).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_core::Message;

    #[test]
    fn answers_only_its_own_target() {
        let device = FakeDevice::numbered(1);
        let other = FakeDevice::numbered(2);
        let pkt = Message::new(Payload::GetPower).to_packet(Some(other.target()), 1, 1);
        assert!(device.respond(&pkt).is_empty());
        assert!(device.received().is_empty());

        let pkt = Message::new(Payload::GetPower).to_packet(Some(device.target()), 1, 1);
        let replies = device.respond(&pkt);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].payload, Payload::StatePower { level: 0 });
    }

    #[test]
    fn set_power_acks_and_applies() {
        let device = FakeDevice::numbered(1);
        let pkt = Message::new(Payload::SetPower { level: 65535 })
            .to_packet(Some(device.target()), 1, 1);
        let replies = device.respond(&pkt);
        assert_eq!(replies.len(), 1);
        assert!(replies[0].is_ack());
        assert_eq!(device.power(), 65535);
    }

    #[test]
    fn offline_device_is_silent() {
        let device = FakeDevice::numbered(1);
        device.set_offline(true);
        let pkt = Message::new(Payload::GetService).to_packet(None, 1, 1);
        assert!(device.respond(&pkt).is_empty());
        assert_eq!(device.count_received(pkt_type::GET_SERVICE), 0);
    }
}
