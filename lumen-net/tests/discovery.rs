mod common;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use common::{config, init_logs, Lan};
use lumen_core::protocol::pkt_type;
use lumen_core::wire::{decode_frame, encode_frame};
use lumen_core::{Packet, Payload, Service, Target};
use lumen_net::fake::FakeDevice;
use lumen_net::{Config, DispatchError, FindOptions, Sender, Transport};
use tokio::net::UdpSocket;

#[tokio::test(start_paused = true)]
async fn discovery_registers_every_device() {
    let lan = Lan::new(3, config());
    let found = lan
        .sender
        .find_devices(FindOptions::new(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(found.targets(), lan.targets());
    for d in &lan.devices {
        let services = found.get(&d.target()).unwrap();
        assert_eq!(services[&Service::Udp].addr(), d.addr());
    }
}

#[tokio::test(start_paused = true)]
async fn lost_devices_are_forgotten_unless_ignored() {
    let lan = Lan::new(2, config());
    lan.discover().await;
    lan.network.remove_device(&lan.devices[1].target());

    let opts = FindOptions::new(Duration::from_secs(5)).ignore_lost(true);
    let found = lan.sender.find_devices(opts).await.unwrap();
    assert_eq!(found.len(), 2);

    let found = lan
        .sender
        .find_devices(FindOptions::new(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(found.targets(), vec![lan.devices[0].target()]);
}

#[tokio::test(start_paused = true)]
async fn empty_network_can_raise() {
    let lan = Lan::new(0, config());
    let found = lan
        .sender
        .find_devices(FindOptions::new(Duration::from_secs(2)))
        .await
        .unwrap();
    assert!(found.is_empty());

    let opts = FindOptions::new(Duration::from_secs(2)).raise_on_none(true);
    assert!(matches!(
        lan.sender.find_devices(opts).await,
        Err(DispatchError::FoundNoDevices)
    ));
}

#[tokio::test(start_paused = true)]
async fn specific_serials_keep_searching_for_late_devices() {
    let lan = Lan::new(1, config());
    let late = FakeDevice::numbered(2);
    let network = lan.network.clone();
    let device = late.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        network.add_device(device);
    });

    let wanted = vec![lan.devices[0].target(), late.target()];
    let (found, missing) = lan
        .sender
        .find_specific_serials(&wanted, FindOptions::new(Duration::from_secs(5)))
        .await
        .unwrap();
    assert!(missing.is_empty());
    assert_eq!(found.len(), 2);
    assert!(lan.devices[0].count_received(pkt_type::GET_SERVICE) >= 2);
}

#[tokio::test(start_paused = true)]
async fn serial_filter_hides_other_devices() {
    let mut cfg = config();
    cfg.discovery.serial_filter = Some(vec![Target::parse("d073d5000002").unwrap()]);
    let lan = Lan::new(3, cfg);
    let found = lan
        .sender
        .find_devices(FindOptions::new(Duration::from_secs(2)))
        .await
        .unwrap();
    assert_eq!(found.serials(), vec!["d073d5000002".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn hardcoded_discovery_skips_the_network() {
    let mut cfg = config();
    let one = FakeDevice::numbered(1);
    cfg.discovery.hardcoded = HashMap::from([(one.target(), one.addr())]);
    let lan = Lan::new(2, cfg);

    let found = lan
        .sender
        .find_devices(FindOptions::new(Duration::from_secs(2)))
        .await
        .unwrap();
    assert_eq!(found.targets(), vec![one.target()]);
    assert_eq!(lan.discovery_rounds(), 0);

    let replies = lan
        .sender
        .send(Payload::GetPower, one.target(), lan.sender.options())
        .all_packets()
        .await
        .unwrap();
    assert_eq!(replies.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn undecodable_datagrams_are_dropped() {
    let lan = Lan::new(1, config());
    let from: SocketAddr = "10.0.0.1:56700".parse().unwrap();
    lan.sender.received_data(&[1, 2, 3], from);
    lan.sender.received_data(&[], from);
    assert_eq!(lan.sender.receiver().pending(), 0);
}

/// One device answering echo requests on a real loopback socket.
async fn echo_device(target: Target) -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 2048];
        loop {
            let Ok((n, from)) = socket.recv_from(&mut buf).await else {
                return;
            };
            let Ok(request) = decode_frame(&buf[..n]) else {
                continue;
            };
            if let Payload::EchoRequest { echoing } = &request.payload {
                let payload = Payload::EchoResponse {
                    echoing: echoing.clone(),
                };
                let reply = Packet::reply_to(&request.header, target, payload);
                let bytes = encode_frame(&reply).unwrap();
                let _ = socket.send_to(&bytes, from).await;
            }
        }
    });
    addr
}

#[tokio::test]
async fn echo_over_loopback_udp() {
    init_logs();
    let target = Target::parse("d073d50000aa").unwrap();
    let addr = echo_device(target).await;

    let cfg = Config {
        message_timeout_secs: 2.0,
        ..Config::default()
    };
    let sender = Sender::bind(cfg).await.unwrap();
    sender.add_service(target, Service::Udp, addr).await;

    let payload = Payload::EchoRequest {
        echoing: b"hello".to_vec(),
    };
    let replies = sender
        .send(payload, target, sender.options().accept_found(true))
        .all_packets()
        .await
        .unwrap();
    assert_eq!(replies.len(), 1);
    assert_eq!(
        replies[0].packet.payload,
        Payload::EchoResponse {
            echoing: b"hello".to_vec()
        }
    );
    assert_eq!(replies[0].remote_addr, addr);
    sender.finish().await;
}
