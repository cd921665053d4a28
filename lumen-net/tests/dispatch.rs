mod common;

use std::collections::HashSet;
use std::time::Duration;

use common::{config, Lan};
use futures::StreamExt;
use lumen_core::protocol::pkt_type;
use lumen_core::{Message, Payload, Target};
use lumen_net::{DispatchError, ErrorCatcher, HardCodedSerials, Limit, Reference, SpecialReference};
use tokio::time::Instant;

#[tokio::test(start_paused = true)]
async fn known_devices_are_not_searched_again() {
    let lan = Lan::new(3, config());
    lan.discover().await;
    let rounds = lan.discovery_rounds();

    for _ in 0..2 {
        let replies = lan
            .sender
            .send(Payload::GetPower, lan.targets(), lan.sender.options())
            .all_packets()
            .await
            .unwrap();
        assert_eq!(replies.len(), 3);
    }
    assert_eq!(lan.discovery_rounds(), rounds);

    let unknown = Target::parse("d073d5000099").unwrap();
    let opts = lan.sender.options().accept_found(true);
    let err = lan
        .sender
        .send(Payload::GetPower, unknown, opts)
        .all_packets()
        .await
        .unwrap_err();
    assert_eq!(err.errors.len(), 1);
    assert!(matches!(err.errors[0], DispatchError::FailedToFindDevice { .. }));
    assert_eq!(lan.discovery_rounds(), rounds);
}

#[tokio::test(start_paused = true)]
async fn replies_stream_before_slow_device_times_out() {
    let lan = Lan::new(3, config());
    lan.discover().await;
    lan.devices[2].set_offline(true);

    let start = Instant::now();
    let opts = lan.sender.options().message_timeout(Duration::from_secs(5));
    let mut stream = lan.sender.send(Payload::GetPower, lan.targets(), opts);

    for _ in 0..2 {
        let reply = stream.next().await.unwrap().unwrap();
        assert!(matches!(reply.packet.payload, Payload::StatePower { .. }));
    }
    assert!(start.elapsed() < Duration::from_secs(1));

    match stream.next().await.unwrap() {
        Err(DispatchError::Multiple(errors)) => {
            assert_eq!(errors.len(), 1);
            match &errors[0] {
                DispatchError::TimedOut { serial, .. } => {
                    assert_eq!(*serial, lan.devices[2].serial())
                }
                other => panic!("expected timeout, got {other}"),
            }
        }
        other => panic!("expected aggregate error, got {other:?}"),
    }
    assert!(stream.next().await.is_none());
    assert!(start.elapsed() >= Duration::from_secs(5));
}

#[tokio::test(start_paused = true)]
async fn errors_are_aggregated_across_targets() {
    let lan = Lan::new(2, config());
    lan.discover().await;
    for d in &lan.devices {
        d.set_offline(true);
    }

    let err = lan
        .sender
        .send(Payload::GetPower, lan.targets(), lan.sender.options())
        .all_packets()
        .await
        .unwrap_err();
    assert_eq!(err.errors.len(), 2);
    let serials: HashSet<String> = err
        .errors
        .iter()
        .map(|e| match e {
            DispatchError::TimedOut { serial, .. } => serial.clone(),
            other => panic!("expected timeout, got {other}"),
        })
        .collect();
    assert_eq!(serials.len(), 2);

    let mut stream = lan
        .sender
        .send(Payload::GetPower, lan.targets()[0], lan.sender.options());
    assert!(matches!(
        stream.next().await,
        Some(Err(DispatchError::TimedOut { .. }))
    ));
}

#[tokio::test(start_paused = true)]
async fn collected_errors_do_not_fail_the_call() {
    let lan = Lan::new(2, config());
    lan.discover().await;
    lan.devices[0].set_offline(true);

    let (catcher, errors) = ErrorCatcher::collect();
    let opts = lan.sender.options().error_catcher(catcher);
    let replies = lan
        .sender
        .send(Payload::GetPower, lan.targets(), opts)
        .all_packets()
        .await
        .unwrap();
    assert_eq!(replies.len(), 1);
    assert_eq!(errors.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn collected_errors_keep_repeats() {
    let lan = Lan::new(1, config());
    let unknown = Target::parse("d073d5000099").unwrap();

    let (catcher, errors) = ErrorCatcher::collect();
    let opts = lan
        .sender
        .options()
        .accept_found(true)
        .error_catcher(catcher);
    let item = vec![Message::new(Payload::GetPower), Message::new(Payload::GetPower)];
    let replies = lan
        .sender
        .send(item, unknown, opts)
        .all_packets()
        .await
        .unwrap();
    assert!(replies.is_empty());

    let errors = errors.snapshot();
    assert_eq!(errors.len(), 2);
    assert!(errors.iter().all(|e| matches!(
        e,
        DispatchError::FailedToFindDevice { serial } if serial == "d073d5000099"
    )));
}

#[tokio::test(start_paused = true)]
async fn raised_errors_are_deduplicated() {
    let lan = Lan::new(1, config());
    let unknown = Target::parse("d073d5000099").unwrap();

    let opts = lan.sender.options().accept_found(true);
    let item = vec![Message::new(Payload::GetPower), Message::new(Payload::GetPower)];
    let err = lan
        .sender
        .send(item, unknown, opts)
        .all_packets()
        .await
        .unwrap_err();
    assert_eq!(err.errors.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn require_all_devices_sends_nothing_when_one_is_missing() {
    let lan = Lan::new(2, config());
    let missing = Target::parse("d073d5000099").unwrap();
    let mut wanted = lan.targets();
    wanted.push(missing);

    let opts = lan.sender.options().require_all_devices(true);
    let mut stream = lan.sender.send(Payload::GetPower, wanted, opts);
    match stream.next().await {
        Some(Err(DispatchError::DevicesNotFound { missing: list })) => {
            assert_eq!(list, vec![missing.serial()])
        }
        other => panic!("expected DevicesNotFound, got {other:?}"),
    }
    assert!(stream.next().await.is_none());
    for d in &lan.devices {
        assert_eq!(d.count_non_discovery(), 0);
    }
}

#[tokio::test(start_paused = true)]
async fn special_reference_resolves_once_until_reset() {
    let lan = Lan::new(3, config());
    let reference = Reference::all();

    let first = lan.sender.send(Payload::GetPower, reference.clone(), lan.sender.options());
    let second = lan.sender.send(Payload::GetPower, reference.clone(), lan.sender.options());
    assert_eq!(first.all_packets().await.unwrap().len(), 3);
    assert_eq!(second.all_packets().await.unwrap().len(), 3);
    assert_eq!(lan.discovery_rounds(), 3);

    lan.sender
        .send(Payload::GetPower, reference.clone(), lan.sender.options())
        .all_packets()
        .await
        .unwrap();
    assert_eq!(lan.discovery_rounds(), 3);

    reference.reset();
    lan.sender
        .send(Payload::GetPower, reference, lan.sender.options())
        .all_packets()
        .await
        .unwrap();
    assert_eq!(lan.discovery_rounds(), 6);
}

#[tokio::test(start_paused = true)]
async fn retries_follow_the_schedule_with_one_sequence() {
    let mut cfg = config();
    cfg.retry.timeouts = vec![(0.01, 0.05), (0.02, 0.2)];
    let lan = Lan::new(1, cfg);
    lan.discover().await;
    let device = &lan.devices[0];
    device.set_drop_acks(true);
    device.set_drop_replies(true);

    let start = Instant::now();
    let opts = lan
        .sender
        .options()
        .message_timeout(Duration::from_millis(300));
    let err = lan
        .sender
        .send(Payload::GetPower, device.target(), opts)
        .all_packets()
        .await
        .unwrap_err();
    assert!(matches!(err.errors[0], DispatchError::TimedOut { .. }));
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(300) && elapsed < Duration::from_millis(400));

    let sent: Vec<_> = device
        .received()
        .into_iter()
        .filter(|p| p.header.pkt_type == pkt_type::GET_POWER)
        .collect();
    assert_eq!(sent.len(), 18);
    assert!(sent.iter().all(|p| p.header.sequence == sent[0].header.sequence));
    assert!(sent.iter().all(|p| p.header.source == lan.sender.source()));
}

#[tokio::test(start_paused = true)]
async fn no_retry_sends_once() {
    let lan = Lan::new(1, config());
    lan.discover().await;
    let device = &lan.devices[0];
    device.set_drop_replies(true);

    let opts = lan.sender.options().no_retry(true);
    let err = lan
        .sender
        .send(Payload::GetPower, device.target(), opts)
        .all_packets()
        .await
        .unwrap_err();
    assert!(matches!(err.errors[0], DispatchError::TimedOut { .. }));
    assert_eq!(device.count_received(pkt_type::GET_POWER), 1);
}

#[tokio::test(start_paused = true)]
async fn broadcast_to_all_devices() {
    let lan = Lan::new(3, config());
    let opts = lan.sender.options().broadcast(true);
    let replies = lan
        .sender
        .send(Payload::GetPower, Reference::all(), opts)
        .all_packets()
        .await
        .unwrap();
    assert_eq!(replies.len(), 3);
    let serials: HashSet<String> = replies.iter().map(|r| r.serial()).collect();
    assert_eq!(serials.len(), 3);
    assert!(replies
        .iter()
        .all(|r| matches!(r.packet.payload, Payload::StatePower { .. })));
    assert!(replies
        .iter()
        .all(|r| r.sender_message == Some(Message::new(Payload::GetPower))));
}

#[tokio::test(start_paused = true)]
async fn hardcoded_serials_report_missing() {
    let lan = Lan::new(1, config());
    let wanted = HardCodedSerials::parse("d073d5000001,d073d5000004").unwrap();

    let (found, serials) = wanted
        .find(&lan.sender, Duration::from_secs(2), Default::default())
        .await
        .unwrap();
    assert_eq!(found.serials(), vec!["d073d5000001".to_string()]);
    assert_eq!(serials, vec![lan.devices[0].target()]);
    assert_eq!(
        wanted.missing(&found),
        vec![Target::parse("d073d5000004").unwrap()]
    );

    let (catcher, errors) = ErrorCatcher::collect();
    let opts = lan.sender.options().error_catcher(catcher);
    let replies = lan
        .sender
        .send(Payload::GetPower, Reference::special(wanted), opts)
        .all_packets()
        .await
        .unwrap();
    assert_eq!(replies.len(), 1);
    let errors = errors.snapshot();
    assert_eq!(errors.len(), 1);
    assert!(matches!(
        &errors[0],
        DispatchError::FailedToFindDevice { serial } if serial == "d073d5000004"
    ));
}

#[tokio::test(start_paused = true)]
async fn limit_serialises_sends() {
    let lan = Lan::new(2, config());
    lan.discover().await;
    for d in &lan.devices {
        d.set_reply_delay(Duration::from_millis(100));
    }

    let opts = lan.sender.options().limit(Limit::new(1));
    let replies = lan
        .sender
        .send(Payload::SetPower { level: 65535 }, lan.targets(), opts)
        .all_packets()
        .await
        .unwrap();
    assert_eq!(replies.len(), 2);
    assert!(replies.iter().all(|r| r.packet.is_ack()));
    assert!(lan.devices.iter().all(|d| d.power() == 65535));

    let first_seen = |i: usize| {
        lan.devices[i]
            .received_at()
            .into_iter()
            .find(|(_, p)| p.header.pkt_type == pkt_type::SET_POWER)
            .map(|(at, _)| at)
            .unwrap()
    };
    let (a, b) = (first_seen(0), first_seen(1));
    let gap = if a > b { a - b } else { b - a };
    assert!(gap >= Duration::from_millis(100));
}

#[tokio::test(start_paused = true)]
async fn unlimited_sends_together() {
    let lan = Lan::new(2, config());
    lan.discover().await;
    for d in &lan.devices {
        d.set_reply_delay(Duration::from_millis(100));
    }

    let start = Instant::now();
    let opts = lan.sender.options().limit(Limit::Unlimited);
    lan.sender
        .send(Payload::SetPower { level: 1 }, lan.targets(), opts)
        .all_packets()
        .await
        .unwrap();
    assert!(start.elapsed() < Duration::from_millis(200));
}

#[tokio::test(start_paused = true)]
async fn finishing_the_sender_cancels_in_flight_messages() {
    let lan = Lan::new(1, config());
    lan.discover().await;
    lan.devices[0].set_offline(true);

    let opts = lan.sender.options().message_timeout(Duration::from_secs(10));
    let mut stream = lan.sender.send(Payload::GetPower, lan.targets(), opts);
    tokio::time::sleep(Duration::from_secs(1)).await;
    lan.sender.finish().await;

    assert!(matches!(
        stream.next().await,
        Some(Err(DispatchError::MessageCancelled { .. }))
    ));
    assert!(lan.sender.found().is_empty());
}

#[tokio::test(start_paused = true)]
async fn dropping_the_stream_cancels_the_call() {
    let lan = Lan::new(1, config());
    lan.discover().await;
    lan.devices[0].set_offline(true);

    let opts = lan.sender.options().message_timeout(Duration::from_secs(10));
    let stream = lan.sender.send(Payload::GetPower, lan.targets(), opts);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(lan.sender.receiver().pending(), 1);

    drop(stream);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(lan.sender.receiver().pending(), 0);
}
