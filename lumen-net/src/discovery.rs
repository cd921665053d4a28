//! Device discovery: broadcast GetService on the discovery backoff and record
//! every StateService reply in the registry.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use futures::StreamExt;
use lumen_core::retry::discovery_timeouts;
use lumen_core::{Message, Payload, RetrySchedule, Service, Target};
use tracing::{debug, info};

use crate::config::DiscoveryOptions;
use crate::error::DispatchError;
use crate::options::{Broadcast, SingleOptions};
use crate::sender::Sender;
use crate::ticker;

/// Search until `wanted` have all answered (or, with no list, until anything
/// answers). Returns every device seen.
pub(crate) async fn search(
    sender: &Sender,
    wanted: Option<&[Target]>,
    timeout: Duration,
    broadcast: Broadcast,
) -> Result<HashSet<Target>, DispatchError> {
    let options = &sender.config().discovery;
    if options.has_hardcoded_discovery() {
        return Ok(hardcoded(sender, options, wanted).await);
    }

    let default = sender.config().default_broadcast;
    let addr = broadcast.resolve(default).unwrap_or(default);
    let mut found_now = HashSet::new();

    let ticks = ticker::ticks(RetrySchedule::new(discovery_timeouts()), timeout);
    futures::pin_mut!(ticks);
    while let Some(tick) = ticks.next().await {
        let msg = Message::new(Payload::GetService);
        let packet = msg.to_packet(None, sender.source(), sender.seq(None));
        let mut opts = SingleOptions::new(tick.till_next);
        opts.no_retry = true;
        opts.broadcast = Broadcast::Addr(addr);
        opts.connect_timeout = sender.config().connect_timeout();

        match sender.send_single(&msg, packet, opts).await {
            Ok(replies) => {
                for reply in replies {
                    let (Payload::StateService { service, port }, Some(target)) =
                        (&reply.packet.payload, reply.packet.header.target)
                    else {
                        continue;
                    };
                    if !options.want(&target) {
                        continue;
                    }
                    let Ok(port) = u16::try_from(*port) else {
                        debug!(serial = %target, port, "ignoring service with bad port");
                        continue;
                    };
                    found_now.insert(target);
                    let addr = SocketAddr::new(reply.remote_addr.ip(), port);
                    sender.add_service(target, *service, addr).await;
                }
            }
            Err(e @ DispatchError::MessageCancelled { .. }) => return Err(e),
            Err(e) => debug!(error = %e, "no discovery replies this round"),
        }

        let done = match wanted {
            None => !found_now.is_empty(),
            Some(serials) => serials.iter().all(|t| found_now.contains(t)),
        };
        if done {
            break;
        }
    }
    info!(found = found_now.len(), "discovery finished");
    Ok(found_now)
}

async fn hardcoded(
    sender: &Sender,
    options: &DiscoveryOptions,
    wanted: Option<&[Target]>,
) -> HashSet<Target> {
    let mut found_now = HashSet::new();
    for (target, addr) in &options.hardcoded {
        if !options.want(target) {
            continue;
        }
        if wanted.map_or(false, |serials| !serials.contains(target)) {
            continue;
        }
        found_now.insert(*target);
        sender.add_service(*target, Service::Udp, *addr).await;
    }
    found_now
}
