//! Item: expand message templates into packets for every addressed device,
//! find the devices, write everything and stream the replies back.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use lumen_core::{Message, Packet, Target};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::catcher::CatchScope;
use crate::error::{BadRunWithResults, DispatchError};
use crate::found::Found;
use crate::options::{FindOptions, SendOptions, SingleOptions};
use crate::reference::Reference;
use crate::result::Reply;
use crate::sender::Sender;
use crate::streamer::ResultStreamer;

/// Sending half handed to whatever drives a `ReplyStream`.
pub type ReplyTx = mpsc::Sender<Result<Reply, DispatchError>>;

/// Replies from one call, in arrival order. The last item is the call's error,
/// if it failed. Dropping the stream cancels the call.
pub struct ReplyStream {
    rx: mpsc::Receiver<Result<Reply, DispatchError>>,
    task: JoinHandle<()>,
}

impl ReplyStream {
    pub fn spawn<F, Fut>(drive: F) -> Self
    where
        F: FnOnce(ReplyTx) -> Fut,
        Fut: Future<Output = Result<(), DispatchError>> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(64);
        let fut = drive(tx.clone());
        let task = tokio::spawn(async move {
            if let Err(e) = fut.await {
                let _ = tx.send(Err(e)).await;
            }
        });
        Self { rx, task }
    }

    /// Wait for the whole call. Any error turns the run into a
    /// `BadRunWithResults` that still carries every reply.
    pub async fn all_packets(mut self) -> Result<Vec<Reply>, BadRunWithResults> {
        let mut results = Vec::new();
        let mut errors = Vec::new();
        while let Some(item) = self.rx.recv().await {
            match item {
                Ok(reply) => results.push(reply),
                Err(e) => errors.extend(e.into_errors()),
            }
        }
        if errors.is_empty() {
            Ok(results)
        } else {
            Err(BadRunWithResults { results, errors })
        }
    }
}

impl Stream for ReplyStream {
    type Item = Result<Reply, DispatchError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for ReplyStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// One or more message templates sent together.
#[derive(Debug, Clone)]
pub struct Item {
    parts: Vec<Message>,
}

impl Item {
    pub fn new(parts: Vec<Message>) -> Self {
        Self { parts }
    }

    pub fn parts(&self) -> &[Message] {
        &self.parts
    }

    pub fn run(&self, reference: Reference, sender: &Sender, options: SendOptions) -> ReplyStream {
        let parts = self.parts.clone();
        let sender = sender.clone();
        ReplyStream::spawn(move |tx| async move {
            let scope = CatchScope::new(options.error_catcher.clone());
            let targets = match run_parts(&parts, &reference, &sender, &options, &scope, &tx).await {
                Ok(targets) => targets,
                Err(e) => {
                    scope.add(e);
                    0
                }
            };
            scope.finish(targets)
        })
    }

    /// Stamp every template: untargeted ones once per serial, targeted ones
    /// once. Each packet gets the sender's source (unless the template has its
    /// own) and the next sequence for its target.
    pub fn make_packets(&self, sender: &Sender, serials: &[Target]) -> Vec<(Message, Packet)> {
        make_packets(&self.parts, sender, serials)
    }
}

fn make_packets(parts: &[Message], sender: &Sender, serials: &[Target]) -> Vec<(Message, Packet)> {
    let mut packets = Vec::new();
    for part in parts {
        match part.target {
            None => {
                for serial in serials {
                    let target = Some(*serial);
                    let packet = part.to_packet(target, sender.source(), sender.seq(target));
                    packets.push((part.clone(), packet));
                }
            }
            Some(target) => {
                let packet = part.to_packet(Some(target), sender.source(), sender.seq(Some(target)));
                packets.push((part.clone(), packet));
            }
        }
    }
    packets
}

/// Returns how many distinct devices were written to.
async fn run_parts(
    parts: &[Message],
    reference: &Reference,
    sender: &Sender,
    options: &SendOptions,
    scope: &CatchScope,
    tx: &ReplyTx,
) -> Result<usize, DispatchError> {
    let broadcast = !options.broadcast.is_off();
    let (found, serials, missing) = reference
        .resolve(sender, options.found.clone(), options.find_timeout, options.broadcast)
        .await?;

    let packets = make_packets(parts, sender, &serials);
    if packets.is_empty() {
        return Ok(0);
    }

    let (found, missing) = match missing {
        None if !broadcast => search(sender, found, options, &packets).await?,
        other => (found, other.unwrap_or_default()),
    };

    if !broadcast && options.require_all_devices && !missing.is_empty() {
        return Err(DispatchError::DevicesNotFound {
            missing: missing.iter().map(Target::serial).collect(),
        });
    }

    let targets: HashSet<Option<Target>> = packets.iter().map(|(_, p)| p.header.target).collect();
    write_messages(sender, found, options, packets, scope, tx).await;
    Ok(targets.len())
}

/// Make sure the registry knows every packet's target, discovering if needed.
async fn search(
    sender: &Sender,
    found: Found,
    options: &SendOptions,
    packets: &[(Message, Packet)],
) -> Result<(Found, Vec<Target>), DispatchError> {
    let mut wanted: Vec<Target> = packets.iter().filter_map(|(_, p)| p.header.target).collect();
    wanted.sort();
    wanted.dedup();

    if options.accept_found || wanted.iter().all(|t| found.contains(t)) {
        let missing = wanted.into_iter().filter(|t| !found.contains(t)).collect();
        return Ok((found, missing));
    }

    let opts = FindOptions::new(options.find_timeout).broadcast(options.broadcast);
    sender.find_specific_serials(&wanted, opts).await
}

async fn write_messages(
    sender: &Sender,
    found: Found,
    options: &SendOptions,
    packets: Vec<(Message, Packet)>,
    scope: &CatchScope,
    tx: &ReplyTx,
) {
    let mut single = SingleOptions::from(options);
    single.found = Some(found);

    let mut streamer = ResultStreamer::new(options.limit.clone());
    for (original, packet) in packets {
        let sender = sender.clone();
        let single = single.clone();
        let header = packet.header.clone();
        streamer.add(header, async move {
            sender.send_single(&original, packet, single).await
        });
    }
    streamer.no_more_work();

    while let Some(result) = streamer.next().await {
        match result.value {
            Ok(replies) => {
                for reply in replies {
                    if tx.send(Ok(reply)).await.is_err() {
                        debug!("reply stream dropped, stopping");
                        return;
                    }
                }
            }
            Err(e) => scope.add(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::fake::MemoryNetwork;
    use lumen_core::Payload;

    fn target(n: u8) -> Target {
        Target::from_slice(&[0xd0, 0x73, 0xd5, 0, 0, n]).unwrap()
    }

    #[tokio::test]
    async fn makes_one_packet_per_template_and_serial() {
        let (sender, _network) = MemoryNetwork::with_sender(Vec::new(), Config::default());
        let item = Item::new(vec![
            Message::new(Payload::GetPower),
            Message::new(Payload::GetLabel),
        ]);
        let serials = [target(1), target(2), target(3)];

        let packets = item.make_packets(&sender, &serials);
        assert_eq!(packets.len(), 6);
        for serial in &serials {
            let mut seqs: Vec<u8> = packets
                .iter()
                .filter(|(_, p)| p.header.target == Some(*serial))
                .map(|(_, p)| p.header.sequence)
                .collect();
            seqs.sort();
            assert_eq!(seqs, vec![1, 2]);
        }
        assert!(packets.iter().all(|(_, p)| p.header.source == sender.source()));

        let again = item.make_packets(&sender, &serials[..1]);
        assert_eq!(again[0].1.header.sequence, 3);
        assert_eq!(again[1].1.header.sequence, 4);
    }

    #[tokio::test]
    async fn targeted_template_ignores_serials() {
        let (sender, _network) = MemoryNetwork::with_sender(Vec::new(), Config::default());
        let item = Item::new(vec![Message::new(Payload::GetPower)
            .with_target(target(9))
            .with_source(77)]);
        let packets = item.make_packets(&sender, &[target(1), target(2)]);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].1.header.target, Some(target(9)));
        assert_eq!(packets[0].1.header.source, 77);
    }

    #[tokio::test]
    async fn nothing_to_send_is_empty() {
        let (sender, _network) = MemoryNetwork::with_sender(Vec::new(), Config::default());
        let item = Item::new(vec![Message::new(Payload::GetPower)]);
        let replies = item
            .run(Reference::Serials(Vec::new()), &sender, sender.options())
            .all_packets()
            .await
            .unwrap();
        assert!(replies.is_empty());
    }
}
