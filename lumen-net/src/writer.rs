//! Write one packet, resend it on the retry schedule and collect its replies.

use std::sync::Arc;

use futures::{Stream, StreamExt};
use lumen_core::{Codec, Header, Message, Packet, RetryGaps};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace};

use crate::error::DispatchError;
use crate::receiver::{Receiver, Registration};
use crate::result::{Reply, ReplyCollector};
use crate::ticker::Tick;
use crate::transport::Transport;

pub struct Writer {
    transport: Arc<dyn Transport>,
    codec: Arc<dyn Codec>,
    registration: Registration,
    original: Message,
    header: Header,
    bytes: Vec<u8>,
    collector: ReplyCollector,
    sent: usize,
}

impl Writer {
    /// Registers for replies before anything is written. Broadcast packets
    /// without a target wait in the broadcast slot.
    pub fn new(
        transport: Arc<dyn Transport>,
        receiver: &Arc<Receiver>,
        codec: Arc<dyn Codec>,
        original: &Message,
        packet: &Packet,
        gaps: RetryGaps,
        did_broadcast: bool,
    ) -> Result<Self, DispatchError> {
        let bytes = codec.encode(packet)?;
        let h = &packet.header;
        let registration = receiver.register((h.source, h.sequence, h.target));
        Ok(Self {
            transport,
            codec,
            registration,
            original: original.clone(),
            header: packet.header.clone(),
            bytes,
            collector: ReplyCollector::new(original.expect, did_broadcast, gaps),
            sent: 0,
        })
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Times the packet has been written.
    pub fn sent(&self) -> usize {
        self.sent
    }

    async fn write(&mut self) -> Result<(), DispatchError> {
        trace!(
            serial = %self.original_serial(),
            pkt_type = self.header.pkt_type,
            sequence = self.header.sequence,
            attempt = self.sent + 1,
            transport = ?self.transport,
            "writing packet"
        );
        self.transport.send(&self.bytes).await?;
        self.sent += 1;
        Ok(())
    }

    fn original_serial(&self) -> String {
        self.header
            .target
            .map(|t| t.serial())
            .unwrap_or_else(|| "000000000000".to_string())
    }

    /// Drive the packet to completion. Every tick resends unless replies are
    /// still coming in; with `no_retry` only the first tick writes. Every
    /// resend reuses the same source and sequence.
    pub async fn run(
        mut self,
        ticks: impl Stream<Item = Tick>,
        no_retry: bool,
    ) -> Result<Vec<Reply>, DispatchError> {
        futures::pin_mut!(ticks);
        loop {
            let finish_at = self.collector.finish_at();
            tokio::select! {
                biased;
                Some(received) = self.registration.recv() => {
                    let h = &received.packet.header;
                    let is_ack = self.codec.is_ack(h.protocol, h.pkt_type);
                    let reply = Reply {
                        packet: received.packet,
                        remote_addr: received.addr,
                        sender_message: Some(self.original.clone()),
                    };
                    self.collector.add(reply, is_ack, Instant::now());
                    if self.collector.is_done() {
                        return Ok(self.collector.into_results());
                    }
                }
                _ = sleep_until(finish_at.unwrap_or_else(Instant::now)), if finish_at.is_some() => {
                    self.collector.finish();
                    return Ok(self.collector.into_results());
                }
                tick = ticks.next() => match tick {
                    Some(_) => {
                        if self.sent > 0 && (no_retry || self.collector.wait_for_result(Instant::now())) {
                            continue;
                        }
                        self.write().await?;
                        if self.collector.is_done() {
                            return Ok(Vec::new());
                        }
                    }
                    None => {
                        if self.collector.finish_at().is_some() && self.collector.has_results() {
                            return Ok(self.collector.into_results());
                        }
                        debug!(
                            serial = %self.original_serial(),
                            pkt_type = self.header.pkt_type,
                            sent = self.sent,
                            "timed out waiting for reply"
                        );
                        return Err(DispatchError::timed_out(&self.header));
                    }
                },
            }
        }
    }
}
