//! Tracks the replies to one written packet and decides when it is complete.

use std::net::SocketAddr;

use lumen_core::{Expect, Message, Packet, RetryGaps};
use tokio::time::Instant;

/// A decoded reply and where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub packet: Packet,
    pub remote_addr: SocketAddr,
    /// Template the request was stamped from.
    pub sender_message: Option<Message>,
}

impl Reply {
    pub fn serial(&self) -> String {
        self.packet.serial()
    }
}

#[derive(Debug)]
pub struct ReplyCollector {
    expect: Expect,
    did_broadcast: bool,
    gaps: RetryGaps,
    results: Vec<Reply>,
    last_ack: Option<Instant>,
    last_res: Option<Instant>,
    finish_at: Option<Instant>,
    done: bool,
}

impl ReplyCollector {
    pub fn new(expect: Expect, did_broadcast: bool, gaps: RetryGaps) -> Self {
        Self {
            expect,
            did_broadcast,
            gaps,
            results: Vec::new(),
            last_ack: None,
            last_res: None,
            finish_at: None,
            done: expect == Expect::Nothing,
        }
    }

    pub fn expect(&self) -> Expect {
        self.expect
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// When a request with an open-ended number of replies counts as finished
    /// if nothing else arrives.
    pub fn finish_at(&self) -> Option<Instant> {
        if self.done {
            None
        } else {
            self.finish_at
        }
    }

    pub fn has_results(&self) -> bool {
        !self.results.is_empty()
    }

    /// Replies expected before done; `None` when open-ended.
    fn expected(&self) -> Option<usize> {
        if self.did_broadcast {
            return None;
        }
        match self.expect {
            Expect::Nothing => Some(0),
            Expect::Ack | Expect::Reply => Some(1),
            Expect::Replies(n) => Some(n),
            Expect::Unbounded => None,
        }
    }

    /// `is_ack` is the codec's classification of the reply.
    pub fn add(&mut self, reply: Reply, is_ack: bool, now: Instant) {
        if self.done {
            return;
        }
        if is_ack {
            self.add_ack(reply, now);
        } else {
            self.add_result(reply, now);
        }
    }

    fn add_ack(&mut self, reply: Reply, now: Instant) {
        self.last_ack = Some(now);
        if self.expect != Expect::Ack {
            return;
        }
        self.results.push(reply);
        if self.did_broadcast {
            self.finish_at = Some(now + self.gaps.finish_multi_gap());
        } else {
            self.done = true;
        }
    }

    fn add_result(&mut self, reply: Reply, now: Instant) {
        if !self.expect.res_required() {
            return;
        }
        self.last_res = Some(now);
        self.results.push(reply);
        match self.expected() {
            Some(n) if self.results.len() >= n => self.done = true,
            Some(_) => {}
            None => self.finish_at = Some(now + self.gaps.finish_multi_gap()),
        }
    }

    /// True when a retry tick should hold off because replies are still
    /// arriving.
    pub fn wait_for_result(&self, now: Instant) -> bool {
        if self.done {
            return true;
        }
        match self.expect {
            Expect::Nothing => false,
            Expect::Ack => self.last_ack.is_some(),
            _ => match (self.last_res, self.last_ack) {
                (Some(res), _) => match self.expected() {
                    Some(_) => now.duration_since(res) < self.gaps.gap_between_results,
                    None => true,
                },
                (None, Some(ack)) => now.duration_since(ack) < self.gaps.gap_between_ack_and_res,
                (None, None) => false,
            },
        }
    }

    /// Mark finished; called once the quiet period after the last reply ends.
    pub fn finish(&mut self) {
        self.done = true;
    }

    pub fn into_results(self) -> Vec<Reply> {
        self.results
    }
}
