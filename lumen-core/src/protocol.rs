//! Wire protocol: message payloads, templates and concrete packets.

use serde::{Deserialize, Serialize};

use crate::target::Target;

/// Protocol number of every message this crate speaks.
pub const PROTOCOL: u16 = 1024;

/// Default UDP port devices listen on.
pub const DEFAULT_PORT: u16 = 56700;

pub mod pkt_type {
    pub const GET_SERVICE: u16 = 2;
    pub const STATE_SERVICE: u16 = 3;
    pub const GET_POWER: u16 = 20;
    pub const SET_POWER: u16 = 21;
    pub const STATE_POWER: u16 = 22;
    pub const GET_LABEL: u16 = 23;
    pub const STATE_LABEL: u16 = 25;
    pub const ACKNOWLEDGEMENT: u16 = 45;
    pub const ECHO_REQUEST: u16 = 58;
    pub const ECHO_RESPONSE: u16 = 59;
}

/// Service a device advertises in StateService.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Service {
    Udp,
    Reserved(u8),
}

impl Service {
    pub fn is_reserved(&self) -> bool {
        matches!(self, Service::Reserved(_))
    }
}

/// Message bodies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    GetService,
    StateService { service: Service, port: u32 },
    Acknowledgement,
    GetPower,
    SetPower { level: u16 },
    StatePower { level: u16 },
    GetLabel,
    StateLabel { label: String },
    EchoRequest { echoing: Vec<u8> },
    EchoResponse { echoing: Vec<u8> },
}

impl Payload {
    pub fn pkt_type(&self) -> u16 {
        match self {
            Payload::GetService => pkt_type::GET_SERVICE,
            Payload::StateService { .. } => pkt_type::STATE_SERVICE,
            Payload::Acknowledgement => pkt_type::ACKNOWLEDGEMENT,
            Payload::GetPower => pkt_type::GET_POWER,
            Payload::SetPower { .. } => pkt_type::SET_POWER,
            Payload::StatePower { .. } => pkt_type::STATE_POWER,
            Payload::GetLabel => pkt_type::GET_LABEL,
            Payload::StateLabel { .. } => pkt_type::STATE_LABEL,
            Payload::EchoRequest { .. } => pkt_type::ECHO_REQUEST,
            Payload::EchoResponse { .. } => pkt_type::ECHO_RESPONSE,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Payload::GetService => "GetService",
            Payload::StateService { .. } => "StateService",
            Payload::Acknowledgement => "Acknowledgement",
            Payload::GetPower => "GetPower",
            Payload::SetPower { .. } => "SetPower",
            Payload::StatePower { .. } => "StatePower",
            Payload::GetLabel => "GetLabel",
            Payload::StateLabel { .. } => "StateLabel",
            Payload::EchoRequest { .. } => "EchoRequest",
            Payload::EchoResponse { .. } => "EchoResponse",
        }
    }

    /// What a sender should wait for when it sends this payload with the
    /// default flags.
    pub fn default_expect(&self) -> Expect {
        match self {
            Payload::GetService => Expect::Unbounded,
            Payload::SetPower { .. } => Expect::Ack,
            Payload::GetPower | Payload::GetLabel | Payload::EchoRequest { .. } => Expect::Reply,
            _ => Expect::Nothing,
        }
    }
}

/// How many frames complete a request. Explicit per template instead of
/// being inferred from the message type at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    /// Fire and forget; done as soon as it is written.
    Nothing,
    /// Exactly one acknowledgement. The acknowledgement itself is the
    /// request's single result, so ack-only sends still yield one reply.
    Ack,
    /// Exactly one decoded reply.
    Reply,
    /// A fixed number of decoded replies.
    Replies(usize),
    /// Any number of replies; done once they stop arriving.
    Unbounded,
}

impl Expect {
    pub fn ack_required(&self) -> bool {
        matches!(self, Expect::Ack)
    }

    pub fn res_required(&self) -> bool {
        matches!(self, Expect::Reply | Expect::Replies(_) | Expect::Unbounded)
    }
}

/// A caller-supplied template. Target, source and sequence are filled in
/// when the template is expanded into packets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub payload: Payload,
    pub target: Option<Target>,
    pub source: Option<u32>,
    pub expect: Expect,
}

impl Message {
    pub fn new(payload: Payload) -> Self {
        let expect = payload.default_expect();
        Self {
            payload,
            target: None,
            source: None,
            expect,
        }
    }

    pub fn with_target(mut self, target: Target) -> Self {
        self.target = Some(target);
        self
    }

    pub fn with_source(mut self, source: u32) -> Self {
        self.source = Some(source);
        self
    }

    pub fn expecting(mut self, expect: Expect) -> Self {
        self.expect = expect;
        self
    }

    pub fn pkt_type(&self) -> u16 {
        self.payload.pkt_type()
    }

    /// Stamp this template into a packet for `target`.
    pub fn to_packet(&self, target: Option<Target>, source: u32, sequence: u8) -> Packet {
        Packet {
            header: Header {
                protocol: PROTOCOL,
                pkt_type: self.payload.pkt_type(),
                source: self.source.unwrap_or(source),
                sequence,
                target,
                ack_required: self.expect.ack_required(),
                res_required: self.expect.res_required(),
            },
            payload: self.payload.clone(),
        }
    }
}

impl From<Payload> for Message {
    fn from(payload: Payload) -> Self {
        Message::new(payload)
    }
}

/// Fixed packet header. `target: None` addresses every device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub protocol: u16,
    pub pkt_type: u16,
    pub source: u32,
    pub sequence: u8,
    pub target: Option<Target>,
    pub ack_required: bool,
    pub res_required: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: Header,
    pub payload: Payload,
}

impl Packet {
    pub fn serial(&self) -> String {
        self.header
            .target
            .map(|t| t.serial())
            .unwrap_or_else(|| "000000000000".to_string())
    }

    pub fn is_ack(&self) -> bool {
        self.header.protocol == PROTOCOL && self.header.pkt_type == pkt_type::ACKNOWLEDGEMENT
    }

    /// Build a reply to `request`, echoing its correlation tuple.
    pub fn reply_to(request: &Header, from: Target, payload: Payload) -> Packet {
        Packet {
            header: Header {
                protocol: PROTOCOL,
                pkt_type: payload.pkt_type(),
                source: request.source,
                sequence: request.sequence,
                target: Some(from),
                ack_required: false,
                res_required: false,
            },
            payload,
        }
    }
}
