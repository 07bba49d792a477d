//! Wire types and the TCP transport.
//!
//! Every frame on a connection is a 4-byte big-endian length prefix followed
//! by the `bincode::options()` (varint) encoding of a [`Frame`]. A prefix
//! above the configured `max_frame_size` closes the connection. Method
//! arguments and results inside a transaction payload use `bincode::serialize`
//! (little-endian fixed-width integers, `u32` enum tags, `u64` lengths).

pub mod client;
pub mod connection;
pub mod endpoint;
pub mod server;
pub mod worker;

use crate::{
    dispatcher::DispatchError,
    types::{BinderId, CallKind, NodeId, FLAG_ONEWAY},
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// One invocation of a method on a binder. Immutable once built.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    target: BinderId,
    code: u32,
    arg1: i32,
    arg2: i32,
    flags: u32,
    payload: Vec<u8>,
}

impl Transaction {
    pub fn new(target: BinderId, code: u32) -> Self {
        Self {
            target,
            code,
            arg1: 0,
            arg2: 0,
            flags: 0,
            payload: Vec::new(),
        }
    }

    pub fn with_args(mut self, arg1: i32, arg2: i32) -> Self {
        self.arg1 = arg1;
        self.arg2 = arg2;
        self
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    pub fn oneway(self) -> Self {
        let flags = self.flags | FLAG_ONEWAY;
        self.with_flags(flags)
    }

    pub fn target(&self) -> BinderId {
        self.target
    }

    pub fn code(&self) -> u32 {
        self.code
    }

    pub fn arg1(&self) -> i32 {
        self.arg1
    }

    pub fn arg2(&self) -> i32 {
        self.arg2
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn kind(&self) -> CallKind {
        CallKind::from_flags(self.flags)
    }

    pub fn is_oneway(&self) -> bool {
        self.kind() == CallKind::Oneway
    }
}

#[derive(Serialize, Deserialize, Debug)]
pub(crate) enum Frame {
    /// First frame in each direction: the sender's node id.
    Hello { node: NodeId },
    /// `id` correlates the reply; oneway requests use 0.
    Request { id: u32, transaction: Transaction },
    Reply {
        id: u32,
        result: Result<Vec<u8>, DispatchError>,
    },
}

pub(crate) fn encode_payload<T: Serialize + ?Sized>(value: &T) -> bincode::Result<Vec<u8>> {
    bincode::serialize(value)
}

pub(crate) fn decode_payload<T: DeserializeOwned>(payload: &[u8]) -> bincode::Result<T> {
    bincode::deserialize(payload)
}
