use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one running process instance.
pub type NodeId = u32;

/// Identifies a binder within the process that owns it.
pub type BinderId = u64;

/// Transaction flag: no reply is sent or awaited.
pub const FLAG_ONEWAY: u32 = 0x1;

/// The only part of a binder that ever crosses a process boundary.
///
/// Two references are equal when they name the same binder on the same node,
/// which is what proxies use for their own equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
pub struct BinderRef {
    node: NodeId,
    id: BinderId,
}

impl BinderRef {
    pub const fn new(node: NodeId, id: BinderId) -> Self {
        Self { node, id }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn id(&self) -> BinderId {
        self.id
    }
}

impl fmt::Display for BinderRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.node)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum CallKind {
    TwoWay,
    Oneway,
}

impl CallKind {
    pub fn from_flags(flags: u32) -> Self {
        if flags & FLAG_ONEWAY != 0 {
            CallKind::Oneway
        } else {
            CallKind::TwoWay
        }
    }

    fn name(&self) -> &'static str {
        use CallKind::*;
        match self {
            TwoWay => "two-way",
            Oneway => "oneway",
        }
    }
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}
