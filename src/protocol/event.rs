//! EVENT frame decoding. Events arrive on stream -1, only on connections
//! that REGISTERed for them (the control connection).

use std::net::SocketAddr;

use crate::constant::{EVENT_SCHEMA_CHANGE, EVENT_STATUS_CHANGE, EVENT_TOPOLOGY_CHANGE};
use crate::error::{Error, Result};
use crate::protocol::primitive::{read_inet, read_string};
use crate::protocol::response::{SchemaChange, read_schema_change};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyChange {
    NewNode,
    RemovedNode,
    MovedNode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusChange {
    Up,
    Down,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Topology {
        change: TopologyChange,
        address: SocketAddr,
    },
    Status {
        change: StatusChange,
        address: SocketAddr,
    },
    Schema(SchemaChange),
}

impl Event {
    pub fn decode(body: &[u8]) -> Result<Self> {
        let (event_type, rest) = read_string(body)?;
        match event_type {
            EVENT_TOPOLOGY_CHANGE => {
                let (change, rest) = read_string(rest)?;
                let change = match change {
                    "NEW_NODE" => TopologyChange::NewNode,
                    "REMOVED_NODE" => TopologyChange::RemovedNode,
                    "MOVED_NODE" => TopologyChange::MovedNode,
                    _ => return Err(Error::InvalidFrame("unknown topology change")),
                };
                let (address, _) = read_inet(rest)?;
                Ok(Self::Topology { change, address })
            }
            EVENT_STATUS_CHANGE => {
                let (change, rest) = read_string(rest)?;
                let change = match change {
                    "UP" => StatusChange::Up,
                    "DOWN" => StatusChange::Down,
                    _ => return Err(Error::InvalidFrame("unknown status change")),
                };
                let (address, _) = read_inet(rest)?;
                Ok(Self::Status { change, address })
            }
            EVENT_SCHEMA_CHANGE => {
                let (change, _) = read_schema_change(rest)?;
                Ok(Self::Schema(change))
            }
            _ => Err(Error::InvalidFrame("unknown event type")),
        }
    }
}
