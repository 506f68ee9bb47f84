//! Per-node lifecycle supervisor (C5).
//!
//! The node table is a flat array indexed by node id, not a hash map: the id
//! space is fixed (1..=127) and small, so locality wins over flexibility.
//! `NodeTable` owns the array; `supervisor` drives state transitions on top
//! of it from boot-up frames, heartbeats, node-guard replies and timeouts.

pub mod supervisor;

use bitflags::bitflags;
use std::time::Instant;

pub const NODE_ID_MIN: u8 = 1;
pub const NODE_ID_MAX: u8 = 127;

bitflags! {
    /// Per-device behavioural overrides bound at driver-bind time from the
    /// driver registry's (vendor, product) table. `--strict` clears all
    /// quirks network-wide regardless of what a driver requests.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Quirks: u32 {
        /// Tolerate a zero NMT status byte in a node-guarding reply instead
        /// of rejecting it.
        const ZERO_GUARD_STATUS = 0b0000_0001;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Dormant,
    Loading,
    PreOperational,
    Operational,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverType {
    None,
    Legacy,
    New,
}

/// Device identity read back during boot via the mandatory 0x1000/0x1008/
/// 0x1009/0x100A/0x1018 objects.
#[derive(Debug, Clone, Default)]
pub struct Identity {
    pub device_type: u32,
    pub vendor_id: u32,
    pub product_code: u32,
    pub revision_number: u32,
    pub name: String,
    pub hw_version: String,
    pub sw_version: String,
}

/// One slot in the node table. A slot is addressable once its id falls in
/// `[NODE_ID_MIN, NODE_ID_MAX]`; it is otherwise inert until a node
/// announces itself.
#[derive(Debug)]
pub struct NodeRecord {
    pub node_id: u8,
    pub state: NodeState,
    pub driver_type: DriverType,
    pub identity: Identity,
    pub heartbeat_supported: bool,
    pub is_loading: bool,
    pub ntimeouts: u32,
    pub quirks: Quirks,
    pub heartbeat_deadline: Option<Instant>,
    pub ping_deadline: Option<Instant>,
    /// `(index, sub)` of a failed boot-time read still waiting on its
    /// backoff delay to expire, and when that delay is up.
    pub boot_retry: Option<(u16, u8)>,
    pub boot_retry_deadline: Option<Instant>,
    /// Delay the *next* boot-read failure will wait before retrying;
    /// doubles on every failure and resets on `on_bootup`/a successful read.
    pub boot_retry_backoff: std::time::Duration,
}

impl NodeRecord {
    fn new(node_id: u8) -> Self {
        NodeRecord {
            node_id,
            state: NodeState::Dormant,
            driver_type: DriverType::None,
            identity: Identity::default(),
            heartbeat_supported: false,
            is_loading: false,
            ntimeouts: 0,
            quirks: Quirks::empty(),
            heartbeat_deadline: None,
            ping_deadline: None,
            boot_retry: None,
            boot_retry_deadline: None,
            boot_retry_backoff: supervisor::BOOT_RETRY_INITIAL_DELAY,
        }
    }
}

/// The master's node table: `O(1)` lookup by id, array-backed.
pub struct NodeTable {
    slots: Vec<NodeRecord>,
}

impl NodeTable {
    pub fn new() -> Self {
        let slots = (NODE_ID_MIN..=NODE_ID_MAX).map(NodeRecord::new).collect();
        NodeTable { slots }
    }

    pub fn is_addressable(node_id: u8) -> bool {
        (NODE_ID_MIN..=NODE_ID_MAX).contains(&node_id)
    }

    pub fn get(&self, node_id: u8) -> Option<&NodeRecord> {
        if !Self::is_addressable(node_id) {
            return None;
        }
        self.slots.get((node_id - NODE_ID_MIN) as usize)
    }

    pub fn get_mut(&mut self, node_id: u8) -> Option<&mut NodeRecord> {
        if !Self::is_addressable(node_id) {
            return None;
        }
        self.slots.get_mut((node_id - NODE_ID_MIN) as usize)
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeRecord> {
        self.slots.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut NodeRecord> {
        self.slots.iter_mut()
    }
}

impl Default for NodeTable {
    fn default() -> Self {
        Self::new()
    }
}
