//! Node lifecycle transitions: boot sequence, heartbeat/guarding, timeout
//! accounting, NMT commands.
//!
//! Functions here take a `&mut NodeRecord` (and whatever event just arrived)
//! and return the `Action`s the runtime (C6) must carry out — SDO reads to
//! submit, NMT frames to send, a driver to bind. No function here sends a
//! frame or touches a socket directly, which is what lets the engine/
//! supervisor tests run against a fake transport.

use super::{DriverType, NodeRecord, NodeState, Quirks};
use std::time::{Duration, Instant};

/// Backoff for a failed boot-time read: starts here, doubles on every
/// successive failure of the same object, capped at `BOOT_RETRY_MAX_DELAY`.
pub const BOOT_RETRY_INITIAL_DELAY: Duration = Duration::from_millis(200);
pub const BOOT_RETRY_MAX_DELAY: Duration = Duration::from_secs(10);

/// Mandatory identity objects read during boot, in read order.
pub const BOOT_OBJECTS: &[(u16, u8)] = &[
    (0x1000, 0x00),
    (0x1008, 0x00),
    (0x1009, 0x00),
    (0x100A, 0x00),
    (0x1018, 0x01),
    (0x1018, 0x02),
    (0x1018, 0x03),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NmtCommand {
    Start,
    Stop,
    EnterPreOperational,
    ResetNode,
    ResetCommunication,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Submit a boot-time SDO upload for `(index, sub)` on `node_id`.
    SubmitBootRead { node_id: u8, index: u16, sub: u8 },
    /// Bind a driver to `node_id` once its identity is fully known.
    BindDriver { node_id: u8 },
    /// Send an NMT command; `node_id = None` means a broadcast.
    SendNmt {
        node_id: Option<u8>,
        command: NmtCommand,
    },
    /// Issue a node-guard poll for `node_id`.
    SendNodeGuard { node_id: u8 },
    /// Tell the bound driver its node went offline.
    DriverOffline { node_id: u8 },
}

/// A node's boot-up frame (or a first successful ping) arrived: begin the
/// boot sequence by requesting the first mandatory identity object.
pub fn on_bootup(node: &mut NodeRecord) -> Vec<Action> {
    node.is_loading = true;
    node.state = NodeState::Loading;
    node.ntimeouts = 0;
    node.boot_retry = None;
    node.boot_retry_deadline = None;
    node.boot_retry_backoff = BOOT_RETRY_INITIAL_DELAY;
    vec![Action::SubmitBootRead {
        node_id: node.node_id,
        index: BOOT_OBJECTS[0].0,
        sub: BOOT_OBJECTS[0].1,
    }]
}

fn store_boot_value(node: &mut NodeRecord, index: u16, sub: u8, payload: &[u8]) {
    let as_u32 = || {
        let mut buf = [0u8; 4];
        let n = payload.len().min(4);
        buf[..n].copy_from_slice(&payload[..n]);
        u32::from_le_bytes(buf)
    };
    let as_string = || String::from_utf8_lossy(payload).trim_end_matches('\0').to_string();

    match (index, sub) {
        (0x1000, _) => node.identity.device_type = as_u32(),
        (0x1008, _) => node.identity.name = as_string(),
        (0x1009, _) => node.identity.hw_version = as_string(),
        (0x100A, _) => node.identity.sw_version = as_string(),
        (0x1018, 0x01) => node.identity.vendor_id = as_u32(),
        (0x1018, 0x02) => node.identity.product_code = as_u32(),
        (0x1018, 0x03) => node.identity.revision_number = as_u32(),
        _ => {}
    }
}

/// A boot-time SDO upload for `(index, sub)` completed successfully; advance
/// to the next mandatory object or, once all are read, bind a driver and
/// leave the loading state.
pub fn on_boot_read_done(node: &mut NodeRecord, index: u16, sub: u8, payload: &[u8]) -> Vec<Action> {
    store_boot_value(node, index, sub, payload);
    node.boot_retry = None;
    node.boot_retry_deadline = None;
    node.boot_retry_backoff = BOOT_RETRY_INITIAL_DELAY;

    let pos = BOOT_OBJECTS
        .iter()
        .position(|&(i, s)| i == index && s == sub);
    let next = pos.and_then(|p| BOOT_OBJECTS.get(p + 1));

    match next {
        Some(&(index, sub)) => vec![Action::SubmitBootRead {
            node_id: node.node_id,
            index,
            sub,
        }],
        None => {
            node.is_loading = false;
            node.state = NodeState::PreOperational;
            vec![Action::BindDriver {
                node_id: node.node_id,
            }]
        }
    }
}

/// A boot-time SDO upload for `(index, sub)` failed: leave `is_loading` set
/// and arm a backoff timer after which `on_boot_retry_due` re-issues the
/// same read. The delay doubles on every successive failure, capped at
/// `BOOT_RETRY_MAX_DELAY`.
pub fn on_boot_read_failed(node: &mut NodeRecord, index: u16, sub: u8, now: Instant) {
    // is_loading stays true: mutation of driver state is forbidden while
    // a boot read is outstanding or pending retry.
    debug_assert!(node.is_loading);
    node.boot_retry = Some((index, sub));
    node.boot_retry_deadline = Some(now + node.boot_retry_backoff);
    node.boot_retry_backoff = (node.boot_retry_backoff * 2).min(BOOT_RETRY_MAX_DELAY);
}

/// A node's boot-retry backoff timer expired: re-submit the read that
/// failed. No-op if the node isn't actually waiting on one (e.g. it already
/// recovered or was reset in the meantime).
pub fn on_boot_retry_due(node: &mut NodeRecord) -> Vec<Action> {
    node.boot_retry_deadline = None;
    match node.boot_retry.take() {
        Some((index, sub)) => vec![Action::SubmitBootRead {
            node_id: node.node_id,
            index,
            sub,
        }],
        None => Vec::new(),
    }
}

/// Heartbeat frame received: (re)arm the consumer watchdog. A heartbeat from
/// a node that was `Dormant` is this node's first sign of life and starts
/// the boot sequence.
pub fn on_heartbeat(node: &mut NodeRecord, now: Instant, timeout: Duration) -> Vec<Action> {
    node.heartbeat_supported = true;
    node.heartbeat_deadline = Some(now + timeout);
    if node.state == NodeState::Dormant {
        on_bootup(node)
    } else {
        Vec::new()
    }
}

/// The heartbeat watchdog expired: count the timeout, reset the node, and
/// tell the driver it's gone offline. A lost heartbeat always forces an NMT
/// reset; `ntimeouts` still accrues so a node that keeps losing
/// heartbeat is indistinguishable, in its timeout count, from one failing
/// repeated SDO jobs.
pub fn on_heartbeat_timeout(node: &mut NodeRecord) -> Vec<Action> {
    node.ntimeouts += 1;
    node.heartbeat_deadline = None;
    node.state = NodeState::Dormant;
    vec![
        Action::DriverOffline {
            node_id: node.node_id,
        },
        Action::SendNmt {
            node_id: Some(node.node_id),
            command: NmtCommand::ResetNode,
        },
    ]
}

/// Node-guard poll is due for a node that doesn't support producer
/// heartbeat.
pub fn on_ping_due(node: &NodeRecord) -> Vec<Action> {
    if node.heartbeat_supported {
        return Vec::new();
    }
    vec![Action::SendNodeGuard {
        node_id: node.node_id,
    }]
}

/// Decode a node-guarding status byte. `ZERO_GUARD_STATUS` permits a literal
/// zero to mean "operational" instead of being rejected as malformed.
pub fn decode_guard_status(node: &NodeRecord, status: u8) -> Option<NodeState> {
    let masked = status & 0x7f;
    if masked == 0 {
        return if node.quirks.contains(Quirks::ZERO_GUARD_STATUS) {
            Some(NodeState::Operational)
        } else {
            None
        };
    }
    match masked {
        0x04 => Some(NodeState::Stopped),
        0x05 => Some(NodeState::Operational),
        0x7f => Some(NodeState::PreOperational),
        _ => None,
    }
}

/// Any SDO job timeout outside the boot sequence: count it, and force a
/// node reset once `ntimeouts_max` is crossed.
/// `ntimeouts_max == 0` disables the cap.
pub fn on_sdo_timeout(node: &mut NodeRecord, ntimeouts_max: u32) -> Vec<Action> {
    node.ntimeouts += 1;
    if ntimeouts_max > 0 && node.ntimeouts >= ntimeouts_max {
        node.ntimeouts = 0;
        node.state = NodeState::Dormant;
        node.driver_type = DriverType::None;
        node.is_loading = false;
        node.boot_retry = None;
        node.boot_retry_deadline = None;
        vec![Action::SendNmt {
            node_id: Some(node.node_id),
            command: NmtCommand::ResetNode,
        }]
    } else {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeTable;
    use std::time::Duration;

    #[test]
    fn bootup_requests_first_mandatory_object() {
        let mut table = NodeTable::new();
        let node = table.get_mut(3).unwrap();
        let actions = on_bootup(node);
        assert_eq!(node.state, NodeState::Loading);
        assert!(node.is_loading);
        assert_eq!(
            actions,
            vec![Action::SubmitBootRead {
                node_id: 3,
                index: 0x1000,
                sub: 0x00
            }]
        );
    }

    #[test]
    fn full_boot_sequence_binds_driver_at_the_end() {
        let mut table = NodeTable::new();
        let node = table.get_mut(7).unwrap();
        on_bootup(node);

        let mut index = BOOT_OBJECTS[0];
        for expected_next in &BOOT_OBJECTS[1..] {
            let actions = on_boot_read_done(node, index.0, index.1, &[0x01, 0x00, 0x00, 0x00]);
            assert_eq!(
                actions,
                vec![Action::SubmitBootRead {
                    node_id: 7,
                    index: expected_next.0,
                    sub: expected_next.1
                }]
            );
            index = *expected_next;
        }

        let last = *BOOT_OBJECTS.last().unwrap();
        let actions = on_boot_read_done(node, last.0, last.1, &[0x2a, 0x00, 0x00, 0x00]);
        assert_eq!(actions, vec![Action::BindDriver { node_id: 7 }]);
        assert!(!node.is_loading);
        assert_eq!(node.state, NodeState::PreOperational);
        assert_eq!(node.identity.device_type, 1);
        assert_eq!(node.identity.revision_number, 0x2a);
    }

    #[test]
    fn boot_read_failure_schedules_an_increasing_backoff() {
        let mut table = NodeTable::new();
        let node = table.get_mut(5).unwrap();
        on_bootup(node);
        let start = Instant::now();

        on_boot_read_failed(node, 0x1000, 0x00, start);
        assert_eq!(node.boot_retry, Some((0x1000, 0x00)));
        assert_eq!(
            node.boot_retry_deadline,
            Some(start + Duration::from_millis(200))
        );

        on_boot_read_failed(node, 0x1000, 0x00, start);
        assert_eq!(
            node.boot_retry_deadline,
            Some(start + Duration::from_millis(400))
        );

        for _ in 0..10 {
            on_boot_read_failed(node, 0x1000, 0x00, start);
        }
        assert_eq!(node.boot_retry_backoff, Duration::from_secs(10));
    }

    #[test]
    fn boot_retry_due_resubmits_the_failed_read_then_clears() {
        let mut table = NodeTable::new();
        let node = table.get_mut(5).unwrap();
        on_bootup(node);
        on_boot_read_failed(node, 0x1009, 0x00, Instant::now());

        let actions = on_boot_retry_due(node);
        assert_eq!(
            actions,
            vec![Action::SubmitBootRead {
                node_id: 5,
                index: 0x1009,
                sub: 0x00
            }]
        );
        assert!(node.boot_retry.is_none());
        assert!(node.boot_retry_deadline.is_none());
        assert!(on_boot_retry_due(node).is_empty());
    }

    #[test]
    fn successful_boot_read_resets_backoff() {
        let mut table = NodeTable::new();
        let node = table.get_mut(5).unwrap();
        on_bootup(node);
        on_boot_read_failed(node, 0x1000, 0x00, Instant::now());
        on_boot_read_failed(node, 0x1000, 0x00, Instant::now());
        assert!(node.boot_retry_backoff > BOOT_RETRY_INITIAL_DELAY);

        on_boot_read_done(node, 0x1000, 0x00, &[0, 0, 0, 0]);
        assert_eq!(node.boot_retry_backoff, BOOT_RETRY_INITIAL_DELAY);
        assert!(node.boot_retry.is_none());
    }

    #[test]
    fn heartbeat_from_dormant_node_triggers_boot() {
        let mut table = NodeTable::new();
        let node = table.get_mut(1).unwrap();
        let actions = on_heartbeat(node, Instant::now(), Duration::from_millis(1000));
        assert!(node.heartbeat_supported);
        assert!(node.heartbeat_deadline.is_some());
        assert_eq!(node.state, NodeState::Loading);
        assert_eq!(actions.len(), 1);
    }

    #[test]
    fn heartbeat_timeout_always_resets_and_counts() {
        let mut table = NodeTable::new();
        let node = table.get_mut(9).unwrap();
        node.state = NodeState::Operational;

        for i in 1..=3u32 {
            let actions = on_heartbeat_timeout(node);
            assert_eq!(node.ntimeouts, i);
            assert_eq!(node.state, NodeState::Dormant);
            assert!(actions.contains(&Action::SendNmt {
                node_id: 9,
                command: NmtCommand::ResetNode
            }));
            assert!(actions.contains(&Action::DriverOffline { node_id: 9 }));
        }
    }

    #[test]
    fn sdo_timeout_escalation_resets_and_clears_counter() {
        let mut table = NodeTable::new();
        let node = table.get_mut(11).unwrap();
        node.state = NodeState::Operational;

        assert!(on_sdo_timeout(node, 3).is_empty());
        assert!(on_sdo_timeout(node, 3).is_empty());
        let actions = on_sdo_timeout(node, 3);
        assert_eq!(
            actions,
            vec![Action::SendNmt {
                node_id: 11,
                command: NmtCommand::ResetNode
            }]
        );
        assert_eq!(node.ntimeouts, 0);
        assert_eq!(node.state, NodeState::Dormant);
    }

    #[test]
    fn four_successive_sdo_timeouts_emit_exactly_one_reset() {
        let mut table = NodeTable::new();
        let node = table.get_mut(13).unwrap();
        node.state = NodeState::Operational;

        let resets: usize = (0..4)
            .map(|_| on_sdo_timeout(node, 3).len())
            .sum();
        assert_eq!(resets, 1);
    }

    #[test]
    fn sdo_timeout_with_max_zero_never_escalates() {
        let mut table = NodeTable::new();
        let node = table.get_mut(12).unwrap();
        for _ in 0..10 {
            assert!(on_sdo_timeout(node, 0).is_empty());
        }
    }

    #[test]
    fn guard_status_zero_requires_quirk() {
        let mut table = NodeTable::new();
        let node = table.get_mut(4).unwrap();
        assert_eq!(decode_guard_status(node, 0x00), None);

        node.quirks = Quirks::ZERO_GUARD_STATUS;
        assert_eq!(decode_guard_status(node, 0x00), Some(NodeState::Operational));
        assert_eq!(decode_guard_status(node, 0x05), Some(NodeState::Operational));
        assert_eq!(decode_guard_status(node, 0x04), Some(NodeState::Stopped));
    }

    #[test]
    fn ping_is_skipped_for_heartbeat_capable_nodes() {
        let mut table = NodeTable::new();
        let node = table.get_mut(6).unwrap();
        assert_eq!(on_ping_due(node).len(), 1);
        node.heartbeat_supported = true;
        assert!(on_ping_due(node).is_empty());
    }
}
