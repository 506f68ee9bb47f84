//! Master runtime (C6): the event loop tying every other component
//! together.
//!
//! One `Master` value owns the node table, EDS database and worker pool —
//! deliberately not scattered ambient singletons. The loop itself is a
//! single `select!` over three streams: CAN ingress, a periodic tick that
//! drives heartbeat/guard timers and backoff retries, and completions
//! draining back from the worker pool. Every branch runs its handler
//! to completion before the loop polls again — nothing suspends mid-handler
//! except the workers themselves.

use crate::driver::{self, DriverInstance};
use crate::eds::EdsDatabase;
use crate::engine::{Direction, Engine, SdoJob};
use crate::error::CanOpenError;
use crate::frame::{self, CanFrame, FrameFunction};
use crate::node::supervisor::{self, Action, NmtCommand};
use crate::node::{NodeState, NodeTable};
use crate::transport::{self, CanTransport, ChannelTransport};
use futures::{future::FutureExt, pin_mut, select};
use futures_timer::Delay;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc as tokio_mpsc;

/// Configuration the runtime needs beyond what `Engine::new` already takes.
pub struct MasterConfig {
    pub managed_range: RangeInclusive<u8>,
    pub heartbeat_period: Duration,
    pub heartbeat_timeout: Duration,
    pub ntimeouts_max: u32,
    pub strict: bool,
    pub tick_interval: Duration,
    pub sdo_queue_length: usize,
    pub job_queue_length: usize,
}

impl Default for MasterConfig {
    fn default() -> Self {
        MasterConfig {
            managed_range: 1..=127,
            heartbeat_period: Duration::from_millis(10_000),
            heartbeat_timeout: Duration::from_millis(1_000),
            ntimeouts_max: 0,
            strict: false,
            tick_interval: Duration::from_millis(100),
            sdo_queue_length: crate::engine::DEFAULT_SDO_QUEUE_LENGTH,
            job_queue_length: crate::engine::DEFAULT_JOB_QUEUE_LENGTH,
        }
    }
}

struct SdoCompletion {
    node_id: u8,
    index: u16,
    sub: u8,
    result: Result<Vec<u8>, CanOpenError>,
}

/// The process-wide state the runtime owns: node table, EDS database,
/// worker pool, bound drivers. Passed explicitly to every handler rather
/// than reached for as a singleton.
pub struct Master {
    pub nodes: NodeTable,
    pub eds: EdsDatabase,
    pub engine: Arc<Engine>,
    channel_transport: Arc<ChannelTransport>,
    drivers: HashMap<u8, DriverInstance>,
    config: MasterConfig,
    completions_rx: std_mpsc::Receiver<SdoCompletion>,
    completions_tx: std_mpsc::Sender<SdoCompletion>,
    control_tx: tokio_mpsc::UnboundedSender<CanFrame>,
}

impl Master {
    /// Builds a `Master` plus the receiving halves of its two outgoing-frame
    /// channels (worker-pool SDO requests, and NMT/node-guard control
    /// frames), which the caller must pump into [`Master::run`].
    pub fn new(
        eds: EdsDatabase,
        config: MasterConfig,
    ) -> (
        Self,
        tokio_mpsc::UnboundedReceiver<(u8, [u8; 8])>,
        tokio_mpsc::UnboundedReceiver<CanFrame>,
    ) {
        let (channel_transport, outgoing_rx) = ChannelTransport::new();
        let channel_transport = Arc::new(channel_transport);
        let engine = Engine::new(
            channel_transport.clone(),
            config.sdo_queue_length,
            config.job_queue_length,
        );
        let (completions_tx, completions_rx) = std_mpsc::channel();
        let (control_tx, control_rx) = tokio_mpsc::unbounded_channel();
        let master = Master {
            nodes: NodeTable::new(),
            eds,
            engine,
            channel_transport,
            drivers: HashMap::new(),
            config,
            completions_rx,
            completions_tx,
            control_tx,
        };
        (master, outgoing_rx, control_rx)
    }

    fn is_managed(&self, node_id: u8) -> bool {
        self.config.managed_range.contains(&node_id)
    }

    /// Drive the event loop forever (or until the transport errors out, at
    /// which point the runtime's caller decides the process exit code).
    ///
    /// Four streams feed the `select!`: CAN ingress, the worker pool's
    /// outgoing SDO requests (queued onto [`ChannelTransport`] by worker
    /// threads and written here), NMT/node-guard control frames queued by
    /// `apply_actions`, and a periodic tick driving heartbeat/node-guard
    /// timers. `outgoing_rx`/`control_rx` are kept as sibling parameters
    /// rather than fields so their borrows don't overlap the `&mut self`
    /// calls the other branches make.
    pub async fn run(
        &mut self,
        transport: &mut CanTransport,
        outgoing_rx: &mut tokio_mpsc::UnboundedReceiver<(u8, [u8; 8])>,
        control_rx: &mut tokio_mpsc::UnboundedReceiver<CanFrame>,
    ) -> Result<(), CanOpenError> {
        loop {
            let ingress = transport.recv().fuse();
            let outgoing = outgoing_rx.recv().fuse();
            let control = control_rx.recv().fuse();
            let tick = Delay::new(self.config.tick_interval).fuse();
            pin_mut!(ingress, outgoing, control, tick);

            select! {
                frame = ingress => {
                    match frame {
                        Ok(frame) => self.handle_ingress(frame),
                        Err(err) => {
                            warn!("transport error, stopping runtime: {err}");
                            return Err(err);
                        }
                    }
                },
                job = outgoing => {
                    if let Some((node_id, data)) = job {
                        match transport::sdo_request_frame(node_id, data) {
                            Ok(frame) => {
                                if let Err(err) = transport.send(frame).await {
                                    warn!("failed writing SDO request for node {node_id}: {err}");
                                }
                            }
                            Err(err) => warn!("malformed outgoing SDO frame for node {node_id}: {err}"),
                        }
                    }
                },
                frame = control => {
                    if let Some(frame) = frame {
                        if let Err(err) = transport.send(frame).await {
                            warn!("failed writing control frame: {err}");
                        }
                    }
                },
                () = tick => self.handle_tick(Instant::now()),
            }

            self.drain_completions();
        }
    }

    fn handle_ingress(&mut self, frame: CanFrame) {
        let (function, node_id) = match frame::split_cob_id(frame.cob_id) {
            Ok(v) => v,
            Err(_) => return,
        };
        if !self.is_managed(node_id) {
            return;
        }

        match function {
            FrameFunction::NmtErrorControl => self.handle_heartbeat(node_id),
            FrameFunction::SyncOrEmergency => self.handle_emcy(node_id, &frame),
            FrameFunction::Rpdo1 | FrameFunction::Rpdo2 | FrameFunction::Rpdo3 | FrameFunction::Rpdo4 => {
                self.handle_pdo(function, node_id, &frame)
            }
            FrameFunction::SdoTx => {
                self.channel_transport.deliver_sdo_response(node_id, frame.data);
            }
            _ => {}
        }
    }

    fn handle_heartbeat(&mut self, node_id: u8) {
        let Some(node) = self.nodes.get_mut(node_id) else {
            return;
        };
        let actions = supervisor::on_heartbeat(node, Instant::now(), self.config.heartbeat_timeout);
        self.apply_actions(actions);
    }

    fn handle_emcy(&self, node_id: u8, frame: &CanFrame) {
        if let Some(driver) = self.drivers.get(&node_id) {
            driver.dispatch_emcy(node_id, &frame.data);
        }
    }

    fn handle_pdo(&self, function: FrameFunction, node_id: u8, frame: &CanFrame) {
        let slot = match function {
            FrameFunction::Rpdo1 => 1,
            FrameFunction::Rpdo2 => 2,
            FrameFunction::Rpdo3 => 3,
            FrameFunction::Rpdo4 => 4,
            _ => return,
        };
        if let Some(driver) = self.drivers.get(&node_id) {
            driver.dispatch_pdo(slot, node_id, frame.data());
        }
    }

    fn handle_tick(&mut self, now: Instant) {
        let timed_out: Vec<u8> = self
            .nodes
            .iter()
            .filter(|n| n.heartbeat_deadline.map(|d| now >= d).unwrap_or(false))
            .map(|n| n.node_id)
            .collect();
        for node_id in timed_out {
            if let Some(node) = self.nodes.get_mut(node_id) {
                let actions = supervisor::on_heartbeat_timeout(node);
                self.apply_actions(actions);
            }
        }

        let due_for_retry: Vec<u8> = self
            .nodes
            .iter()
            .filter(|n| n.boot_retry_deadline.map(|d| now >= d).unwrap_or(false))
            .map(|n| n.node_id)
            .collect();
        for node_id in due_for_retry {
            if let Some(node) = self.nodes.get_mut(node_id) {
                let actions = supervisor::on_boot_retry_due(node);
                self.apply_actions(actions);
            }
        }

        let due_for_ping: Vec<u8> = self
            .nodes
            .iter()
            .filter(|n| n.state != NodeState::Dormant && !n.heartbeat_supported)
            .map(|n| n.node_id)
            .collect();
        for node_id in due_for_ping {
            if let Some(node) = self.nodes.get(node_id) {
                let actions = supervisor::on_ping_due(node);
                self.apply_actions(actions);
            }
        }
    }

    fn apply_actions(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::SubmitBootRead { node_id, index, sub } => {
                    self.submit_boot_read(node_id, index, sub);
                }
                Action::BindDriver { node_id } => self.bind_driver(node_id),
                Action::SendNmt { node_id, command } => self.send_nmt(node_id, command),
                Action::SendNodeGuard { node_id } => self.send_node_guard(node_id),
                Action::DriverOffline { node_id } => {
                    if let Some(driver) = self.drivers.remove(&node_id) {
                        drop(driver);
                    }
                }
            }
        }
    }

    fn submit_boot_read(&self, node_id: u8, index: u16, sub: u8) {
        let tx = self.completions_tx.clone();
        let job = SdoJob {
            node_id,
            index,
            sub,
            direction: Direction::Upload,
            payload: Vec::new(),
            timeout: Duration::from_millis(500),
            on_done: Box::new(move |result| {
                let _ = tx.send(SdoCompletion {
                    node_id,
                    index,
                    sub,
                    result,
                });
            }),
        };
        if let Err(err) = self.engine.submit(job) {
            warn!("node {node_id}: failed to submit boot read 0x{index:04x}:{sub:02x}: {err}");
        }
    }

    fn bind_driver(&mut self, node_id: u8) {
        let Some(node) = self.nodes.get_mut(node_id) else {
            return;
        };
        let eds_record = self
            .eds
            .find(
                node.identity.vendor_id,
                node.identity.product_code,
                node.identity.revision_number,
            )
            .cloned();
        let (instance, mut quirks) = driver::bind(
            node_id,
            node.identity.vendor_id,
            node.identity.product_code,
            eds_record.as_ref(),
        );
        if self.config.strict {
            quirks = crate::node::Quirks::empty();
        }
        node.quirks = quirks;
        node.state = NodeState::Operational;
        info!(
            "node {node_id}: bound driver for {:04x}:{:04x} rev {}",
            node.identity.vendor_id, node.identity.product_code, node.identity.revision_number
        );
        self.drivers.insert(node_id, instance);
    }

    fn send_nmt(&self, node_id: Option<u8>, command: NmtCommand) {
        debug!("NMT {command:?} -> {node_id:?}");
        match transport::nmt_frame(command, node_id) {
            Ok(frame) => {
                if self.control_tx.send(frame).is_err() {
                    warn!("control-frame channel is gone, dropping NMT {command:?}");
                }
            }
            Err(err) => warn!("failed building NMT {command:?} frame: {err}"),
        }
    }

    fn send_node_guard(&self, node_id: u8) {
        debug!("node {node_id}: node-guard poll due");
        match transport::node_guard_request_frame(node_id) {
            Ok(frame) => {
                if self.control_tx.send(frame).is_err() {
                    warn!("control-frame channel is gone, dropping node-guard poll for {node_id}");
                }
            }
            Err(err) => warn!("failed building node-guard poll for {node_id}: {err}"),
        }
    }

    fn drain_completions(&mut self) {
        while let Ok(completion) = self.completions_rx.try_recv() {
            let node_id = completion.node_id;
            match completion.result {
                Ok(payload) => {
                    let Some(node) = self.nodes.get_mut(node_id) else {
                        continue;
                    };
                    let actions = supervisor::on_boot_read_done(
                        node,
                        completion.index,
                        completion.sub,
                        &payload,
                    );
                    self.apply_actions(actions);
                }
                Err(CanOpenError::Timeout { .. }) => {
                    if let Some(node) = self.nodes.get_mut(node_id) {
                        supervisor::on_boot_read_failed(node, completion.index, completion.sub, Instant::now());
                        let actions = supervisor::on_sdo_timeout(node, self.config.ntimeouts_max);
                        self.apply_actions(actions);
                    }
                }
                Err(err) => {
                    warn!("node {node_id}: boot read failed: {err}");
                    if let Some(node) = self.nodes.get_mut(node_id) {
                        supervisor::on_boot_read_failed(node, completion.index, completion.sub, Instant::now());
                    }
                }
            }
        }
    }
}
