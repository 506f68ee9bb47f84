//! CAN transport: the external collaborator the runtime and engine depend
//! on, not part of the core design itself.
//!
//! Two backends: real SocketCAN via `tokio_socketcan`, and a raw TCP tunnel
//! for `--use-tcp`, for hosts without a CAN controller. Framing
//! on the wire is a fixed 11-byte record: 2-byte little-endian COB-ID, a
//! 1-byte length, and 8 data bytes (unused tail ignored on the receive
//! side) — this project's own framing, since the TCP tunnel has no
//! standardized wire format to defer to.

use crate::engine::SyncTransport;
use crate::error::CanOpenError;
use crate::frame::{self, CanFrame, FrameFunction};
use crate::node::supervisor::NmtCommand;
use byteorder::{ByteOrder, LittleEndian};
use std::sync::mpsc as std_mpsc;
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc as tokio_mpsc;
use tokio_socketcan::{CANFrame, CANSocket};

const TCP_RECORD_LEN: usize = 11;

pub enum CanTransport {
    SocketCan(CANSocket),
    Tcp(TcpStream),
}

impl CanTransport {
    pub async fn open(endpoint: &str, use_tcp: bool) -> Result<Self, CanOpenError> {
        if use_tcp {
            let stream =
                TcpStream::connect(endpoint)
                    .await
                    .map_err(|err| CanOpenError::TransportError {
                        reason: format!("connecting to {endpoint}: {err}"),
                    })?;
            Ok(CanTransport::Tcp(stream))
        } else {
            let socket =
                CANSocket::open(endpoint).map_err(|err| CanOpenError::TransportError {
                    reason: format!("opening {endpoint}: {err}"),
                })?;
            Ok(CanTransport::SocketCan(socket))
        }
    }

    pub async fn send(&mut self, frame: CanFrame) -> Result<(), CanOpenError> {
        match self {
            CanTransport::SocketCan(socket) => {
                let can_frame = CANFrame::new(frame.cob_id, frame.data(), frame.rtr, false)
                    .map_err(|err| CanOpenError::TransportError {
                        reason: err.to_string(),
                    })?;
                socket
                    .write_frame(can_frame)
                    .map_err(|err| CanOpenError::TransportError {
                        reason: err.to_string(),
                    })?
                    .await
                    .map_err(|err| CanOpenError::TransportError {
                        reason: err.to_string(),
                    })
            }
            CanTransport::Tcp(stream) => {
                let mut buf = [0u8; TCP_RECORD_LEN];
                LittleEndian::write_u16(&mut buf[0..2], frame.cob_id as u16);
                buf[2] = frame.len;
                buf[3..11].copy_from_slice(&frame.data);
                stream
                    .write_all(&buf)
                    .await
                    .map_err(|err| CanOpenError::TransportError {
                        reason: err.to_string(),
                    })
            }
        }
    }

    pub async fn recv(&mut self) -> Result<CanFrame, CanOpenError> {
        match self {
            CanTransport::SocketCan(socket) => {
                use futures_util::StreamExt;
                let frame = socket
                    .next()
                    .await
                    .ok_or_else(|| CanOpenError::TransportError {
                        reason: "CAN socket closed".into(),
                    })?
                    .map_err(|err| CanOpenError::TransportError {
                        reason: err.to_string(),
                    })?;
                CanFrame::new_with_rtr(frame.id(), frame.data(), frame.is_rtr())
            }
            CanTransport::Tcp(stream) => {
                let mut buf = [0u8; TCP_RECORD_LEN];
                stream
                    .read_exact(&mut buf)
                    .await
                    .map_err(|err| CanOpenError::TransportError {
                        reason: err.to_string(),
                    })?;
                let cob_id = LittleEndian::read_u16(&buf[0..2]) as u32;
                let len = (buf[2] as usize).min(8);
                CanFrame::new(cob_id, &buf[3..3 + len])
            }
        }
    }
}

/// Bridges the worker pool's synchronous [`SyncTransport`] onto the async
/// [`CanTransport`] the runtime owns. Workers call `send_sdo_request`/
/// `recv_sdo_response` from plain OS threads; this struct forwards the
/// former onto an unbounded channel the runtime drains in its event loop
/// and the latter blocks on a per-node channel the runtime feeds
/// whenever an SDO server-response frame arrives for that node. Only one
/// SDO job is ever in flight per node, so a single-slot channel per
/// node never backs up.
pub struct ChannelTransport {
    outgoing_tx: tokio_mpsc::UnboundedSender<(u8, [u8; 8])>,
    response_txs: Vec<std_mpsc::Sender<[u8; 8]>>,
    response_rxs: Vec<Mutex<std_mpsc::Receiver<[u8; 8]>>>,
}

impl ChannelTransport {
    /// Returns the transport plus the receiving half of the outgoing-frame
    /// channel, which the runtime drains and writes onto the real
    /// [`CanTransport`].
    pub fn new() -> (Self, tokio_mpsc::UnboundedReceiver<(u8, [u8; 8])>) {
        let (outgoing_tx, outgoing_rx) = tokio_mpsc::unbounded_channel();
        let mut response_txs = Vec::with_capacity(128);
        let mut response_rxs = Vec::with_capacity(128);
        for _ in 0..128 {
            let (tx, rx) = std_mpsc::channel();
            response_txs.push(tx);
            response_rxs.push(Mutex::new(rx));
        }
        (
            ChannelTransport {
                outgoing_tx,
                response_txs,
                response_rxs,
            },
            outgoing_rx,
        )
    }

    /// Called by the runtime's ingress handler when an SDO server-response
    /// frame arrives for `node_id`; wakes whichever worker is blocked in
    /// `recv_sdo_response` for that node.
    pub fn deliver_sdo_response(&self, node_id: u8, data: [u8; 8]) {
        let _ = self.response_txs[node_id as usize].send(data);
    }
}

impl SyncTransport for ChannelTransport {
    fn send_sdo_request(&self, node_id: u8, frame: [u8; 8]) -> Result<(), CanOpenError> {
        self.outgoing_tx
            .send((node_id, frame))
            .map_err(|_| CanOpenError::TransportError {
                reason: "runtime's outgoing-frame channel is gone".into(),
            })
    }

    fn recv_sdo_response(&self, node_id: u8, timeout: Duration) -> Result<[u8; 8], CanOpenError> {
        self.response_rxs[node_id as usize]
            .lock()
            .unwrap()
            .recv_timeout(timeout)
            .map_err(|_| CanOpenError::Timeout {
                node_id,
                timeout_ms: timeout.as_millis() as u64,
            })
    }
}

/// Turns an `(node_id, sdo-command-bytes)` pair from the outgoing channel
/// into a full CAN frame addressed at that node's SDO server COB-ID.
pub fn sdo_request_frame(node_id: u8, data: [u8; 8]) -> Result<CanFrame, CanOpenError> {
    CanFrame::new(frame::sdo_request_cob_id(node_id), &data)
}

fn nmt_command_code(command: NmtCommand) -> u8 {
    match command {
        NmtCommand::Start => 0x01,
        NmtCommand::Stop => 0x02,
        NmtCommand::EnterPreOperational => 0x80,
        NmtCommand::ResetNode => 0x81,
        NmtCommand::ResetCommunication => 0x82,
    }
}

/// An NMT master command frame: COB-ID 0x000, command byte plus target node
/// id (0 addresses every node on the bus).
pub fn nmt_frame(command: NmtCommand, node_id: Option<u8>) -> Result<CanFrame, CanOpenError> {
    let cob_id = frame::make_cob_id(FrameFunction::Nmt, 0);
    CanFrame::new(cob_id, &[nmt_command_code(command), node_id.unwrap_or(0)])
}

/// A node-guarding poll: an RTR frame on the node's heartbeat COB-ID with no
/// payload, soliciting its NMT status byte in reply.
pub fn node_guard_request_frame(node_id: u8) -> Result<CanFrame, CanOpenError> {
    CanFrame::new_with_rtr(frame::heartbeat_cob_id(node_id), &[], true)
}
