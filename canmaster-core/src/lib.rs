//! Core CANopen master engine.
//!
//! Layered bottom-up: [`frame`] (C1, the wire codec), [`eds`] (C2, device
//! description lookup), [`sdo`] (C3, pure SDO state machines), [`engine`]
//! (C4, the worker-pool request engine), [`node`] (C5, per-node lifecycle),
//! [`driver`] (C7, the static driver registry) and [`runtime`] (C6, the
//! event loop tying the rest together). [`transport`] is the CAN transport
//! itself, an external collaborator rather than part of the core design.

pub mod abort;
pub mod driver;
pub mod eds;
pub mod engine;
pub mod error;
pub mod frame;
pub mod node;
pub mod runtime;
pub mod sdo;
pub mod transport;
pub mod util;

pub use error::{CanOpenError, Result};
