//! SDO transfer state machines (C3).
//!
//! Everything here is pure: a state (plus, for segmented transfers, a small
//! context struct accumulating bytes) and a `feed` function mapping an input
//! frame to the next state and an optional output frame. The request engine
//! (`crate::engine`) and the node supervisor's SDO server side are the only
//! callers that attach timers, sockets, or node identity to these machines.

pub mod machine;

pub use machine::{client_download, client_upload, server_download, server_upload, State};
