//! Pure SDO transfer state machines (C3).
//!
//! Every machine here is a step function over `(state, input frame) -> (next
//! state, output frame)`. None of them touch a socket, a timer, or the node
//! table — the request engine (`crate::engine`) and the SDO server side of
//! the node supervisor are the only things that feed them real frames and
//! act on their output. That separation is what makes the exhaustive
//! round-trip tests in this module possible without any I/O.

use crate::abort::{self, AbortCode};
use crate::frame::sdo_codec::{self, ccs, scs};

/// Transfer progress shared by the client and server machines.
///
/// `Seg` / `SegToggled` distinguish which toggle value the machine expects
/// next, rather than carrying the toggle bit as a separate field, so the
/// state alone determines the expected toggle (see `feed`/`feed_seg`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Start,
    Seg,
    SegToggled,
    Done,
    Abort,
    RemoteAbort,
}

impl State {
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Done | State::Abort | State::RemoteAbort)
    }
}

fn abort_frame(input: &[u8; 8], cs: u8, code: u32) -> [u8; 8] {
    let (index, sub) = sdo_codec::get_multiplexer(input);
    let out = sdo_codec::set_multiplexer([0u8; 8], index, sub);
    let out = sdo_codec::set_cs(out, cs);
    sdo_codec::set_abort_code(out, code)
}

/// Server-side download: a client is writing an object via this master's SDO
/// server role reversed — i.e. this is the shape the master's own SDO client
/// machines mirror.
pub mod server_download {
    use super::*;

    pub fn feed_init(input: &[u8; 8]) -> (State, Option<[u8; 8]>) {
        let cs = sdo_codec::get_cs(input);
        if cs == ccs::ABORT {
            // An abort before any segment has started leaves nothing to
            // unwind: go back to waiting for a fresh init, not a terminal
            // abort state.
            return (State::Start, None);
        }
        if cs != ccs::DL_INIT_REQ {
            return (
                State::Abort,
                Some(abort_frame(input, scs::ABORT, abort::INVALID_CS)),
            );
        }
        let (index, sub) = sdo_codec::get_multiplexer(input);
        let out = sdo_codec::set_multiplexer([0u8; 8], index, sub);
        let out = sdo_codec::set_cs(out, scs::DL_INIT_RES);
        (State::Seg, Some(out))
    }

    pub fn feed_seg(input: &[u8; 8], expected_toggle: bool) -> (State, Option<[u8; 8]>) {
        let cs = sdo_codec::get_cs(input);
        if cs == ccs::ABORT {
            return (State::RemoteAbort, None);
        }
        if cs != ccs::DL_SEG_REQ {
            return (
                State::Abort,
                Some(abort_frame(input, scs::ABORT, abort::INVALID_CS)),
            );
        }
        if sdo_codec::is_toggled(input) != expected_toggle {
            return (
                State::Abort,
                Some(abort_frame(input, scs::ABORT, abort::TOGGLE_MISMATCH)),
            );
        }
        let out = sdo_codec::set_toggle([0u8; 8], expected_toggle);
        let out = sdo_codec::set_cs(out, scs::DL_SEG_RES);
        if sdo_codec::is_end_segment(input) {
            (State::Done, Some(sdo_codec::set_end_segment(out, true)))
        } else {
            let next = if expected_toggle {
                State::Seg
            } else {
                State::SegToggled
            };
            (next, Some(out))
        }
    }

    /// Dispatch to `feed_init` while `Start`, to `feed_seg` otherwise,
    /// threading the toggle bit the current state implies.
    pub fn feed(state: State, input: &[u8; 8]) -> (State, Option<[u8; 8]>) {
        match state {
            State::Start => feed_init(input),
            State::Seg => feed_seg(input, false),
            State::SegToggled => feed_seg(input, true),
            terminal => (terminal, None),
        }
    }
}

/// Server-side upload: this master's SDO server serving an upload request.
/// Structurally mirrors `server_download` with data flowing the other way;
/// since an upload response carries a payload the state alone can't supply,
/// the context here owns the bytes remaining to be sent.
pub mod server_upload {
    use super::*;

    #[derive(Debug, Clone)]
    pub struct Context {
        pub state: State,
        remaining: Vec<u8>,
    }

    impl Context {
        pub fn new() -> Self {
            Context {
                state: State::Start,
                remaining: Vec::new(),
            }
        }

        /// `payload` is the object dictionary value to serve; ignored once
        /// `remaining` has already been primed by a previous init step.
        pub fn feed(&mut self, input: &[u8; 8], payload: &[u8]) -> Option<[u8; 8]> {
            let (next, out) = match self.state {
                State::Start => self.feed_init(input, payload),
                State::Seg => self.feed_seg(input, false),
                State::SegToggled => self.feed_seg(input, true),
                terminal => (terminal, None),
            };
            self.state = next;
            out
        }

        fn feed_init(&mut self, input: &[u8; 8], payload: &[u8]) -> (State, Option<[u8; 8]>) {
            let cs = sdo_codec::get_cs(input);
            if cs == ccs::ABORT {
                // Same as server_download::feed_init: nothing has started
                // yet, so go back to waiting for a fresh init rather than
                // a terminal abort.
                return (State::Start, None);
            }
            if cs != ccs::UL_INIT_REQ {
                return (
                    State::Abort,
                    Some(abort_frame(input, scs::ABORT, abort::INVALID_CS)),
                );
            }
            let (index, sub) = sdo_codec::get_multiplexer(input);
            let mut out = sdo_codec::set_multiplexer([0u8; 8], index, sub);
            out = sdo_codec::set_cs(out, scs::UL_INIT_RES);
            if payload.len() <= 4 {
                out = sdo_codec::set_expedited(out, true);
                out = sdo_codec::set_indicated_size(out, true);
                out = sdo_codec::set_segment_size(out, (4 - payload.len()) as u8);
                out[4..4 + payload.len()].copy_from_slice(payload);
                (State::Done, Some(out))
            } else {
                out = sdo_codec::set_indicated_size(out, true);
                out[4..8].copy_from_slice(&(payload.len() as u32).to_le_bytes());
                self.remaining = payload.to_vec();
                (State::Seg, Some(out))
            }
        }

        fn feed_seg(&mut self, input: &[u8; 8], expected_toggle: bool) -> (State, Option<[u8; 8]>) {
            let cs = sdo_codec::get_cs(input);
            if cs == ccs::ABORT {
                return (State::RemoteAbort, None);
            }
            if cs != ccs::UL_SEG_REQ {
                return (
                    State::Abort,
                    Some(abort_frame(input, scs::ABORT, abort::INVALID_CS)),
                );
            }
            if sdo_codec::is_toggled(input) != expected_toggle {
                return (
                    State::Abort,
                    Some(abort_frame(input, scs::ABORT, abort::TOGGLE_MISMATCH)),
                );
            }
            let chunk_len = self.remaining.len().min(7);
            let chunk: Vec<u8> = self.remaining.drain(..chunk_len).collect();
            let mut out = sdo_codec::set_toggle([0u8; 8], expected_toggle);
            out = sdo_codec::set_cs(out, scs::UL_SEG_RES);
            out[1..1 + chunk.len()].copy_from_slice(&chunk);
            out = sdo_codec::set_segment_size(out, (7 - chunk_len) as u8);
            if self.remaining.is_empty() {
                out = sdo_codec::set_end_segment(out, true);
                (State::Done, Some(out))
            } else {
                let next = if expected_toggle {
                    State::Seg
                } else {
                    State::SegToggled
                };
                (next, Some(out))
            }
        }
    }

    impl Default for Context {
        fn default() -> Self {
            Self::new()
        }
    }
}

/// Client-side download: the shape the SDO request engine (C4) drives when a
/// driver enqueues a `Download` job.
pub mod client_download {
    use super::*;

    #[derive(Debug, Clone)]
    pub struct Context {
        pub state: State,
        remaining: Vec<u8>,
        pub abort_code: Option<AbortCode>,
    }

    impl Context {
        /// Build the initial request frame and the context that expects its
        /// response. `expedited` downloads still need the server's
        /// `DL_INIT_RES` fed back through `feed` before they reach `Done` —
        /// the request going out is not itself confirmation.
        pub fn start(index: u16, sub: u8, data: &[u8]) -> ([u8; 8], Self) {
            let mut out = sdo_codec::set_multiplexer([0u8; 8], index, sub);
            out = sdo_codec::set_cs(out, ccs::DL_INIT_REQ);
            if data.len() <= 4 {
                out = sdo_codec::set_expedited(out, true);
                out = sdo_codec::set_indicated_size(out, true);
                out = sdo_codec::set_segment_size(out, (4 - data.len()) as u8);
                out[4..4 + data.len()].copy_from_slice(data);
                (
                    out,
                    Context {
                        state: State::Start,
                        remaining: Vec::new(),
                        abort_code: None,
                    },
                )
            } else {
                out = sdo_codec::set_indicated_size(out, true);
                out[4..8].copy_from_slice(&(data.len() as u32).to_le_bytes());
                (
                    out,
                    Context {
                        state: State::Start,
                        remaining: data.to_vec(),
                        abort_code: None,
                    },
                )
            }
        }

        /// Feed a server response frame; returns the next request frame to
        /// send, or `None` once the transfer has reached a terminal state.
        pub fn feed(&mut self, input: &[u8; 8]) -> Option<[u8; 8]> {
            let cs = sdo_codec::get_cs(input);
            if cs == scs::ABORT {
                self.abort_code = Some(sdo_codec::get_abort_code(input).into());
                self.state = State::RemoteAbort;
                return None;
            }
            match self.state {
                State::Start => {
                    if cs != scs::DL_INIT_RES {
                        self.abort_code = Some(AbortCode::CommandSpecifierError);
                        self.state = State::Abort;
                        return None;
                    }
                    self.send_next_segment(false)
                }
                State::Seg | State::SegToggled => {
                    let expected_toggle = self.state == State::SegToggled;
                    if cs != scs::DL_SEG_RES || sdo_codec::is_toggled(input) != expected_toggle {
                        self.abort_code = Some(AbortCode::ToggleBitNotAlternated);
                        self.state = State::Abort;
                        return None;
                    }
                    self.send_next_segment(!expected_toggle)
                }
                _ => None,
            }
        }

        fn send_next_segment(&mut self, toggle: bool) -> Option<[u8; 8]> {
            if self.remaining.is_empty() {
                self.state = State::Done;
                return None;
            }
            let chunk_len = self.remaining.len().min(7);
            let chunk: Vec<u8> = self.remaining.drain(..chunk_len).collect();
            let mut out = sdo_codec::set_toggle([0u8; 8], toggle);
            out = sdo_codec::set_cs(out, ccs::DL_SEG_REQ);
            out[1..1 + chunk.len()].copy_from_slice(&chunk);
            out = sdo_codec::set_segment_size(out, (7 - chunk_len) as u8);
            if self.remaining.is_empty() {
                out = sdo_codec::set_end_segment(out, true);
            }
            self.state = if toggle { State::SegToggled } else { State::Seg };
            Some(out)
        }
    }
}

/// Client-side upload: drives an `Upload` job, accumulating the value read
/// back from the node's object dictionary.
pub mod client_upload {
    use super::*;

    #[derive(Debug, Clone)]
    pub struct Context {
        pub state: State,
        pub data: Vec<u8>,
        pub abort_code: Option<AbortCode>,
        expected_size: Option<usize>,
    }

    impl Context {
        pub fn start(index: u16, sub: u8) -> ([u8; 8], Self) {
            let out = sdo_codec::set_multiplexer([0u8; 8], index, sub);
            let out = sdo_codec::set_cs(out, ccs::UL_INIT_REQ);
            (
                out,
                Context {
                    state: State::Start,
                    data: Vec::new(),
                    abort_code: None,
                    expected_size: None,
                },
            )
        }

        pub fn feed(&mut self, input: &[u8; 8]) -> Option<[u8; 8]> {
            let cs = sdo_codec::get_cs(input);
            if cs == scs::ABORT {
                self.abort_code = Some(sdo_codec::get_abort_code(input).into());
                self.state = State::RemoteAbort;
                return None;
            }
            match self.state {
                State::Start => {
                    if cs != scs::UL_INIT_RES {
                        self.abort_code = Some(AbortCode::CommandSpecifierError);
                        self.state = State::Abort;
                        return None;
                    }
                    if sdo_codec::is_expedited(input) {
                        let n = sdo_codec::get_segment_size(input) as usize;
                        let len = 4usize.saturating_sub(n);
                        self.data.extend_from_slice(&input[4..4 + len]);
                        self.state = State::Done;
                        None
                    } else {
                        if sdo_codec::is_size_indicated(input) {
                            self.expected_size =
                                Some(u32::from_le_bytes([input[4], input[5], input[6], input[7]]) as usize);
                        }
                        self.state = State::Seg;
                        let mut out = sdo_codec::set_toggle([0u8; 8], false);
                        out = sdo_codec::set_cs(out, ccs::UL_SEG_REQ);
                        Some(out)
                    }
                }
                State::Seg | State::SegToggled => {
                    let expected_toggle = self.state == State::SegToggled;
                    if cs != scs::UL_SEG_RES || sdo_codec::is_toggled(input) != expected_toggle {
                        self.abort_code = Some(AbortCode::ToggleBitNotAlternated);
                        self.state = State::Abort;
                        return None;
                    }
                    let n = sdo_codec::get_segment_size(input) as usize;
                    let chunk_len = 7usize.saturating_sub(n);
                    self.data.extend_from_slice(&input[1..1 + chunk_len]);
                    if sdo_codec::is_end_segment(input) {
                        self.state = State::Done;
                        None
                    } else {
                        let next_toggle = !expected_toggle;
                        self.state = if next_toggle {
                            State::SegToggled
                        } else {
                            State::Seg
                        };
                        let mut out = sdo_codec::set_toggle([0u8; 8], next_toggle);
                        out = sdo_codec::set_cs(out, ccs::UL_SEG_REQ);
                        Some(out)
                    }
                }
                _ => None,
            }
        }
    }
}
