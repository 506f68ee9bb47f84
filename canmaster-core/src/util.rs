//! Small CLI value parsers shared by the binary's argument definitions.
//!
//! Kept separate from `main.rs` so they can be unit tested without pulling
//! in `clap`.

use crate::error::CanOpenError;
use parse_int::parse;
use std::ops::RangeInclusive;

const NODE_ID_RANGE: RangeInclusive<u32> = 0x01..=0x7f;

/// Parse a single CANopen node id, accepting decimal or `0x`-prefixed hex.
pub fn nodeid_parser(s: &str) -> Result<u8, String> {
    let nodeid = parse::<u32>(s).map_err(|x| format!("{x} is not an integer"))?;
    if NODE_ID_RANGE.contains(&nodeid) {
        Ok(nodeid as u8)
    } else {
        Err(format!(
            "node id is not in range {}-{}",
            NODE_ID_RANGE.start(),
            NODE_ID_RANGE.end()
        ))
    }
}

/// Parse `--range=A-B`: a managed node-id interval, both bounds inclusive
/// and within `[1,127]`, `A <= B`.
pub fn range_parser(s: &str) -> Result<RangeInclusive<u8>, CanOpenError> {
    let (lo, hi) = s.split_once('-').ok_or_else(|| CanOpenError::ConfigError {
        reason: format!("--range expects A-B, got {s:?}"),
    })?;
    let lo = nodeid_parser(lo.trim()).map_err(|reason| CanOpenError::ConfigError { reason })?;
    let hi = nodeid_parser(hi.trim()).map_err(|reason| CanOpenError::ConfigError { reason })?;
    if lo > hi {
        return Err(CanOpenError::ConfigError {
            reason: format!("--range lower bound {lo} is greater than upper bound {hi}"),
        });
    }
    Ok(lo..=hi)
}
