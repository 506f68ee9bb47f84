//! CiA 301 SDO abort codes.
//!
//! Only six of these are ever *produced* by this master's own state machines
//! (see [`crate::sdo::machine`]); the rest exist so an abort code *received*
//! from a slave renders as something readable in logs and in a job's error
//! result instead of a bare hex number.

use std::fmt;

#[allow(non_camel_case_types, dead_code)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortCode {
    ToggleBitNotAlternated,
    SdoProtocolTimedOut,
    CommandSpecifierError,
    InvalidBlockSize,
    InvalidSequenceNumber,
    CrcError,
    OutOfMemory,
    UnsupportedAccess,
    ReadWriteOnlyError,
    WriteReadOnlyError,
    ObjectDoesNotExist,
    ObjectCannotBeMapped,
    PdoOverflow,
    ParameterIncompatibility,
    InternalIncompatibility,
    HardwareError,
    WrongLength,
    TooLong,
    TooShort,
    SubindexDoesNotExist,
    WrongValue,
    ValueTooHigh,
    ValueTooLow,
    RangeError,
    GeneralError,
    StorageError,
    LocalControlError,
    DeviceStateError,
    DictionaryError,
    /// Not a CiA 301 code; a sentinel for codes this table doesn't know.
    Unknown(u32),
}

/// Abort codes the master's own state machines are allowed to emit.
pub const INVALID_CS: u32 = 0x0504_0001;
pub const TOGGLE_MISMATCH: u32 = 0x0503_0000;
pub const TIMEOUT: u32 = 0x0504_0000;
pub const OUT_OF_MEMORY: u32 = 0x0504_0005;
pub const ACCESS_DENIED: u32 = 0x0601_0000;
pub const NOT_FOUND: u32 = 0x0602_0000;

impl From<u32> for AbortCode {
    fn from(code: u32) -> Self {
        match code {
            0x0503_0000 => AbortCode::ToggleBitNotAlternated,
            0x0504_0000 => AbortCode::SdoProtocolTimedOut,
            0x0504_0001 => AbortCode::CommandSpecifierError,
            0x0504_0002 => AbortCode::InvalidBlockSize,
            0x0504_0003 => AbortCode::InvalidSequenceNumber,
            0x0504_0004 => AbortCode::CrcError,
            0x0504_0005 => AbortCode::OutOfMemory,
            0x0601_0000 => AbortCode::UnsupportedAccess,
            0x0601_0001 => AbortCode::ReadWriteOnlyError,
            0x0601_0002 => AbortCode::WriteReadOnlyError,
            0x0602_0000 => AbortCode::ObjectDoesNotExist,
            0x0604_0041 => AbortCode::ObjectCannotBeMapped,
            0x0604_0042 => AbortCode::PdoOverflow,
            0x0604_0043 => AbortCode::ParameterIncompatibility,
            0x0604_0047 => AbortCode::InternalIncompatibility,
            0x0606_0000 => AbortCode::HardwareError,
            0x0607_0010 => AbortCode::WrongLength,
            0x0607_0012 => AbortCode::TooLong,
            0x0607_0013 => AbortCode::TooShort,
            0x0609_0011 => AbortCode::SubindexDoesNotExist,
            0x0609_0030 => AbortCode::WrongValue,
            0x0609_0031 => AbortCode::ValueTooHigh,
            0x0609_0032 => AbortCode::ValueTooLow,
            0x0609_0036 => AbortCode::RangeError,
            0x0800_0000 => AbortCode::GeneralError,
            0x0800_0020 => AbortCode::StorageError,
            0x0800_0021 => AbortCode::LocalControlError,
            0x0800_0022 => AbortCode::DeviceStateError,
            0x0800_0023 => AbortCode::DictionaryError,
            other => AbortCode::Unknown(other),
        }
    }
}

impl From<AbortCode> for u32 {
    fn from(code: AbortCode) -> u32 {
        match code {
            AbortCode::ToggleBitNotAlternated => 0x0503_0000,
            AbortCode::SdoProtocolTimedOut => 0x0504_0000,
            AbortCode::CommandSpecifierError => 0x0504_0001,
            AbortCode::InvalidBlockSize => 0x0504_0002,
            AbortCode::InvalidSequenceNumber => 0x0504_0003,
            AbortCode::CrcError => 0x0504_0004,
            AbortCode::OutOfMemory => 0x0504_0005,
            AbortCode::UnsupportedAccess => 0x0601_0000,
            AbortCode::ReadWriteOnlyError => 0x0601_0001,
            AbortCode::WriteReadOnlyError => 0x0601_0002,
            AbortCode::ObjectDoesNotExist => 0x0602_0000,
            AbortCode::ObjectCannotBeMapped => 0x0604_0041,
            AbortCode::PdoOverflow => 0x0604_0042,
            AbortCode::ParameterIncompatibility => 0x0604_0043,
            AbortCode::InternalIncompatibility => 0x0604_0047,
            AbortCode::HardwareError => 0x0606_0000,
            AbortCode::WrongLength => 0x0607_0010,
            AbortCode::TooLong => 0x0607_0012,
            AbortCode::TooShort => 0x0607_0013,
            AbortCode::SubindexDoesNotExist => 0x0609_0011,
            AbortCode::WrongValue => 0x0609_0030,
            AbortCode::ValueTooHigh => 0x0609_0031,
            AbortCode::ValueTooLow => 0x0609_0032,
            AbortCode::RangeError => 0x0609_0036,
            AbortCode::GeneralError => 0x0800_0000,
            AbortCode::StorageError => 0x0800_0020,
            AbortCode::LocalControlError => 0x0800_0021,
            AbortCode::DeviceStateError => 0x0800_0022,
            AbortCode::DictionaryError => 0x0800_0023,
            AbortCode::Unknown(code) => code,
        }
    }
}

impl fmt::Display for AbortCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            AbortCode::ToggleBitNotAlternated => "toggle bit not alternated",
            AbortCode::SdoProtocolTimedOut => "SDO protocol timed out",
            AbortCode::CommandSpecifierError => {
                "client/server command specifier not valid or unknown"
            }
            AbortCode::InvalidBlockSize => "invalid block size",
            AbortCode::InvalidSequenceNumber => "invalid sequence number",
            AbortCode::CrcError => "CRC error",
            AbortCode::OutOfMemory => "out of memory",
            AbortCode::UnsupportedAccess => "unsupported access to an object",
            AbortCode::ReadWriteOnlyError => "attempt to read a write-only object",
            AbortCode::WriteReadOnlyError => "attempt to write a read-only object",
            AbortCode::ObjectDoesNotExist => "object does not exist in the object dictionary",
            AbortCode::ObjectCannotBeMapped => "object cannot be mapped to the PDO",
            AbortCode::PdoOverflow => {
                "number and length of mapped objects would exceed PDO length"
            }
            AbortCode::ParameterIncompatibility => "general parameter incompatibility",
            AbortCode::InternalIncompatibility => "general internal incompatibility in the device",
            AbortCode::HardwareError => "access failed due to a hardware error",
            AbortCode::WrongLength => "data type/length of service parameter does not match",
            AbortCode::TooLong => "data type/length of service parameter too high",
            AbortCode::TooShort => "data type/length of service parameter too low",
            AbortCode::SubindexDoesNotExist => "sub-index does not exist",
            AbortCode::WrongValue => "value range of parameter exceeded",
            AbortCode::ValueTooHigh => "value of parameter written too high",
            AbortCode::ValueTooLow => "value of parameter written too low",
            AbortCode::RangeError => "maximum value is less than minimum value",
            AbortCode::GeneralError => "general error",
            AbortCode::StorageError => "data cannot be transferred or stored to the application",
            AbortCode::LocalControlError => "data cannot be transferred due to local control",
            AbortCode::DeviceStateError => "data cannot be transferred due to present device state",
            AbortCode::DictionaryError => "object dictionary dynamic generation fails or is absent",
        };
        match self {
            AbortCode::Unknown(code) => write!(f, "unknown abort code 0x{code:08x}"),
            _ => write!(f, "{text} (0x{:08x})", u32::from(*self)),
        }
    }
}
