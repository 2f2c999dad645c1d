//! Unified error types for the blower-door firmware.
//!
//! A single `Error` enum that every subsystem converts into, so service
//! callers (the HTTP boundary, the task loops) match on one type.  All
//! variants are `Copy`; nothing here allocates.

use core::fmt;

// ---------------------------------------------------------------------------
// Top-level firmware error
// ---------------------------------------------------------------------------

/// Every fallible operation in the firmware funnels into this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Caller contract violation.  No state was changed.
    InvalidArgument(&'static str),
    /// Sensor bus I/O failed after all retries.
    Bus(BusError),
    /// Flash erase/program/read/verify failed.
    FlashIo(FlashError),
    /// A checksum did not match its payload.
    CrcMismatch,
    /// Stored image failed structural validation (magic, version, size).
    ImageInvalid(&'static str),
    /// Device or driver not initialised yet.
    NotReady,
    /// Operation not valid in the current state-machine state.
    InvalidState(&'static str),
    /// Another operation is already in progress.
    Busy,
    /// Length or range outside the permitted window.
    SizeOutOfRange,
    /// Offset not aligned with the expected boundary.
    OffsetMismatch,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Self::Bus(e) => write!(f, "bus: {e}"),
            Self::FlashIo(e) => write!(f, "flash: {e}"),
            Self::CrcMismatch => write!(f, "CRC mismatch"),
            Self::ImageInvalid(msg) => write!(f, "image invalid: {msg}"),
            Self::NotReady => write!(f, "not ready"),
            Self::InvalidState(msg) => write!(f, "invalid state: {msg}"),
            Self::Busy => write!(f, "busy"),
            Self::SizeOutOfRange => write!(f, "size out of range"),
            Self::OffsetMismatch => write!(f, "offset mismatch"),
        }
    }
}

impl std::error::Error for Error {}

// ---------------------------------------------------------------------------
// Bus errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusError {
    /// Target did not acknowledge its address or a data byte.
    Nack,
    /// Transaction did not finish within the computed timeout.
    Timeout,
    /// Platform driver returned a raw error code.
    Io(i32),
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nack => write!(f, "NACK"),
            Self::Timeout => write!(f, "timeout"),
            Self::Io(code) => write!(f, "I/O error {code}"),
        }
    }
}

impl From<BusError> for Error {
    fn from(e: BusError) -> Self {
        Self::Bus(e)
    }
}

// ---------------------------------------------------------------------------
// Flash errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashError {
    Erase(i32),
    Program(i32),
    Read(i32),
    /// Readback after programming differed from the image.
    VerifyFailed,
    /// Request not aligned to erase/page granularity.
    Misaligned,
    /// Request extends past the end of the region.
    OutOfBounds,
}

impl fmt::Display for FlashError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Erase(code) => write!(f, "erase failed ({code})"),
            Self::Program(code) => write!(f, "program failed ({code})"),
            Self::Read(code) => write!(f, "read failed ({code})"),
            Self::VerifyFailed => write!(f, "readback verify failed"),
            Self::Misaligned => write!(f, "misaligned access"),
            Self::OutOfBounds => write!(f, "access out of bounds"),
        }
    }
}

impl From<FlashError> for Error {
    fn from(e: FlashError) -> Self {
        match e {
            FlashError::Misaligned => Self::OffsetMismatch,
            FlashError::OutOfBounds => Self::SizeOutOfRange,
            other => Self::FlashIo(other),
        }
    }
}

// ---------------------------------------------------------------------------
// Convenience Result alias
// ---------------------------------------------------------------------------

/// Firmware-wide `Result` alias.
pub type Result<T> = core::result::Result<T, Error>;
