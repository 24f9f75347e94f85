//! The single error type surfaced by every fallible operation in this
//! crate. Compilation aborts at the first error; nothing is recovered.

use std::fmt;

/// What went wrong. Each kind corresponds to one class of user mistake
/// (or, rarely, an internal inconsistency) detected during sequence
/// description or compilation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A device or wait label reuses a name already registered.
    NameClash,
    /// A device name is a Rust reserved word.
    ReservedName,
    /// A device name is not a legal identifier.
    InvalidName,
    /// A child device was attached to a parent that does not accept its kind.
    KindMismatch,
    /// No pseudoclock device was found above a device that needs one.
    NoPseudoclock,
    /// An instruction was issued before `start()`.
    NotStarted,
    /// An instruction was issued before the device's earliest possible time.
    TooEarly,
    /// A commanded or generated value fell outside an output's limits.
    OutOfRange,
    /// A ramp was issued on a clockline with ramping disabled.
    NoRamping,
    /// A ramp or scalar instruction landed inside an existing ramp.
    RampOverlap,
    /// A ramp was given an end time before its start time.
    NegativeDuration,
    /// A ramp was given a zero sample rate.
    BadRate,
    /// Units were named that the output's calibration does not define.
    UnknownUnits,
    /// A calibration declares a unit without both conversion directions.
    BadCalibration,
    /// Adjacent updates were requested faster than a clock can tick.
    ClockLimitExceeded,
    /// The stop time is too close to the final instruction.
    StopTimeTooClose,
    /// An instruction lies after the experiment's stop time.
    InstructionsAfterStop,
    /// More than one parentless pseudoclock device exists.
    MultipleMasters,
    /// `start()` found no top-level devices at all.
    NoToplevelDevices,
    /// `stop(0)` was requested.
    ZeroStop,
    /// Two waits share a time.
    TimeClash,
    /// Two triggerings of the same trigger output overlap.
    TriggerOverlap,
    /// A shutter was commanded to move before its previous movement finished.
    ShutterRecovery,
    /// A start/stop order was set on a device with no hardware connection.
    NotStartable,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::NameClash => "name clash",
            ErrorKind::ReservedName => "reserved name",
            ErrorKind::InvalidName => "invalid name",
            ErrorKind::KindMismatch => "kind mismatch",
            ErrorKind::NoPseudoclock => "no pseudoclock",
            ErrorKind::NotStarted => "not started",
            ErrorKind::TooEarly => "too early",
            ErrorKind::OutOfRange => "out of range",
            ErrorKind::NoRamping => "no ramping",
            ErrorKind::RampOverlap => "ramp overlap",
            ErrorKind::NegativeDuration => "negative duration",
            ErrorKind::BadRate => "bad rate",
            ErrorKind::UnknownUnits => "unknown units",
            ErrorKind::BadCalibration => "bad calibration",
            ErrorKind::ClockLimitExceeded => "clock limit exceeded",
            ErrorKind::StopTimeTooClose => "stop time too close",
            ErrorKind::InstructionsAfterStop => "instructions after stop",
            ErrorKind::MultipleMasters => "multiple masters",
            ErrorKind::NoToplevelDevices => "no toplevel devices",
            ErrorKind::ZeroStop => "zero stop time",
            ErrorKind::TimeClash => "time clash",
            ErrorKind::TriggerOverlap => "trigger overlap",
            ErrorKind::ShutterRecovery => "shutter recovery",
            ErrorKind::NotStartable => "not startable",
        };
        f.write_str(name)
    }
}

/// Error raised by sequence description and compilation.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct SequenceError {
    pub kind: ErrorKind,
    pub message: String,
}

impl SequenceError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        SequenceError {
            kind,
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SequenceError>;

/// Shorthand for `Err(SequenceError::new(..))` with format arguments.
macro_rules! seq_err {
    ($kind:ident, $($arg:tt)*) => {
        return Err(crate::errors::SequenceError::new(
            crate::errors::ErrorKind::$kind,
            format!($($arg)*),
        ))
    };
}

pub(crate) use seq_err;
