//! Compiler for hardware-timed experiment sequences.
//!
//! A user script describes, in wall-clock time, what every output of a
//! lab's device tree should do: hold values, ramp through waveforms,
//! pulse digital lines, pause for external triggers. This crate turns
//! that description into the two things a playback runtime needs: a
//! per-pseudoclock *clock program* (repetition-encoded tick segments
//! interleaved with wait markers) and, for every output, a flat sample
//! array aligned to those ticks.
//!
//! The entry point is [`Experiment`]: build the device tree, call
//! [`Experiment::start`], issue instructions, then [`Experiment::stop`]
//! to compile and receive the [`Shot`] artifact for the external
//! writer. Compilation is a pure function of the declared tree and
//! instructions; a fresh `Experiment` is a fresh compilation context.

mod clock;
mod device;
mod diagnostics;
mod errors;
mod experiment;
mod functions;
mod instruction;
mod output;
mod properties;
mod shot;
mod units;

pub use clock::{ClockSegment, PseudoclockProgram};
pub use device::{
    Acquisition, AnalogInId, AnalogOutId, ClockLineId, ClockSpec, DdsId, DeviceId, DigitalOutId,
    IntermediateDeviceId, PseudoclockDeviceId, PseudoclockId, ShutterId, StaticAnalogOutId,
    StaticDdsId, StaticDigitalOutId, TriggerEdge, TriggerId, WaitMonitorId,
};
pub use diagnostics::{Severity, Warning};
pub use errors::{ErrorKind, Result, SequenceError};
pub use experiment::{Config, Experiment, StopOptions};
pub use functions::Waveform;
pub use output::{
    AnalogOutOptions, DdsOptions, DdsQuantityOptions, Dtype, ExpTruncation, RawOutput,
    WaitMonitorOptions, WaitMonitorRouting,
};
pub use properties::{PropertyLocation, PropertyMap};
pub use shot::{
    ConnectionTableRow, DevicePropertiesEntry, OutputSamples, Shot, ShotProperties, ShotSink,
    ShutterCalibration, TimeMarkerRow, WaitMonitorInfo, WaitRow,
};
pub use units::{Calibration, CalibrationBuilder};

#[cfg(test)]
mod tests {
    use super::*;

    /// Smallest useful tree: one clock, one line, one card.
    fn minimal_rig(exp: &mut Experiment) -> Result<IntermediateDeviceId> {
        let clock = exp.new_pseudoclock_device(
            "pulser",
            ClockSpec {
                clock_limit: 10e6,
                clock_resolution: 1e-7,
                trigger_delay: 0.0,
                trigger_minimum_duration: 0.0,
                wait_delay: 0.0,
            },
        )?;
        let pseudoclock = exp.new_pseudoclock(clock, "pulser_clock", "clock")?;
        let line = exp.new_clock_line(pseudoclock, "flag0", "flag 0", true)?;
        exp.new_intermediate_device(line, "card0", None)
    }

    #[test]
    fn instructions_require_start() {
        let mut exp = Experiment::new();
        let card = minimal_rig(&mut exp).unwrap();
        let d = exp.new_digital_out(card, "d0", "port0", false).unwrap();
        let err = exp.go_high(d, 1e-3).unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotStarted);
    }

    #[test]
    fn duplicate_names_rejected() {
        let mut exp = Experiment::new();
        let card = minimal_rig(&mut exp).unwrap();
        exp.new_digital_out(card, "d0", "port0", false).unwrap();
        let err = exp.new_digital_out(card, "d0", "port1", false).unwrap_err();
        assert_eq!(err.kind, ErrorKind::NameClash);
    }

    #[test]
    fn second_master_rejected() {
        let mut exp = Experiment::new();
        minimal_rig(&mut exp).unwrap();
        let err = exp
            .new_pseudoclock_device(
                "pulser2",
                ClockSpec {
                    clock_limit: 1e6,
                    clock_resolution: 1e-6,
                    trigger_delay: 0.0,
                    trigger_minimum_duration: 0.0,
                    wait_delay: 0.0,
                },
            )
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::MultipleMasters);
    }

    #[test]
    fn zero_stop_rejected() {
        let mut exp = Experiment::new();
        minimal_rig(&mut exp).unwrap();
        exp.start().unwrap();
        let err = exp.stop(0.0, StopOptions::default()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ZeroStop);
    }
}
