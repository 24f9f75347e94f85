//! Output kinds and their user-facing instruction methods.
//!
//! Every output shares one payload: the instruction map, ramp
//! intervals, optional limits and calibration, and the compile
//! products. The kind discriminant carries what is particular to each
//! flavour (digital inversion, shutter delays, trigger bookkeeping,
//! wait-monitor routing). DDS channels are containers delegating to
//! three analog quantities and an optional gate; they add no output
//! kind of their own.

use std::collections::BTreeMap;

use ndarray::Array1;

use crate::device::{
    AnalogInId, AnalogOutId, Dds, DdsId, DeviceId, DeviceKind, IntermediateDeviceId, ShutterId,
    StaticAnalogOutId, StaticDdsId, StaticDigitalOutId, TriggerEdge, TriggerId, WaitMonitorId,
};
use crate::device::{Acquisition, AnalogIn, DigitalOutId};
use crate::diagnostics::Severity;
use crate::errors::{seq_err, Result};
use crate::experiment::Experiment;
use crate::functions::Waveform;
use crate::instruction::{round_time, time_key, Instruction, RampInstruction, TimeKey};
use crate::units::Calibration;

/// Sample element type of an output's raw array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dtype {
    Float64,
    Uint32,
}

/// A flattened, fully expanded sample array for one output.
#[derive(Debug, Clone)]
pub enum RawOutput {
    Analog(Array1<f64>),
    Digital(Array1<u32>),
}

impl RawOutput {
    pub(crate) fn from_values(values: Vec<f64>, dtype: Dtype) -> Self {
        match dtype {
            Dtype::Float64 => RawOutput::Analog(Array1::from(values)),
            Dtype::Uint32 => {
                RawOutput::Digital(values.into_iter().map(|v| v as u32).collect())
            }
        }
    }

    pub fn len(&self) -> usize {
        match self {
            RawOutput::Analog(a) => a.len(),
            RawOutput::Digital(a) => a.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dtype(&self) -> Dtype {
        match self {
            RawOutput::Analog(_) => Dtype::Float64,
            RawOutput::Digital(_) => Dtype::Uint32,
        }
    }
}

/// One commanded shutter movement, before and after delay compensation.
#[derive(Debug, Clone)]
pub(crate) struct ShutterMove {
    pub requested: f64,
    pub actual: f64,
    /// 1 for open, 0 for close.
    pub state: u8,
}

/// Routing of the wait monitor's pulses and optional timeout output.
#[derive(Debug, Clone)]
pub struct WaitMonitorRouting {
    pub acquisition_device: DeviceId,
    pub acquisition_connection: String,
    pub timeout_device: Option<DeviceId>,
    pub timeout_connection: Option<String>,
    pub timeout_trigger_type: TriggerEdge,
    /// Shortest pulse the acquisition device can register.
    pub minimum_pulse_width: f64,
}

#[derive(Debug)]
pub(crate) enum OutputKind {
    Analog,
    StaticAnalog,
    Digital {
        inverted: bool,
    },
    StaticDigital {
        inverted: bool,
    },
    Shutter {
        inverted: bool,
        open_delay: f64,
        close_delay: f64,
        moves: BTreeMap<TimeKey, ShutterMove>,
    },
    Trigger {
        edge: TriggerEdge,
        triggerings: Vec<(f64, f64)>,
        monitor: Option<WaitMonitorRouting>,
    },
}

#[derive(Debug)]
pub(crate) struct Output {
    pub kind: OutputKind,
    pub instructions: BTreeMap<TimeKey, Instruction>,
    pub ramp_limits: Vec<(f64, f64)>,
    pub limits: Option<(f64, f64)>,
    pub calibration: Option<Calibration>,
    pub default_value: f64,
    /// Compile products.
    pub timeseries: Vec<Instruction>,
    pub raw_output: Option<RawOutput>,
}

impl Output {
    pub(crate) fn new(kind: OutputKind) -> Self {
        Output {
            kind,
            instructions: BTreeMap::new(),
            ramp_limits: Vec::new(),
            limits: None,
            calibration: None,
            default_value: 0.0,
            timeseries: Vec::new(),
            raw_output: None,
        }
    }

    pub(crate) fn dtype(&self) -> Dtype {
        match self.kind {
            OutputKind::Analog | OutputKind::StaticAnalog => Dtype::Float64,
            _ => Dtype::Uint32,
        }
    }

    pub(crate) fn is_static(&self) -> bool {
        matches!(
            self.kind,
            OutputKind::StaticAnalog | OutputKind::StaticDigital { .. }
        )
    }

    fn inverted(&self) -> bool {
        match &self.kind {
            OutputKind::Digital { inverted }
            | OutputKind::StaticDigital { inverted }
            | OutputKind::Shutter { inverted, .. } => *inverted,
            _ => false,
        }
    }
}

/// Options for a timed or static analog output.
#[derive(Default)]
pub struct AnalogOutOptions {
    /// `(min, max)` allowed in base units, checked on entry and on
    /// every generated ramp sample.
    pub limits: Option<(f64, f64)>,
    pub calibration: Option<Calibration>,
    /// Value used when the user gives no instruction.
    pub default_value: f64,
}

/// Options for one quantity of a DDS channel.
#[derive(Default)]
pub struct DdsQuantityOptions {
    pub limits: Option<(f64, f64)>,
    pub calibration: Option<Calibration>,
}

/// Options for a DDS channel.
#[derive(Default)]
pub struct DdsOptions {
    /// Digital output used as an enable gate: the device it lives on
    /// and the connection name there.
    pub digital_gate: Option<(IntermediateDeviceId, String)>,
    pub frequency: DdsQuantityOptions,
    pub amplitude: DdsQuantityOptions,
    pub phase: DdsQuantityOptions,
}

/// Options for a wait monitor.
pub struct WaitMonitorOptions {
    pub acquisition_device: DeviceId,
    pub acquisition_connection: String,
    pub timeout_device: Option<DeviceId>,
    pub timeout_connection: Option<String>,
    pub timeout_trigger_type: TriggerEdge,
    pub minimum_pulse_width: f64,
}

/// Truncation policy for exponential ramps.
#[derive(Debug, Clone, Copy)]
pub enum ExpTruncation {
    /// Stop the ramp when it reaches this value (which must lie between
    /// the initial and final values).
    Linear(f64),
    /// Stop the ramp after this fraction of its duration.
    Exponential(f64),
}

fn check_truncation(truncation: f64, min: f64, max: f64) -> Result<()> {
    if !(min <= truncation && truncation <= max) {
        seq_err!(
            OutOfRange,
            "truncation argument must be between {min} and {max} (inclusive), but is {truncation}"
        );
    }
    Ok(())
}

impl Experiment {
    // ------------------------------------------------------------------
    // Constructors
    // ------------------------------------------------------------------

    pub fn new_analog_out(
        &mut self,
        parent: IntermediateDeviceId,
        name: &str,
        connection: &str,
        options: AnalogOutOptions,
    ) -> Result<AnalogOutId> {
        let id = self.new_analog_quantity(parent.device_id(), name, connection, options)?;
        Ok(AnalogOutId(id))
    }

    pub fn new_static_analog_out(
        &mut self,
        parent: IntermediateDeviceId,
        name: &str,
        connection: &str,
        options: AnalogOutOptions,
    ) -> Result<StaticAnalogOutId> {
        let mut out = Output::new(OutputKind::StaticAnalog);
        validate_limits(name, options.limits)?;
        out.limits = options.limits;
        out.calibration = options.calibration;
        out.default_value = options.default_value;
        let id = self.register_device(name, Some(parent.device_id()), connection, DeviceKind::Output(out))?;
        Ok(StaticAnalogOutId(id))
    }

    pub fn new_digital_out(
        &mut self,
        parent: IntermediateDeviceId,
        name: &str,
        connection: &str,
        inverted: bool,
    ) -> Result<DigitalOutId> {
        let out = Output::new(OutputKind::Digital { inverted });
        let id = self.register_device(name, Some(parent.device_id()), connection, DeviceKind::Output(out))?;
        Ok(DigitalOutId(id))
    }

    pub fn new_static_digital_out(
        &mut self,
        parent: IntermediateDeviceId,
        name: &str,
        connection: &str,
        inverted: bool,
    ) -> Result<StaticDigitalOutId> {
        let out = Output::new(OutputKind::StaticDigital { inverted });
        let id = self.register_device(name, Some(parent.device_id()), connection, DeviceKind::Output(out))?;
        Ok(StaticDigitalOutId(id))
    }

    /// A shutter: a digital output whose open/close commands are
    /// shifted earlier by the mechanical delay in each direction.
    /// `open_state_high` selects which logic level opens the shutter.
    pub fn new_shutter(
        &mut self,
        parent: IntermediateDeviceId,
        name: &str,
        connection: &str,
        delay: (f64, f64),
        open_state_high: bool,
    ) -> Result<ShutterId> {
        let out = Output::new(OutputKind::Shutter {
            inverted: !open_state_high,
            open_delay: delay.0,
            close_delay: delay.1,
            moves: BTreeMap::new(),
        });
        let id = self.register_device(name, Some(parent.device_id()), connection, DeviceKind::Output(out))?;
        Ok(ShutterId(id))
    }

    pub fn new_trigger(
        &mut self,
        parent: IntermediateDeviceId,
        name: &str,
        connection: &str,
        edge: TriggerEdge,
    ) -> Result<TriggerId> {
        let out = Output::new(OutputKind::Trigger {
            edge,
            triggerings: Vec::new(),
            monitor: None,
        });
        let id = self.register_device(name, Some(parent.device_id()), connection, DeviceKind::Output(out))?;
        Ok(TriggerId(id))
    }

    /// The wait monitor: a trigger output pulsed whenever the master
    /// pseudoclock starts or resumes, whose pulse intervals are
    /// measured by the acquisition device named in `options`.
    pub fn new_wait_monitor(
        &mut self,
        parent: IntermediateDeviceId,
        name: &str,
        connection: &str,
        options: WaitMonitorOptions,
    ) -> Result<WaitMonitorId> {
        if self.wait_monitor.is_some() {
            seq_err!(
                NameClash,
                "cannot instantiate a second wait monitor: there can only be one in the experiment"
            );
        }
        if options.timeout_device.is_some() != options.timeout_connection.is_some() {
            seq_err!(
                KindMismatch,
                "must specify both the timeout device and timeout connection of '{name}', or neither"
            );
        }
        let clock = self.pseudoclock_device_of(parent.device_id())?;
        if !self.is_master_pseudoclock(clock) {
            seq_err!(
                KindMismatch,
                "the output device '{name}' for monitoring wait durations must be clocked by \
                 the master pseudoclock device"
            );
        }
        let out = Output::new(OutputKind::Trigger {
            edge: TriggerEdge::Rising,
            triggerings: Vec::new(),
            monitor: Some(WaitMonitorRouting {
                acquisition_device: options.acquisition_device,
                acquisition_connection: options.acquisition_connection,
                timeout_device: options.timeout_device,
                timeout_connection: options.timeout_connection,
                timeout_trigger_type: options.timeout_trigger_type,
                minimum_pulse_width: options.minimum_pulse_width,
            }),
        });
        let id = self.register_device(name, Some(parent.device_id()), connection, DeviceKind::Output(out))?;
        self.wait_monitor = Some(id);
        Ok(WaitMonitorId(id))
    }

    /// A DDS channel: three analog quantities (frequency, amplitude,
    /// phase) plus an optional digital gate on another device.
    pub fn new_dds(
        &mut self,
        parent: IntermediateDeviceId,
        name: &str,
        connection: &str,
        options: DdsOptions,
    ) -> Result<DdsId> {
        let id = self.new_dds_device(parent, name, connection, options, false)?;
        Ok(DdsId(id))
    }

    pub fn new_static_dds(
        &mut self,
        parent: IntermediateDeviceId,
        name: &str,
        connection: &str,
        options: DdsOptions,
    ) -> Result<StaticDdsId> {
        let id = self.new_dds_device(parent, name, connection, options, true)?;
        Ok(StaticDdsId(id))
    }

    pub fn new_analog_in(
        &mut self,
        parent: IntermediateDeviceId,
        name: &str,
        connection: &str,
        scale_factor: f64,
        units: &str,
    ) -> Result<AnalogInId> {
        let id = self.register_device(
            name,
            Some(parent.device_id()),
            connection,
            DeviceKind::AnalogIn(AnalogIn {
                scale_factor,
                units: units.to_string(),
                acquisitions: Vec::new(),
            }),
        )?;
        Ok(AnalogInId(id))
    }

    fn new_analog_quantity(
        &mut self,
        parent: DeviceId,
        name: &str,
        connection: &str,
        options: AnalogOutOptions,
    ) -> Result<DeviceId> {
        validate_limits(name, options.limits)?;
        let mut out = Output::new(OutputKind::Analog);
        out.limits = options.limits;
        out.calibration = options.calibration;
        out.default_value = options.default_value;
        self.register_device(name, Some(parent), connection, DeviceKind::Output(out))
    }

    fn new_dds_device(
        &mut self,
        parent: IntermediateDeviceId,
        name: &str,
        connection: &str,
        options: DdsOptions,
        static_: bool,
    ) -> Result<DeviceId> {
        let kind = if static_ {
            DeviceKind::StaticDds(Dds {
                frequency: DeviceId(0),
                amplitude: DeviceId(0),
                phase: DeviceId(0),
                gate: None,
            })
        } else {
            DeviceKind::Dds(Dds {
                frequency: DeviceId(0),
                amplitude: DeviceId(0),
                phase: DeviceId(0),
                gate: None,
            })
        };
        let id = self.register_device(name, Some(parent.device_id()), connection, kind)?;

        let sub = |opts: DdsQuantityOptions| {
            let mut out = Output::new(if static_ {
                OutputKind::StaticAnalog
            } else {
                OutputKind::Analog
            });
            out.limits = opts.limits;
            out.calibration = opts.calibration;
            out
        };
        validate_limits(name, options.frequency.limits)?;
        validate_limits(name, options.amplitude.limits)?;
        validate_limits(name, options.phase.limits)?;
        let frequency = self.register_device(
            &format!("{name}_freq"),
            Some(id),
            "freq",
            DeviceKind::Output(sub(options.frequency)),
        )?;
        let amplitude = self.register_device(
            &format!("{name}_amp"),
            Some(id),
            "amp",
            DeviceKind::Output(sub(options.amplitude)),
        )?;
        let phase = self.register_device(
            &format!("{name}_phase"),
            Some(id),
            "phase",
            DeviceKind::Output(sub(options.phase)),
        )?;
        let gate = match options.digital_gate {
            Some((gate_device, gate_connection)) => Some(self.register_device(
                &format!("{name}_gate"),
                Some(gate_device.device_id()),
                &gate_connection,
                DeviceKind::Output(Output::new(OutputKind::Digital { inverted: false })),
            )?),
            None => None,
        };
        match &mut self.device_mut(id).kind {
            DeviceKind::Dds(dds) | DeviceKind::StaticDds(dds) => {
                dds.frequency = frequency;
                dds.amplitude = amplitude;
                dds.phase = phase;
                dds.gate = gate;
            }
            _ => unreachable!(),
        }
        Ok(id)
    }

    fn dds_payload(&self, id: DeviceId) -> &Dds {
        match &self.device(id).kind {
            DeviceKind::Dds(dds) | DeviceKind::StaticDds(dds) => dds,
            _ => unreachable!("device {} is not a DDS", self.device_name(id)),
        }
    }

    /// The frequency quantity of a DDS, for ramping it directly.
    pub fn dds_frequency(&self, dds: DdsId) -> AnalogOutId {
        AnalogOutId(self.dds_payload(dds.device_id()).frequency)
    }

    pub fn dds_amplitude(&self, dds: DdsId) -> AnalogOutId {
        AnalogOutId(self.dds_payload(dds.device_id()).amplitude)
    }

    pub fn dds_phase(&self, dds: DdsId) -> AnalogOutId {
        AnalogOutId(self.dds_payload(dds.device_id()).phase)
    }

    pub fn dds_gate(&self, dds: DdsId) -> Option<DigitalOutId> {
        self.dds_payload(dds.device_id()).gate.map(DigitalOutId)
    }

    // ------------------------------------------------------------------
    // Analog instruction methods
    // ------------------------------------------------------------------

    /// Set the output to a constant value at time `t`.
    pub fn constant(
        &mut self,
        out: AnalogOutId,
        t: f64,
        value: f64,
        units: Option<&str>,
    ) -> Result<()> {
        self.add_instruction(out.device_id(), t, Instruction::Constant(value), units)
    }

    /// Linear ramp from `initial` to `final_value` over `duration`.
    /// Returns the occupied duration (`truncation * duration`).
    #[allow(clippy::too_many_arguments)]
    pub fn ramp(
        &mut self,
        out: AnalogOutId,
        t: f64,
        duration: f64,
        initial: f64,
        final_value: f64,
        samplerate: f64,
        units: Option<&str>,
        truncation: f64,
    ) -> Result<f64> {
        check_truncation(truncation, 0.0, 1.0)?;
        if truncation == 0.0 {
            return Ok(0.0);
        }
        if initial == final_value {
            // A flat ramp burns samples and clock ticks for nothing.
            self.diagnostics.warn(
                Severity::Mild,
                format!(
                    "analog output '{}' has the same initial and final value at time t={t}s \
                     with duration {duration}s; replacing the instruction with a constant output",
                    self.device_name(out.device_id())
                ),
            );
            self.constant(out, t, initial, units)?;
            return Ok(truncation * duration);
        }
        let function = Waveform::Ramp {
            duration: round_time(t + duration) - round_time(t),
            initial,
            final_value,
        };
        self.add_ramp(out, t, truncation * duration, function, "linear ramp", samplerate, units)?;
        Ok(truncation * duration)
    }

    /// Sinusoidal modulation `amplitude*sin(angfreq*t + phase) + dc_offset`.
    #[allow(clippy::too_many_arguments)]
    pub fn sine(
        &mut self,
        out: AnalogOutId,
        t: f64,
        duration: f64,
        amplitude: f64,
        angfreq: f64,
        phase: f64,
        dc_offset: f64,
        samplerate: f64,
        units: Option<&str>,
        truncation: f64,
    ) -> Result<f64> {
        check_truncation(truncation, 0.0, 1.0)?;
        if truncation == 0.0 {
            return Ok(0.0);
        }
        let function = Waveform::Sine {
            amplitude,
            angfreq,
            phase,
            dc_offset,
        };
        self.add_ramp(out, t, truncation * duration, function, "sine wave", samplerate, units)?;
        Ok(truncation * duration)
    }

    /// Ramp along one half period of a squared sine wave.
    #[allow(clippy::too_many_arguments)]
    pub fn sine_ramp(
        &mut self,
        out: AnalogOutId,
        t: f64,
        duration: f64,
        initial: f64,
        final_value: f64,
        samplerate: f64,
        units: Option<&str>,
        truncation: f64,
    ) -> Result<f64> {
        check_truncation(truncation, 0.0, 1.0)?;
        if truncation == 0.0 {
            return Ok(0.0);
        }
        let function = Waveform::SineRamp {
            duration: round_time(t + duration) - round_time(t),
            initial,
            final_value,
        };
        self.add_ramp(out, t, truncation * duration, function, "sinusoidal ramp", samplerate, units)?;
        Ok(truncation * duration)
    }

    /// Ramp along one half period of a quartic sine wave.
    #[allow(clippy::too_many_arguments)]
    pub fn sine4_ramp(
        &mut self,
        out: AnalogOutId,
        t: f64,
        duration: f64,
        initial: f64,
        final_value: f64,
        samplerate: f64,
        units: Option<&str>,
        truncation: f64,
    ) -> Result<f64> {
        check_truncation(truncation, 0.0, 1.0)?;
        if truncation == 0.0 {
            return Ok(0.0);
        }
        let function = Waveform::Sine4Ramp {
            duration: round_time(t + duration) - round_time(t),
            initial,
            final_value,
        };
        self.add_ramp(out, t, truncation * duration, function, "sinusoidal ramp", samplerate, units)?;
        Ok(truncation * duration)
    }

    /// Reversed quartic-sine ramp (steep side first).
    #[allow(clippy::too_many_arguments)]
    pub fn sine4_reverse_ramp(
        &mut self,
        out: AnalogOutId,
        t: f64,
        duration: f64,
        initial: f64,
        final_value: f64,
        samplerate: f64,
        units: Option<&str>,
        truncation: f64,
    ) -> Result<f64> {
        check_truncation(truncation, 0.0, 1.0)?;
        if truncation == 0.0 {
            return Ok(0.0);
        }
        let function = Waveform::Sine4ReverseRamp {
            duration: round_time(t + duration) - round_time(t),
            initial,
            final_value,
        };
        self.add_ramp(out, t, truncation * duration, function, "sinusoidal ramp", samplerate, units)?;
        Ok(truncation * duration)
    }

    /// Exponential ramp whose rate is set by the asymptote `zero`.
    /// Returns the occupied duration after truncation.
    #[allow(clippy::too_many_arguments)]
    pub fn exp_ramp(
        &mut self,
        out: AnalogOutId,
        t: f64,
        duration: f64,
        initial: f64,
        final_value: f64,
        samplerate: f64,
        zero: f64,
        units: Option<&str>,
        truncation: Option<ExpTruncation>,
    ) -> Result<f64> {
        let trunc_duration = match truncation {
            Some(ExpTruncation::Linear(stop_value)) => {
                check_truncation(
                    stop_value,
                    initial.min(final_value),
                    initial.max(final_value),
                )?;
                duration * ((initial - zero) / (stop_value - zero)).ln()
                    / ((initial - zero) / (final_value - zero)).ln()
            }
            Some(ExpTruncation::Exponential(fraction)) => {
                check_truncation(fraction, 0.0, 1.0)?;
                fraction * duration
            }
            None => duration,
        };
        if trunc_duration <= 0.0 {
            return Ok(trunc_duration.max(0.0));
        }
        let function = Waveform::ExpRamp {
            duration: round_time(t + duration) - round_time(t),
            initial,
            final_value,
            zero,
        };
        self.add_ramp(out, t, trunc_duration, function, "exponential ramp", samplerate, units)?;
        Ok(trunc_duration)
    }

    /// Exponential ramp with an explicit 1/e time constant.
    #[allow(clippy::too_many_arguments)]
    pub fn exp_ramp_t(
        &mut self,
        out: AnalogOutId,
        t: f64,
        duration: f64,
        initial: f64,
        final_value: f64,
        time_constant: f64,
        samplerate: f64,
        units: Option<&str>,
        truncation: Option<ExpTruncation>,
    ) -> Result<f64> {
        let decay = (-duration / time_constant).exp();
        let zero = (final_value - initial * decay) / (1.0 - decay);
        let trunc_duration = match truncation {
            Some(ExpTruncation::Linear(stop_value)) => {
                check_truncation(
                    stop_value,
                    initial.min(final_value),
                    initial.max(final_value),
                )?;
                time_constant * ((initial - zero) / (stop_value - zero)).ln()
            }
            Some(ExpTruncation::Exponential(fraction)) => {
                check_truncation(fraction, 0.0, 1.0)?;
                fraction * duration
            }
            None => duration,
        };
        if trunc_duration <= 0.0 {
            return Ok(trunc_duration.max(0.0));
        }
        let function = Waveform::ExpRampT {
            duration: round_time(t + duration) - round_time(t),
            initial,
            final_value,
            time_constant,
        };
        self.add_ramp(
            out,
            t,
            trunc_duration,
            function,
            "exponential ramp with time constant",
            samplerate,
            units,
        )?;
        Ok(trunc_duration)
    }

    /// Ramp whose second derivative follows one period of a triangle
    /// wave.
    #[allow(clippy::too_many_arguments)]
    pub fn piecewise_accel_ramp(
        &mut self,
        out: AnalogOutId,
        t: f64,
        duration: f64,
        initial: f64,
        final_value: f64,
        samplerate: f64,
        units: Option<&str>,
        truncation: f64,
    ) -> Result<f64> {
        check_truncation(truncation, 0.0, 1.0)?;
        if truncation == 0.0 {
            return Ok(0.0);
        }
        let function = Waveform::PiecewiseAccel {
            duration: round_time(t + duration) - round_time(t),
            initial,
            final_value,
        };
        self.add_ramp(
            out,
            t,
            truncation * duration,
            function,
            "piecewise linear acceleration ramp",
            samplerate,
            units,
        )?;
        Ok(truncation * duration)
    }

    /// Square wave parameterised by peak-to-peak amplitude around an
    /// offset. Starts HIGH at zero phase.
    #[allow(clippy::too_many_arguments)]
    pub fn square_wave(
        &mut self,
        out: AnalogOutId,
        t: f64,
        duration: f64,
        amplitude: f64,
        frequency: f64,
        phase: f64,
        offset: f64,
        duty_cycle: f64,
        samplerate: f64,
        units: Option<&str>,
        truncation: f64,
    ) -> Result<f64> {
        self.square_wave_levels(
            out,
            t,
            duration,
            offset + 0.5 * amplitude,
            offset - 0.5 * amplitude,
            frequency,
            phase,
            duty_cycle,
            samplerate,
            units,
            truncation,
        )
    }

    /// Square wave parameterised by its two levels directly.
    #[allow(clippy::too_many_arguments)]
    pub fn square_wave_levels(
        &mut self,
        out: AnalogOutId,
        t: f64,
        duration: f64,
        level_0: f64,
        level_1: f64,
        frequency: f64,
        phase: f64,
        duty_cycle: f64,
        samplerate: f64,
        units: Option<&str>,
        truncation: f64,
    ) -> Result<f64> {
        check_truncation(truncation, 0.0, 1.0)?;
        if !(0.0..=1.0).contains(&duty_cycle) {
            seq_err!(
                OutOfRange,
                "square wave duty cycle must be in the range [0, 1] but was set to {duty_cycle}"
            );
        }
        if truncation == 0.0 {
            return Ok(0.0);
        }
        let function = Waveform::SquareWave {
            level_0,
            level_1,
            frequency,
            phase,
            duty_cycle,
        };
        self.add_ramp(out, t, truncation * duration, function, "square wave", samplerate, units)?;
        Ok(truncation * duration)
    }

    /// Ramp through a user-supplied function of relative time.
    #[allow(clippy::too_many_arguments)]
    pub fn custom_ramp(
        &mut self,
        out: AnalogOutId,
        t: f64,
        duration: f64,
        name: &str,
        function: impl Fn(f64) -> f64 + 'static,
        samplerate: f64,
        units: Option<&str>,
        truncation: f64,
    ) -> Result<f64> {
        check_truncation(truncation, 0.0, 1.0)?;
        if truncation == 0.0 {
            return Ok(0.0);
        }
        let function = Waveform::Custom {
            name: name.to_string(),
            func: std::rc::Rc::new(function),
        };
        self.add_ramp(
            out,
            t,
            truncation * duration,
            function,
            &format!("custom ramp: {name}"),
            samplerate,
            units,
        )?;
        Ok(truncation * duration)
    }

    fn add_ramp(
        &mut self,
        out: AnalogOutId,
        t: f64,
        occupied: f64,
        function: Waveform,
        description: &str,
        samplerate: f64,
        units: Option<&str>,
    ) -> Result<()> {
        let ramp = RampInstruction {
            function,
            description: description.to_string(),
            initial_time: t,
            end_time: t + occupied,
            clock_rate: samplerate,
            units: units.map(str::to_string),
        };
        self.add_instruction(out.device_id(), t, Instruction::Ramp(ramp), units)
    }

    // ------------------------------------------------------------------
    // Static analog
    // ------------------------------------------------------------------

    /// Set a static analog output's one value.
    pub fn set_static_value(
        &mut self,
        out: StaticAnalogOutId,
        value: f64,
        units: Option<&str>,
    ) -> Result<()> {
        self.set_static(out.device_id(), value, units)
    }

    fn set_static(&mut self, id: DeviceId, value: f64, units: Option<&str>) -> Result<()> {
        if let Some(existing) = self.device(id).output().instructions.values().next() {
            seq_err!(
                TimeClash,
                "static output '{}' has already been set to {}; it cannot also be set to {value}",
                self.device_name(id),
                existing.describe()
            );
        }
        self.add_instruction(id, 0.0, Instruction::Constant(value), units)
    }

    // ------------------------------------------------------------------
    // Digital instruction methods
    // ------------------------------------------------------------------

    /// Command the output high at time `t`.
    pub fn go_high(&mut self, out: DigitalOutId, t: f64) -> Result<()> {
        self.add_instruction(out.device_id(), t, Instruction::Constant(1.0), None)
    }

    /// Command the output low at time `t`.
    pub fn go_low(&mut self, out: DigitalOutId, t: f64) -> Result<()> {
        self.add_instruction(out.device_id(), t, Instruction::Constant(0.0), None)
    }

    /// Logical enable: high, or low for an inverted output.
    pub fn enable(&mut self, out: DigitalOutId, t: f64) -> Result<()> {
        self.set_logical(out.device_id(), t, true)
    }

    /// Logical disable: low, or high for an inverted output.
    pub fn disable(&mut self, out: DigitalOutId, t: f64) -> Result<()> {
        self.set_logical(out.device_id(), t, false)
    }

    fn set_logical(&mut self, id: DeviceId, t: f64, on: bool) -> Result<()> {
        let value = if on != self.device(id).output().inverted() {
            1.0
        } else {
            0.0
        };
        self.add_instruction(id, t, Instruction::Constant(value), None)
    }

    /// Repeat a `(time, state)` pulse sequence from `t` until
    /// `t + duration`, wrapping every `period` seconds. The sequence is
    /// sampled at `samplerate` like any other ramp, so the sample rate
    /// must comfortably exceed the sequence's fastest feature.
    pub fn repeat_pulse_sequence(
        &mut self,
        out: DigitalOutId,
        t: f64,
        duration: f64,
        mut pulse_sequence: Vec<(f64, f64)>,
        period: f64,
        samplerate: f64,
    ) -> Result<f64> {
        pulse_sequence.sort_by(|a, b| a.0.total_cmp(&b.0));
        let ramp = RampInstruction {
            function: Waveform::PulseSequence {
                sequence: pulse_sequence,
                period,
            },
            description: "pulse sequence".to_string(),
            initial_time: t,
            end_time: t + duration,
            clock_rate: samplerate,
            units: None,
        };
        self.add_instruction(out.device_id(), t, Instruction::Ramp(ramp), None)?;
        Ok(duration)
    }

    // ------------------------------------------------------------------
    // Static digital
    // ------------------------------------------------------------------

    pub fn static_go_high(&mut self, out: StaticDigitalOutId) -> Result<()> {
        self.set_static(out.device_id(), 1.0, None)
    }

    pub fn static_go_low(&mut self, out: StaticDigitalOutId) -> Result<()> {
        self.set_static(out.device_id(), 0.0, None)
    }

    // ------------------------------------------------------------------
    // Shutter
    // ------------------------------------------------------------------

    /// Command the shutter to be open at time `t`, compensating the
    /// opening delay. A shutter commanded before it can physically move
    /// starts moving at t=0 instead.
    pub fn open_shutter(&mut self, shutter: ShutterId, t: f64) -> Result<()> {
        self.move_shutter(shutter.device_id(), t, 1)
    }

    /// Command the shutter to be closed at time `t`, compensating the
    /// closing delay.
    pub fn close_shutter(&mut self, shutter: ShutterId, t: f64) -> Result<()> {
        self.move_shutter(shutter.device_id(), t, 0)
    }

    fn move_shutter(&mut self, id: DeviceId, t: f64, state: u8) -> Result<()> {
        let (delay, _) = match &self.device(id).output().kind {
            OutputKind::Shutter {
                open_delay,
                close_delay,
                ..
            } => {
                if state == 1 {
                    (*open_delay, *close_delay)
                } else {
                    (*close_delay, *open_delay)
                }
            }
            _ => unreachable!("device {} is not a shutter", self.device_name(id)),
        };
        let actual = if t >= delay { t - delay } else { 0.0 };
        if let OutputKind::Shutter { moves, .. } = &mut self.device_mut(id).output_mut().kind {
            moves.insert(
                time_key(t),
                ShutterMove {
                    requested: t,
                    actual,
                    state,
                },
            );
        }
        self.set_logical(id, actual, state == 1)
    }

    // ------------------------------------------------------------------
    // Trigger
    // ------------------------------------------------------------------

    /// Command a trigger pulse of the given duration. The output is
    /// parked in its disabled state at t0 if nothing has commanded it
    /// yet.
    pub(crate) fn trigger_pulse(&mut self, id: DeviceId, t: f64, duration: f64) -> Result<()> {
        if duration <= 0.0 {
            seq_err!(
                NegativeDuration,
                "negative or zero trigger duration given on '{}'",
                self.device_name(id)
            );
        }
        let t0 = self.t0(id)?;
        let edge = match &self.device(id).output().kind {
            OutputKind::Trigger { edge, .. } => *edge,
            _ => unreachable!("device {} is not a trigger", self.device_name(id)),
        };
        if t != t0
            && !self
                .device(id)
                .output()
                .instructions
                .contains_key(&time_key(t0))
        {
            self.trigger_set(id, t0, edge, false)?;
        }
        let (start, end) = (t, t + duration);
        if let OutputKind::Trigger { triggerings, .. } = &self.device(id).output().kind {
            for &(other_start, other_duration) in triggerings {
                let other_end = other_start + other_duration;
                if !(end < other_start || start > other_end) {
                    seq_err!(
                        TriggerOverlap,
                        "trigger output '{}' has two overlapping triggerings: one at t={start}s \
                         for {duration}s, and another at t={other_start}s for {other_duration}s",
                        self.device_name(id)
                    );
                }
            }
        }
        self.trigger_set(id, t, edge, true)?;
        self.trigger_set(id, round_time(t + duration), edge, false)?;
        if let OutputKind::Trigger { triggerings, .. } =
            &mut self.device_mut(id).output_mut().kind
        {
            triggerings.push((t, duration));
        }
        Ok(())
    }

    /// Public form of [`Experiment::trigger_pulse`] for user-placed
    /// trigger outputs.
    pub fn trigger(&mut self, trigger: TriggerId, t: f64, duration: f64) -> Result<()> {
        self.trigger_pulse(trigger.device_id(), t, duration)
    }

    fn trigger_set(&mut self, id: DeviceId, t: f64, edge: TriggerEdge, asserted: bool) -> Result<()> {
        let value = match (edge, asserted) {
            (TriggerEdge::Rising, true) | (TriggerEdge::Falling, false) => 1.0,
            (TriggerEdge::Rising, false) | (TriggerEdge::Falling, true) => 0.0,
        };
        self.add_instruction(id, t, Instruction::Constant(value), None)
    }

    // ------------------------------------------------------------------
    // DDS
    // ------------------------------------------------------------------

    /// Set the frequency of a DDS output at time `t`.
    pub fn dds_setfreq(&mut self, dds: DdsId, t: f64, value: f64, units: Option<&str>) -> Result<()> {
        self.constant(self.dds_frequency(dds), t, value, units)
    }

    /// Set the amplitude of a DDS output at time `t`.
    pub fn dds_setamp(&mut self, dds: DdsId, t: f64, value: f64, units: Option<&str>) -> Result<()> {
        self.constant(self.dds_amplitude(dds), t, value, units)
    }

    /// Set the phase of a DDS output at time `t`.
    pub fn dds_setphase(&mut self, dds: DdsId, t: f64, value: f64, units: Option<&str>) -> Result<()> {
        self.constant(self.dds_phase(dds), t, value, units)
    }

    /// Gate the DDS output on at time `t`.
    pub fn dds_enable(&mut self, dds: DdsId, t: f64) -> Result<()> {
        match self.dds_gate(dds) {
            Some(gate) => self.go_high(gate, t),
            None => seq_err!(
                KindMismatch,
                "DDS '{}' does not have a digital gate, so it cannot be enabled",
                self.device_name(dds.device_id())
            ),
        }
    }

    /// Gate the DDS output off at time `t`.
    pub fn dds_disable(&mut self, dds: DdsId, t: f64) -> Result<()> {
        match self.dds_gate(dds) {
            Some(gate) => self.go_low(gate, t),
            None => seq_err!(
                KindMismatch,
                "DDS '{}' does not have a digital gate, so it cannot be disabled",
                self.device_name(dds.device_id())
            ),
        }
    }

    /// Pulse the DDS: set amplitude, frequency and optionally phase at
    /// `t`, gate on if a gate exists, and revert at `t + duration`.
    #[allow(clippy::too_many_arguments)]
    pub fn dds_pulse(
        &mut self,
        dds: DdsId,
        t: f64,
        duration: f64,
        amplitude: f64,
        frequency: Option<f64>,
        phase: Option<f64>,
        amplitude_units: Option<&str>,
        frequency_units: Option<&str>,
        phase_units: Option<&str>,
    ) -> Result<f64> {
        self.dds_setamp(dds, t, amplitude, amplitude_units)?;
        if let Some(frequency) = frequency {
            self.dds_setfreq(dds, t, frequency, frequency_units)?;
        }
        if let Some(phase) = phase {
            self.dds_setphase(dds, t, phase, phase_units)?;
        }
        if amplitude != 0.0 && self.dds_gate(dds).is_some() {
            self.dds_enable(dds, t)?;
            self.dds_disable(dds, t + duration)?;
            self.dds_setamp(dds, t + duration, 0.0, amplitude_units)?;
        }
        Ok(duration)
    }

    /// Set a static DDS frequency.
    pub fn static_dds_setfreq(&mut self, dds: StaticDdsId, value: f64, units: Option<&str>) -> Result<()> {
        let id = self.dds_payload(dds.device_id()).frequency;
        self.set_static(id, value, units)
    }

    /// Set a static DDS amplitude.
    pub fn static_dds_setamp(&mut self, dds: StaticDdsId, value: f64, units: Option<&str>) -> Result<()> {
        let id = self.dds_payload(dds.device_id()).amplitude;
        self.set_static(id, value, units)
    }

    /// Set a static DDS phase.
    pub fn static_dds_setphase(&mut self, dds: StaticDdsId, value: f64, units: Option<&str>) -> Result<()> {
        let id = self.dds_payload(dds.device_id()).phase;
        self.set_static(id, value, units)
    }

    // ------------------------------------------------------------------
    // Analog input
    // ------------------------------------------------------------------

    /// Record an acquisition window on an analog input. Returns its
    /// duration.
    #[allow(clippy::too_many_arguments)]
    pub fn acquire(
        &mut self,
        input: AnalogInId,
        label: &str,
        start_time: f64,
        end_time: f64,
        wait_label: &str,
        scale_factor: Option<f64>,
        units: Option<&str>,
    ) -> Result<f64> {
        if end_time <= start_time {
            seq_err!(
                NegativeDuration,
                "acquisition '{label}' on '{}' has end time {end_time}s not after its start \
                 time {start_time}s",
                self.device_name(input.device_id())
            );
        }
        let (default_scale, default_units) = match &self.device(input.device_id()).kind {
            DeviceKind::AnalogIn(a) => (a.scale_factor, a.units.clone()),
            _ => unreachable!(),
        };
        let acquisition = Acquisition {
            label: label.to_string(),
            start_time,
            end_time,
            wait_label: wait_label.to_string(),
            scale_factor: scale_factor.unwrap_or(default_scale),
            units: units.map(str::to_string).unwrap_or(default_units),
        };
        match &mut self.device_mut(input.device_id()).kind {
            DeviceKind::AnalogIn(a) => a.acquisitions.push(acquisition),
            _ => unreachable!(),
        }
        Ok(end_time - start_time)
    }

    /// Recorded acquisition windows of an analog input.
    pub fn acquisitions(&self, input: AnalogInId) -> &[Acquisition] {
        match &self.device(input.device_id()).kind {
            DeviceKind::AnalogIn(a) => &a.acquisitions,
            _ => unreachable!(),
        }
    }
}

fn validate_limits(name: &str, limits: Option<(f64, f64)>) -> Result<()> {
    if let Some((min, max)) = limits {
        if min > max {
            seq_err!(
                OutOfRange,
                "the lower limit of '{name}' must not exceed the upper limit ({min} > {max})"
            );
        }
    }
    Ok(())
}
