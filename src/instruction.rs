//! Per-output instruction model.
//!
//! Each output owns a time-indexed map of instructions: either a scalar
//! base-unit value, or a ramp record occupying a closed interval with a
//! waveform and a requested sample rate. User-supplied times are
//! rounded to 0.1 ns on entry and the maps are keyed by the integer
//! count of 0.1 ns ticks, so float equality never decides which
//! instruction a time refers to.

use crate::clock::TickGroup;
use crate::device::DeviceId;
use crate::diagnostics::Severity;
use crate::errors::{seq_err, Result};
use crate::experiment::Experiment;
use crate::functions::Waveform;
use crate::output::{OutputKind, RawOutput};

/// Integer count of 0.1 ns ticks; the key type of instruction maps.
pub(crate) type TimeKey = i64;

pub(crate) fn time_key(t: f64) -> TimeKey {
    (t * 1e10).round() as TimeKey
}

pub(crate) fn key_time(k: TimeKey) -> f64 {
    k as f64 * 1e-10
}

/// Round a user-supplied time to the nearest 0.1 ns.
pub(crate) fn round_time(t: f64) -> f64 {
    key_time(time_key(t))
}

/// A ramp record: a waveform spanning `[initial_time, end_time]`,
/// sampled at `clock_rate` while it is the active instruction.
#[derive(Debug, Clone)]
pub(crate) struct RampInstruction {
    pub function: Waveform,
    pub description: String,
    pub initial_time: f64,
    pub end_time: f64,
    pub clock_rate: f64,
    pub units: Option<String>,
}

#[derive(Debug, Clone)]
pub(crate) enum Instruction {
    /// A scalar value in base units, effective from its key time.
    Constant(f64),
    Ramp(RampInstruction),
}

impl Instruction {
    pub fn describe(&self) -> String {
        match self {
            Instruction::Constant(v) => format!("{v}"),
            Instruction::Ramp(r) => r.description.clone(),
        }
    }
}

impl Experiment {
    /// Add an instruction to an output. This is the single entry point
    /// for all user-facing instruction methods; it enforces the timing,
    /// range, and ramp-overlap contracts.
    pub(crate) fn add_instruction(
        &mut self,
        out_id: DeviceId,
        time: f64,
        mut instruction: Instruction,
        units: Option<&str>,
    ) -> Result<()> {
        if !self.start_called {
            seq_err!(NotStarted, "cannot add instructions prior to calling start()");
        }
        let time = round_time(time);
        if let Instruction::Ramp(r) = &mut instruction {
            r.initial_time = round_time(r.initial_time);
            r.end_time = round_time(r.end_time);
        }
        let t0 = self.t0(out_id)?;
        if time < t0 {
            seq_err!(
                TooEarly,
                "output '{}' has an instruction at t={time}s; due to the delay in triggering \
                 its pseudoclock device, the earliest output possible is at t={t0}s",
                self.device_name(out_id)
            );
        }
        let key = time_key(time);
        if let Some(existing) = self.device(out_id).output().instructions.get(&key) {
            let message = format!(
                "state of output '{}' at t={time}s has already been set to {}; overwriting to {}",
                self.device_name(out_id),
                existing.describe(),
                instruction.describe()
            );
            self.diagnostics.warn(Severity::Normal, message);
        }
        match instruction {
            Instruction::Ramp(ramp) => {
                let line = self.parent_clock_line_of(out_id)?;
                if !self.clock_line_payload(line).ramping_allowed {
                    seq_err!(
                        NoRamping,
                        "output '{}' is on a clockline that does not support ramping; it \
                         cannot have a function ramp as an instruction",
                        self.device_name(out_id)
                    );
                }
                let name = self.device_name(out_id).to_string();
                let out = self.device_mut(out_id).output_mut();
                for &(start, end) in &out.ramp_limits {
                    if (start < time && time < end) || (start < ramp.end_time && ramp.end_time < end)
                    {
                        seq_err!(
                            RampOverlap,
                            "state of output '{name}' from t={start}s to {end}s has already \
                             been set; cannot set {} from t={time}s to {}s",
                            ramp.description,
                            ramp.end_time
                        );
                    }
                }
                if time > ramp.end_time {
                    seq_err!(
                        NegativeDuration,
                        "output '{name}' has been passed a {} with a negative duration",
                        ramp.description
                    );
                }
                if ramp.clock_rate == 0.0 {
                    seq_err!(BadRate, "a nonzero sample rate is required on '{name}'");
                }
                out.ramp_limits.push((time, ramp.end_time));
                out.instructions.insert(key, Instruction::Ramp(ramp));
            }
            Instruction::Constant(value) => {
                let name = self.device_name(out_id).to_string();
                let out = self.device_mut(out_id).output_mut();
                let value = match units {
                    Some(unit) => match &out.calibration {
                        Some(cal) => cal.to_base(unit, value)?,
                        None => seq_err!(
                            UnknownUnits,
                            "units cannot be specified for output '{name}' as it has no \
                             calibration associated with it"
                        ),
                    },
                    None => value,
                };
                if let Some((min, max)) = out.limits {
                    if value < min || value > max {
                        seq_err!(
                            OutOfRange,
                            "cannot program the value {value} (base units) to '{name}' as it \
                             falls outside the limits ({min} to {max})"
                        );
                    }
                }
                out.instructions.insert(key, Instruction::Constant(value));
            }
        }
        Ok(())
    }

    /// Sorted instruction times for an output, validated against ramps:
    /// no scalar instruction may sit strictly inside a ramp interval.
    pub(crate) fn get_change_times(&mut self, out_id: DeviceId) -> Result<Vec<f64>> {
        self.check_shutter_recovery(out_id)?;
        let name = self.device_name(out_id).to_string();
        let out = self.device_mut(out_id).output_mut();
        if out.is_static() {
            // A static output holds one value for all time; it never
            // asks its clockline for a tick.
            return Ok(Vec::new());
        }
        let mut times = Vec::with_capacity(out.instructions.len());
        let mut active_ramp: Option<(f64, f64, String)> = None;
        for (&key, instr) in &out.instructions {
            let t = key_time(key);
            match instr {
                Instruction::Ramp(r) => {
                    active_ramp = Some((r.initial_time, r.end_time, r.description.clone()));
                }
                Instruction::Constant(_) => {
                    if let Some((start, end, desc)) = &active_ramp {
                        if *start < t && t < *end {
                            seq_err!(
                                RampOverlap,
                                "output '{name}' has an instruction at t={t}s which collides \
                                 with the {desc} on this output from {start}s till {end}s"
                            );
                        }
                    }
                }
            }
            times.push(t);
        }
        Ok(times)
    }

    /// Ramp `(start, end)` intervals of an output.
    pub(crate) fn get_ramp_times(&self, out_id: DeviceId) -> Vec<(f64, f64)> {
        self.device(out_id).output().ramp_limits.clone()
    }

    /// Pair each change time on the output's clockline with the
    /// instruction active at that time (the last instruction whose time
    /// is not later). Stored on the output for `expand_timeseries`.
    pub(crate) fn make_timeseries(&mut self, out_id: DeviceId, change_times: &[f64]) {
        let out = self.device_mut(out_id).output_mut();
        if out.is_static() {
            return;
        }
        let instructions: Vec<(f64, Instruction)> = out
            .instructions
            .iter()
            .map(|(&k, instr)| (key_time(k), instr.clone()))
            .collect();
        let mut series = Vec::with_capacity(change_times.len());
        let mut i = 0;
        for &change_time in change_times {
            while i < instructions.len() && change_time >= instructions[i].0 {
                i += 1;
            }
            let idx = i.saturating_sub(1);
            series.push(instructions[idx].1.clone());
        }
        out.timeseries = series;
    }

    /// Evaluate the timeseries at the tick times generated for the
    /// output's clockline, producing the raw sample array.
    ///
    /// Ramps are sampled at the midpoints of consecutive ticks to
    /// cancel the zero-order-hold error of a sampled analog signal; the
    /// final midpoint straddles the gap to the next instruction's first
    /// tick.
    pub(crate) fn expand_timeseries(
        &mut self,
        out_id: DeviceId,
        all_times: &[TickGroup],
        flat_len: usize,
    ) -> Result<()> {
        let line = self.parent_clock_line_of(out_id)?;
        let ramping_allowed = self.clock_line_payload(line).ramping_allowed;
        let name = self.device_name(out_id).to_string();
        let out = self.device_mut(out_id).output_mut();

        if !ramping_allowed {
            // A non-ramping clockline ticks once per change time; the
            // timeseries is already as expanded as it will get.
            let values: Vec<f64> = out
                .timeseries
                .iter()
                .map(|instr| match instr {
                    Instruction::Constant(v) => *v,
                    Instruction::Ramp(_) => unreachable!("ramp on non-ramping clockline"),
                })
                .collect();
            out.raw_output = Some(RawOutput::from_values(values, out.dtype()));
            out.timeseries.clear();
            return Ok(());
        }

        let mut flat: Vec<f64> = Vec::with_capacity(flat_len);
        for (i, group) in all_times.iter().enumerate() {
            match group {
                TickGroup::Point(t) => match &out.timeseries[i] {
                    Instruction::Constant(v) => flat.push(*v),
                    Instruction::Ramp(r) => {
                        let value =
                            convert_and_check(&name, out, r, r.function.sample(t - r.initial_time))?;
                        flat.push(value);
                    }
                },
                TickGroup::Span(ticks) => match &out.timeseries[i] {
                    Instruction::Ramp(r) => {
                        let spacing = if ticks.len() > 1 {
                            ticks[1] - ticks[0]
                        } else {
                            0.0
                        };
                        let last = *ticks.last().expect("span is never empty");
                        // First tick after this ramp's span, for the
                        // final midpoint. Same spacing if nothing
                        // follows.
                        let next_time = match all_times.get(i + 1) {
                            Some(TickGroup::Point(t)) => *t,
                            Some(TickGroup::Span(next)) => next[0],
                            None => last + spacing,
                        };
                        for (j, &tick) in ticks.iter().enumerate() {
                            let midpoint = if j + 1 == ticks.len() {
                                tick + 0.5 * (next_time - tick)
                            } else {
                                tick + 0.5 * spacing
                            };
                            let raw = r.function.sample(midpoint - r.initial_time);
                            flat.push(convert_and_check(&name, out, r, raw)?);
                        }
                    }
                    Instruction::Constant(v) => {
                        flat.extend(std::iter::repeat(*v).take(ticks.len()));
                    }
                },
            }
        }
        out.raw_output = Some(RawOutput::from_values(flat, out.dtype()));
        out.timeseries.clear();
        Ok(())
    }

    /// Compile-time sanity checks on one output, given the trigger
    /// times of its pseudoclock device. Inserts default values where
    /// the user left gaps, holds ramp end values, and rejects
    /// instructions that conflict with trigger windows.
    pub(crate) fn do_output_checks(&mut self, out_id: DeviceId, trigger_times: &[f64]) -> Result<()> {
        let t0 = self.t0(out_id)?;
        let name = self.device_name(out_id).to_string();
        let default_value = self.device(out_id).output().default_value;

        if self.device(out_id).output().instructions.is_empty() {
            self.diagnostics.warn(
                Severity::Mild,
                format!("output '{name}' has no instructions; it will be set to {default_value} for all time"),
            );
            self.add_instruction(out_id, t0, Instruction::Constant(default_value), None)?;
        }
        if !self
            .device(out_id)
            .output()
            .instructions
            .contains_key(&time_key(t0))
        {
            self.diagnostics.warn(
                Severity::Mild,
                format!("output '{name}' has no initial instruction; it will initially be set to {default_value}"),
            );
            self.add_instruction(out_id, t0, Instruction::Constant(default_value), None)?;
        }

        // Hold each ramp's final value if nothing follows it.
        let holds: Vec<(f64, f64, Option<String>)> = self
            .device(out_id)
            .output()
            .instructions
            .values()
            .filter_map(|instr| match instr {
                Instruction::Ramp(r) => Some((
                    r.end_time,
                    r.function.sample(r.end_time - r.initial_time),
                    r.units.clone(),
                )),
                Instruction::Constant(_) => None,
            })
            .collect();
        for (end_time, value, units) in holds {
            if !self
                .device(out_id)
                .output()
                .instructions
                .contains_key(&time_key(end_time))
            {
                self.add_instruction(
                    out_id,
                    end_time,
                    Instruction::Constant(value),
                    units.as_deref(),
                )?;
            }
        }

        let trigger_delay = self.output_trigger_delay(out_id)?;
        let clock_period = 1.0 / self.output_clock_limit(out_id)?;
        let wait_delay = self.wait_delay;
        let out = self.device(out_id).output();
        for &trigger_time in trigger_times {
            for (&key, instr) in &out.instructions {
                let t = key_time(key);
                if let Instruction::Ramp(r) = instr {
                    if r.initial_time < trigger_time && r.end_time > trigger_time {
                        seq_err!(
                            TriggerOverlap,
                            "output '{name}' has a {} from t={}s to {}s; this overlaps with a \
                             trigger at t={trigger_time}s, and so cannot be performed",
                            r.description,
                            r.initial_time,
                            r.end_time
                        );
                    }
                }
                if round_time(trigger_time) < t && t < round_time(trigger_time + trigger_delay) {
                    seq_err!(
                        TriggerOverlap,
                        "output '{name}' has an instruction at t={t}s; this is too soon after \
                         a trigger at t={trigger_time}s, the earliest output possible after \
                         this trigger is at t={}s",
                        trigger_time + trigger_delay
                    );
                }
                let gap = trigger_time - t;
                if 0.0 < gap && gap < clock_period.max(wait_delay) {
                    seq_err!(
                        TriggerOverlap,
                        "output '{name}' has an instruction at t={t}s; this is too soon before \
                         a trigger at t={trigger_time}s, the latest output possible before this \
                         trigger is at t={}s",
                        trigger_time - clock_period.max(wait_delay)
                    );
                }
            }
        }
        Ok(())
    }

    /// Rewrite instruction times onto the pseudoclock device's own
    /// timeline: subtract the initial trigger time and the accumulated
    /// trigger delays of all prior triggers, then re-quantise.
    pub(crate) fn offset_instructions_from_trigger(
        &mut self,
        out_id: DeviceId,
        trigger_times: &[f64],
    ) -> Result<()> {
        let trigger_delay = self.output_trigger_delay(out_id)?;
        let resolution = self.clock_resolution_of(out_id)?;
        let first_trigger = trigger_times.first().copied().unwrap_or(0.0);
        let quant = |t: f64| crate::device::quantise(round_time(t), resolution);
        let offset_for = |t: f64| {
            let n_prior = trigger_times.iter().filter(|&&tt| tt < t).count() as f64;
            round_time(trigger_delay * n_prior + first_trigger)
        };

        let out = self.device_mut(out_id).output_mut();
        let mut rewritten = std::collections::BTreeMap::new();
        for (&key, instr) in &out.instructions {
            let t = key_time(key);
            let offset = offset_for(t);
            let mut instr = instr.clone();
            if let Instruction::Ramp(r) = &mut instr {
                r.initial_time = quant(r.initial_time - offset);
                r.end_time = quant(r.end_time - offset);
            }
            rewritten.insert(time_key(quant(t - offset)), instr);
        }
        out.instructions = rewritten;

        // Ramps cannot span a trigger, so one offset applies to both
        // ends of each interval.
        for limits in out.ramp_limits.iter_mut() {
            let offset = offset_for(limits.0);
            *limits = (quant(limits.0 - offset), quant(limits.1 - offset));
        }
        Ok(())
    }

    /// Trigger delay seen by an output: zero under the master clock.
    pub(crate) fn output_trigger_delay(&self, out_id: DeviceId) -> Result<f64> {
        let clock = self.pseudoclock_device_of(out_id)?;
        if self.is_master_pseudoclock(clock) {
            Ok(0.0)
        } else {
            Ok(self.pseudoclock_device_payload(clock).spec.trigger_delay)
        }
    }

    /// The shutter timing checks: commanding a state change before the
    /// previous movement completes is an error; re-commanding the same
    /// state is merely suspicious.
    fn check_shutter_recovery(&mut self, out_id: DeviceId) -> Result<()> {
        let name = self.device_name(out_id).to_string();
        let moves = match &self.device(out_id).output().kind {
            OutputKind::Shutter { moves, .. } if moves.len() > 1 => moves.clone(),
            _ => return Ok(()),
        };
        let entries: Vec<_> = moves.values().cloned().collect();
        for pair in entries.windows(2) {
            let (prev, next) = (&pair[0], &pair[1]);
            if prev.state != next.state {
                if next.actual < prev.actual {
                    seq_err!(
                        ShutterRecovery,
                        "shutter '{name}' is requested to {} at t={}s (taking its delay into \
                         account) when it has still not {} from an earlier instruction at t={}s",
                        if next.state == 1 { "open" } else { "close" },
                        next.requested,
                        if prev.state == 1 { "opened" } else { "closed" },
                        prev.requested
                    );
                }
            } else {
                self.diagnostics.warn(
                    Severity::Mild,
                    format!(
                        "shutter '{name}' is requested to {} at t={}s but was never {} after \
                         the earlier instruction at t={}s",
                        if next.state == 1 { "open" } else { "close" },
                        next.requested,
                        if prev.state == 1 { "closed" } else { "opened" },
                        prev.requested
                    ),
                );
            }
        }
        Ok(())
    }
}

/// Apply an output's calibration to a ramp sample and re-check limits.
fn convert_and_check(
    name: &str,
    out: &crate::output::Output,
    ramp: &RampInstruction,
    raw: f64,
) -> Result<f64> {
    let value = match (&ramp.units, &out.calibration) {
        (Some(unit), Some(cal)) => cal.to_base(unit, raw)?,
        (Some(unit), None) => seq_err!(
            UnknownUnits,
            "ramp on '{name}' specifies units '{unit}' but the output has no calibration"
        ),
        (None, _) => raw,
    };
    if let Some((min, max)) = out.limits {
        if value < min || value > max {
            seq_err!(
                OutOfRange,
                "the {} on '{name}' generated the value {value} which falls outside the base \
                 unit limits ({min} to {max})",
                ramp.description
            );
        }
    }
    Ok(value)
}
