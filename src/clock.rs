//! The pseudoclock scheduler.
//!
//! For one pseudoclock this walks every output hanging off its
//! clocklines, gathers the times at which any output changes state,
//! quantises them to the clock's resolution, inserts ticks inside ramps
//! at each output's requested sample rate, and emits a compact clock
//! program of `(start, step, reps, enabled clocklines)` segments with
//! `WAIT` markers wherever the clock pauses for an external trigger.

use std::collections::HashSet;

use ndarray::Array1;

use crate::device::{quantise, DeviceId, DeviceKind};
use crate::diagnostics::Severity;
use crate::errors::{seq_err, Result};
use crate::experiment::Experiment;
use crate::instruction::{time_key, Instruction, TimeKey};

/// Tick times generated for one clockline over one change-time
/// interval: a single tick for a held value, a span of evenly spaced
/// ticks while a ramp is looping.
#[derive(Debug, Clone)]
pub(crate) enum TickGroup {
    Point(f64),
    Span(Vec<f64>),
}

impl TickGroup {
    fn len(&self) -> usize {
        match self {
            TickGroup::Point(_) => 1,
            TickGroup::Span(ticks) => ticks.len(),
        }
    }
}

/// One entry of a clock program.
#[derive(Debug, Clone, PartialEq)]
pub enum ClockSegment {
    /// Pause the clock until an external resume trigger.
    Wait,
    /// Starting at `start`, emit `reps` ticks separated by `step` on
    /// each clockline in `enabled_clocks`.
    Step {
        start: f64,
        reps: usize,
        step: f64,
        enabled_clocks: Vec<String>,
    },
}

/// The compiled timing of one pseudoclock: its segment program and the
/// flat tick times of each clockline, in clockline insertion order.
#[derive(Debug, Clone)]
pub struct PseudoclockProgram {
    pub pseudoclock: String,
    pub segments: Vec<ClockSegment>,
    pub clockline_ticks: Vec<(String, Array1<f64>)>,
}

impl Experiment {
    pub(crate) fn clock_line_payload(&self, id: DeviceId) -> &crate::device::ClockLine {
        match &self.device(id).kind {
            DeviceKind::ClockLine(cl) => cl,
            _ => unreachable!("device {} is not a clockline", self.device_name(id)),
        }
    }

    fn pseudoclock_payload(&self, id: DeviceId) -> &crate::device::Pseudoclock {
        match &self.device(id).kind {
            DeviceKind::Pseudoclock(p) => p,
            _ => unreachable!("device {} is not a pseudoclock", self.device_name(id)),
        }
    }

    /// Group the outputs under a pseudoclock by the clockline that
    /// clocks them, in clockline insertion order.
    fn outputs_by_clockline(&self, pseudoclock: DeviceId) -> Result<(Vec<DeviceId>, Vec<Vec<DeviceId>>)> {
        let clock_lines: Vec<DeviceId> = self
            .device(pseudoclock)
            .children
            .iter()
            .copied()
            .filter(|&id| matches!(self.device(id).kind, DeviceKind::ClockLine(_)))
            .collect();
        let mut outputs: Vec<Vec<DeviceId>> = vec![Vec::new(); clock_lines.len()];
        for out in self.get_all_outputs(pseudoclock) {
            let line = self.parent_clock_line_of(out)?;
            let idx = clock_lines
                .iter()
                .position(|&cl| cl == line)
                .expect("output's clockline belongs to this pseudoclock");
            outputs[idx].push(out);
        }
        Ok((clock_lines, outputs))
    }

    /// Gather and quantise every time at which any output under this
    /// pseudoclock changes state, break ramps at foreign change times,
    /// and enforce the minimum update intervals.
    #[allow(clippy::type_complexity)]
    fn collect_change_times(
        &mut self,
        pseudoclock: DeviceId,
        clock_lines: &[DeviceId],
        outputs_by_clockline: &[Vec<DeviceId>],
        stop_time: f64,
        trigger_times: &[f64],
    ) -> Result<(Vec<f64>, Vec<Vec<f64>>)> {
        let payload = self.pseudoclock_payload(pseudoclock);
        let resolution = payload.clock_resolution;
        let pc_limit = payload.clock_limit;
        let pc_name = self.device_name(pseudoclock).to_string();

        let mut change_times: Vec<Vec<f64>> = vec![Vec::new(); clock_lines.len()];
        let mut ramps_by_line: Vec<Vec<(f64, f64)>> = vec![Vec::new(); clock_lines.len()];
        let mut all_change_times: Vec<f64> = Vec::new();
        for (li, outputs) in outputs_by_clockline.iter().enumerate() {
            for &out in outputs {
                let times = self.get_change_times(out)?;
                change_times[li].extend_from_slice(&times);
                all_change_times.extend_from_slice(&times);
                ramps_by_line[li].extend(self.get_ramp_times(out));
            }
        }

        if all_change_times.is_empty() {
            all_change_times.push(0.0);
        }
        all_change_times.push(stop_time);
        all_change_times.extend_from_slice(trigger_times);
        for t in all_change_times.iter_mut() {
            *t = quantise(*t, resolution);
        }

        // A ramping clockline must stop looping at any instant another
        // clockline changes state, or the two fall out of step.
        for (li, ramps) in ramps_by_line.iter().enumerate() {
            for &(ramp_start, ramp_end) in ramps {
                for &t in &all_change_times {
                    if ramp_start < t && t < ramp_end {
                        change_times[li].push(t);
                    }
                }
            }
        }

        all_change_times.sort_by(f64::total_cmp);
        all_change_times.dedup();

        for pair in all_change_times.windows(2) {
            let dt = pair[1] - pair[0];
            if dt < 1.0 / pc_limit {
                seq_err!(
                    ClockLimitExceeded,
                    "commands have been issued to devices attached to '{pc_name}' at t={}s and \
                     {}s; this pseudoclock cannot support update delays shorter than {}s",
                    pair[0],
                    pair[1],
                    1.0 / pc_limit
                );
            }
        }

        for (li, &line) in clock_lines.iter().enumerate() {
            let line_name = self.device_name(line).to_string();
            let line_limit = self.clock_line_limit(line)?;
            let list = &mut change_times[li];
            // The clock must tick immediately after every wait, whether
            // or not an output on this line changes there.
            list.extend_from_slice(trigger_times);
            if list.is_empty() {
                list.push(0.0);
            }
            for t in list.iter_mut() {
                *t = quantise(*t, resolution);
            }
            list.sort_by(f64::total_cmp);
            list.dedup();

            let mut j = 0;
            for i in 0..list.len().saturating_sub(1) {
                let t = list[i];
                let dt = list[i + 1] - t;
                if dt < 1.0 / line_limit {
                    seq_err!(
                        ClockLimitExceeded,
                        "commands have been issued to devices attached to clockline \
                         '{line_name}' at t={t}s and {}s; one or more of its devices cannot \
                         support update delays shorter than {}s",
                        list[i + 1],
                        1.0 / line_limit
                    );
                }
                // The next change time anywhere on the pseudoclock also
                // bounds how soon this line's tick must complete.
                while all_change_times[j] < t && j < all_change_times.len() - 1 {
                    j += 1;
                }
                if j + 1 < all_change_times.len() {
                    let dt = all_change_times[j + 1] - t;
                    if dt < 1.0 / line_limit {
                        seq_err!(
                            ClockLimitExceeded,
                            "commands have been issued to devices attached to '{pc_name}' at \
                             t={t}s and {}s; one or more devices on clockline '{line_name}' \
                             cannot support update delays shorter than {}s",
                            all_change_times[j + 1],
                            1.0 / line_limit
                        );
                    }
                }
            }

            let stop_key = time_key(stop_time);
            if !list.iter().any(|&t| time_key(t) == stop_key) {
                let last = *list.last().expect("list is non-empty");
                if (stop_time - last).abs() < 1.0 / line_limit {
                    seq_err!(
                        StopTimeTooClose,
                        "the stop time of the experiment is t={stop_time}s, but the last \
                         instruction for a device attached to '{pc_name}' is at t={last}s; one \
                         or more connected devices cannot support update delays shorter than \
                         {}s, please set the stop time a little later",
                        1.0 / line_limit
                    );
                }
                // If the stop time lands before the last instruction it
                // sorts into the middle here; the per-interval walk in
                // expand then reports which output overran it.
                list.push(stop_time);
                list.sort_by(f64::total_cmp);
            }
        }

        Ok((all_change_times, change_times))
    }

    /// Walk the change-time intervals in order, decide which clocklines
    /// tick at each, insert evenly spaced ticks where a ramp is active,
    /// and emit the clock program.
    #[allow(clippy::type_complexity)]
    fn expand_change_times(
        &mut self,
        pseudoclock: DeviceId,
        clock_lines: &[DeviceId],
        outputs_by_clockline: &[Vec<DeviceId>],
        all_change_times: &[f64],
        change_times: &[Vec<f64>],
        stop_time: f64,
        trigger_times: &[f64],
    ) -> Result<(Vec<Vec<TickGroup>>, Vec<ClockSegment>)> {
        let payload = self.pseudoclock_payload(pseudoclock);
        let resolution = payload.clock_resolution;
        let pc_limit = payload.clock_limit;
        let pc_name = self.device_name(pseudoclock).to_string();
        let line_names: Vec<String> = clock_lines
            .iter()
            .map(|&id| self.device_name(id).to_string())
            .collect();
        let line_limits: Vec<f64> = clock_lines
            .iter()
            .map(|&id| self.clock_line_limit(id))
            .collect::<Result<_>>()?;

        // Waits are at every trigger time except the initial one.
        let wait_keys: HashSet<TimeKey> =
            trigger_times.iter().skip(1).map(|&t| time_key(t)).collect();

        let mut all_times: Vec<Vec<TickGroup>> = vec![Vec::new(); clock_lines.len()];
        let mut clock: Vec<ClockSegment> = Vec::new();
        let mut indices: Vec<usize> = vec![0; clock_lines.len()];

        for (i, &time) in all_change_times.iter().enumerate() {
            if wait_keys.contains(&time_key(time)) {
                clock.push(ClockSegment::Wait);
            }

            let mut enabled: Vec<usize> = Vec::new();
            let mut looping: Vec<usize> = Vec::new();
            for li in 0..clock_lines.len() {
                let list = &change_times[li];
                while indices[li] < list.len() && list[indices[li]] < time {
                    indices[li] += 1;
                }
                if indices[li] >= list.len() {
                    indices[li] = list.len() - 1;
                    self.diagnostics.warn(
                        Severity::Normal,
                        format!(
                            "clockline '{}' has its last change time at t={}s but another \
                             clockline has a change time at t={time}s; this should never \
                             happen, as the last change time should always be the time passed \
                             to stop() -- perhaps there is an instruction after the stop time \
                             of the experiment?",
                            line_names[li],
                            list[list.len() - 1]
                        ),
                    );
                }
                if time_key(list[indices[li]]) == time_key(time) {
                    enabled.push(li);
                }
            }

            // Fastest requested sample rate among ramps active now, and
            // the tightest limit among the clocklines that loop.
            let mut maxrate: f64 = 0.0;
            let mut local_limit = pc_limit;
            for &li in &enabled {
                for &out in &outputs_by_clockline[li] {
                    let out_ref = self.device(out).output();
                    if out_ref.timeseries.is_empty() {
                        continue;
                    }
                    if let Instruction::Ramp(r) = &out_ref.timeseries[indices[li]] {
                        if !looping.contains(&li) {
                            looping.push(li);
                        }
                        if r.clock_rate > maxrate {
                            maxrate = r.clock_rate;
                        }
                        if local_limit > line_limits[li] {
                            local_limit = line_limits[li];
                        }
                    }
                }
            }

            let names_of =
                |set: &[usize]| set.iter().map(|&li| line_names[li].clone()).collect::<Vec<_>>();

            if maxrate > 0.0 {
                // Round the period to what the pseudoclock can produce.
                let period = quantise(1.0 / maxrate, resolution);
                let maxrate = 1.0 / period;
                if maxrate > local_limit {
                    seq_err!(
                        ClockLimitExceeded,
                        "at t={time}s, a clock rate of {maxrate}Hz was requested; one or more \
                         devices connected to '{pc_name}' cannot support clock rates higher \
                         than {local_limit}Hz"
                    );
                }
                let next_time = match all_change_times.get(i + 1) {
                    Some(&t) => t,
                    None => seq_err!(
                        InstructionsAfterStop,
                        "a ramp on '{pc_name}' is still running at the experiment's stop time \
                         (t={stop_time}s)"
                    ),
                };
                let product = (next_time - time) * maxrate;
                let mut n_ticks = product.floor() as usize;
                let remainder = product - n_ticks as f64;
                // Squeeze in the final cycle if it would not force the
                // clock beyond its limit.
                if remainder != 0.0 && remainder / maxrate >= 1.0 / local_limit {
                    n_ticks += 1;
                }
                let ticks: Vec<f64> = (0..n_ticks).map(|k| time + k as f64 * period).collect();
                let last_tick = *ticks.last().expect("interval always fits one tick");

                for &li in &enabled {
                    if looping.contains(&li) {
                        all_times[li].push(TickGroup::Span(ticks.clone()));
                    } else {
                        all_times[li].push(TickGroup::Point(time));
                    }
                }

                // Only the first tick of a ramp may activate the
                // non-looping clocklines that share this instant;
                // subsequent ramp ticks must not re-trigger them.
                if n_ticks > 2 {
                    clock.push(ClockSegment::Step {
                        start: time,
                        reps: 1,
                        step: period,
                        enabled_clocks: names_of(&enabled),
                    });
                    clock.push(ClockSegment::Step {
                        start: time + period,
                        reps: n_ticks - 2,
                        step: period,
                        enabled_clocks: names_of(&looping),
                    });
                } else if n_ticks == 2 {
                    clock.push(ClockSegment::Step {
                        start: time,
                        reps: 1,
                        step: period,
                        enabled_clocks: names_of(&enabled),
                    });
                }
                clock.push(ClockSegment::Step {
                    start: last_tick,
                    reps: 1,
                    step: next_time - last_tick,
                    enabled_clocks: if n_ticks == 1 {
                        names_of(&enabled)
                    } else {
                        names_of(&looping)
                    },
                });
            } else {
                for &li in &enabled {
                    all_times[li].push(TickGroup::Point(time));
                }
                match all_change_times.get(i + 1) {
                    Some(&next_time) => clock.push(ClockSegment::Step {
                        start: time,
                        reps: 1,
                        step: next_time - time,
                        enabled_clocks: names_of(&enabled),
                    }),
                    None => {
                        if stop_time < time {
                            seq_err!(
                                InstructionsAfterStop,
                                "'{pc_name}' has more instructions (at t={time}s) after the \
                                 experiment's stop time (t={stop_time}s)"
                            );
                        }
                        debug_assert!(
                            time_key(stop_time) == time_key(time),
                            "stop_time is always the last change time"
                        );
                        // Hold the final values for one more cycle so
                        // tick counts match the sample arrays.
                        let everyone: Vec<usize> = (0..clock_lines.len()).collect();
                        clock.push(ClockSegment::Step {
                            start: time,
                            reps: 1,
                            step: 10.0 / pc_limit,
                            enabled_clocks: names_of(&everyone),
                        });
                    }
                }
            }
        }
        Ok((all_times, clock))
    }

    /// Run the full scheduling pass for one pseudoclock: change times,
    /// per-output timeseries, tick expansion, and sample expansion.
    pub(crate) fn generate_clock(&mut self, pseudoclock: DeviceId) -> Result<PseudoclockProgram> {
        let clock_device = self.pseudoclock_device_of(pseudoclock)?;
        let device_payload = self.pseudoclock_device_payload(clock_device);
        let stop_time = match device_payload.stop_time {
            Some(t) => t,
            None => seq_err!(
                NotStarted,
                "stop() has not been called; '{}' has no stop time",
                self.device_name(clock_device)
            ),
        };
        let trigger_times = device_payload.trigger_times.clone();

        let (clock_lines, outputs_by_clockline) = self.outputs_by_clockline(pseudoclock)?;

        let (all_change_times, change_times) = self.collect_change_times(
            pseudoclock,
            &clock_lines,
            &outputs_by_clockline,
            stop_time,
            &trigger_times,
        )?;

        for (li, outputs) in outputs_by_clockline.iter().enumerate() {
            for &out in outputs {
                self.make_timeseries(out, &change_times[li]);
            }
        }

        let (all_times, segments) = self.expand_change_times(
            pseudoclock,
            &clock_lines,
            &outputs_by_clockline,
            &all_change_times,
            &change_times,
            stop_time,
            &trigger_times,
        )?;

        let mut clockline_ticks = Vec::with_capacity(clock_lines.len());
        for (li, &line) in clock_lines.iter().enumerate() {
            let mut flat = Vec::new();
            for group in &all_times[li] {
                match group {
                    TickGroup::Point(t) => flat.push(*t),
                    TickGroup::Span(ticks) => flat.extend_from_slice(ticks),
                }
            }
            clockline_ticks.push((self.device_name(line).to_string(), Array1::from(flat)));
        }

        for (li, outputs) in outputs_by_clockline.iter().enumerate() {
            let flat_len: usize = all_times[li].iter().map(TickGroup::len).sum();
            for &out in outputs {
                if self.device(out).output().is_static() {
                    self.expand_static(out)?;
                } else {
                    self.expand_timeseries(out, &all_times[li], flat_len)?;
                }
            }
        }

        Ok(PseudoclockProgram {
            pseudoclock: self.device_name(pseudoclock).to_string(),
            segments,
            clockline_ticks,
        })
    }

    /// A static output carries exactly one sample.
    fn expand_static(&mut self, out_id: DeviceId) -> Result<()> {
        let (value, unset) = {
            let out = self.device(out_id).output();
            match out.instructions.values().next() {
                Some(Instruction::Constant(v)) => (*v, false),
                Some(Instruction::Ramp(_)) => unreachable!("static outputs reject ramps"),
                None => (out.default_value, true),
            }
        };
        if unset {
            self.diagnostics.warn(
                Severity::Mild,
                format!(
                    "static output '{}' has no value set; it will be set to {value}",
                    self.device_name(out_id)
                ),
            );
        }
        let out = self.device_mut(out_id).output_mut();
        out.raw_output = Some(crate::output::RawOutput::from_values(
            vec![value],
            out.dtype(),
        ));
        Ok(())
    }
}
