//! The compilation context.
//!
//! An [`Experiment`] owns the device arena, the name registry, the wait
//! table and time markers, and the handful of flags the compile pass
//! needs (`start_called`, the master pseudoclock, the trigger duration
//! and wait delay). Constructing devices threads this context
//! explicitly; there is no ambient global state, so independent
//! compilations are just independent `Experiment` values.

use std::collections::{BTreeMap, HashMap};

use crate::clock::PseudoclockProgram;
use crate::device::{
    ClockLine, ClockSpec, ClockLineId, Device, DeviceId, DeviceKind, IntermediateDevice,
    IntermediateDeviceId, Pseudoclock, PseudoclockDevice, PseudoclockDeviceId, PseudoclockId,
    TriggerEdge, TriggerId,
};
use crate::diagnostics::{Diagnostics, Warning};
use crate::errors::{seq_err, Result};
use crate::instruction::{round_time, time_key, TimeKey};
use crate::output::OutputKind;
use crate::shot::{Shot, ShotProperties};

/// Passthrough configuration for the compilation and the external
/// writer.
#[derive(Debug, Clone)]
pub struct Config {
    /// Collect Mercurial metadata about the user script (passthrough).
    pub save_hg_info: bool,
    /// Collect git metadata about the user script (passthrough).
    pub save_git_info: bool,
    /// Gzip the connection table dataset in the shot file.
    pub compression: bool,
    pub suppress_mild_warnings: bool,
    pub suppress_all_warnings: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            save_hg_info: true,
            save_git_info: false,
            compression: true,
            suppress_mild_warnings: true,
            suppress_all_warnings: false,
        }
    }
}

/// Options accepted by [`Experiment::stop`].
#[derive(Debug, Clone, Default)]
pub struct StopOptions {
    /// Requested shot-to-shot cycle time for the runtime, seconds.
    pub target_cycle_time: Option<f64>,
    /// Whether the runtime should insert the cycle-time delay after
    /// programming devices rather than before.
    pub cycle_time_delay_after_programming: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct WaitEntry {
    pub label: String,
    pub time: f64,
    pub timeout: f64,
}

#[derive(Debug, Clone)]
pub(crate) struct TimeMarker {
    pub label: String,
    pub color: (i16, i16, i16),
}

/// The experiment being described and compiled.
pub struct Experiment {
    pub(crate) devices: Vec<Device>,
    pub(crate) names: HashMap<String, DeviceId>,
    pub(crate) start_called: bool,
    pub(crate) master_pseudoclock: Option<DeviceId>,
    pub(crate) wait_monitor: Option<DeviceId>,
    pub(crate) trigger_duration: f64,
    pub(crate) wait_delay: f64,
    pub(crate) wait_table: BTreeMap<TimeKey, WaitEntry>,
    pub(crate) time_markers: BTreeMap<TimeKey, TimeMarker>,
    pub(crate) config: Config,
    pub(crate) diagnostics: Diagnostics,
}

impl Default for Experiment {
    fn default() -> Self {
        Self::new()
    }
}

impl Experiment {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        let diagnostics =
            Diagnostics::new(config.suppress_mild_warnings, config.suppress_all_warnings);
        Experiment {
            devices: Vec::new(),
            names: HashMap::new(),
            start_called: false,
            master_pseudoclock: None,
            wait_monitor: None,
            trigger_duration: 0.0,
            wait_delay: 0.0,
            wait_table: BTreeMap::new(),
            time_markers: BTreeMap::new(),
            config,
            diagnostics,
        }
    }

    /// Warnings collected so far.
    pub fn warnings(&self) -> &[Warning] {
        self.diagnostics.warnings()
    }

    // ------------------------------------------------------------------
    // Tree-level constructors
    // ------------------------------------------------------------------

    /// Create the master pseudoclock device. Exactly one may exist.
    pub fn new_pseudoclock_device(
        &mut self,
        name: &str,
        spec: ClockSpec,
    ) -> Result<PseudoclockDeviceId> {
        if let Some(existing) = self.find_master_pseudoclock() {
            seq_err!(
                MultipleMasters,
                "there is already a master pseudoclock device: '{}'; there cannot be multiple \
                 master pseudoclock devices, provide a trigger for one of them",
                self.device_name(existing)
            );
        }
        let id = self.register_device(
            name,
            None,
            "",
            DeviceKind::PseudoclockDevice(PseudoclockDevice {
                spec,
                initial_trigger_time: 0.0,
                trigger_times: Vec::new(),
                requested_triggers: Vec::new(),
                stop_time: None,
            }),
        )?;
        Ok(PseudoclockDeviceId(id))
    }

    /// Create a secondary pseudoclock device triggered through a new
    /// trigger output named `<name>_trigger` on `trigger_device`.
    pub fn new_secondary_pseudoclock_device(
        &mut self,
        name: &str,
        spec: ClockSpec,
        trigger_device: IntermediateDeviceId,
        trigger_connection: &str,
    ) -> Result<PseudoclockDeviceId> {
        let trigger = self.new_trigger(
            trigger_device,
            &format!("{name}_trigger"),
            trigger_connection,
            TriggerEdge::Rising,
        )?;
        self.new_secondary_pseudoclock_device_on_trigger(name, spec, trigger)
    }

    /// Create a secondary pseudoclock device under an existing trigger
    /// output.
    pub fn new_secondary_pseudoclock_device_on_trigger(
        &mut self,
        name: &str,
        spec: ClockSpec,
        trigger: TriggerId,
    ) -> Result<PseudoclockDeviceId> {
        match &self.device(trigger.device_id()).output().kind {
            OutputKind::Trigger { edge, .. } => {
                if *edge != TriggerEdge::Rising {
                    seq_err!(
                        KindMismatch,
                        "trigger edge type for '{name}' is rising, but trigger '{}' has edge \
                         type falling",
                        self.device_name(trigger.device_id())
                    );
                }
            }
            _ => unreachable!(),
        }
        let trigger_clock = self.pseudoclock_device_of(trigger.device_id())?;
        if !self.is_master_pseudoclock(trigger_clock) {
            seq_err!(
                KindMismatch,
                "secondary pseudoclock device '{name}' must be triggered by a device clocked \
                 by the master pseudoclock device; pseudoclocks triggering each other in \
                 series is not supported"
            );
        }
        let id = self.register_device(
            name,
            Some(trigger.device_id()),
            "trigger",
            DeviceKind::PseudoclockDevice(PseudoclockDevice {
                spec,
                initial_trigger_time: 0.0,
                trigger_times: Vec::new(),
                requested_triggers: Vec::new(),
                stop_time: None,
            }),
        )?;
        Ok(PseudoclockDeviceId(id))
    }

    /// Set when a secondary pseudoclock device receives its first
    /// trigger. Must be called before `start()`.
    pub fn set_initial_trigger_time(&mut self, clock: PseudoclockDeviceId, t: f64) -> Result<()> {
        if self.start_called {
            seq_err!(
                NotStarted,
                "initial trigger times must be set prior to calling start()"
            );
        }
        if self.is_master_pseudoclock(clock.device_id()) {
            seq_err!(
                TooEarly,
                "the initial trigger time of the master pseudoclock device '{}' is always \
                 zero and cannot be changed",
                self.device_name(clock.device_id())
            );
        }
        self.pseudoclock_device_payload_mut(clock.device_id())
            .initial_trigger_time = round_time(t);
        Ok(())
    }

    pub fn new_pseudoclock(
        &mut self,
        parent: PseudoclockDeviceId,
        name: &str,
        connection: &str,
    ) -> Result<PseudoclockId> {
        let spec = self.pseudoclock_device_payload(parent.device_id()).spec;
        let id = self.register_device(
            name,
            Some(parent.device_id()),
            connection,
            DeviceKind::Pseudoclock(Pseudoclock {
                clock_limit: spec.clock_limit,
                clock_resolution: spec.clock_resolution,
            }),
        )?;
        Ok(PseudoclockId(id))
    }

    pub fn new_clock_line(
        &mut self,
        parent: PseudoclockId,
        name: &str,
        connection: &str,
        ramping_allowed: bool,
    ) -> Result<ClockLineId> {
        let id = self.register_device(
            name,
            Some(parent.device_id()),
            connection,
            DeviceKind::ClockLine(ClockLine { ramping_allowed }),
        )?;
        Ok(ClockLineId(id))
    }

    /// An I/O card on a clockline. A card declaring its own clock limit
    /// lowers the effective limit of the whole clockline.
    pub fn new_intermediate_device(
        &mut self,
        parent: ClockLineId,
        name: &str,
        clock_limit: Option<f64>,
    ) -> Result<IntermediateDeviceId> {
        let id = self.register_device(
            name,
            Some(parent.device_id()),
            "internal",
            DeviceKind::IntermediateDevice(IntermediateDevice { clock_limit }),
        )?;
        Ok(IntermediateDeviceId(id))
    }

    // ------------------------------------------------------------------
    // Wait/trigger protocol
    // ------------------------------------------------------------------

    /// Pause all pseudoclocks at time `t` until an external resume
    /// trigger, or until `timeout` seconds pass. Returns the time by
    /// which every device is guaranteed ready again.
    pub fn wait(&mut self, label: &str, t: f64, timeout: f64) -> Result<f64> {
        if label.is_empty() {
            seq_err!(InvalidName, "a wait must have a name");
        }
        let key = time_key(round_time(t));
        if self.wait_table.contains_key(&key) {
            seq_err!(TimeClash, "there is already a wait at t={t}s");
        }
        if self.wait_table.values().any(|w| w.label == label) {
            seq_err!(NameClash, "there is already a wait named '{label}'");
        }
        let max_delay = self.trigger_all_pseudoclocks(Some(t))?;
        self.wait_table.insert(
            key,
            WaitEntry {
                label: label.to_string(),
                time: round_time(t),
                timeout,
            },
        );
        Ok(max_delay)
    }

    /// Label a moment of the experiment, with an optional RGB colour
    /// for display tools. Unset colour is recorded as `(-1, -1, -1)`.
    pub fn add_time_marker(&mut self, t: f64, label: &str, color: Option<(u8, u8, u8)>) {
        let color = match color {
            Some((r, g, b)) => (r as i16, g as i16, b as i16),
            None => (-1, -1, -1),
        };
        self.time_markers.insert(
            time_key(round_time(t)),
            TimeMarker {
                label: label.to_string(),
                color,
            },
        );
    }

    /// Trigger every pseudoclock device. `None` means the initial
    /// pre-experiment trigger, which carries no wait delay.
    fn trigger_all_pseudoclocks(&mut self, t: Option<f64>) -> Result<f64> {
        let wait_delay = if t.is_none() { 0.0 } else { self.wait_delay };
        let clocks: Vec<DeviceId> = self.pseudoclock_devices();
        let trigger_duration = self.trigger_duration;
        for clock in &clocks {
            self.trigger_pseudoclock_device(*clock, t, trigger_duration, wait_delay)?;
        }

        // How long until every device can take instructions again: the
        // slowest secondary's trigger delay, or the master's own
        // trigger pulse plus one period of its slowest clock.
        let max_secondary_delay = clocks
            .iter()
            .filter(|&&c| !self.is_master_pseudoclock(c))
            .map(|&c| self.pseudoclock_device_payload(c).spec.trigger_delay)
            .fold(0.0, f64::max);
        let master = match self.master_pseudoclock {
            Some(master) => master,
            None => seq_err!(
                NoToplevelDevices,
                "no master pseudoclock device; has start() been called?"
            ),
        };
        let master_spec = self.pseudoclock_device_payload(master).spec;
        let mut master_period = 1.0 / master_spec.clock_limit;
        for &pseudoclock in &self.device(master).children {
            if !matches!(self.device(pseudoclock).kind, DeviceKind::Pseudoclock(_)) {
                continue;
            }
            for &line in &self.device(pseudoclock).children {
                if matches!(self.device(line).kind, DeviceKind::ClockLine(_)) {
                    master_period = master_period.max(1.0 / self.clock_line_limit(line)?);
                }
            }
        }
        Ok((trigger_duration + master_period).max(max_secondary_delay) + wait_delay)
    }

    fn trigger_pseudoclock_device(
        &mut self,
        clock: DeviceId,
        t: Option<f64>,
        duration: f64,
        wait_delay: f64,
    ) -> Result<()> {
        let t = round_time(
            t.unwrap_or_else(|| self.pseudoclock_device_payload(clock).initial_trigger_time),
        );
        if self.is_master_pseudoclock(clock) {
            // The wait monitor pulses to mark every start or resumption
            // of the master clock.
            if let Some(monitor) = self.wait_monitor {
                self.trigger_pulse(monitor, t, duration)?;
            }
            self.pseudoclock_device_payload_mut(clock)
                .trigger_times
                .push(t);
        } else {
            let parent_trigger = self.device(clock).parent.expect("secondary has a trigger");
            // Only ask for the pulse if a sibling sharing this trigger
            // has not already requested the identical one.
            let already_requested = self
                .device(parent_trigger)
                .children
                .iter()
                .filter(|&&sibling| sibling != clock)
                .any(|&sibling| match &self.device(sibling).kind {
                    DeviceKind::PseudoclockDevice(p) => {
                        p.requested_triggers.iter().any(|&(other_t, other_d)| {
                            time_key(other_t) == time_key(t) && other_d == duration
                        })
                    }
                    _ => false,
                });
            if !already_requested {
                self.trigger_pulse(parent_trigger, t, duration)?;
            }
            let payload = self.pseudoclock_device_payload_mut(clock);
            payload.requested_triggers.push((t, duration));
            payload.trigger_times.push(round_time(t + wait_delay));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Start/stop orchestration
    // ------------------------------------------------------------------

    /// End of the connection table, start of the experiment logic.
    /// Identifies the master pseudoclock, sizes the trigger pulse,
    /// and fires the initial trigger. Returns the time by which all
    /// pseudoclocks are running.
    pub fn start(&mut self) -> Result<f64> {
        self.start_called = true;
        let clocks = self.pseudoclock_devices();
        let toplevel: Vec<DeviceId> = (0..self.devices.len())
            .map(DeviceId)
            .filter(|&id| self.device(id).parent.is_none())
            .collect();
        let masters: Vec<DeviceId> = clocks
            .iter()
            .copied()
            .filter(|&c| self.is_master_pseudoclock(c))
            .collect();
        if masters.len() > 1 {
            seq_err!(MultipleMasters, "cannot have more than one master pseudoclock");
        }
        if toplevel.is_empty() {
            seq_err!(
                NoToplevelDevices,
                "no toplevel devices and no master pseudoclock found"
            );
        }
        if clocks.is_empty() {
            self.master_pseudoclock = None;
            self.trigger_duration = 0.0;
            self.wait_delay = 0.0;
            return Ok(0.0);
        }
        let master = match masters.first() {
            Some(&m) => m,
            None => seq_err!(NoToplevelDevices, "no master pseudoclock found"),
        };
        self.master_pseudoclock = Some(master);
        let master_spec = self.pseudoclock_device_payload(master).spec;

        // Which pseudoclock needs the longest pulse to trigger it?
        let mut trigger_duration = clocks
            .iter()
            .filter(|&&c| !self.is_master_pseudoclock(c))
            .map(|&c| self.pseudoclock_device_payload(c).spec.trigger_minimum_duration)
            .fold(0.0, f64::max);

        // The slowest clock involved in producing trigger edges bounds
        // how short a pulse can reliably be.
        let mut min_clock_limit = master_spec.clock_limit;
        for &clock in &clocks {
            if self.is_master_pseudoclock(clock) {
                continue;
            }
            let trigger_output = self.device(clock).parent.expect("secondary has a trigger");
            min_clock_limit = min_clock_limit.min(self.output_clock_limit(trigger_output)?);
        }
        for &pseudoclock in &self.device(master).children {
            if !matches!(self.device(pseudoclock).kind, DeviceKind::Pseudoclock(_)) {
                continue;
            }
            for &line in &self.device(pseudoclock).children {
                if matches!(self.device(line).kind, DeviceKind::ClockLine(_)) {
                    min_clock_limit = min_clock_limit.min(self.clock_line_limit(line)?);
                }
            }
        }

        if let Some(monitor) = self.wait_monitor {
            if let OutputKind::Trigger {
                monitor: Some(routing),
                ..
            } = &self.device(monitor).output().kind
            {
                trigger_duration = trigger_duration.max(routing.minimum_pulse_width);
            }
        }

        self.trigger_duration =
            (2.0 / min_clock_limit).max(trigger_duration) + 2.0 * master_spec.clock_resolution;
        self.wait_delay = clocks
            .iter()
            .filter(|&&c| !self.is_master_pseudoclock(c))
            .map(|&c| self.pseudoclock_device_payload(c).spec.wait_delay)
            .fold(0.0, f64::max);

        self.trigger_all_pseudoclocks(None)
    }

    /// End of the experiment: run the compile pass and produce the shot
    /// artifact for the external writer.
    pub fn stop(&mut self, t: f64, options: StopOptions) -> Result<Shot> {
        if t == 0.0 {
            seq_err!(
                ZeroStop,
                "stop time cannot be t=0; make the run a finite duration"
            );
        }
        let t = round_time(t);
        for clock in self.pseudoclock_devices() {
            self.pseudoclock_device_payload_mut(clock).stop_time = Some(t);
        }
        let shot_properties = ShotProperties {
            target_cycle_time: options.target_cycle_time,
            cycle_time_delay_after_programming: options.cycle_time_delay_after_programming,
        };

        let toplevel: Vec<DeviceId> = (0..self.devices.len())
            .map(DeviceId)
            .filter(|&id| self.device(id).parent.is_none())
            .collect();
        let mut programs = Vec::new();
        for root in toplevel {
            self.compile_device(root, &mut programs)?;
        }
        self.assemble_shot(programs, shot_properties)
    }

    /// Depth-first compile: pseudoclock devices validate and offset
    /// their subtree's instructions, pseudoclocks generate their clock,
    /// trigger outputs check their shared-trigger consistency.
    fn compile_device(
        &mut self,
        id: DeviceId,
        programs: &mut Vec<PseudoclockProgram>,
    ) -> Result<()> {
        if matches!(self.device(id).kind, DeviceKind::PseudoclockDevice(_)) {
            let trigger_times = self.pseudoclock_device_payload(id).trigger_times.clone();
            let outputs = self.get_all_outputs(id);
            for &out in &outputs {
                self.do_output_checks(out, &trigger_times)?;
            }
            for &out in &outputs {
                self.offset_instructions_from_trigger(out, &trigger_times)?;
            }
            self.offset_pseudoclock_device(id)?;
        } else if matches!(self.device(id).kind, DeviceKind::Pseudoclock(_)) {
            programs.push(self.generate_clock(id)?);
        } else if matches!(
            &self.device(id).kind,
            DeviceKind::Output(out) if matches!(out.kind, OutputKind::Trigger { .. })
        ) {
            self.check_shared_triggers(id)?;
        }
        let children = self.device(id).children.clone();
        for child in children {
            self.compile_device(child, programs)?;
        }
        Ok(())
    }

    /// Move a secondary pseudoclock device onto its own timeline:
    /// subtract the initial trigger time and accumulated trigger
    /// delays from its trigger times and stop time, then quantise.
    fn offset_pseudoclock_device(&mut self, id: DeviceId) -> Result<()> {
        let resolution = self.pseudoclock_device_payload(id).spec.clock_resolution;
        let is_master = self.is_master_pseudoclock(id);
        let payload = self.pseudoclock_device_payload_mut(id);
        if !is_master {
            let initial = payload.trigger_times.first().copied().unwrap_or(0.0);
            let delay = payload.spec.trigger_delay;
            let n_triggers = payload.trigger_times.len() as f64;
            if let Some(stop) = payload.stop_time {
                payload.stop_time = Some(round_time(stop - initial - delay * n_triggers));
            }
            let rewritten: Vec<f64> = payload
                .trigger_times
                .iter()
                .enumerate()
                .map(|(i, &t)| round_time(t - initial - i as f64 * delay))
                .collect();
            payload.trigger_times = rewritten;
        }
        let payload = self.pseudoclock_device_payload_mut(id);
        for t in payload.trigger_times.iter_mut() {
            *t = crate::device::quantise(*t, resolution);
        }
        if let Some(stop) = payload.stop_time {
            payload.stop_time = Some(crate::device::quantise(stop, resolution));
        }
        Ok(())
    }

    /// Devices sharing a trigger output must request identical trigger
    /// pulses; one resuming while another sleeps cannot be recovered.
    fn check_shared_triggers(&self, trigger: DeviceId) -> Result<()> {
        let children = &self.device(trigger).children;
        for &a in children {
            let a_triggers = match &self.device(a).kind {
                DeviceKind::PseudoclockDevice(p) => &p.requested_triggers,
                _ => continue,
            };
            for &b in children {
                if a == b {
                    continue;
                }
                let b_triggers = match &self.device(b).kind {
                    DeviceKind::PseudoclockDevice(p) => &p.requested_triggers,
                    _ => continue,
                };
                for &(t, duration) in a_triggers {
                    let matched = b_triggers.iter().any(|&(other_t, other_d)| {
                        time_key(other_t) == time_key(t) && other_d == duration
                    });
                    if !matched {
                        seq_err!(
                            TriggerOverlap,
                            "devices '{}' and '{}' share trigger '{}'; '{}' has a trigger at \
                             t={t}s for {duration}s but there is no matching trigger for '{}'; \
                             devices sharing a trigger must have identical trigger times and \
                             durations",
                            self.device_name(a),
                            self.device_name(b),
                            self.device_name(trigger),
                            self.device_name(a),
                            self.device_name(b)
                        );
                    }
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Small queries
    // ------------------------------------------------------------------

    pub(crate) fn pseudoclock_devices(&self) -> Vec<DeviceId> {
        (0..self.devices.len())
            .map(DeviceId)
            .filter(|&id| matches!(self.device(id).kind, DeviceKind::PseudoclockDevice(_)))
            .collect()
    }

    fn find_master_pseudoclock(&self) -> Option<DeviceId> {
        self.pseudoclock_devices()
            .into_iter()
            .find(|&id| self.is_master_pseudoclock(id))
    }
}
