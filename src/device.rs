//! The device tree: typed nodes, parent/child invariants and the name
//! registry.
//!
//! Devices live in an arena owned by the [`Experiment`] context and are
//! referred to by index. Children are owned by their parent through the
//! `children` list; the `parent` field is a non-owning back reference
//! used only for upward lookups (finding the controlling pseudoclock
//! device or clockline).

use regex::Regex;

use crate::errors::{seq_err, Result, SequenceError};
use crate::experiment::Experiment;
use crate::output::{Output, OutputKind};
use crate::properties::Properties;

/// Index of a device in the experiment's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId(pub(crate) usize);

macro_rules! typed_ids {
    ($($(#[$doc:meta])* $name:ident),* $(,)?) => {$(
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(pub(crate) DeviceId);

        impl $name {
            pub fn device_id(self) -> DeviceId {
                self.0
            }
        }

        impl From<$name> for DeviceId {
            fn from(id: $name) -> DeviceId {
                id.0
            }
        }
    )*};
}

typed_ids! {
    /// A pseudoclock device (master or secondary).
    PseudoclockDeviceId,
    /// A pseudoclock within a pseudoclock device.
    PseudoclockId,
    /// One physical clock output of a pseudoclock.
    ClockLineId,
    /// An I/O card bridging a clockline and its outputs.
    IntermediateDeviceId,
    /// A timed analog output.
    AnalogOutId,
    /// A single-value analog output.
    StaticAnalogOutId,
    /// A timed digital output.
    DigitalOutId,
    /// A single-value digital output.
    StaticDigitalOutId,
    /// A digital output with mechanical open/close delays.
    ShutterId,
    /// A digital output that triggers other devices.
    TriggerId,
    /// The trigger output that pulses when the master clock (re)starts.
    WaitMonitorId,
    /// A DDS channel (frequency, amplitude, phase, optional gate).
    DdsId,
    /// A single-value DDS channel.
    StaticDdsId,
    /// An analog acquisition input.
    AnalogInId,
}

/// Which edge of a trigger pulse is the active one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerEdge {
    Rising,
    Falling,
}

/// Timing characteristics of a pseudoclock device, fixed at creation.
#[derive(Debug, Clone, Copy)]
pub struct ClockSpec {
    /// Fastest sustained tick rate, Hz.
    pub clock_limit: f64,
    /// Quantum all times on this clock are rounded to, seconds.
    pub clock_resolution: f64,
    /// Delay from trigger edge to the first instruction taking effect.
    pub trigger_delay: f64,
    /// Shortest trigger pulse the device can detect.
    pub trigger_minimum_duration: f64,
    /// Recovery time after a wait before the device can resume.
    pub wait_delay: f64,
}

#[derive(Debug)]
pub(crate) struct PseudoclockDevice {
    pub spec: ClockSpec,
    pub initial_trigger_time: f64,
    /// Times this device has been (re)triggered, in experiment time.
    pub trigger_times: Vec<f64>,
    /// Triggers requested from the parent trigger output, for the
    /// shared-trigger consistency check.
    pub requested_triggers: Vec<(f64, f64)>,
    pub stop_time: Option<f64>,
}

#[derive(Debug)]
pub(crate) struct Pseudoclock {
    pub clock_limit: f64,
    pub clock_resolution: f64,
}

#[derive(Debug)]
pub(crate) struct ClockLine {
    pub ramping_allowed: bool,
}

#[derive(Debug)]
pub(crate) struct IntermediateDevice {
    pub clock_limit: Option<f64>,
}

#[derive(Debug)]
pub(crate) struct Dds {
    pub frequency: DeviceId,
    pub amplitude: DeviceId,
    pub phase: DeviceId,
    pub gate: Option<DeviceId>,
}

/// One recorded acquisition window on an analog input.
#[derive(Debug, Clone)]
pub struct Acquisition {
    pub label: String,
    pub start_time: f64,
    pub end_time: f64,
    pub wait_label: String,
    pub scale_factor: f64,
    pub units: String,
}

#[derive(Debug)]
pub(crate) struct AnalogIn {
    pub scale_factor: f64,
    pub units: String,
    pub acquisitions: Vec<Acquisition>,
}

#[derive(Debug)]
pub(crate) enum DeviceKind {
    PseudoclockDevice(PseudoclockDevice),
    Pseudoclock(Pseudoclock),
    ClockLine(ClockLine),
    IntermediateDevice(IntermediateDevice),
    Output(Output),
    Dds(Dds),
    StaticDds(Dds),
    AnalogIn(AnalogIn),
}

#[derive(Debug)]
pub(crate) struct Device {
    pub name: String,
    pub parent: Option<DeviceId>,
    pub connection: String,
    pub children: Vec<DeviceId>,
    /// Opaque identifier of the runtime connection to hardware. Devices
    /// without one are not started or stopped directly by the runtime.
    pub hardware_connection: Option<String>,
    pub start_order: Option<i32>,
    pub stop_order: Option<i32>,
    pub properties: Properties,
    pub kind: DeviceKind,
}

impl Device {
    /// Kind name recorded in the connection table.
    pub fn kind_name(&self) -> &'static str {
        match &self.kind {
            DeviceKind::PseudoclockDevice(_) => "PseudoclockDevice",
            DeviceKind::Pseudoclock(_) => "Pseudoclock",
            DeviceKind::ClockLine(_) => "ClockLine",
            DeviceKind::IntermediateDevice(_) => "IntermediateDevice",
            DeviceKind::Output(out) => match &out.kind {
                OutputKind::Analog => "AnalogOut",
                OutputKind::StaticAnalog => "StaticAnalogOut",
                OutputKind::Digital { .. } => "DigitalOut",
                OutputKind::StaticDigital { .. } => "StaticDigitalOut",
                OutputKind::Shutter { .. } => "Shutter",
                OutputKind::Trigger { monitor: None, .. } => "Trigger",
                OutputKind::Trigger { monitor: Some(_), .. } => "WaitMonitor",
            },
            DeviceKind::Dds(_) => "DDS",
            DeviceKind::StaticDds(_) => "StaticDDS",
            DeviceKind::AnalogIn(_) => "AnalogIn",
        }
    }

    pub fn is_output(&self) -> bool {
        matches!(self.kind, DeviceKind::Output(_))
    }

    pub(crate) fn output(&self) -> &Output {
        match &self.kind {
            DeviceKind::Output(out) => out,
            _ => unreachable!("device {} is not an output", self.name),
        }
    }

    pub(crate) fn output_mut(&mut self) -> &mut Output {
        match &mut self.kind {
            DeviceKind::Output(out) => out,
            _ => unreachable!("device {} is not an output", self.name),
        }
    }
}

/// Identifiers that cannot be device names.
const RESERVED_NAMES: &[&str] = &[
    "as", "break", "const", "continue", "crate", "dyn", "else", "enum", "extern", "false", "fn",
    "for", "if", "impl", "in", "let", "loop", "match", "mod", "move", "mut", "pub", "ref",
    "return", "self", "Self", "static", "struct", "super", "trait", "true", "type", "unsafe",
    "use", "where", "while", "async", "await", "abstract", "become", "box", "do", "final",
    "macro", "override", "priv", "try", "typeof", "unsized", "virtual", "yield", "_",
];

pub(crate) fn validate_name(name: &str) -> Result<()> {
    let legal = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("static pattern");
    if !legal.is_match(name) {
        seq_err!(InvalidName, "'{name}' is not a valid identifier");
    }
    if RESERVED_NAMES.contains(&name) {
        seq_err!(
            ReservedName,
            "'{name}' is a reserved word; choose a different device name"
        );
    }
    Ok(())
}

fn child_allowed(parent: &DeviceKind, child: &DeviceKind) -> bool {
    match parent {
        DeviceKind::PseudoclockDevice(_) => matches!(child, DeviceKind::Pseudoclock(_)),
        DeviceKind::Pseudoclock(_) => matches!(child, DeviceKind::ClockLine(_)),
        DeviceKind::ClockLine(_) => matches!(child, DeviceKind::IntermediateDevice(_)),
        DeviceKind::IntermediateDevice(_) => matches!(
            child,
            DeviceKind::Output(_)
                | DeviceKind::Dds(_)
                | DeviceKind::StaticDds(_)
                | DeviceKind::AnalogIn(_)
        ),
        DeviceKind::Output(out) => match &out.kind {
            // Trigger outputs parent triggerable devices.
            OutputKind::Trigger { .. } => matches!(child, DeviceKind::PseudoclockDevice(_)),
            _ => false,
        },
        // A DDS composes analog quantities plus an optional gate.
        DeviceKind::Dds(_) | DeviceKind::StaticDds(_) => match child {
            DeviceKind::Output(out) => matches!(
                out.kind,
                OutputKind::Analog | OutputKind::StaticAnalog | OutputKind::Digital { .. }
            ),
            _ => false,
        },
        DeviceKind::AnalogIn(_) => false,
    }
}

impl Experiment {
    pub(crate) fn device(&self, id: DeviceId) -> &Device {
        &self.devices[id.0]
    }

    pub(crate) fn device_mut(&mut self, id: DeviceId) -> &mut Device {
        &mut self.devices[id.0]
    }

    pub(crate) fn device_name(&self, id: DeviceId) -> &str {
        &self.devices[id.0].name
    }

    /// Core device registration: name checks, kind checks, tree linkage.
    pub(crate) fn register_device(
        &mut self,
        name: &str,
        parent: Option<DeviceId>,
        connection: &str,
        kind: DeviceKind,
    ) -> Result<DeviceId> {
        validate_name(name)?;
        if self.names.contains_key(name) {
            seq_err!(NameClash, "the device name '{name}' is already in use");
        }
        if let Some(pid) = parent {
            let parent_dev = self.device(pid);
            if !child_allowed(&parent_dev.kind, &kind) {
                seq_err!(
                    KindMismatch,
                    "devices of the kind given for '{name}' cannot be attached to '{}' ({})",
                    parent_dev.name,
                    parent_dev.kind_name()
                );
            }
            if let DeviceKind::Output(out) = &parent_dev.kind {
                if matches!(out.kind, OutputKind::Trigger { .. }) && connection != "trigger" {
                    seq_err!(
                        KindMismatch,
                        "the connection of '{name}' to trigger '{}' must be 'trigger', not '{connection}'",
                        parent_dev.name
                    );
                }
            }
        }
        let id = DeviceId(self.devices.len());
        self.devices.push(Device {
            name: name.to_string(),
            parent,
            connection: connection.to_string(),
            children: Vec::new(),
            hardware_connection: None,
            start_order: None,
            stop_order: None,
            properties: Properties::default(),
            kind,
        });
        if let Some(pid) = parent {
            self.devices[pid.0].children.push(id);
        }
        self.names.insert(name.to_string(), id);
        Ok(id)
    }

    /// Walk parents until a pseudoclock device is found. A pseudoclock
    /// device is its own pseudoclock device.
    pub(crate) fn pseudoclock_device_of(&self, id: DeviceId) -> Result<DeviceId> {
        let mut cursor = Some(id);
        while let Some(cur) = cursor {
            if matches!(self.device(cur).kind, DeviceKind::PseudoclockDevice(_)) {
                return Ok(cur);
            }
            cursor = self.device(cur).parent;
        }
        Err(SequenceError::new(
            crate::errors::ErrorKind::NoPseudoclock,
            format!(
                "could not find a parent pseudoclock device of '{}'",
                self.device_name(id)
            ),
        ))
    }

    /// Walk parents until a clockline is found.
    pub(crate) fn parent_clock_line_of(&self, id: DeviceId) -> Result<DeviceId> {
        let mut cursor = Some(id);
        while let Some(cur) = cursor {
            if matches!(self.device(cur).kind, DeviceKind::ClockLine(_)) {
                return Ok(cur);
            }
            cursor = self.device(cur).parent;
        }
        Err(SequenceError::new(
            crate::errors::ErrorKind::NoPseudoclock,
            format!(
                "could not find a parent clockline of '{}'",
                self.device_name(id)
            ),
        ))
    }

    pub(crate) fn pseudoclock_device_payload(&self, id: DeviceId) -> &PseudoclockDevice {
        match &self.device(id).kind {
            DeviceKind::PseudoclockDevice(p) => p,
            _ => unreachable!("device {} is not a pseudoclock device", self.device_name(id)),
        }
    }

    pub(crate) fn pseudoclock_device_payload_mut(&mut self, id: DeviceId) -> &mut PseudoclockDevice {
        match &mut self.devices[id.0].kind {
            DeviceKind::PseudoclockDevice(p) => p,
            _ => unreachable!("not a pseudoclock device"),
        }
    }

    pub(crate) fn is_master_pseudoclock(&self, id: DeviceId) -> bool {
        self.device(id).parent.is_none()
    }

    /// The earliest time output can be commanded from a device: zero
    /// under the master clock, first trigger plus trigger delay under a
    /// secondary clock.
    pub(crate) fn t0(&self, id: DeviceId) -> Result<f64> {
        let clock = self.pseudoclock_device_of(id)?;
        if self.is_master_pseudoclock(clock) {
            Ok(0.0)
        } else {
            let payload = self.pseudoclock_device_payload(clock);
            let first = payload
                .trigger_times
                .first()
                .copied()
                .unwrap_or(payload.initial_trigger_time);
            Ok(crate::instruction::round_time(
                first + payload.spec.trigger_delay,
            ))
        }
    }

    pub(crate) fn clock_resolution_of(&self, id: DeviceId) -> Result<f64> {
        let clock = self.pseudoclock_device_of(id)?;
        Ok(self.pseudoclock_device_payload(clock).spec.clock_resolution)
    }

    /// Round `t` to the resolution of the pseudoclock controlling a
    /// device. This is the single rounding policy for scheduling; every
    /// downstream time comparison assumes its inputs went through here.
    pub fn quantise_to_pseudoclock(&self, id: impl Into<DeviceId>, t: f64) -> Result<f64> {
        let resolution = self.clock_resolution_of(id.into())?;
        Ok(quantise(t, resolution))
    }

    /// Effective clock limit of a clockline: the minimum over attached
    /// devices that declare one, or the pseudoclock's limit when none
    /// does.
    pub(crate) fn clock_line_limit(&self, line: DeviceId) -> Result<f64> {
        debug_assert!(matches!(self.device(line).kind, DeviceKind::ClockLine(_)));
        let mut limit: Option<f64> = None;
        for &child in &self.device(line).children {
            if let DeviceKind::IntermediateDevice(dev) = &self.device(child).kind {
                if let Some(declared) = dev.clock_limit {
                    limit = Some(limit.map_or(declared, |current| declared.min(current)));
                }
            }
        }
        match limit {
            Some(limit) => Ok(limit),
            None => {
                let clock = self.pseudoclock_device_of(line)?;
                Ok(self.pseudoclock_device_payload(clock).spec.clock_limit)
            }
        }
    }

    /// Clock limit seen by an output: its parent clockline's.
    pub(crate) fn output_clock_limit(&self, out: DeviceId) -> Result<f64> {
        let line = self.parent_clock_line_of(out)?;
        self.clock_line_limit(line)
    }

    /// All outputs in the subtree of `root`. Output nodes are collected
    /// without descending into them, so devices hanging off a trigger
    /// output belong to their own pseudoclock's collection.
    pub(crate) fn get_all_outputs(&self, root: DeviceId) -> Vec<DeviceId> {
        let mut found = Vec::new();
        let mut stack: Vec<DeviceId> = self.device(root).children.clone();
        stack.reverse();
        while let Some(id) = stack.pop() {
            if self.device(id).is_output() {
                found.push(id);
            } else {
                let mut children = self.device(id).children.clone();
                children.reverse();
                stack.extend(children);
            }
        }
        found
    }

    /// Set a named property on a device. Properties are opaque to the
    /// compiler; they travel to the runtime in the location given.
    pub fn set_property(
        &mut self,
        id: impl Into<DeviceId>,
        name: &str,
        value: serde_json::Value,
        location: crate::properties::PropertyLocation,
    ) -> Result<()> {
        let id = id.into();
        let device_name = self.device_name(id).to_string();
        self.device_mut(id)
            .properties
            .set(&device_name, name, value, location, false)
    }

    /// Set the opaque hardware connection string for a device.
    pub fn set_hardware_connection(
        &mut self,
        id: impl Into<DeviceId>,
        connection: impl Into<String>,
    ) {
        self.device_mut(id.into()).hardware_connection = Some(connection.into());
    }

    /// Priority of this device when the runtime starts devices.
    pub fn set_start_order(&mut self, id: impl Into<DeviceId>, order: i32) {
        self.device_mut(id.into()).start_order = Some(order);
    }

    /// Priority of this device when the runtime stops devices.
    pub fn set_stop_order(&mut self, id: impl Into<DeviceId>, order: i32) {
        self.device_mut(id.into()).stop_order = Some(order);
    }
}

/// Round `t` to an integer number of `resolution` quanta.
pub(crate) fn quantise(t: f64, resolution: f64) -> f64 {
    (t / resolution).round() * resolution
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_validation() {
        assert!(validate_name("shutter_1").is_ok());
        assert!(validate_name("_private").is_ok());
        assert!(validate_name("1shutter").is_err());
        assert!(validate_name("shut ter").is_err());
        assert!(validate_name("").is_err());
        let err = validate_name("loop").unwrap_err();
        assert_eq!(err.kind, crate::errors::ErrorKind::ReservedName);
    }

    #[test]
    fn quantise_is_idempotent() {
        let resolution = 1e-7;
        for t in [0.0, 1e-3, 0.123456789, 2.5e-7, 3.49e-7] {
            let once = quantise(t, resolution);
            assert_eq!(once, quantise(once, resolution));
        }
    }
}
