//! The compiled shot artifact handed to the external writer.
//!
//! Everything the persistence collaborator needs is assembled here
//! after the compile pass: the connection table, per-device properties,
//! the wait table and monitor routing, time markers, the per-
//! pseudoclock clock programs, and every output's raw sample array.
//! The core performs no file I/O itself.

use serde_json::json;

use crate::clock::PseudoclockProgram;
use crate::device::{DeviceId, DeviceKind, TriggerEdge};
use crate::errors::{seq_err, Result};
use crate::experiment::Experiment;
use crate::output::{OutputKind, RawOutput};
use crate::properties::serialise;

/// One row of the connection table, used by the runtime to check the
/// lab's wiring against what the shot was compiled for.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ConnectionTableRow {
    pub name: String,
    pub kind: String,
    pub parent: String,
    pub parent_port: String,
    pub unit_conversion_class: String,
    /// JSON of the unit conversion parameters.
    pub unit_conversion_params: String,
    pub hardware_connection: String,
    /// JSON of the connection table properties.
    pub properties: String,
}

/// Per-device properties travelling with the shot, plus the start/stop
/// ordering for devices the runtime manages directly.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DevicePropertiesEntry {
    pub name: String,
    pub properties: crate::properties::PropertyMap,
    pub start_order: Option<i32>,
    pub stop_order: Option<i32>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct WaitRow {
    pub label: String,
    pub time: f64,
    pub timeout: f64,
}

/// Identifies the devices the wait monitor is wired through.
#[derive(Debug, Clone, serde::Serialize)]
pub struct WaitMonitorInfo {
    pub name: String,
    pub acquisition_device: String,
    pub acquisition_connection: String,
    pub timeout_device: String,
    pub timeout_connection: String,
    pub timeout_trigger_type: TriggerEdge,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct TimeMarkerRow {
    pub label: String,
    pub time: f64,
    pub color: (i16, i16, i16),
}

/// One output's flattened samples.
#[derive(Debug, Clone)]
pub struct OutputSamples {
    pub name: String,
    pub samples: RawOutput,
}

/// Mechanical delay calibration of one shutter.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ShutterCalibration {
    pub name: String,
    pub open_delay: f64,
    pub close_delay: f64,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ShotProperties {
    pub target_cycle_time: Option<f64>,
    pub cycle_time_delay_after_programming: bool,
}

/// The complete compiled shot.
#[derive(Debug, Clone)]
pub struct Shot {
    pub master_pseudoclock: Option<String>,
    /// Sorted by device name.
    pub connection_table: Vec<ConnectionTableRow>,
    pub device_properties: Vec<DevicePropertiesEntry>,
    /// Sorted by time.
    pub waits: Vec<WaitRow>,
    pub wait_monitor: Option<WaitMonitorInfo>,
    pub time_markers: Vec<TimeMarkerRow>,
    pub clock_programs: Vec<PseudoclockProgram>,
    pub outputs: Vec<OutputSamples>,
    pub shutter_calibrations: Vec<ShutterCalibration>,
    pub shot_properties: ShotProperties,
    /// Gzip the connection table dataset when writing.
    pub compression: bool,
    pub save_hg_info: bool,
    pub save_git_info: bool,
}

impl Shot {
    /// Samples of a named output, if it produced any.
    pub fn output(&self, name: &str) -> Option<&RawOutput> {
        self.outputs
            .iter()
            .find(|o| o.name == name)
            .map(|o| &o.samples)
    }

    /// Clock program of a named pseudoclock.
    pub fn clock_program(&self, pseudoclock: &str) -> Option<&PseudoclockProgram> {
        self.clock_programs
            .iter()
            .find(|p| p.pseudoclock == pseudoclock)
    }
}

/// The external persistence collaborator. Called exactly once per
/// compilation with the finished artifact.
pub trait ShotSink {
    fn write_shot(&mut self, shot: &Shot) -> Result<()>;
}

impl Experiment {
    pub(crate) fn assemble_shot(
        &self,
        programs: Vec<PseudoclockProgram>,
        shot_properties: ShotProperties,
    ) -> Result<Shot> {
        let mut connection_table = Vec::with_capacity(self.devices.len());
        let mut device_properties = Vec::new();
        let mut outputs = Vec::new();
        let mut shutter_calibrations = Vec::new();

        for index in 0..self.devices.len() {
            let id = DeviceId(index);
            let device = self.device(id);

            // Orders only make sense on devices the runtime talks to.
            let (start_order, stop_order) = match &device.hardware_connection {
                Some(_) => (
                    Some(device.start_order.unwrap_or(0)),
                    Some(device.stop_order.unwrap_or(0)),
                ),
                None => {
                    if device.start_order.is_some() || device.stop_order.is_some() {
                        seq_err!(
                            NotStartable,
                            "cannot set a start or stop order on device '{}', which has no \
                             hardware connection and thus is not started or stopped directly \
                             by the runtime",
                            device.name
                        );
                    }
                    (None, None)
                }
            };
            device_properties.push(DevicePropertiesEntry {
                name: device.name.clone(),
                properties: device.properties.device_properties.clone(),
                start_order,
                stop_order,
            });

            // Flags that live in the kind discriminant still belong in
            // the connection table row.
            let mut table_properties = device.properties.connection_table_properties.clone();
            let mut unit_conversion_class = "None".to_string();
            if let DeviceKind::Output(out) = &device.kind {
                match &out.kind {
                    OutputKind::Digital { inverted } | OutputKind::StaticDigital { inverted } => {
                        table_properties.insert("inverted".to_string(), json!(inverted));
                    }
                    OutputKind::Shutter {
                        inverted,
                        open_delay,
                        close_delay,
                        ..
                    } => {
                        table_properties.insert("inverted".to_string(), json!(inverted));
                        table_properties
                            .insert("open_state".to_string(), json!(u8::from(!*inverted)));
                        shutter_calibrations.push(ShutterCalibration {
                            name: device.name.clone(),
                            open_delay: *open_delay,
                            close_delay: *close_delay,
                        });
                    }
                    _ => {}
                }
                if let Some(calibration) = &out.calibration {
                    unit_conversion_class = calibration.class_name().to_string();
                }
                if let Some(raw) = &out.raw_output {
                    outputs.push(OutputSamples {
                        name: device.name.clone(),
                        samples: raw.clone(),
                    });
                }
            }

            connection_table.push(ConnectionTableRow {
                name: device.name.clone(),
                kind: device.kind_name().to_string(),
                parent: device
                    .parent
                    .map(|p| self.device_name(p).to_string())
                    .unwrap_or_else(|| "None".to_string()),
                parent_port: if device.parent.is_some() {
                    device.connection.clone()
                } else {
                    "None".to_string()
                },
                unit_conversion_class,
                unit_conversion_params: serialise(&device.properties.unit_conversion_parameters),
                hardware_connection: device.hardware_connection.clone().unwrap_or_default(),
                properties: serialise(&table_properties),
            });
        }
        connection_table.sort_by(|a, b| a.name.cmp(&b.name));

        let waits = self
            .wait_table
            .values()
            .map(|w| WaitRow {
                label: w.label.clone(),
                time: w.time,
                timeout: w.timeout,
            })
            .collect();

        let wait_monitor = match self.wait_monitor {
            Some(id) => match &self.device(id).output().kind {
                OutputKind::Trigger {
                    monitor: Some(routing),
                    ..
                } => Some(WaitMonitorInfo {
                    name: self.device_name(id).to_string(),
                    acquisition_device: self
                        .device_name(routing.acquisition_device)
                        .to_string(),
                    acquisition_connection: routing.acquisition_connection.clone(),
                    timeout_device: routing
                        .timeout_device
                        .map(|d| self.device_name(d).to_string())
                        .unwrap_or_default(),
                    timeout_connection: routing.timeout_connection.clone().unwrap_or_default(),
                    timeout_trigger_type: routing.timeout_trigger_type,
                }),
                _ => None,
            },
            None => None,
        };

        let time_markers = self
            .time_markers
            .iter()
            .map(|(&key, marker)| TimeMarkerRow {
                label: marker.label.clone(),
                time: crate::instruction::key_time(key),
                color: marker.color,
            })
            .collect();

        Ok(Shot {
            master_pseudoclock: self
                .master_pseudoclock
                .map(|id| self.device_name(id).to_string()),
            connection_table,
            device_properties,
            waits,
            wait_monitor,
            time_markers,
            clock_programs: programs,
            outputs,
            shutter_calibrations,
            shot_properties,
            compression: self.config.compression,
            save_hg_info: self.config.save_hg_info,
            save_git_info: self.config.save_git_info,
        })
    }
}
