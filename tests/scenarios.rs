// End-to-end compilation scenarios on the public API.

use anyhow::{ensure, Result};

use shotline::{
    AnalogOutOptions, ClockSegment, ClockSpec, ErrorKind, Experiment, IntermediateDeviceId,
    PseudoclockProgram, RawOutput, Shot, StopOptions, TriggerEdge, WaitMonitorOptions,
};

const SPEC_10MHZ: ClockSpec = ClockSpec {
    clock_limit: 10e6,
    clock_resolution: 1e-7,
    trigger_delay: 0.0,
    trigger_minimum_duration: 0.0,
    wait_delay: 0.0,
};

/// Master pseudoclock with one clockline and one card.
fn single_line_rig(exp: &mut Experiment, spec: ClockSpec) -> Result<IntermediateDeviceId> {
    let clock = exp.new_pseudoclock_device("pulser", spec)?;
    let pseudoclock = exp.new_pseudoclock(clock, "pulser_clock", "clock")?;
    let line = exp.new_clock_line(pseudoclock, "flag0", "flag 0", true)?;
    Ok(exp.new_intermediate_device(line, "card0", None)?)
}

fn samples_f64(shot: &Shot, name: &str) -> Result<Vec<f64>> {
    match shot.output(name) {
        Some(RawOutput::Analog(a)) => Ok(a.to_vec()),
        Some(RawOutput::Digital(a)) => Ok(a.iter().map(|&v| v as f64).collect()),
        None => anyhow::bail!("no raw output for '{name}'"),
    }
}

fn line_ticks(program: &PseudoclockProgram, line: &str) -> Result<Vec<f64>> {
    program
        .clockline_ticks
        .iter()
        .find(|(name, _)| name == line)
        .map(|(_, ticks)| ticks.to_vec())
        .ok_or_else(|| anyhow::anyhow!("no tick array for clockline '{line}'"))
}

fn close(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}

// S1: a single digital pulse compiles to four ticks and [0, 1, 0, 0].
#[test]
fn digital_pulse() -> Result<()> {
    let mut exp = Experiment::new();
    let card = single_line_rig(&mut exp, SPEC_10MHZ)?;
    let d = exp.new_digital_out(card, "d", "port0", false)?;
    exp.start()?;
    exp.go_high(d, 1e-3)?;
    exp.go_low(d, 2e-3)?;
    let shot = exp.stop(3e-3, StopOptions::default())?;

    let samples = samples_f64(&shot, "d")?;
    ensure!(samples == vec![0.0, 1.0, 0.0, 0.0], "got {samples:?}");

    let program = shot.clock_program("pulser_clock").unwrap();
    let ticks = line_ticks(program, "flag0")?;
    ensure!(ticks.len() == 4, "got {ticks:?}");
    for (tick, expected) in ticks.iter().zip([0.0, 1e-3, 2e-3, 3e-3]) {
        ensure!(close(*tick, expected), "got {ticks:?}");
    }
    ensure!(!program.segments.iter().any(|s| *s == ClockSegment::Wait));
    Ok(())
}

// S2: a linear analog ramp is sampled at midpoints at the requested
// rate and holds its final value.
#[test]
fn linear_analog_ramp() -> Result<()> {
    let mut exp = Experiment::new();
    let card = single_line_rig(&mut exp, SPEC_10MHZ)?;
    let a = exp.new_analog_out(
        card,
        "a",
        "ao0",
        AnalogOutOptions {
            limits: Some((0.0, 10.0)),
            ..Default::default()
        },
    )?;
    exp.start()?;
    exp.ramp(a, 0.0, 1e-3, 0.0, 5.0, 1e5, None, 1.0)?;
    let shot = exp.stop(2e-3, StopOptions::default())?;

    let program = shot.clock_program("pulser_clock").unwrap();
    let ticks = line_ticks(program, "flag0")?;
    // 100 ticks inside the ramp at 10 us spacing, then the hold at
    // t=1e-3 and the stop tick.
    let in_ramp = ticks.iter().filter(|&&t| t < 1e-3).count();
    ensure!(in_ramp == 100, "got {in_ramp} ticks inside the ramp");
    ensure!(ticks.len() == 102);
    ensure!(close(ticks[1] - ticks[0], 1e-5));

    let samples = samples_f64(&shot, "a")?;
    ensure!(samples.len() == 102);
    // Midpoint sampling: first sample is f(5 us) = 5 * 0.5e-5 / 1e-3.
    ensure!(close(samples[0], 0.025), "got {}", samples[0]);
    ensure!(close(samples[99], 4.975), "got {}", samples[99]);
    ensure!(close(samples[100], 5.0));
    ensure!(close(samples[101], 5.0));
    Ok(())
}

// S3: a change on one clockline during another clockline's ramp breaks
// the ramp's loop at that time.
#[test]
fn cross_clockline_ramp_break() -> Result<()> {
    let mut exp = Experiment::new();
    let clock = exp.new_pseudoclock_device("pulser", SPEC_10MHZ)?;
    let pseudoclock = exp.new_pseudoclock(clock, "pulser_clock", "clock")?;
    let line_a = exp.new_clock_line(pseudoclock, "line_a", "flag 0", true)?;
    let line_b = exp.new_clock_line(pseudoclock, "line_b", "flag 1", true)?;
    let card_a = exp.new_intermediate_device(line_a, "card_a", None)?;
    let card_b = exp.new_intermediate_device(line_b, "card_b", None)?;
    let a = exp.new_analog_out(card_a, "a", "ao0", AnalogOutOptions::default())?;
    let b = exp.new_digital_out(card_b, "b", "port0", false)?;
    exp.start()?;
    exp.ramp(a, 0.0, 1e-3, 0.0, 1.0, 1e6, None, 1.0)?;
    exp.go_high(b, 0.5e-3)?;
    let shot = exp.stop(2e-3, StopOptions::default())?;

    let program = shot.clock_program("pulser_clock").unwrap();
    // B ticks exactly at its own change times.
    let ticks_b = line_ticks(program, "line_b")?;
    ensure!(ticks_b.len() == 3, "got {ticks_b:?}");
    ensure!(close(ticks_b[0], 0.0) && close(ticks_b[1], 0.5e-3) && close(ticks_b[2], 2e-3));

    // A's ramp received an extra change time at 0.5e-3: the clock
    // program restarts a full-rate segment there with both lines
    // enabled for its first tick.
    let restart = program.segments.iter().any(|segment| match segment {
        ClockSegment::Step {
            start,
            enabled_clocks,
            ..
        } => {
            close(*start, 0.5e-3)
                && enabled_clocks.contains(&"line_a".to_string())
                && enabled_clocks.contains(&"line_b".to_string())
        }
        ClockSegment::Wait => false,
    });
    ensure!(restart, "no segment restarts at the break: {:?}", program.segments);

    // 500 ticks per half of the ramp, plus the hold and stop ticks.
    let ticks_a = line_ticks(program, "line_a")?;
    ensure!(ticks_a.len() == 1002, "got {}", ticks_a.len());
    ensure!(ticks_a.iter().filter(|&&t| close(t, 0.5e-3)).count() == 1);
    Ok(())
}

// S4: a wait pauses the clock exactly once, right at the wait time.
#[test]
fn wait_inserts_one_pause() -> Result<()> {
    let mut exp = Experiment::new();
    let card = single_line_rig(&mut exp, SPEC_10MHZ)?;
    let d = exp.new_digital_out(card, "d", "port0", false)?;
    exp.start()?;
    exp.go_high(d, 1e-3)?;
    exp.go_low(d, 1.5e-3)?;
    exp.wait("w", 2e-3, 5.0)?;
    exp.go_high(d, 3e-3)?;
    exp.go_low(d, 3.5e-3)?;
    let shot = exp.stop(4e-3, StopOptions::default())?;

    ensure!(shot.waits.len() == 1);
    ensure!(shot.waits[0].label == "w");
    ensure!(close(shot.waits[0].time, 2e-3));
    ensure!(close(shot.waits[0].timeout, 5.0));

    let program = shot.clock_program("pulser_clock").unwrap();
    let wait_positions: Vec<usize> = program
        .segments
        .iter()
        .enumerate()
        .filter(|(_, s)| **s == ClockSegment::Wait)
        .map(|(i, _)| i)
        .collect();
    ensure!(wait_positions.len() == 1, "got {:?}", program.segments);
    // The segment following the wait resumes at the wait time.
    match &program.segments[wait_positions[0] + 1] {
        ClockSegment::Step { start, .. } => ensure!(close(*start, 2e-3)),
        ClockSegment::Wait => anyhow::bail!("double wait"),
    }
    Ok(())
}

// S5: a secondary pseudoclock's instructions are rewritten onto its own
// timeline, losing the initial trigger time and one trigger delay.
#[test]
fn secondary_pseudoclock_offset() -> Result<()> {
    let mut exp = Experiment::new();
    let master_card = single_line_rig(&mut exp, SPEC_10MHZ)?;
    let secondary = exp.new_secondary_pseudoclock_device(
        "follower",
        ClockSpec {
            trigger_delay: 1e-6,
            ..SPEC_10MHZ
        },
        master_card,
        "port7",
    )?;
    exp.set_initial_trigger_time(secondary, 1.0)?;
    let pseudoclock = exp.new_pseudoclock(secondary, "follower_clock", "clock")?;
    let line = exp.new_clock_line(pseudoclock, "follower_flag0", "flag 0", true)?;
    let card = exp.new_intermediate_device(line, "follower_card", None)?;
    let o = exp.new_digital_out(card, "o", "port0", false)?;
    exp.start()?;
    exp.go_high(o, 1.000001)?;
    let shot = exp.stop(2.0, StopOptions::default())?;

    let program = shot.clock_program("follower_clock").unwrap();
    let ticks = line_ticks(program, "follower_flag0")?;
    // The instruction lands at exactly t=0 of the secondary timeline,
    // and the stop time is compressed by the trigger delay.
    ensure!(close(ticks[0], 0.0), "got {ticks:?}");
    ensure!(close(*ticks.last().unwrap(), 1.0 - 1e-6), "got {ticks:?}");
    let samples = samples_f64(&shot, "o")?;
    ensure!(samples[0] == 1.0, "instruction did not survive the offset");
    Ok(())
}

// S6: a scalar instruction inside a ramp interval fails compilation.
#[test]
fn scalar_inside_ramp_rejected() -> Result<()> {
    let mut exp = Experiment::new();
    let card = single_line_rig(&mut exp, SPEC_10MHZ)?;
    let a = exp.new_analog_out(card, "a", "ao0", AnalogOutOptions::default())?;
    exp.start()?;
    exp.ramp(a, 0.1, 0.1, 0.0, 1.0, 1e5, None, 1.0)?;
    exp.constant(a, 0.15, 0.5, None)?;
    let err = exp.stop(0.3, StopOptions::default()).unwrap_err();
    ensure!(err.kind == ErrorKind::RampOverlap, "got {err}");
    ensure!(err.message.contains('a') && err.message.contains("0.15"), "got {err}");
    Ok(())
}

// Property: every start, step and tick is an integer multiple of the
// clock resolution; tick sequences are strictly increasing and respect
// the clock limit; user instruction times survive as ticks; a ramp gets
// exactly duration * rate ticks when they divide evenly.
#[test]
fn timing_invariants() -> Result<()> {
    let mut exp = Experiment::new();
    let card = single_line_rig(&mut exp, SPEC_10MHZ)?;
    let a = exp.new_analog_out(card, "a", "ao0", AnalogOutOptions::default())?;
    let d = exp.new_digital_out(card, "d", "port0", false)?;
    exp.start()?;
    exp.go_high(d, 0.25e-3)?;
    exp.ramp(a, 0.5e-3, 1e-3, 0.0, 1.0, 2.5e4, None, 1.0)?;
    exp.go_low(d, 1.75e-3)?;
    let shot = exp.stop(2.5e-3, StopOptions::default())?;

    let resolution = 1e-7;
    let program = shot.clock_program("pulser_clock").unwrap();
    for segment in &program.segments {
        if let ClockSegment::Step { start, step, .. } = segment {
            for value in [start, step] {
                let quanta = value / resolution;
                ensure!(
                    (quanta - quanta.round()).abs() * resolution < 1e-12,
                    "{value} is not a multiple of the resolution"
                );
            }
        }
    }
    let ticks = line_ticks(program, "flag0")?;
    for pair in ticks.windows(2) {
        ensure!(pair[1] > pair[0], "ticks not strictly increasing");
        ensure!(pair[1] - pair[0] >= 1e-7 - 1e-12, "clock limit violated");
    }
    for t in [0.25e-3, 0.5e-3, 1.5e-3, 1.75e-3] {
        ensure!(
            ticks.iter().any(|&tick| close(tick, t)),
            "instruction time {t} lost"
        );
    }
    // Ramp coverage: 1e-3 s at 2.5e4 Hz is exactly 25 ticks.
    let in_ramp = ticks
        .iter()
        .filter(|&&t| (0.5e-3..1.5e-3).contains(&t))
        .count();
    ensure!(in_ramp == 25, "got {in_ramp}");
    Ok(())
}

// The sample array of an output on a non-ramping clockline is one value
// per change time, and ramps there are rejected.
#[test]
fn non_ramping_clockline() -> Result<()> {
    let mut exp = Experiment::new();
    let clock = exp.new_pseudoclock_device("pulser", SPEC_10MHZ)?;
    let pseudoclock = exp.new_pseudoclock(clock, "pulser_clock", "clock")?;
    let line = exp.new_clock_line(pseudoclock, "slow", "flag 0", false)?;
    let card = exp.new_intermediate_device(line, "card0", None)?;
    let a = exp.new_analog_out(card, "a", "ao0", AnalogOutOptions::default())?;
    exp.start()?;
    let err = exp.ramp(a, 0.0, 1e-3, 0.0, 1.0, 1e5, None, 1.0).unwrap_err();
    ensure!(err.kind == ErrorKind::NoRamping);
    exp.constant(a, 0.0, 0.25, None)?;
    exp.constant(a, 1e-3, 0.75, None)?;
    let shot = exp.stop(2e-3, StopOptions::default())?;
    let samples = samples_f64(&shot, "a")?;
    ensure!(samples == vec![0.25, 0.75, 0.75], "got {samples:?}");
    Ok(())
}

// Unit conversion happens on entry; limits apply in base units.
#[test]
fn calibrated_instruction_values() -> Result<()> {
    use shotline::Calibration;

    let mut exp = Experiment::new();
    let card = single_line_rig(&mut exp, SPEC_10MHZ)?;
    let cal = Calibration::builder("coils.GaussCal")
        .unit("G", |x| x / 20.0, |x| x * 20.0)
        .build()?;
    let a = exp.new_analog_out(
        card,
        "coil",
        "ao0",
        AnalogOutOptions {
            limits: Some((0.0, 1.0)),
            calibration: Some(cal),
            default_value: 0.0,
        },
    )?;
    exp.start()?;
    exp.constant(a, 1e-3, 10.0, Some("G"))?;
    let err = exp.constant(a, 2e-3, 30.0, Some("G")).unwrap_err();
    ensure!(err.kind == ErrorKind::OutOfRange, "got {err}");
    let err = exp.constant(a, 2e-3, 1.0, Some("volts")).unwrap_err();
    ensure!(err.kind == ErrorKind::UnknownUnits, "got {err}");
    let shot = exp.stop(3e-3, StopOptions::default())?;
    let samples = samples_f64(&shot, "coil")?;
    ensure!(samples.contains(&0.5), "got {samples:?}");
    Ok(())
}

// Two updates faster than the pseudoclock can tick fail compilation.
#[test]
fn clock_limit_enforced() -> Result<()> {
    let mut exp = Experiment::new();
    let card = single_line_rig(
        &mut exp,
        ClockSpec {
            clock_limit: 1e6,
            clock_resolution: 1e-7,
            trigger_delay: 0.0,
            trigger_minimum_duration: 0.0,
            wait_delay: 0.0,
        },
    )?;
    let d = exp.new_digital_out(card, "d", "port0", false)?;
    exp.start()?;
    exp.go_high(d, 1e-3)?;
    exp.go_low(d, 1e-3 + 3e-7)?;
    let err = exp.stop(2e-3, StopOptions::default()).unwrap_err();
    ensure!(err.kind == ErrorKind::ClockLimitExceeded, "got {err}");
    Ok(())
}

// A stop time closer to the last instruction than one period of the
// clockline's (slower) limit is rejected.
#[test]
fn stop_time_too_close() -> Result<()> {
    let mut exp = Experiment::new();
    let clock = exp.new_pseudoclock_device("pulser", SPEC_10MHZ)?;
    let pseudoclock = exp.new_pseudoclock(clock, "pulser_clock", "clock")?;
    let line = exp.new_clock_line(pseudoclock, "flag0", "flag 0", true)?;
    // The card only supports 10 kHz updates, limiting the clockline.
    let card = exp.new_intermediate_device(line, "card0", Some(1e4))?;
    let d = exp.new_digital_out(card, "d", "port0", false)?;
    exp.start()?;
    exp.go_high(d, 1e-3)?;
    let err = exp.stop(1.05e-3, StopOptions::default()).unwrap_err();
    ensure!(err.kind == ErrorKind::StopTimeTooClose, "got {err}");
    Ok(())
}

// Instructions beyond the stop time fail compilation.
#[test]
fn instructions_after_stop() -> Result<()> {
    let mut exp = Experiment::new();
    let card = single_line_rig(&mut exp, SPEC_10MHZ)?;
    let d = exp.new_digital_out(card, "d", "port0", false)?;
    exp.start()?;
    exp.go_high(d, 2e-3)?;
    let err = exp.stop(1e-3, StopOptions::default()).unwrap_err();
    ensure!(err.kind == ErrorKind::InstructionsAfterStop, "got {err}");
    Ok(())
}

// An instruction inside the no-go window before a wait trigger fails.
#[test]
fn instruction_too_close_to_wait() -> Result<()> {
    let mut exp = Experiment::new();
    let card = single_line_rig(&mut exp, SPEC_10MHZ)?;
    let d = exp.new_digital_out(card, "d", "port0", false)?;
    exp.start()?;
    exp.go_high(d, 2e-3 - 1e-8)?;
    exp.wait("w", 2e-3, 5.0)?;
    let err = exp.stop(3e-3, StopOptions::default()).unwrap_err();
    ensure!(err.kind == ErrorKind::TriggerOverlap, "got {err}");
    Ok(())
}

// Duplicate wait labels and times are rejected.
#[test]
fn wait_table_uniqueness() -> Result<()> {
    let mut exp = Experiment::new();
    let card = single_line_rig(&mut exp, SPEC_10MHZ)?;
    let _d = exp.new_digital_out(card, "d", "port0", false)?;
    exp.start()?;
    exp.wait("w", 1e-3, 5.0)?;
    let err = exp.wait("w", 2e-3, 5.0).unwrap_err();
    ensure!(err.kind == ErrorKind::NameClash, "got {err}");
    let err = exp.wait("w2", 1e-3, 5.0).unwrap_err();
    ensure!(err.kind == ErrorKind::TimeClash, "got {err}");
    Ok(())
}

// Shutter delays shift the underlying digital edges earlier; a shutter
// commanded to reverse while still moving is an error.
#[test]
fn shutter_delay_compensation() -> Result<()> {
    let mut exp = Experiment::new();
    let card = single_line_rig(&mut exp, SPEC_10MHZ)?;
    let shutter = exp.new_shutter(card, "probe_shutter", "port0", (1e-4, 5e-5), true)?;
    exp.start()?;
    exp.open_shutter(shutter, 1e-3)?;
    exp.close_shutter(shutter, 2e-3)?;
    let shot = exp.stop(3e-3, StopOptions::default())?;
    let program = shot.clock_program("pulser_clock").unwrap();
    let ticks = line_ticks(program, "flag0")?;
    for t in [9e-4, 1.95e-3] {
        ensure!(ticks.iter().any(|&tick| close(tick, t)), "edge at {t} missing");
    }
    ensure!(shot.shutter_calibrations.len() == 1);
    ensure!(close(shot.shutter_calibrations[0].open_delay, 1e-4));

    let mut exp = Experiment::new();
    let card = single_line_rig(&mut exp, SPEC_10MHZ)?;
    let shutter = exp.new_shutter(card, "probe_shutter", "port0", (1e-4, 3e-4), true)?;
    exp.start()?;
    exp.open_shutter(shutter, 1e-3)?;
    exp.close_shutter(shutter, 1.1e-3)?;
    let err = exp.stop(3e-3, StopOptions::default()).unwrap_err();
    ensure!(err.kind == ErrorKind::ShutterRecovery, "got {err}");
    Ok(())
}

// A DDS delegates to its analog quantities and digital gate.
#[test]
fn dds_delegation() -> Result<()> {
    use shotline::{DdsOptions, DdsQuantityOptions};

    let mut exp = Experiment::new();
    let card = single_line_rig(&mut exp, SPEC_10MHZ)?;
    let dds = exp.new_dds(
        card,
        "rf0",
        "dds 0",
        DdsOptions {
            digital_gate: Some((card, "port3".to_string())),
            frequency: DdsQuantityOptions {
                limits: Some((0.0, 400e6)),
                ..Default::default()
            },
            ..Default::default()
        },
    )?;
    exp.start()?;
    exp.dds_setfreq(dds, 0.0, 80e6, None)?;
    exp.dds_setamp(dds, 0.0, 0.0, None)?;
    exp.dds_pulse(dds, 1e-3, 0.5e-3, 1.0, Some(100e6), None, None, None, None)?;
    let shot = exp.stop(2e-3, StopOptions::default())?;

    let freq = samples_f64(&shot, "rf0_freq")?;
    ensure!(freq[0] == 80e6 && freq.contains(&100e6), "got {freq:?}");
    let gate = samples_f64(&shot, "rf0_gate")?;
    ensure!(gate.contains(&1.0), "gate never opened: {gate:?}");
    let amp = samples_f64(&shot, "rf0_amp")?;
    ensure!(*amp.last().unwrap() == 0.0, "pulse did not revert amplitude");
    Ok(())
}

// Static outputs carry exactly one sample and reject a second value.
#[test]
fn static_outputs() -> Result<()> {
    let mut exp = Experiment::new();
    let card = single_line_rig(&mut exp, SPEC_10MHZ)?;
    let bias = exp.new_static_analog_out(card, "bias", "ao7", AnalogOutOptions::default())?;
    let en = exp.new_static_digital_out(card, "enable_line", "port5", false)?;
    exp.start()?;
    exp.set_static_value(bias, 2.5, None)?;
    exp.static_go_high(en)?;
    let err = exp.set_static_value(bias, 3.0, None).unwrap_err();
    ensure!(err.kind == ErrorKind::TimeClash, "got {err}");
    let shot = exp.stop(1e-3, StopOptions::default())?;
    ensure!(samples_f64(&shot, "bias")? == vec![2.5]);
    ensure!(samples_f64(&shot, "enable_line")? == vec![1.0]);
    Ok(())
}

// The wait monitor pulses at the start and at every wait, and its
// routing lands in the shot artifact.
#[test]
fn wait_monitor_routing() -> Result<()> {
    let mut exp = Experiment::new();
    let clock = exp.new_pseudoclock_device("pulser", SPEC_10MHZ)?;
    let pseudoclock = exp.new_pseudoclock(clock, "pulser_clock", "clock")?;
    let line = exp.new_clock_line(pseudoclock, "flag0", "flag 0", true)?;
    let card = exp.new_intermediate_device(line, "card0", None)?;
    let line1 = exp.new_clock_line(pseudoclock, "flag1", "flag 1", true)?;
    let daq = exp.new_intermediate_device(line1, "daq0", None)?;
    let _monitor = exp.new_wait_monitor(
        card,
        "wait_monitor",
        "port6",
        WaitMonitorOptions {
            acquisition_device: daq.device_id(),
            acquisition_connection: "Ctr0".to_string(),
            timeout_device: None,
            timeout_connection: None,
            timeout_trigger_type: TriggerEdge::Rising,
            minimum_pulse_width: 0.0,
        },
    )?;
    let d = exp.new_digital_out(card, "d", "port0", false)?;
    exp.start()?;
    exp.go_high(d, 1e-3)?;
    exp.wait("w", 2e-3, 5.0)?;
    let shot = exp.stop(3e-3, StopOptions::default())?;

    let info = shot.wait_monitor.as_ref().unwrap();
    ensure!(info.acquisition_device == "daq0");
    ensure!(info.acquisition_connection == "Ctr0");
    let monitor_samples = samples_f64(&shot, "wait_monitor")?;
    // Two pulses: the initial trigger and the wait.
    let rising = monitor_samples
        .windows(2)
        .filter(|w| w[0] == 0.0 && w[1] == 1.0)
        .count()
        + usize::from(monitor_samples[0] == 1.0);
    ensure!(rising == 2, "got {monitor_samples:?}");
    Ok(())
}

// The connection table is sorted, carries kinds and ports, and names
// the master pseudoclock.
#[test]
fn connection_table_contents() -> Result<()> {
    let mut exp = Experiment::new();
    let card = single_line_rig(&mut exp, SPEC_10MHZ)?;
    exp.new_digital_out(card, "zeta", "port0", true)?;
    exp.set_hardware_connection(card, "PXI1Slot2");
    exp.set_start_order(card, 1);
    exp.start()?;
    let shot = exp.stop(1e-3, StopOptions::default())?;

    ensure!(shot.master_pseudoclock.as_deref() == Some("pulser"));
    let names: Vec<&str> = shot.connection_table.iter().map(|r| r.name.as_str()).collect();
    let mut sorted = names.clone();
    sorted.sort();
    ensure!(names == sorted, "table not sorted: {names:?}");
    let zeta = shot
        .connection_table
        .iter()
        .find(|r| r.name == "zeta")
        .unwrap();
    ensure!(zeta.kind == "DigitalOut");
    ensure!(zeta.parent == "card0");
    ensure!(zeta.parent_port == "port0");
    ensure!(zeta.properties.contains("\"inverted\":true"));
    let card_row = shot
        .connection_table
        .iter()
        .find(|r| r.name == "card0")
        .unwrap();
    ensure!(card_row.hardware_connection == "PXI1Slot2");
    let card_props = shot
        .device_properties
        .iter()
        .find(|p| p.name == "card0")
        .unwrap();
    ensure!(card_props.start_order == Some(1));
    ensure!(card_props.stop_order == Some(0));
    Ok(())
}

// Start/stop orders on devices without a hardware connection fail.
#[test]
fn orders_require_hardware_connection() -> Result<()> {
    let mut exp = Experiment::new();
    let card = single_line_rig(&mut exp, SPEC_10MHZ)?;
    let d = exp.new_digital_out(card, "d", "port0", false)?;
    exp.set_stop_order(d, 2);
    exp.start()?;
    let err = exp.stop(1e-3, StopOptions::default()).unwrap_err();
    ensure!(err.kind == ErrorKind::NotStartable, "got {err}");
    Ok(())
}
