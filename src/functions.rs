//! Waveform shapes carried by ramp instructions.
//!
//! A ramp instruction stores one of these variants together with its
//! timing metadata; the scheduler later samples it at the midpoints of
//! the generated clock ticks. Every variant is a pure function of the
//! time elapsed since the ramp began.

use std::fmt;
use std::rc::Rc;

/// A pure map from relative time (seconds since the ramp's start) to an
/// output value in base units.
#[derive(Clone)]
pub enum Waveform {
    /// `f(t) = initial + (final - initial) * t / duration`
    Ramp {
        duration: f64,
        initial: f64,
        final_value: f64,
    },
    /// `f(t) = amplitude * sin(angfreq * t + phase) + dc_offset`
    Sine {
        amplitude: f64,
        angfreq: f64,
        phase: f64,
        dc_offset: f64,
    },
    /// Half period of a squared sine:
    /// `f(t) = (final - initial) * sin(pi*t/(2*duration))^2 + initial`
    SineRamp {
        duration: f64,
        initial: f64,
        final_value: f64,
    },
    /// Half period of a quartic sine:
    /// `f(t) = (final - initial) * sin(pi*t/(2*duration))^4 + initial`
    Sine4Ramp {
        duration: f64,
        initial: f64,
        final_value: f64,
    },
    /// Complement of [`Waveform::Sine4Ramp`], steep side first:
    /// `f(t) = (final - initial) * (1 - sin(pi*(duration-t)/(2*duration))^4) + initial`
    Sine4ReverseRamp {
        duration: f64,
        initial: f64,
        final_value: f64,
    },
    /// Exponential approach whose rate is fixed by the asymptote `zero`:
    /// `f(t) = (initial - zero) * exp(-rate*t) + zero` with
    /// `rate = ln((initial-zero)/(final-zero)) / duration`.
    ExpRamp {
        duration: f64,
        initial: f64,
        final_value: f64,
        zero: f64,
    },
    /// Exponential approach with an explicit 1/e time. The asymptote is
    /// derived so that the ramp passes through `initial` at t=0 and
    /// `final` at t=duration.
    ExpRampT {
        duration: f64,
        initial: f64,
        final_value: f64,
        time_constant: f64,
    },
    /// Second derivative follows one period of a triangle wave, giving
    /// smooth acceleration in thirds of the duration.
    PiecewiseAccel {
        duration: f64,
        initial: f64,
        final_value: f64,
    },
    /// Two-level wave with phase expressed as a fraction of a cycle.
    /// Output is `level_0` while the wrapped phase is below `duty_cycle`.
    SquareWave {
        level_0: f64,
        level_1: f64,
        frequency: f64,
        phase: f64,
        duty_cycle: f64,
    },
    /// A `(time, value)` sequence repeated with the given period. Times
    /// are relative to the start of each cycle; between entries the
    /// previous value holds, and wrapped times before the first entry
    /// hold the chronologically last entry's value.
    PulseSequence {
        sequence: Vec<(f64, f64)>,
        period: f64,
    },
    /// User-supplied closure of relative time.
    Custom {
        name: String,
        func: Rc<dyn Fn(f64) -> f64>,
    },
}

impl Waveform {
    /// Evaluate the waveform at relative time `t`.
    pub fn sample(&self, t: f64) -> f64 {
        use std::f64::consts::PI;
        match self {
            Waveform::Ramp {
                duration,
                initial,
                final_value,
            } => initial + (final_value - initial) * t / duration,
            Waveform::Sine {
                amplitude,
                angfreq,
                phase,
                dc_offset,
            } => amplitude * (angfreq * t + phase).sin() + dc_offset,
            Waveform::SineRamp {
                duration,
                initial,
                final_value,
            } => {
                let s = (PI * t / (2.0 * duration)).sin();
                (final_value - initial) * s * s + initial
            }
            Waveform::Sine4Ramp {
                duration,
                initial,
                final_value,
            } => {
                let s = (PI * t / (2.0 * duration)).sin();
                (final_value - initial) * s.powi(4) + initial
            }
            Waveform::Sine4ReverseRamp {
                duration,
                initial,
                final_value,
            } => {
                let s = (PI * (duration - t) / (2.0 * duration)).sin();
                (final_value - initial) * (1.0 - s.powi(4)) + initial
            }
            Waveform::ExpRamp {
                duration,
                initial,
                final_value,
                zero,
            } => {
                let rate = ((initial - zero) / (final_value - zero)).ln() / duration;
                (initial - zero) * (-rate * t).exp() + zero
            }
            Waveform::ExpRampT {
                duration,
                initial,
                final_value,
                time_constant,
            } => {
                let decay = (-duration / time_constant).exp();
                let zero = (final_value - initial * decay) / (1.0 - decay);
                (initial - zero) * (-t / time_constant).exp() + zero
            }
            Waveform::PiecewiseAccel {
                duration,
                initial,
                final_value,
            } => {
                let x = t / duration;
                let shape = if x < 1.0 / 3.0 {
                    4.5 * x.powi(3)
                } else if x < 2.0 / 3.0 {
                    -9.0 * x.powi(3) + 13.5 * x * x - 4.5 * x + 0.5
                } else {
                    4.5 * x.powi(3) - 13.5 * x * x + 13.5 * x - 3.5
                };
                initial + (final_value - initial) * shape
            }
            Waveform::SquareWave {
                level_0,
                level_1,
                frequency,
                phase,
                duty_cycle,
            } => {
                // Wrapped phase in [0, 1). Rounded to a nanocycle so
                // that tick times sitting on an edge within float noise
                // land on the intended side.
                let mut p = (frequency * t + phase).rem_euclid(1.0);
                p = (p * 1e9).round() / 1e9;
                if p >= 1.0 {
                    p -= 1.0;
                }
                if p < *duty_cycle {
                    *level_0
                } else {
                    *level_1
                }
            }
            Waveform::PulseSequence { sequence, period } => {
                let tw = t.rem_euclid(*period);
                let mut value = match sequence.last() {
                    Some(&(_, v)) => v,
                    None => 0.0,
                };
                for &(edge, state) in sequence {
                    if tw >= edge {
                        value = state;
                    } else {
                        break;
                    }
                }
                value
            }
            Waveform::Custom { func, .. } => func(t),
        }
    }
}

impl fmt::Debug for Waveform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Waveform::Ramp { .. } => f.write_str("Ramp"),
            Waveform::Sine { .. } => f.write_str("Sine"),
            Waveform::SineRamp { .. } => f.write_str("SineRamp"),
            Waveform::Sine4Ramp { .. } => f.write_str("Sine4Ramp"),
            Waveform::Sine4ReverseRamp { .. } => f.write_str("Sine4ReverseRamp"),
            Waveform::ExpRamp { .. } => f.write_str("ExpRamp"),
            Waveform::ExpRampT { .. } => f.write_str("ExpRampT"),
            Waveform::PiecewiseAccel { .. } => f.write_str("PiecewiseAccel"),
            Waveform::SquareWave { .. } => f.write_str("SquareWave"),
            Waveform::PulseSequence { .. } => f.write_str("PulseSequence"),
            Waveform::Custom { name, .. } => write!(f, "Custom({name})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn linear_ramp_endpoints() {
        let w = Waveform::Ramp {
            duration: 2.0,
            initial: 1.0,
            final_value: 5.0,
        };
        assert!(close(w.sample(0.0), 1.0));
        assert!(close(w.sample(1.0), 3.0));
        assert!(close(w.sample(2.0), 5.0));
    }

    #[test]
    fn sine_ramp_family_endpoints() {
        for w in [
            Waveform::SineRamp {
                duration: 1.0,
                initial: -1.0,
                final_value: 3.0,
            },
            Waveform::Sine4Ramp {
                duration: 1.0,
                initial: -1.0,
                final_value: 3.0,
            },
            Waveform::Sine4ReverseRamp {
                duration: 1.0,
                initial: -1.0,
                final_value: 3.0,
            },
        ] {
            assert!(close(w.sample(0.0), -1.0), "{w:?} start");
            assert!(close(w.sample(1.0), 3.0), "{w:?} end");
        }
    }

    #[test]
    fn exp_ramps_hit_endpoints() {
        let w = Waveform::ExpRamp {
            duration: 1.0,
            initial: 10.0,
            final_value: 1.0,
            zero: 0.0,
        };
        assert!(close(w.sample(0.0), 10.0));
        assert!(close(w.sample(1.0), 1.0));

        let w = Waveform::ExpRampT {
            duration: 1.0,
            initial: 10.0,
            final_value: 1.0,
            time_constant: 0.3,
        };
        assert!(close(w.sample(0.0), 10.0));
        assert!(close(w.sample(1.0), 1.0));
    }

    #[test]
    fn piecewise_accel_endpoints_and_midpoint() {
        let w = Waveform::PiecewiseAccel {
            duration: 1.0,
            initial: 0.0,
            final_value: 2.0,
        };
        assert!(close(w.sample(0.0), 0.0));
        assert!(close(w.sample(0.5), 1.0));
        assert!(close(w.sample(1.0), 2.0));
    }

    #[test]
    fn square_wave_levels_and_phase() {
        let w = Waveform::SquareWave {
            level_0: 1.0,
            level_1: -1.0,
            frequency: 10.0,
            phase: 0.0,
            duty_cycle: 0.25,
        };
        assert_eq!(w.sample(0.0), 1.0);
        assert_eq!(w.sample(0.020), 1.0); // 0.2 cycles
        assert_eq!(w.sample(0.030), -1.0); // 0.3 cycles
        assert_eq!(w.sample(0.100), 1.0); // wrapped
    }

    #[test]
    fn pulse_sequence_wraps_and_holds() {
        let w = Waveform::PulseSequence {
            sequence: vec![(0.1, 1.0), (0.3, 0.0)],
            period: 0.5,
        };
        // Before the first edge of a cycle the last state holds over.
        assert_eq!(w.sample(0.0), 0.0);
        assert_eq!(w.sample(0.2), 1.0);
        assert_eq!(w.sample(0.4), 0.0);
        // Second cycle.
        assert_eq!(w.sample(0.7), 1.0);
        // Partial final cycle samples the same shape.
        assert_eq!(w.sample(1.05), 0.0);
    }
}
