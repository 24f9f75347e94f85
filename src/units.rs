//! Unit conversion between calibrated engineering units and an output's
//! base unit.
//!
//! A calibration is a named set of derived units, each carrying a pair
//! of pure conversion closures. Instruction values given in a derived
//! unit are converted to base units on entry; nothing downstream of the
//! instruction map ever sees engineering units.

use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use crate::errors::{seq_err, Result};

type UnitFn = Rc<dyn Fn(f64) -> f64>;

#[derive(Clone)]
struct UnitPair {
    to_base: Option<UnitFn>,
    from_base: Option<UnitFn>,
}

/// A validated bidirectional mapping between derived units and base
/// units. Built with [`CalibrationBuilder`]; construction fails unless
/// every declared unit carries both conversion directions.
#[derive(Clone)]
pub struct Calibration {
    class_name: String,
    units: BTreeMap<String, (UnitFn, UnitFn)>,
}

impl Calibration {
    pub fn builder(class_name: impl Into<String>) -> CalibrationBuilder {
        CalibrationBuilder {
            class_name: class_name.into(),
            units: BTreeMap::new(),
        }
    }

    /// Qualified name of the calibration, recorded in the connection
    /// table so the runtime can reinstantiate it.
    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn derived_units(&self) -> impl Iterator<Item = &str> {
        self.units.keys().map(|s| s.as_str())
    }

    pub fn has_unit(&self, unit: &str) -> bool {
        self.units.contains_key(unit)
    }

    /// Convert `value` in `unit` to base units.
    pub fn to_base(&self, unit: &str, value: f64) -> Result<f64> {
        match self.units.get(unit) {
            Some((to_base, _)) => Ok(to_base(value)),
            None => seq_err!(
                UnknownUnits,
                "units '{unit}' do not exist within the calibration '{}'",
                self.class_name
            ),
        }
    }

    /// Convert `value` in base units back to `unit`.
    pub fn from_base(&self, unit: &str, value: f64) -> Result<f64> {
        match self.units.get(unit) {
            Some((_, from_base)) => Ok(from_base(value)),
            None => seq_err!(
                UnknownUnits,
                "units '{unit}' do not exist within the calibration '{}'",
                self.class_name
            ),
        }
    }
}

impl fmt::Debug for Calibration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Calibration")
            .field("class_name", &self.class_name)
            .field("units", &self.units.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Builder for [`Calibration`]. Units may be declared in any order and
/// the two directions registered separately, mirroring how calibration
/// classes define `<unit>_to_base` / `<unit>_from_base` pairs.
pub struct CalibrationBuilder {
    class_name: String,
    units: BTreeMap<String, UnitPair>,
}

impl CalibrationBuilder {
    /// Register a derived unit with both conversion directions at once.
    pub fn unit(
        mut self,
        name: impl Into<String>,
        to_base: impl Fn(f64) -> f64 + 'static,
        from_base: impl Fn(f64) -> f64 + 'static,
    ) -> Self {
        self.units.insert(
            name.into(),
            UnitPair {
                to_base: Some(Rc::new(to_base)),
                from_base: Some(Rc::new(from_base)),
            },
        );
        self
    }

    /// Declare a derived unit without conversions yet.
    pub fn declare_unit(mut self, name: impl Into<String>) -> Self {
        self.units.entry(name.into()).or_insert(UnitPair {
            to_base: None,
            from_base: None,
        });
        self
    }

    pub fn to_base_fn(mut self, name: &str, f: impl Fn(f64) -> f64 + 'static) -> Self {
        self.units
            .entry(name.to_string())
            .or_insert(UnitPair {
                to_base: None,
                from_base: None,
            })
            .to_base = Some(Rc::new(f));
        self
    }

    pub fn from_base_fn(mut self, name: &str, f: impl Fn(f64) -> f64 + 'static) -> Self {
        self.units
            .entry(name.to_string())
            .or_insert(UnitPair {
                to_base: None,
                from_base: None,
            })
            .from_base = Some(Rc::new(f));
        self
    }

    pub fn build(self) -> Result<Calibration> {
        let mut units = BTreeMap::new();
        for (name, pair) in self.units {
            let to_base = match pair.to_base {
                Some(f) => f,
                None => seq_err!(
                    BadCalibration,
                    "the conversion '{name}_to_base' does not exist within the calibration '{}'",
                    self.class_name
                ),
            };
            let from_base = match pair.from_base {
                Some(f) => f,
                None => seq_err!(
                    BadCalibration,
                    "the conversion '{name}_from_base' does not exist within the calibration '{}'",
                    self.class_name
                ),
            };
            units.insert(name, (to_base, from_base));
        }
        Ok(Calibration {
            class_name: self.class_name,
            units,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;

    #[test]
    fn round_trip_within_tolerance() {
        let cal = Calibration::builder("optics.PowerCal")
            .unit("mW", |x| x / 12.5, |x| x * 12.5)
            .unit("dBm", |x| 10f64.powf(x / 10.0) / 12.5, |x| 10.0 * (12.5 * x).log10())
            .build()
            .unwrap();
        for x in [0.3, 1.0, 7.75] {
            let b = cal.to_base("mW", x).unwrap();
            assert!((cal.from_base("mW", b).unwrap() - x).abs() < 1e-12);
            let b = cal.to_base("dBm", x).unwrap();
            assert!((cal.from_base("dBm", b).unwrap() - x).abs() < 1e-9);
        }
    }

    #[test]
    fn missing_direction_is_rejected() {
        let err = Calibration::builder("broken")
            .declare_unit("A")
            .to_base_fn("A", |x| x)
            .build()
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::BadCalibration);
    }

    #[test]
    fn unknown_units_are_rejected() {
        let cal = Calibration::builder("c")
            .unit("V", |x| x, |x| x)
            .build()
            .unwrap();
        let err = cal.to_base("W", 1.0).unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnknownUnits);
    }
}
