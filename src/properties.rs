//! Per-device property maps and their serialisation.
//!
//! Every device carries three property maps distinguished by where the
//! runtime consumes them: `device_properties` travel with the compiled
//! shot, `connection_table_properties` are part of the connection table
//! row used to validate the lab's wiring, and
//! `unit_conversion_parameters` parameterise the calibration class when
//! the runtime reinstantiates it.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::errors::{seq_err, Result};

/// Which of the three property maps a value is stored in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyLocation {
    DeviceProperties,
    ConnectionTableProperties,
    UnitConversionParameters,
}

pub type PropertyMap = BTreeMap<String, Value>;

#[derive(Debug, Clone, Default)]
pub struct Properties {
    pub device_properties: PropertyMap,
    pub connection_table_properties: PropertyMap,
    pub unit_conversion_parameters: PropertyMap,
}

impl Properties {
    pub fn map(&self, location: PropertyLocation) -> &PropertyMap {
        match location {
            PropertyLocation::DeviceProperties => &self.device_properties,
            PropertyLocation::ConnectionTableProperties => &self.connection_table_properties,
            PropertyLocation::UnitConversionParameters => &self.unit_conversion_parameters,
        }
    }

    pub fn map_mut(&mut self, location: PropertyLocation) -> &mut PropertyMap {
        match location {
            PropertyLocation::DeviceProperties => &mut self.device_properties,
            PropertyLocation::ConnectionTableProperties => &mut self.connection_table_properties,
            PropertyLocation::UnitConversionParameters => &mut self.unit_conversion_parameters,
        }
    }

    /// Set a property, refusing to silently overwrite unless asked.
    pub fn set(
        &mut self,
        device_name: &str,
        name: &str,
        value: Value,
        location: PropertyLocation,
        overwrite: bool,
    ) -> Result<()> {
        let map = self.map_mut(location);
        if !overwrite && map.contains_key(name) {
            seq_err!(
                NameClash,
                "device {device_name} already has a property '{name}' in {location:?}; \
                 pass overwrite to replace it"
            );
        }
        map.insert(name.to_string(), value);
        Ok(())
    }
}

/// JSON text of a property map, as stored in connection table rows.
pub fn serialise(map: &PropertyMap) -> String {
    serde_json::to_string(map).unwrap_or_else(|_| "{}".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn overwrite_guard() {
        let mut p = Properties::default();
        p.set(
            "dev",
            "gain",
            json!(2.0),
            PropertyLocation::DeviceProperties,
            false,
        )
        .unwrap();
        assert!(p
            .set(
                "dev",
                "gain",
                json!(3.0),
                PropertyLocation::DeviceProperties,
                false,
            )
            .is_err());
        p.set(
            "dev",
            "gain",
            json!(3.0),
            PropertyLocation::DeviceProperties,
            true,
        )
        .unwrap();
        assert_eq!(p.device_properties["gain"], json!(3.0));
    }

    #[test]
    fn serialisation_is_sorted_json() {
        let mut p = Properties::default();
        p.set(
            "dev",
            "b",
            json!(1),
            PropertyLocation::UnitConversionParameters,
            false,
        )
        .unwrap();
        p.set(
            "dev",
            "a",
            json!(true),
            PropertyLocation::UnitConversionParameters,
            false,
        )
        .unwrap();
        assert_eq!(
            serialise(&p.unit_conversion_parameters),
            r#"{"a":true,"b":1}"#
        );
    }
}
