use crate::error::DiscoveryError;
use crate::forecast::{ForecastUnit, ParamSet};
use crate::source::DeviceDirectory;
use crate::telemetry::device_id_from_name;
use std::collections::BTreeMap;

/// Owns exactly one forecast unit per discovered temperature sensor.
#[derive(Debug)]
pub struct SensorRegistry {
    params: ParamSet,
    units: BTreeMap<String, ForecastUnit>,
}

impl SensorRegistry {
    pub fn new(params: ParamSet) -> Self {
        Self {
            params,
            units: BTreeMap::new(),
        }
    }

    /// Lists devices and registers every temperature sensor. Returns the sensor ids found.
    pub async fn discover(
        &mut self,
        directory: &dyn DeviceDirectory,
    ) -> Result<Vec<String>, DiscoveryError> {
        let devices = directory.list_devices().await?;
        let total = devices.len();
        let mut found = Vec::new();
        for device in devices.iter().filter(|device| device.is_temperature()) {
            let sensor_id = device_id_from_name(&device.name);
            if sensor_id.is_empty() {
                tracing::warn!(name = %device.name, "skipping device with empty name");
                continue;
            }
            self.register(sensor_id);
            if !found.iter().any(|id| id == sensor_id) {
                found.push(sensor_id.to_string());
            }
        }

        if found.is_empty() {
            return Err(DiscoveryError::NoSensors {
                scope: format!("{total} listed devices"),
            });
        }
        tracing::info!(sensors = found.len(), devices = total, "sensor discovery complete");
        for sensor_id in &found {
            tracing::info!(sensor = %sensor_id, "forecast unit ready");
        }
        Ok(found)
    }

    /// Creates a unit for `sensor_id` unless one exists. Returns whether one was created.
    pub fn register(&mut self, sensor_id: &str) -> bool {
        if self.units.contains_key(sensor_id) {
            return false;
        }
        let params = self.params.for_sensor(sensor_id);
        self.units
            .insert(sensor_id.to_string(), ForecastUnit::new(sensor_id, params));
        true
    }

    pub fn unit(&self, sensor_id: &str) -> Option<&ForecastUnit> {
        self.units.get(sensor_id)
    }

    pub fn unit_mut(&mut self, sensor_id: &str) -> Option<&mut ForecastUnit> {
        self.units.get_mut(sensor_id)
    }

    pub fn sensor_ids(&self) -> Vec<String> {
        self.units.keys().cloned().collect()
    }

    pub fn units(&self) -> impl Iterator<Item = &ForecastUnit> {
        self.units.values()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn close_all(&mut self) {
        for unit in self.units.values_mut() {
            unit.close();
        }
    }
}
