//! Vehicle Registry Module
//!
//! Holds the vehicles bound to the logged-in account. The list is fetched
//! once per session and replaced wholesale on the next login.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::auth::Session;
use crate::sync::{lenient, ApiError, TelematicsApi};

/// A vehicle as reported by the device platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vehicle {
    pub vin: String,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub plate_no: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub series_name: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub color_code: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub tbox_platform: Option<String>,
}

impl Vehicle {
    /// Human readable name: plate number, falling back to the VIN.
    pub fn display_name(&self) -> &str {
        self.plate_no
            .as_deref()
            .filter(|p| !p.is_empty())
            .unwrap_or(&self.vin)
    }
}

/// Session-scoped set of known vehicles, unique by VIN
#[derive(Debug, Default)]
pub struct VehicleRegistry {
    vehicles: Vec<Vehicle>,
}

impl VehicleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the vehicle list for `session` and replace the known set.
    ///
    /// On error, or when the account has no vehicles, the previous set is
    /// left untouched.
    pub async fn refresh<A>(&mut self, api: &A, session: &Session) -> Result<usize, ApiError>
    where
        A: TelematicsApi + ?Sized,
    {
        let listed = api.list_vehicles(session).await?;
        debug!("Vehicle list returned {} entries", listed.len());
        self.replace(listed)?;
        info!("Registered {} vehicle(s)", self.vehicles.len());
        Ok(self.vehicles.len())
    }

    /// Replace the known set, dropping duplicate VINs (first entry wins).
    pub fn replace(&mut self, listed: Vec<Vehicle>) -> Result<(), ApiError> {
        let mut seen = HashSet::new();
        let mut vehicles = Vec::with_capacity(listed.len());
        for vehicle in listed {
            if vehicle.vin.is_empty() {
                warn!("Skipping vehicle entry without a VIN");
                continue;
            }
            if seen.insert(vehicle.vin.clone()) {
                vehicles.push(vehicle);
            } else {
                warn!("Duplicate VIN in vehicle list: {}", vehicle.vin);
            }
        }

        if vehicles.is_empty() {
            return Err(ApiError::VehicleList("account has no vehicles".into()));
        }
        self.vehicles = vehicles;
        Ok(())
    }

    pub fn vehicles(&self) -> &[Vehicle] {
        &self.vehicles
    }

    pub fn get(&self, vin: &str) -> Option<&Vehicle> {
        self.vehicles.iter().find(|v| v.vin == vin)
    }

    pub fn contains(&self, vin: &str) -> bool {
        self.get(vin).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.vehicles.is_empty()
    }

    pub fn len(&self) -> usize {
        self.vehicles.len()
    }

    pub fn clear(&mut self) {
        self.vehicles.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vehicle(vin: &str) -> Vehicle {
        Vehicle {
            vin: vin.to_string(),
            plate_no: Some(format!("PLATE-{}", vin)),
            series_name: Some("01".into()),
            color_code: None,
            tbox_platform: None,
        }
    }

    #[test]
    fn test_vehicle_deserializes_from_platform_json() {
        let json = r#"{
            "vin": "L6T0000000000001",
            "plateNo": "ZJ-A1234",
            "seriesName": "Lynk 01",
            "colorCode": "BLK",
            "tboxPlatform": 3,
            "unrelated": 7
        }"#;
        let v: Vehicle = serde_json::from_str(json).unwrap();
        assert_eq!(v.vin, "L6T0000000000001");
        assert_eq!(v.plate_no.as_deref(), Some("ZJ-A1234"));
        assert_eq!(v.series_name.as_deref(), Some("Lynk 01"));
        assert_eq!(v.color_code.as_deref(), Some("BLK"));
        assert_eq!(v.tbox_platform.as_deref(), Some("3"));
    }

    #[test]
    fn test_display_name_falls_back_to_vin() {
        let mut v = vehicle("VIN1");
        assert_eq!(v.display_name(), "PLATE-VIN1");
        v.plate_no = Some(String::new());
        assert_eq!(v.display_name(), "VIN1");
        v.plate_no = None;
        assert_eq!(v.display_name(), "VIN1");
    }

    #[test]
    fn test_replace_drops_duplicates_and_blank_vins() {
        let mut registry = VehicleRegistry::new();
        let mut dup = vehicle("VIN1");
        dup.plate_no = Some("OTHER".into());
        registry
            .replace(vec![vehicle("VIN1"), vehicle(""), dup, vehicle("VIN2")])
            .unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get("VIN1").unwrap().plate_no.as_deref(), Some("PLATE-VIN1"));
        assert!(registry.contains("VIN2"));
    }

    #[test]
    fn test_empty_list_keeps_previous_set() {
        let mut registry = VehicleRegistry::new();
        registry.replace(vec![vehicle("VIN1")]).unwrap();

        let err = registry.replace(Vec::new()).unwrap_err();
        assert!(matches!(err, ApiError::VehicleList(_)));
        assert_eq!(registry.len(), 1);
        assert!(registry.contains("VIN1"));
    }
}
