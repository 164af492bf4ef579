//! Telemetry Module
//!
//! Per-vehicle status as returned by the telematics service, the snapshot
//! published after every successful poll, and typed views over the raw
//! status tree.

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::auth::Session;
use crate::registry::Vehicle;
use crate::sync::{ApiError, TelematicsApi};

/// Current status of one vehicle, with its static metadata merged in
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VehicleStatus {
    pub vin: String,
    pub vehicle: Vehicle,
    /// Raw `data` object from the status endpoint, including the merged
    /// `plateNo`, `seriesName`, `colorCode` and `tboxPlatform` keys.
    pub data: Value,
}

impl VehicleStatus {
    /// Merge vehicle metadata into a raw status payload.
    pub fn merge(vehicle: &Vehicle, data: Value) -> Result<Self, ApiError> {
        let Value::Object(mut map) = data else {
            return Err(ApiError::StatusFetch {
                vin: vehicle.vin.clone(),
                reason: "status payload is not an object".into(),
            });
        };

        insert_opt(&mut map, "plateNo", &vehicle.plate_no);
        insert_opt(&mut map, "seriesName", &vehicle.series_name);
        insert_opt(&mut map, "colorCode", &vehicle.color_code);
        insert_opt(&mut map, "tboxPlatform", &vehicle.tbox_platform);

        Ok(Self {
            vin: vehicle.vin.clone(),
            vehicle: vehicle.clone(),
            data: Value::Object(map),
        })
    }

    /// Look up a value in the status tree by JSON pointer
    pub fn get(&self, pointer: &str) -> Option<&Value> {
        self.data.pointer(pointer)
    }

    /// Typed view of the fields the presentation layer cares about
    pub fn summary(&self) -> StatusSummary {
        StatusSummary {
            engine_running: engine_running(&self.data),
            doors_locked: doors_locked(&self.data),
            battery_state_of_charge: self
                .get(MAIN_BATTERY)
                .and_then(|b| number(b.get("stateOfCharge"))),
            battery_voltage: self
                .get(MAIN_BATTERY)
                .and_then(|b| number(b.get("voltage"))),
            ecu_warnings: self
                .get(ECU_WARNINGS)
                .and_then(Value::as_array)
                .map_or(0, Vec::len),
            tyre_pre_warning: tyre_pre_warning(&self.data),
        }
    }
}

fn insert_opt(map: &mut Map<String, Value>, key: &str, value: &Option<String>) {
    let value = value.clone().map_or(Value::Null, Value::String);
    map.insert(key.to_string(), value);
}

const ENGINE_STATUS: &str = "/vehicleStatus/basicVehicleStatus/engineStatus";
const MAIN_BATTERY: &str =
    "/vehicleStatus/additionalVehicleStatus/maintenanceStatus/mainBatteryStatus";
const ECU_WARNINGS: &str = "/vehicleStatus/additionalVehicleStatus/ecuWarningMessages";

const DOOR_LOCKS: [&str; 4] = [
    "/vehicleStatus/additionalVehicleStatus/drivingSafetyStatus/doorLockStatusDriver",
    "/vehicleStatus/additionalVehicleStatus/drivingSafetyStatus/doorLockStatusPassenger",
    "/vehicleStatus/additionalVehicleStatus/drivingSafetyStatus/doorLockStatusDriverRear",
    "/vehicleStatus/additionalVehicleStatus/drivingSafetyStatus/doorLockStatusPassengerRear",
];

const TYRE_PRE_WARNINGS: [&str; 4] = [
    "/vehicleStatus/additionalVehicleStatus/maintenanceStatus/tyrePreWarningDriver",
    "/vehicleStatus/additionalVehicleStatus/maintenanceStatus/tyrePreWarningPassenger",
    "/vehicleStatus/additionalVehicleStatus/maintenanceStatus/tyrePreWarningDriverRear",
    "/vehicleStatus/additionalVehicleStatus/maintenanceStatus/tyrePreWarningPassengerRear",
];

/// Derived, display-ready view of a [`VehicleStatus`]
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSummary {
    pub engine_running: Option<bool>,
    /// `Some(false)` as soon as any reported door lock reads unlocked.
    pub doors_locked: Option<bool>,
    pub battery_state_of_charge: Option<f64>,
    pub battery_voltage: Option<f64>,
    pub ecu_warnings: usize,
    pub tyre_pre_warning: Option<bool>,
}

fn number(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn engine_running(data: &Value) -> Option<bool> {
    match data.pointer(ENGINE_STATUS)?.as_str()? {
        "ENGINE_OFF" => Some(false),
        "ENGINE_RUNNING" | "ENGINE_ON" => Some(true),
        _ => None,
    }
}

/// Numeric values present at `pointers`, skipping absent or non-numeric ones
fn readings(data: &Value, pointers: &[&str]) -> Vec<f64> {
    pointers
        .iter()
        .filter_map(|pointer| number(data.pointer(pointer)))
        .collect()
}

// Door locks read 0 when unlocked.
fn doors_locked(data: &Value) -> Option<bool> {
    let locks = readings(data, &DOOR_LOCKS);
    (!locks.is_empty()).then(|| locks.iter().all(|state| *state != 0.0))
}

// Pre-warnings read 1 when a tyre needs attention.
fn tyre_pre_warning(data: &Value) -> Option<bool> {
    let flags = readings(data, &TYRE_PRE_WARNINGS);
    (!flags.is_empty()).then(|| flags.iter().any(|flag| *flag == 1.0))
}

/// Latest published poll result, in vehicle registry order
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Snapshot {
    pub vehicles: Vec<VehicleStatus>,
}

impl Snapshot {
    pub fn get(&self, vin: &str) -> Option<&VehicleStatus> {
        self.vehicles.iter().find(|s| s.vin == vin)
    }

    pub fn vins(&self) -> impl Iterator<Item = &str> {
        self.vehicles.iter().map(|s| s.vin.as_str())
    }

    pub fn len(&self) -> usize {
        self.vehicles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vehicles.is_empty()
    }
}

/// Fetch status for every vehicle, in order.
///
/// Stops at the first failing vehicle and discards the partial batch.
pub async fn fetch_all<A>(
    api: &A,
    session: &Session,
    vehicles: &[Vehicle],
) -> Result<Snapshot, ApiError>
where
    A: TelematicsApi + ?Sized,
{
    let mut statuses = Vec::with_capacity(vehicles.len());
    for vehicle in vehicles {
        let data = api.fetch_status(session, &vehicle.vin).await.map_err(|e| {
            warn!("Status fetch failed for {}: {}", vehicle.vin, e);
            e
        })?;
        statuses.push(VehicleStatus::merge(vehicle, data)?);
        debug!("Fetched status for {}", vehicle.vin);
    }

    Ok(Snapshot { vehicles: statuses })
}
