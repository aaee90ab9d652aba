//! Read-side queries over the queue collections.
//!
//! Everything here is a pure function of the records passed in and is
//! recomputed on every read.

use std::collections::BTreeSet;

use chrono::{DateTime, TimeZone};

use crate::models::{CrewMember, Service, ServicePackage, Vehicle, VehicleBase, VehicleStatus};

pub const UNKNOWN_SERVICE: &str = "Unknown service";
pub const UNKNOWN_PACKAGE: &str = "Unknown package";
pub const UNKNOWN_CREW: &str = "Unknown crew";

/// Crew assigned to another `in-progress` vehicle created on `now`'s
/// calendar day (in `now`'s time zone).
///
/// Jobs left `in-progress` from a previous day do not keep their crew busy.
pub fn busy_crew<'a, Tz: TimeZone>(
    vehicles: impl IntoIterator<Item = &'a VehicleBase>,
    exclude_id: Option<&str>,
    now: &DateTime<Tz>,
) -> BTreeSet<String> {
    let today = now.date_naive();
    let tz = now.timezone();
    vehicles
        .into_iter()
        .filter(|v| !v.is_deleted && v.status == VehicleStatus::InProgress)
        .filter(|v| exclude_id != Some(v.id.as_str()))
        .filter(|v| v.created_at.with_timezone(&tz).date_naive() == today)
        .flat_map(|v| v.crew.iter().cloned())
        .collect()
}

/// 1-based rank of a waiting vehicle among waiting peers of the same kind,
/// by `created_at`. `None` unless `vehicle` is waiting.
pub fn queue_position<V: Vehicle>(vehicles: &[V], vehicle: &V) -> Option<usize> {
    let base = vehicle.base();
    if base.status != VehicleStatus::Waiting || base.is_deleted {
        return None;
    }
    let ahead = vehicles
        .iter()
        .map(Vehicle::base)
        .filter(|other| other.id != base.id)
        .filter(|other| other.status == VehicleStatus::Waiting && !other.is_deleted)
        .filter(|other| other.created_at < base.created_at)
        .count();
    Some(ahead + 1)
}

/// Waiting vehicles in queue order.
pub fn waiting_in_order<V: Vehicle>(vehicles: &[V]) -> Vec<&V> {
    let mut waiting: Vec<&V> = vehicles
        .iter()
        .filter(|v| v.status() == VehicleStatus::Waiting && !v.base().is_deleted)
        .collect();
    waiting.sort_by_key(|v| v.base().created_at);
    waiting
}

// ---------------------------------------------------------------------------
// Name lookups
// ---------------------------------------------------------------------------

pub fn service_name(services: &[Service], id: &str) -> String {
    services
        .iter()
        .find(|s| s.id == id)
        .map(|s| s.name.clone())
        .unwrap_or_else(|| UNKNOWN_SERVICE.to_string())
}

pub fn package_name(packages: &[ServicePackage], id: &str) -> String {
    packages
        .iter()
        .find(|p| p.id == id)
        .map(|p| p.name.clone())
        .unwrap_or_else(|| UNKNOWN_PACKAGE.to_string())
}

pub fn crew_name(crews: &[CrewMember], id: &str) -> String {
    crews
        .iter()
        .find(|c| c.id == id)
        .map(|c| c.name.clone())
        .unwrap_or_else(|| UNKNOWN_CREW.to_string())
}

pub fn crew_names(crews: &[CrewMember], ids: &[String]) -> Vec<String> {
    ids.iter().map(|id| crew_name(crews, id)).collect()
}
