//! Domain records for the service queue.
//!
//! Rows are exchanged with the store as JSON objects; these types are their
//! strongly-typed form. Vehicles share a [`VehicleBase`] that is flattened
//! into the `cars` / `motorcycles` rows, and the two kinds differ only in
//! how services and packages are attached.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::store::Table;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VehicleKind {
    Car,
    Motorcycle,
}

impl VehicleKind {
    pub fn as_str(self) -> &'static str {
        match self {
            VehicleKind::Car => "car",
            VehicleKind::Motorcycle => "motorcycle",
        }
    }

    pub fn table(self) -> Table {
        match self {
            VehicleKind::Car => Table::Cars,
            VehicleKind::Motorcycle => Table::Motorcycles,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            VehicleKind::Car => "Car",
            VehicleKind::Motorcycle => "Motorcycle",
        }
    }
}

impl fmt::Display for VehicleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Service lifecycle status. `completed` and `cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VehicleStatus {
    Waiting,
    InProgress,
    PaymentPending,
    Completed,
    Cancelled,
}

impl VehicleStatus {
    pub const ALL: [VehicleStatus; 5] = [
        VehicleStatus::Waiting,
        VehicleStatus::InProgress,
        VehicleStatus::PaymentPending,
        VehicleStatus::Completed,
        VehicleStatus::Cancelled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            VehicleStatus::Waiting => "waiting",
            VehicleStatus::InProgress => "in-progress",
            VehicleStatus::PaymentPending => "payment-pending",
            VehicleStatus::Completed => "completed",
            VehicleStatus::Cancelled => "cancelled",
        }
    }

    /// Statuses in which a plate must be unique per vehicle kind.
    pub fn is_active(self) -> bool {
        matches!(self, VehicleStatus::Waiting | VehicleStatus::InProgress)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, VehicleStatus::Completed | VehicleStatus::Cancelled)
    }
}

impl fmt::Display for VehicleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VehicleStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        VehicleStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == wanted)
            .ok_or_else(|| ValidationError::new(format!("Unknown status: {}", s.trim())))
    }
}

/// Vehicle size; the valid subset depends on the vehicle kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VehicleSize {
    Small,
    Medium,
    Large,
    ExtraLarge,
}

impl VehicleSize {
    const CAR_SIZES: [VehicleSize; 4] = [
        VehicleSize::Small,
        VehicleSize::Medium,
        VehicleSize::Large,
        VehicleSize::ExtraLarge,
    ];
    const MOTORCYCLE_SIZES: [VehicleSize; 3] =
        [VehicleSize::Small, VehicleSize::Medium, VehicleSize::Large];

    pub fn as_str(self) -> &'static str {
        match self {
            VehicleSize::Small => "small",
            VehicleSize::Medium => "medium",
            VehicleSize::Large => "large",
            VehicleSize::ExtraLarge => "extra_large",
        }
    }

    pub fn allowed_for(kind: VehicleKind) -> &'static [VehicleSize] {
        match kind {
            VehicleKind::Car => &Self::CAR_SIZES,
            VehicleKind::Motorcycle => &Self::MOTORCYCLE_SIZES,
        }
    }

    pub fn is_valid_for(self, kind: VehicleKind) -> bool {
        Self::allowed_for(kind).contains(&self)
    }
}

impl fmt::Display for VehicleSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VehicleSize {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace(['-', ' '], "_").as_str() {
            "small" => Ok(VehicleSize::Small),
            "medium" => Ok(VehicleSize::Medium),
            "large" => Ok(VehicleSize::Large),
            "extra_large" | "xl" => Ok(VehicleSize::ExtraLarge),
            other => Err(ValidationError::new(format!("Unknown vehicle size: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Vehicles
// ---------------------------------------------------------------------------

/// Fields shared by cars and motorcycles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleBase {
    pub id: String,
    pub plate: String,
    #[serde(default)]
    pub model: String,
    pub size: VehicleSize,
    pub status: VehicleStatus,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub crew: Vec<String>,
    #[serde(default)]
    pub total_cost: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default)]
    pub cancellation_reason: Option<String>,
    #[serde(default)]
    pub time_waiting: Option<DateTime<Utc>>,
    #[serde(default)]
    pub time_in_progress: Option<DateTime<Utc>>,
    #[serde(default)]
    pub time_ready_for_payment: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl VehicleBase {
    fn apply(&mut self, patch: &VehiclePatch) {
        if let Some(plate) = &patch.plate {
            self.plate = plate.clone();
        }
        if let Some(model) = &patch.model {
            self.model = model.clone();
        }
        if let Some(size) = patch.size {
            self.size = size;
        }
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(phone) = &patch.phone {
            self.phone = phone.clone();
        }
        if let Some(crew) = &patch.crew {
            self.crew = crew.clone();
        }
        if let Some(total_cost) = patch.total_cost {
            self.total_cost = total_cost;
        }
        if let Some(reason) = &patch.cancellation_reason {
            self.cancellation_reason = Some(reason.clone());
        }
    }

    /// Copy set-once lifecycle stamps; never overwrites a populated value.
    pub(crate) fn apply_stamps(&mut self, stamps: &LifecycleStamps) {
        self.time_waiting = self.time_waiting.or(stamps.time_waiting);
        self.time_in_progress = self.time_in_progress.or(stamps.time_in_progress);
        self.time_ready_for_payment = self
            .time_ready_for_payment
            .or(stamps.time_ready_for_payment);
        self.completed_at = self.completed_at.or(stamps.completed_at);
    }
}

/// A queue record of either kind.
///
/// The queue core is generic over this trait so cars and motorcycles share
/// one implementation of every mutation and derived query.
pub trait Vehicle: Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static {
    const KIND: VehicleKind;

    fn base(&self) -> &VehicleBase;
    fn base_mut(&mut self) -> &mut VehicleBase;

    /// Selected service ids. For cars this may also contain package ids.
    fn service_ids(&self) -> &[String];

    /// Single-select package; only motorcycles carry one.
    fn package_id(&self) -> Option<&str>;

    /// Apply the kind-specific part of a patch.
    fn apply_details(&mut self, patch: &VehiclePatch);

    fn id(&self) -> &str {
        &self.base().id
    }

    fn status(&self) -> VehicleStatus {
        self.base().status
    }

    /// Merge an accepted patch into this record (optimistic local update).
    fn apply_patch(&mut self, patch: &VehiclePatch, stamps: &LifecycleStamps, now: DateTime<Utc>) {
        self.base_mut().apply(patch);
        self.apply_details(patch);
        self.base_mut().apply_stamps(stamps);
        self.base_mut().updated_at = now;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Car {
    #[serde(flatten)]
    pub base: VehicleBase,
    /// Combined human-readable label, e.g. "Wash + Wax".
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub services: Vec<String>,
}

impl Vehicle for Car {
    const KIND: VehicleKind = VehicleKind::Car;

    fn base(&self) -> &VehicleBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut VehicleBase {
        &mut self.base
    }

    fn service_ids(&self) -> &[String] {
        &self.services
    }

    fn package_id(&self) -> Option<&str> {
        None
    }

    fn apply_details(&mut self, patch: &VehiclePatch) {
        if let Some(service) = &patch.service {
            self.service = service.clone();
        }
        if let Some(services) = &patch.services {
            self.services = services.clone();
        }
    }
}

fn motorcycle_type() -> String {
    VehicleKind::Motorcycle.as_str().to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Motorcycle {
    #[serde(flatten)]
    pub base: VehicleBase,
    #[serde(default)]
    pub services: Vec<String>,
    #[serde(default)]
    pub package: Option<String>,
    #[serde(default = "motorcycle_type")]
    pub vehicle_type: String,
}

impl Vehicle for Motorcycle {
    const KIND: VehicleKind = VehicleKind::Motorcycle;

    fn base(&self) -> &VehicleBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut VehicleBase {
        &mut self.base
    }

    fn service_ids(&self) -> &[String] {
        &self.services
    }

    fn package_id(&self) -> Option<&str> {
        self.package.as_deref()
    }

    fn apply_details(&mut self, patch: &VehiclePatch) {
        if let Some(services) = &patch.services {
            self.services = services.clone();
        }
        if let Some(package) = &patch.package {
            self.package = package.clone();
        }
    }
}

/// Input for adding a vehicle to the queue.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct VehicleDraft {
    pub plate: String,
    pub model: String,
    pub size: VehicleSize,
    #[serde(default = "default_draft_status")]
    pub status: VehicleStatus,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub crew: Vec<String>,
    #[serde(default)]
    pub services: Vec<String>,
    /// Motorcycles only.
    #[serde(default)]
    pub package: Option<String>,
    /// Cars only; derived from the selected names when absent.
    #[serde(default)]
    pub service: Option<String>,
    /// Manual override of the computed total.
    #[serde(default)]
    pub total_cost: Option<f64>,
}

fn default_draft_status() -> VehicleStatus {
    VehicleStatus::Waiting
}

impl VehicleDraft {
    pub fn new(plate: impl Into<String>, model: impl Into<String>, size: VehicleSize) -> Self {
        Self {
            plate: plate.into(),
            model: model.into(),
            size,
            status: VehicleStatus::Waiting,
            phone: None,
            crew: Vec::new(),
            services: Vec::new(),
            package: None,
            service: None,
            total_cost: None,
        }
    }

    pub fn with_services(mut self, services: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.services = services.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_package(mut self, package: impl Into<String>) -> Self {
        self.package = Some(package.into());
        self
    }

    pub fn with_crew(mut self, crew: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.crew = crew.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_phone(mut self, phone: impl Into<String>) -> Self {
        self.phone = Some(phone.into());
        self
    }

    pub fn with_status(mut self, status: VehicleStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_total_cost(mut self, total_cost: f64) -> Self {
        self.total_cost = Some(total_cost);
        self
    }
}

/// Partial update of a vehicle. `None` leaves a field untouched.
///
/// `phone` and `package` are double options so a caller can clear them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VehiclePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<VehicleSize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<VehicleStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crew: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_cost: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancellation_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub services: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package: Option<Option<String>>,
}

impl VehiclePatch {
    pub fn status(status: VehicleStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn cancel(reason: impl Into<String>) -> Self {
        Self {
            status: Some(VehicleStatus::Cancelled),
            cancellation_reason: Some(reason.into()),
            ..Self::default()
        }
    }

    pub fn with_crew(mut self, crew: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.crew = Some(crew.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_plate(mut self, plate: impl Into<String>) -> Self {
        self.plate = Some(plate.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Lifecycle timestamps the core stamps onto a write. Set-once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LifecycleStamps {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_waiting: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_in_progress: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_ready_for_payment: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Catalog and crew
// ---------------------------------------------------------------------------

pub type PriceTable = BTreeMap<VehicleSize, f64>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub prices: Option<PriceTable>,
    pub vehicle_type: VehicleKind,
    #[serde(default)]
    pub is_deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServicePackage {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub prices: PriceTable,
    pub vehicle_type: VehicleKind,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default, rename = "requiresCrew")]
    pub requires_crew: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrewMember {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub is_deleted: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDraft {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prices: Option<PriceTable>,
    pub vehicle_type: VehicleKind,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServicePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<Option<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prices: Option<Option<PriceTable>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageDraft {
    pub name: String,
    pub prices: PriceTable,
    pub vehicle_type: VehicleKind,
    #[serde(rename = "requiresCrew", skip_serializing_if = "Option::is_none")]
    pub requires_crew: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PackagePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prices: Option<PriceTable>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_active: Option<bool>,
    #[serde(
        default,
        rename = "requiresCrew",
        skip_serializing_if = "Option::is_none"
    )]
    pub requires_crew: Option<Option<bool>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrewDraft {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CrewPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_active: Option<bool>,
}

/// Auto-fill data for a returning customer's plate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryMatch {
    pub plate: String,
    pub model: String,
    pub phone: Option<String>,
    pub size: VehicleSize,
}
