//! Queue synchronization core.
//!
//! [`QueueCore`] owns the in-memory collections (cars, motorcycles,
//! services, crew, packages) and keeps them in step with a [`DataStore`]:
//!
//! - initial parallel load of every table
//! - per-table change listeners that refetch after a debounce window,
//!   skipped while a fetch or write for the same table is in flight
//! - validated mutations guarded by the [`OperationTracker`], patched into
//!   the local collections once the remote write succeeds
//! - verified, retried writes for the transition to `completed`
//! - fire-and-forget customer notifications after committed transitions
//!
//! Every change to the collections bumps a revision counter that consumers
//! watch to re-render.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Local, SecondsFormat, SubsecRound, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::derived;
use crate::error::{QueueError, QueueResult, StoreError, StoreErrorKind, ValidationError};
use crate::lifecycle::{check_transition, initial_stamps, stamps_for, time_section, TimeSection};
use crate::models::{
    Car, CrewDraft, CrewMember, CrewPatch, HistoryMatch, LifecycleStamps, Motorcycle,
    PackageDraft, PackagePatch, Service, ServiceDraft, ServicePackage, ServicePatch, Vehicle,
    VehicleDraft, VehicleKind, VehiclePatch, VehicleStatus,
};
use crate::notify::{NotificationPayload, Notifier};
use crate::pricing::Catalog;
use crate::store::{DataStore, Query, Subscription, Table};
use crate::tracker::{ExecuteOptions, OperationKind, OperationTracker};
use crate::validation::{
    normalize_plate, validate_cancellation_reason, validate_cost, validate_history_term,
    validate_initial_status, validate_model, validate_name, validate_optional_phone,
    validate_plate, validate_price_table, validate_size,
};

const CREW_REQUIRED: &str = "Assign at least one crew member before starting work";

// ---------------------------------------------------------------------------
// Settings and state
// ---------------------------------------------------------------------------

/// Timing and retry policy for the core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSettings {
    /// Debounce before refetching cars, motorcycles or crew.
    pub vehicle_debounce: Duration,
    /// Debounce before refetching services or packages. Longer, since these
    /// are edited in place and a refetch would clobber an open form.
    pub catalog_debounce: Duration,
    pub completion_max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            vehicle_debounce: Duration::from_millis(500),
            catalog_debounce: Duration::from_millis(1000),
            completion_max_retries: 3,
            retry_delay: Duration::from_millis(1000),
        }
    }
}

impl QueueSettings {
    pub fn debounce_for(&self, table: Table) -> Duration {
        match table {
            Table::Cars | Table::Motorcycles | Table::Crews => self.vehicle_debounce,
            Table::Services | Table::Packages => self.catalog_debounce,
        }
    }
}

/// Snapshot of everything the core holds.
#[derive(Debug, Clone, Default)]
pub struct QueueState {
    pub cars: Vec<Car>,
    pub motorcycles: Vec<Motorcycle>,
    pub services: Vec<Service>,
    pub crews: Vec<CrewMember>,
    pub packages: Vec<ServicePackage>,
    pub loading: bool,
    pub last_error: Option<String>,
    /// Last fetch error per table; cleared by the next successful fetch.
    pub table_errors: BTreeMap<Table, String>,
}

impl QueueState {
    pub fn catalog(&self) -> Catalog<'_> {
        Catalog::new(&self.services, &self.packages)
    }
}

// ---------------------------------------------------------------------------
// Collection plumbing
// ---------------------------------------------------------------------------

/// A vehicle kind held by the core.
pub trait Queued: Vehicle {
    fn collection(state: &QueueState) -> &Vec<Self>;
    fn collection_mut(state: &mut QueueState) -> &mut Vec<Self>;
    /// Label sent as `serviceType` in notifications.
    fn service_label(&self, catalog: &Catalog<'_>) -> String;
}

impl Queued for Car {
    fn collection(state: &QueueState) -> &Vec<Self> {
        &state.cars
    }

    fn collection_mut(state: &mut QueueState) -> &mut Vec<Self> {
        &mut state.cars
    }

    fn service_label(&self, catalog: &Catalog<'_>) -> String {
        if self.service.trim().is_empty() {
            catalog.label(&self.services, None)
        } else {
            self.service.clone()
        }
    }
}

impl Queued for Motorcycle {
    fn collection(state: &QueueState) -> &Vec<Self> {
        &state.motorcycles
    }

    fn collection_mut(state: &mut QueueState) -> &mut Vec<Self> {
        &mut state.motorcycles
    }

    fn service_label(&self, catalog: &Catalog<'_>) -> String {
        catalog.label(&self.services, self.package.as_deref())
    }
}

/// Crew, services and packages: plain CRUD records.
pub trait CatalogRecord: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    const TABLE: Table;
    const ENTITY: &'static str;

    fn id(&self) -> &str;
    fn name(&self) -> &str;
    /// Whether the record belongs in the live collection.
    fn is_listed(&self) -> bool;
    fn collection_mut(state: &mut QueueState) -> &mut Vec<Self>;
}

impl CatalogRecord for CrewMember {
    const TABLE: Table = Table::Crews;
    const ENTITY: &'static str = "Crew member";

    fn id(&self) -> &str {
        &self.id
    }
    fn name(&self) -> &str {
        &self.name
    }
    fn is_listed(&self) -> bool {
        self.is_active && !self.is_deleted
    }
    fn collection_mut(state: &mut QueueState) -> &mut Vec<Self> {
        &mut state.crews
    }
}

impl CatalogRecord for Service {
    const TABLE: Table = Table::Services;
    const ENTITY: &'static str = "Service";

    fn id(&self) -> &str {
        &self.id
    }
    fn name(&self) -> &str {
        &self.name
    }
    fn is_listed(&self) -> bool {
        !self.is_deleted
    }
    fn collection_mut(state: &mut QueueState) -> &mut Vec<Self> {
        &mut state.services
    }
}

impl CatalogRecord for ServicePackage {
    const TABLE: Table = Table::Packages;
    const ENTITY: &'static str = "Package";

    fn id(&self) -> &str {
        &self.id
    }
    fn name(&self) -> &str {
        &self.name
    }
    fn is_listed(&self) -> bool {
        self.is_active && !self.is_deleted
    }
    fn collection_mut(state: &mut QueueState) -> &mut Vec<Self> {
        &mut state.packages
    }
}

/// Operation-key prefix for writes to `table` (`car-update-<id>`, ...).
fn key_prefix(table: Table) -> &'static str {
    match table {
        Table::Cars => "car",
        Table::Motorcycles => "motorcycle",
        Table::Services => "service",
        Table::Crews => "crew",
        Table::Packages => "package",
    }
}

fn fetch_key(table: Table) -> String {
    format!("fetch-{table}")
}

/// Query for the live rows of `table`.
fn list_query(table: Table) -> Query {
    let query = Query::new().eq("is_deleted", false);
    match table {
        Table::Cars | Table::Motorcycles => query.order_by("created_at", false),
        Table::Services => query.order_by("name", true),
        Table::Crews | Table::Packages => query.eq("is_active", true).order_by("name", true),
    }
}

fn now_utc() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn encode<T: Serialize>(value: &T) -> QueueResult<Value> {
    serde_json::to_value(value).map_err(|e| QueueError::Store {
        kind: StoreErrorKind::Decode,
        message: format!("Failed to encode record: {e}"),
    })
}

fn decode<T: DeserializeOwned>(table: Table, row: Value) -> QueueResult<T> {
    serde_json::from_value(row).map_err(|e| QueueError::Store {
        kind: StoreErrorKind::Decode,
        message: format!("Unexpected {table} row: {e}"),
    })
}

/// Decode rows, dropping (and logging) any that do not fit the model.
fn decode_rows<T: DeserializeOwned>(table: Table, rows: Vec<Value>) -> Vec<T> {
    rows.into_iter()
        .filter_map(|row| match serde_json::from_value(row) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(table = %table, error = %e, "skipping undecodable row");
                None
            }
        })
        .collect()
}

fn merge_object(target: &mut Value, extra: Value) {
    if let (Some(target), Value::Object(extra)) = (target.as_object_mut(), extra) {
        target.extend(extra);
    }
}

/// Trimmed, de-duplicated ids in first-seen order.
fn dedup_ids(ids: Vec<String>) -> Vec<String> {
    let mut seen = BTreeSet::new();
    ids.into_iter()
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty() && seen.insert(id.clone()))
        .collect()
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Whether another live vehicle already holds `plate` in an active status.
fn plate_taken<V: Vehicle>(vehicles: &[V], plate: &str, exclude_id: Option<&str>) -> bool {
    vehicles.iter().map(Vehicle::base).any(|v| {
        exclude_id != Some(v.id.as_str())
            && !v.is_deleted
            && v.status.is_active()
            && normalize_plate(&v.plate) == plate
    })
}

// ---------------------------------------------------------------------------
// Core
// ---------------------------------------------------------------------------

struct Inner {
    store: Arc<dyn DataStore>,
    notifier: Arc<dyn Notifier>,
    tracker: OperationTracker,
    state: RwLock<QueueState>,
    settings: QueueSettings,
    revision: watch::Sender<u64>,
    started: AtomicBool,
    cancel: CancellationToken,
    tasks: TaskTracker,
    /// Per-table counter, moved when a write starts and again when it ends.
    write_epochs: [AtomicU64; 5],
}

/// Holds a table's write epoch open; dropping it moves the epoch again.
struct WriteMark<'a> {
    epoch: &'a AtomicU64,
}

impl Drop for WriteMark<'_> {
    fn drop(&mut self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }
}

impl Inner {
    fn read(&self) -> RwLockReadGuard<'_, QueueState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, QueueState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn bump(&self) {
        self.revision.send_modify(|rev| *rev += 1);
    }

    fn write_epoch(&self, table: Table) -> u64 {
        self.write_epochs[table as usize].load(Ordering::SeqCst)
    }

    /// Call after taking the operation guard, before touching the store.
    fn begin_write(&self, table: Table) -> WriteMark<'_> {
        let epoch = &self.write_epochs[table as usize];
        epoch.fetch_add(1, Ordering::SeqCst);
        WriteMark { epoch }
    }

    /// Log a failed write and map it to the message staff will see.
    fn write_failed(
        &self,
        table: Table,
        action: &str,
        err: StoreError,
        plate: Option<&str>,
    ) -> QueueError {
        warn!(
            table = %table,
            action,
            code = err.code.as_deref().unwrap_or("-"),
            error = %err,
            "remote write failed"
        );
        let mapped = QueueError::from_store(table, err, plate);
        self.write().last_error = Some(mapped.to_string());
        mapped
    }

    /// Fetch `table` and replace its collection wholesale.
    ///
    /// With `since`, the rows are dropped (`Ok(None)`) if the table's write
    /// epoch moved while the select was in flight.
    async fn fetch_table(&self, table: Table, since: Option<u64>) -> QueueResult<Option<usize>> {
        let rows = self
            .store
            .select(table, &list_query(table))
            .await
            .map_err(|e| QueueError::from_store(table, e, None))?;
        let count = rows.len();
        {
            // Checked under the state lock so a write cannot patch in between.
            let mut state = self.write();
            if since.is_some_and(|epoch| epoch != self.write_epoch(table)) {
                return Ok(None);
            }
            match table {
                Table::Cars => state.cars = decode_rows(table, rows),
                Table::Motorcycles => state.motorcycles = decode_rows(table, rows),
                Table::Services => state.services = decode_rows(table, rows),
                Table::Crews => state.crews = decode_rows(table, rows),
                Table::Packages => state.packages = decode_rows(table, rows),
            }
            state.table_errors.remove(&table);
        }
        self.bump();
        Ok(Some(count))
    }

    /// Fetch under the table's fetch key; failures are recorded, not returned.
    async fn fetch_logged(&self, table: Table, since: Option<u64>) {
        let key = fetch_key(table);
        let Some(_guard) = self.tracker.guard(&key, OperationKind::Fetch) else {
            debug!(table = %table, "fetch already in flight");
            return;
        };
        match self.fetch_table(table, since).await {
            Ok(Some(rows)) => debug!(table = %table, rows, "table fetched"),
            Ok(None) => debug!(table = %table, "refetch discarded, write landed during read"),
            Err(e) => {
                warn!(table = %table, error = %e, "table fetch failed");
                let message = e.to_string();
                let mut state = self.write();
                state.table_errors.insert(table, message.clone());
                state.last_error = Some(message);
            }
        }
    }

    async fn load_all(&self) {
        self.write().loading = true;
        self.bump();
        tokio::join!(
            self.fetch_logged(Table::Cars, None),
            self.fetch_logged(Table::Motorcycles, None),
            self.fetch_logged(Table::Services, None),
            self.fetch_logged(Table::Crews, None),
            self.fetch_logged(Table::Packages, None),
        );
        self.write().loading = false;
        self.bump();
    }

    /// Change-triggered refetch. Skipped while a fetch or a write on the
    /// same table is in flight, and discarded if a write starts before the
    /// rows arrive. The write's own change event schedules the next one.
    async fn refetch(&self, table: Table) {
        let epoch = self.write_epoch(table);
        let prefix = format!("{}-", key_prefix(table));
        if self.tracker.is_active(&fetch_key(table)) || self.tracker.any_active_with_prefix(&prefix)
        {
            debug!(table = %table, "refetch skipped, operation in flight");
            return;
        }
        self.fetch_logged(table, Some(epoch)).await;
    }

    fn notify_status<V: Queued>(&self, vehicle: &V) {
        let base = vehicle.base();
        let Some(phone) = base.phone.clone() else {
            return;
        };
        let (service_type, queue_number) = {
            let state = self.read();
            (
                vehicle.service_label(&state.catalog()),
                derived::queue_position(V::collection(&state), vehicle),
            )
        };
        let payload = NotificationPayload {
            status: base.status,
            plate_number: base.plate.clone(),
            service_type,
            phone_number: phone,
            queue_number,
        };
        let notifier = Arc::clone(&self.notifier);
        self.tasks.spawn(async move {
            if let Err(e) = notifier.notify(&payload).await {
                warn!(
                    plate = %payload.plate_number,
                    status = %payload.status,
                    error = %e,
                    "customer notification failed"
                );
            }
        });
    }

    /// Single-attempt update of one row by id.
    async fn write_once(
        &self,
        table: Table,
        entity: &'static str,
        id: &str,
        changes: Value,
        plate: Option<&str>,
    ) -> QueueResult<Vec<Value>> {
        let rows = self
            .store
            .update(table, changes, &Query::by_id(id))
            .await
            .map_err(|e| self.write_failed(table, "update", e, plate))?;
        if rows.is_empty() {
            return Err(QueueError::NotFound {
                entity,
                id: id.to_string(),
            });
        }
        Ok(rows)
    }
}

/// Wait for changes on one table and refetch it once they settle.
async fn listen(
    inner: Arc<Inner>,
    mut subscription: Subscription,
    debounce: Duration,
    cancel: CancellationToken,
) {
    let table = subscription.table();
    debug!(table = %table, debounce_ms = debounce.as_millis() as u64, "change listener started");
    'events: loop {
        tokio::select! {
            _ = cancel.cancelled() => break 'events,
            event = subscription.recv() => if event.is_none() { break 'events },
        }
        // Every further event restarts the window.
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break 'events,
                _ = tokio::time::sleep(debounce) => break,
                event = subscription.recv() => if event.is_none() { break 'events },
            }
        }
        inner.refetch(table).await;
    }
    debug!(table = %table, "change listener stopped");
}

/// The queue state container. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct QueueCore {
    inner: Arc<Inner>,
}

impl QueueCore {
    pub fn new(
        store: Arc<dyn DataStore>,
        notifier: Arc<dyn Notifier>,
        settings: QueueSettings,
    ) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                store,
                notifier,
                tracker: OperationTracker::new(),
                state: RwLock::new(QueueState::default()),
                settings,
                revision,
                started: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                tasks: TaskTracker::new(),
                write_epochs: Default::default(),
            }),
        }
    }

    /// Subscribe to every table, then run the initial load.
    pub async fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            warn!("queue core already started");
            return;
        }
        for table in Table::ALL {
            let subscription = self.inner.store.subscribe(table);
            let debounce = self.inner.settings.debounce_for(table);
            self.inner.tasks.spawn(listen(
                Arc::clone(&self.inner),
                subscription,
                debounce,
                self.inner.cancel.child_token(),
            ));
        }
        self.load().await;
        let state = self.inner.read();
        info!(
            cars = state.cars.len(),
            motorcycles = state.motorcycles.len(),
            services = state.services.len(),
            crews = state.crews.len(),
            packages = state.packages.len(),
            "queue loaded"
        );
    }

    /// Fetch all five tables in parallel. A failing table does not stop
    /// the others; its error is recorded in the state.
    pub async fn load(&self) {
        self.inner.load_all().await;
    }

    /// Refetch one table now, subject to the in-flight skip rule.
    pub async fn refetch(&self, table: Table) {
        self.inner.refetch(table).await;
    }

    /// Stop the change listeners and wait for them and any pending
    /// notifications.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        debug!("queue core stopped");
    }

    // -- reads --------------------------------------------------------------

    pub fn revisions(&self) -> watch::Receiver<u64> {
        self.inner.revision.subscribe()
    }

    pub fn tracker(&self) -> &OperationTracker {
        &self.inner.tracker
    }

    pub fn snapshot(&self) -> QueueState {
        self.inner.read().clone()
    }

    pub fn cars(&self) -> Vec<Car> {
        self.inner.read().cars.clone()
    }

    pub fn motorcycles(&self) -> Vec<Motorcycle> {
        self.inner.read().motorcycles.clone()
    }

    pub fn services(&self) -> Vec<Service> {
        self.inner.read().services.clone()
    }

    pub fn crews(&self) -> Vec<CrewMember> {
        self.inner.read().crews.clone()
    }

    pub fn packages(&self) -> Vec<ServicePackage> {
        self.inner.read().packages.clone()
    }

    pub fn is_loading(&self) -> bool {
        self.inner.read().loading
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.read().last_error.clone()
    }

    pub fn vehicle<V: Queued>(&self, id: &str) -> Option<V> {
        V::collection(&self.inner.read())
            .iter()
            .find(|v| v.id() == id)
            .cloned()
    }

    /// Crew busy on another same-day in-progress vehicle of either kind.
    pub fn busy_crew(&self, exclude_id: Option<&str>) -> BTreeSet<String> {
        self.busy_crew_at(exclude_id, &Local::now())
    }

    pub fn busy_crew_at<Tz: TimeZone>(
        &self,
        exclude_id: Option<&str>,
        now: &DateTime<Tz>,
    ) -> BTreeSet<String> {
        let state = self.inner.read();
        let vehicles = state
            .cars
            .iter()
            .map(Vehicle::base)
            .chain(state.motorcycles.iter().map(Vehicle::base));
        derived::busy_crew(vehicles, exclude_id, now)
    }

    pub fn queue_position<V: Queued>(&self, id: &str) -> Option<usize> {
        let state = self.inner.read();
        let vehicles = V::collection(&state);
        let vehicle = vehicles.iter().find(|v| v.id() == id)?;
        derived::queue_position(vehicles, vehicle)
    }

    pub fn time_section<V: Queued>(&self, id: &str, now: DateTime<Utc>) -> Option<TimeSection> {
        self.vehicle::<V>(id)
            .map(|vehicle| time_section(vehicle.base(), now))
    }

    // -- vehicle mutations --------------------------------------------------

    /// Validate and insert a vehicle, then prepend it to its collection.
    pub async fn add<V: Queued>(&self, draft: VehicleDraft) -> QueueResult<V> {
        let inner = &self.inner;
        let kind = V::KIND;
        let table = kind.table();

        let plate = validate_plate(&draft.plate)?;
        let model = validate_model(&draft.model)?;
        let size = validate_size(kind, draft.size)?;
        let status = validate_initial_status(draft.status)?;
        let phone = validate_optional_phone(draft.phone.as_deref())?;
        if kind == VehicleKind::Car && draft.package.is_some() {
            return Err(ValidationError::new("Car packages are selected in the services list").into());
        }
        let crew = dedup_ids(draft.crew);
        let services = dedup_ids(draft.services);
        let package = non_blank(draft.package);

        let (total_cost, label) = {
            let state = inner.read();
            let catalog = state.catalog();
            if status == VehicleStatus::InProgress
                && crew.is_empty()
                && catalog.requires_crew(&services, package.as_deref())
            {
                return Err(ValidationError::new(CREW_REQUIRED).into());
            }
            if plate_taken(V::collection(&state), &plate, None) {
                return Err(QueueError::DuplicatePlate { plate });
            }
            let total = match draft.total_cost {
                Some(cost) => validate_cost(cost)?,
                None => catalog.compute_total(size, &services, package.as_deref()),
            };
            (total, catalog.label(&services, package.as_deref()))
        };

        let now = now_utc();
        let mut row = json!({
            "plate": plate,
            "model": model,
            "size": size,
            "status": status,
            "phone": phone,
            "crew": crew,
            "total_cost": total_cost,
            "is_deleted": false,
            "services": services,
        });
        match kind {
            VehicleKind::Car => {
                row["service"] = json!(non_blank(draft.service).unwrap_or(label));
            }
            VehicleKind::Motorcycle => {
                row["package"] = json!(package);
                row["vehicle_type"] = json!(kind.as_str());
            }
        }
        merge_object(&mut row, encode(&initial_stamps(status, now))?);

        let key = format!("{kind}-insert-{plate}");
        let Some(_guard) = inner.tracker.guard(&key, OperationKind::Insert) else {
            return Err(QueueError::DuplicatePlate { plate });
        };
        let _mark = inner.begin_write(table);
        let inserted = inner
            .store
            .insert(table, row)
            .await
            .map_err(|e| inner.write_failed(table, "insert", e, Some(&plate)))?;
        let vehicle: V = decode(table, inserted)?;

        V::collection_mut(&mut inner.write()).insert(0, vehicle.clone());
        inner.bump();
        info!(kind = %kind, id = %vehicle.id(), plate = %plate, status = %status, "vehicle added");

        inner.notify_status(&vehicle);
        Ok(vehicle)
    }

    /// Apply a partial update.
    ///
    /// Returns `Ok(None)` without writing when an update for the same
    /// vehicle is already in flight. A transition to `completed` is written
    /// with retries and confirmed by reading the row back.
    pub async fn update<V: Queued>(&self, id: &str, patch: VehiclePatch) -> QueueResult<Option<V>> {
        let inner = &self.inner;
        let kind = V::KIND;
        let table = kind.table();

        let key = format!("{kind}-update-{id}");
        let Some(_guard) = inner.tracker.guard(&key, OperationKind::Update) else {
            debug!(operation = %key, "update already in flight, dropped");
            return Ok(None);
        };
        let _mark = inner.begin_write(table);

        let current = self.vehicle::<V>(id).ok_or_else(|| QueueError::NotFound {
            entity: kind.label(),
            id: id.to_string(),
        })?;
        let (accepted, transition) = self.prepare_patch(&current, patch)?;
        if accepted.is_empty() {
            return Ok(Some(current));
        }

        let now = now_utc();
        let stamps = match transition {
            Some(to) => stamps_for(current.base(), to, now),
            None => LifecycleStamps::default(),
        };
        let mut changes = encode(&accepted)?;
        merge_object(&mut changes, encode(&stamps)?);
        changes["updated_at"] = json!(timestamp(now));
        let plate = accepted
            .plate
            .clone()
            .unwrap_or_else(|| current.base().plate.clone());

        if transition == Some(VehicleStatus::Completed) {
            self.write_completion(kind, id, changes, &plate).await?;
        } else {
            inner
                .write_once(table, kind.label(), id, changes, Some(&plate))
                .await?;
        }

        let mut updated = current;
        updated.apply_patch(&accepted, &stamps, now);
        {
            let mut state = inner.write();
            if let Some(slot) = V::collection_mut(&mut state)
                .iter_mut()
                .find(|v| v.id() == id)
            {
                slot.apply_patch(&accepted, &stamps, now);
                updated = slot.clone();
            }
        }
        inner.bump();

        match transition {
            Some(to) => {
                info!(kind = %kind, id, plate = %plate, status = %to, "vehicle status changed");
                if to != VehicleStatus::Cancelled {
                    inner.notify_status(&updated);
                }
            }
            None => debug!(kind = %kind, id, "vehicle updated"),
        }
        Ok(Some(updated))
    }

    /// Validate a patch against the current record. Returns the accepted
    /// changes (normalized, no-op fields dropped, derived totals filled in)
    /// and the status being entered, if any.
    fn prepare_patch<V: Queued>(
        &self,
        current: &V,
        patch: VehiclePatch,
    ) -> QueueResult<(VehiclePatch, Option<VehicleStatus>)> {
        let kind = V::KIND;
        let base = current.base();

        if kind == VehicleKind::Car && patch.package.is_some() {
            return Err(ValidationError::new("Car packages are selected in the services list").into());
        }
        if kind == VehicleKind::Motorcycle && patch.service.is_some() {
            return Err(ValidationError::new("Motorcycles do not carry a service label").into());
        }

        let mut accepted = VehiclePatch::default();
        if let Some(plate) = &patch.plate {
            let plate = validate_plate(plate)?;
            if plate != base.plate {
                accepted.plate = Some(plate);
            }
        }
        if let Some(model) = &patch.model {
            accepted.model = Some(validate_model(model)?);
        }
        if let Some(size) = patch.size {
            accepted.size = Some(validate_size(kind, size)?);
        }
        if let Some(phone) = &patch.phone {
            accepted.phone = Some(validate_optional_phone(phone.as_deref())?);
        }
        if let Some(cost) = patch.total_cost {
            accepted.total_cost = Some(validate_cost(cost)?);
        }
        accepted.crew = patch.crew.map(dedup_ids);
        accepted.services = patch.services.map(dedup_ids);
        accepted.package = patch.package.map(non_blank);
        accepted.service = patch.service.map(|s| s.trim().to_string());

        let transition = match patch.status {
            Some(to) if to != base.status => {
                check_transition(base.status, to)?;
                Some(to)
            }
            _ => None,
        };
        accepted.status = transition;

        match (transition, &patch.cancellation_reason) {
            (Some(VehicleStatus::Cancelled), Some(reason)) => {
                accepted.cancellation_reason = Some(validate_cancellation_reason(reason)?);
            }
            (Some(VehicleStatus::Cancelled), None) => {
                return Err(ValidationError::new("A cancellation reason is required").into());
            }
            (_, Some(_)) => {
                return Err(
                    ValidationError::new("A cancellation reason is only accepted when cancelling").into(),
                );
            }
            (_, None) => {}
        }

        let state = self.inner.read();
        let catalog = state.catalog();
        let mut projected = current.clone();
        projected.apply_patch(&accepted, &LifecycleStamps::default(), base.updated_at);

        let selection_changed =
            accepted.services.is_some() || accepted.package.is_some() || accepted.size.is_some();
        if selection_changed && accepted.total_cost.is_none() {
            accepted.total_cost = Some(catalog.compute_total(
                projected.base().size,
                projected.service_ids(),
                projected.package_id(),
            ));
        }
        if kind == VehicleKind::Car && accepted.services.is_some() && accepted.service.is_none() {
            accepted.service = Some(catalog.label(projected.service_ids(), None));
        }

        let target = projected.base();
        if transition == Some(VehicleStatus::InProgress)
            && target.crew.is_empty()
            && catalog.requires_crew(projected.service_ids(), projected.package_id())
        {
            return Err(ValidationError::new(CREW_REQUIRED).into());
        }

        let entering_active =
            transition.is_some_and(|to| to.is_active() && !base.status.is_active());
        if target.status.is_active()
            && (accepted.plate.is_some() || entering_active)
            && plate_taken(V::collection(&state), &target.plate, Some(&base.id))
        {
            return Err(QueueError::DuplicatePlate {
                plate: target.plate.clone(),
            });
        }

        Ok((accepted, transition))
    }

    /// Write the completion with retries, confirming each apparently
    /// successful attempt by reading the status back.
    async fn write_completion(
        &self,
        kind: VehicleKind,
        id: &str,
        changes: Value,
        plate: &str,
    ) -> QueueResult<()> {
        let inner = &self.inner;
        let table = kind.table();
        let key = format!("{kind}-complete-{id}");
        let query = Query::by_id(id);
        let options = ExecuteOptions::new(
            inner.settings.completion_max_retries,
            inner.settings.retry_delay,
        );

        inner
            .tracker
            .execute_verified(
                &key,
                OperationKind::Completion,
                options,
                || {
                    let changes = changes.clone();
                    let query = &query;
                    async move {
                        let rows = inner
                            .store
                            .update(table, changes, query)
                            .await
                            .map_err(|e| inner.write_failed(table, "complete", e, Some(plate)))?;
                        if rows.is_empty() {
                            return Err(QueueError::NotFound {
                                entity: kind.label(),
                                id: id.to_string(),
                            });
                        }
                        Ok(())
                    }
                },
                || {
                    let query = &query;
                    async move {
                        let rows = inner
                            .store
                            .select(table, query)
                            .await
                            .map_err(|e| QueueError::from_store(table, e, None))?;
                        let status = rows
                            .first()
                            .and_then(|row| row.get("status"))
                            .and_then(Value::as_str);
                        if status == Some(VehicleStatus::Completed.as_str()) {
                            Ok(())
                        } else {
                            warn!(table = %table, id, status = ?status, "completion did not stick");
                            Err(QueueError::VerificationFailed)
                        }
                    }
                },
            )
            .await
    }

    /// Soft-delete a vehicle and drop it from its collection. Returns
    /// `false` when a removal for the same vehicle is already in flight.
    pub async fn remove<V: Queued>(&self, id: &str) -> QueueResult<bool> {
        let inner = &self.inner;
        let kind = V::KIND;
        let key = format!("{kind}-delete-{id}");
        let Some(_guard) = inner.tracker.guard(&key, OperationKind::Delete) else {
            return Ok(false);
        };
        let _mark = inner.begin_write(kind.table());
        let changes = json!({ "is_deleted": true, "updated_at": timestamp(now_utc()) });
        inner
            .write_once(kind.table(), kind.label(), id, changes, None)
            .await?;
        V::collection_mut(&mut inner.write()).retain(|v| v.id() != id);
        inner.bump();
        info!(kind = %kind, id, "vehicle removed");
        Ok(true)
    }

    /// Most recent vehicle whose plate contains `term`, for auto-filling a
    /// returning customer's details.
    pub async fn search_history<V: Queued>(&self, term: &str) -> QueueResult<Option<HistoryMatch>> {
        let term = validate_history_term(term)?;
        let table = V::KIND.table();
        let query = Query::new()
            .eq("is_deleted", false)
            .contains("plate", &term)
            .order_by("created_at", false)
            .limit(1);
        let rows = self
            .inner
            .store
            .select(table, &query)
            .await
            .map_err(|e| QueueError::from_store(table, e, None))?;
        let Some(row) = rows.into_iter().next() else {
            return Ok(None);
        };
        let vehicle: V = decode(table, row)?;
        let base = vehicle.base();
        Ok(Some(HistoryMatch {
            plate: base.plate.clone(),
            model: base.model.clone(),
            phone: base.phone.clone(),
            size: base.size,
        }))
    }

    pub async fn add_car(&self, draft: VehicleDraft) -> QueueResult<Car> {
        self.add(draft).await
    }

    pub async fn add_motorcycle(&self, draft: VehicleDraft) -> QueueResult<Motorcycle> {
        self.add(draft).await
    }

    pub async fn update_car(&self, id: &str, patch: VehiclePatch) -> QueueResult<Option<Car>> {
        self.update(id, patch).await
    }

    pub async fn update_motorcycle(
        &self,
        id: &str,
        patch: VehiclePatch,
    ) -> QueueResult<Option<Motorcycle>> {
        self.update(id, patch).await
    }

    pub async fn remove_car(&self, id: &str) -> QueueResult<bool> {
        self.remove::<Car>(id).await
    }

    pub async fn remove_motorcycle(&self, id: &str) -> QueueResult<bool> {
        self.remove::<Motorcycle>(id).await
    }

    pub async fn search_car_history(&self, term: &str) -> QueueResult<Option<HistoryMatch>> {
        self.search_history::<Car>(term).await
    }

    pub async fn search_motorcycle_history(&self, term: &str) -> QueueResult<Option<HistoryMatch>> {
        self.search_history::<Motorcycle>(term).await
    }

    // -- catalog and crew ---------------------------------------------------

    async fn insert_record<T: CatalogRecord>(&self, name: &str, row: Value) -> QueueResult<T> {
        let inner = &self.inner;
        let key = format!("{}-insert-{}", key_prefix(T::TABLE), name.to_lowercase());
        let Some(_guard) = inner.tracker.guard(&key, OperationKind::Insert) else {
            return Err(ValidationError::new(format!("{} {name} is already being saved", T::ENTITY)).into());
        };
        let _mark = inner.begin_write(T::TABLE);
        let inserted = inner
            .store
            .insert(T::TABLE, row)
            .await
            .map_err(|e| inner.write_failed(T::TABLE, "insert", e, None))?;
        let record: T = decode(T::TABLE, inserted)?;
        if record.is_listed() {
            let mut state = inner.write();
            let list = T::collection_mut(&mut state);
            list.push(record.clone());
            list.sort_by(|a, b| a.name().cmp(b.name()));
        }
        inner.bump();
        info!(table = %T::TABLE, id = %record.id(), name, "record added");
        Ok(record)
    }

    /// Update a record; the row the store returns replaces the local copy.
    async fn update_record<T: CatalogRecord>(
        &self,
        id: &str,
        mut changes: Value,
    ) -> QueueResult<Option<T>> {
        let inner = &self.inner;
        let key = format!("{}-update-{id}", key_prefix(T::TABLE));
        let Some(_guard) = inner.tracker.guard(&key, OperationKind::Update) else {
            debug!(operation = %key, "update already in flight, dropped");
            return Ok(None);
        };
        let _mark = inner.begin_write(T::TABLE);
        changes["updated_at"] = json!(timestamp(now_utc()));
        let rows = inner
            .write_once(T::TABLE, T::ENTITY, id, changes, None)
            .await?;
        let Some(row) = rows.into_iter().next() else {
            return Err(QueueError::NotFound {
                entity: T::ENTITY,
                id: id.to_string(),
            });
        };
        let record: T = decode(T::TABLE, row)?;
        {
            let mut state = inner.write();
            let list = T::collection_mut(&mut state);
            list.retain(|r| r.id() != id);
            if record.is_listed() {
                list.push(record.clone());
                list.sort_by(|a, b| a.name().cmp(b.name()));
            }
        }
        inner.bump();
        debug!(table = %T::TABLE, id, "record updated");
        Ok(Some(record))
    }

    async fn remove_record<T: CatalogRecord>(&self, id: &str) -> QueueResult<bool> {
        let inner = &self.inner;
        let key = format!("{}-delete-{id}", key_prefix(T::TABLE));
        let Some(_guard) = inner.tracker.guard(&key, OperationKind::Delete) else {
            return Ok(false);
        };
        let _mark = inner.begin_write(T::TABLE);
        let changes = json!({ "is_deleted": true, "updated_at": timestamp(now_utc()) });
        inner
            .write_once(T::TABLE, T::ENTITY, id, changes, None)
            .await?;
        T::collection_mut(&mut inner.write()).retain(|r| r.id() != id);
        inner.bump();
        info!(table = %T::TABLE, id, "record removed");
        Ok(true)
    }

    pub async fn add_crew(&self, draft: CrewDraft) -> QueueResult<CrewMember> {
        let name = validate_name("Crew", &draft.name)?;
        let phone = validate_optional_phone(draft.phone.as_deref())?;
        let row = json!({
            "name": name,
            "phone": phone,
            "role": non_blank(draft.role),
            "is_active": true,
            "is_deleted": false,
        });
        self.insert_record(&name, row).await
    }

    pub async fn update_crew(&self, id: &str, patch: CrewPatch) -> QueueResult<Option<CrewMember>> {
        let mut patch = patch;
        if let Some(name) = &patch.name {
            patch.name = Some(validate_name("Crew", name)?);
        }
        if let Some(phone) = &patch.phone {
            patch.phone = Some(validate_optional_phone(phone.as_deref())?);
        }
        patch.role = patch.role.map(non_blank);
        self.update_record(id, encode(&patch)?).await
    }

    pub async fn remove_crew(&self, id: &str) -> QueueResult<bool> {
        self.remove_record::<CrewMember>(id).await
    }

    pub async fn add_service(&self, draft: ServiceDraft) -> QueueResult<Service> {
        let name = validate_name("Service", &draft.name)?;
        if let Some(price) = draft.price {
            validate_cost(price)?;
        }
        if let Some(prices) = &draft.prices {
            validate_price_table(draft.vehicle_type, prices)?;
        }
        let mut row = encode(&ServiceDraft { name: name.clone(), ..draft })?;
        row["is_deleted"] = json!(false);
        self.insert_record(&name, row).await
    }

    pub async fn update_service(&self, id: &str, patch: ServicePatch) -> QueueResult<Option<Service>> {
        let mut patch = patch;
        if let Some(name) = &patch.name {
            patch.name = Some(validate_name("Service", name)?);
        }
        if let Some(Some(price)) = patch.price {
            validate_cost(price)?;
        }
        if let Some(Some(prices)) = &patch.prices {
            let kind = self
                .inner
                .read()
                .services
                .iter()
                .find(|s| s.id == id)
                .map(|s| s.vehicle_type)
                .ok_or_else(|| QueueError::NotFound {
                    entity: Service::ENTITY,
                    id: id.to_string(),
                })?;
            validate_price_table(kind, prices)?;
        }
        self.update_record(id, encode(&patch)?).await
    }

    pub async fn remove_service(&self, id: &str) -> QueueResult<bool> {
        self.remove_record::<Service>(id).await
    }

    pub async fn add_package(&self, draft: PackageDraft) -> QueueResult<ServicePackage> {
        let name = validate_name("Package", &draft.name)?;
        validate_price_table(draft.vehicle_type, &draft.prices)?;
        let mut row = encode(&PackageDraft { name: name.clone(), ..draft })?;
        row["is_active"] = json!(true);
        row["is_deleted"] = json!(false);
        self.insert_record(&name, row).await
    }

    /// Packages deactivated here leave the live collection but can be
    /// reactivated by id.
    pub async fn update_package(
        &self,
        id: &str,
        patch: PackagePatch,
    ) -> QueueResult<Option<ServicePackage>> {
        let mut patch = patch;
        if let Some(name) = &patch.name {
            patch.name = Some(validate_name("Package", name)?);
        }
        if let Some(prices) = &patch.prices {
            let kind = self
                .inner
                .read()
                .packages
                .iter()
                .find(|p| p.id == id)
                .map(|p| p.vehicle_type);
            // Inactive packages are not held locally; fall back to the
            // widest size domain.
            validate_price_table(kind.unwrap_or(VehicleKind::Car), prices)?;
        }
        self.update_record(id, encode(&patch)?).await
    }

    pub async fn remove_package(&self, id: &str) -> QueueResult<bool> {
        self.remove_record::<ServicePackage>(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteStore;
    use crate::models::{PriceTable, VehicleSize};
    use crate::notify::NotifyError;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;

    /// Wraps the in-memory store with counters and injected failures.
    struct FlakyStore {
        inner: SqliteStore,
        inserts: AtomicU32,
        updates: AtomicU32,
        fail_next_updates: AtomicU32,
        yield_on_update: AtomicBool,
        /// Held after reading, before the rows are returned.
        select_delay: Mutex<Option<Duration>>,
        fail_select_for: Mutex<Option<Table>>,
    }

    impl FlakyStore {
        fn new() -> Self {
            Self {
                inner: SqliteStore::open_in_memory().expect("in-memory store"),
                inserts: AtomicU32::new(0),
                updates: AtomicU32::new(0),
                fail_next_updates: AtomicU32::new(0),
                yield_on_update: AtomicBool::new(false),
                select_delay: Mutex::new(None),
                fail_select_for: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl DataStore for FlakyStore {
        async fn select(&self, table: Table, query: &Query) -> Result<Vec<Value>, StoreError> {
            if *self.fail_select_for.lock().unwrap() == Some(table) {
                return Err(StoreError::network("connection refused"));
            }
            let rows = self.inner.select(table, query).await?;
            let delay = *self.select_delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            Ok(rows)
        }

        async fn insert(&self, table: Table, row: Value) -> Result<Value, StoreError> {
            self.inserts.fetch_add(1, Ordering::SeqCst);
            self.inner.insert(table, row).await
        }

        async fn update(
            &self,
            table: Table,
            changes: Value,
            query: &Query,
        ) -> Result<Vec<Value>, StoreError> {
            self.updates.fetch_add(1, Ordering::SeqCst);
            if self.yield_on_update.load(Ordering::SeqCst) {
                tokio::task::yield_now().await;
            }
            let should_fail = self
                .fail_next_updates
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if should_fail {
                return Err(StoreError::network("connection reset"));
            }
            self.inner.update(table, changes, query).await
        }

        fn subscribe(&self, table: Table) -> Subscription {
            self.inner.subscribe(table)
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<NotificationPayload>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, payload: &NotificationPayload) -> Result<(), NotifyError> {
            self.sent.lock().unwrap().push(payload.clone());
            Ok(())
        }
    }

    fn fast_settings() -> QueueSettings {
        QueueSettings {
            vehicle_debounce: Duration::from_millis(20),
            catalog_debounce: Duration::from_millis(20),
            completion_max_retries: 3,
            retry_delay: Duration::from_millis(1),
        }
    }

    fn setup() -> (QueueCore, Arc<FlakyStore>, Arc<RecordingNotifier>) {
        let store = Arc::new(FlakyStore::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let core = QueueCore::new(store.clone(), notifier.clone(), fast_settings());
        (core, store, notifier)
    }

    async fn add_wash(core: &QueueCore) -> Service {
        core.add_service(ServiceDraft {
            name: "Wash".into(),
            price: Some(200.0),
            prices: None,
            vehicle_type: VehicleKind::Car,
        })
        .await
        .expect("add service")
    }

    async fn waiting_car(core: &QueueCore, plate: &str, service_id: &str) -> Car {
        core.add_car(
            VehicleDraft::new(plate, "Vios", VehicleSize::Medium)
                .with_services([service_id])
                .with_crew(["crew-1"]),
        )
        .await
        .expect("add car")
    }

    #[tokio::test]
    async fn test_add_car_computes_total_and_queue_position() {
        let (core, _, _) = setup();
        let wash = add_wash(&core).await;

        let first = waiting_car(&core, "abc-1234", &wash.id).await;
        assert_eq!(first.base.plate, "ABC-1234");
        assert_eq!(first.base.total_cost, 200.0);
        assert_eq!(first.service, "Wash");
        assert!(first.base.time_waiting.is_some());
        assert_eq!(core.queue_position::<Car>(first.id()), Some(1));

        tokio::time::sleep(Duration::from_millis(2)).await;
        let second = waiting_car(&core, "XYZ-9876", &wash.id).await;
        assert_eq!(core.queue_position::<Car>(second.id()), Some(2));
        assert_eq!(core.cars()[0].id(), second.id());
    }

    #[tokio::test]
    async fn test_duplicate_active_plate_rejected_before_write() {
        let (core, store, _) = setup();
        let wash = add_wash(&core).await;
        waiting_car(&core, "ABC-1234", &wash.id).await;
        let inserts_before = store.inserts.load(Ordering::SeqCst);

        let err = core
            .add_car(VehicleDraft::new(" abc-1234", "City", VehicleSize::Small))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::DuplicatePlate { .. }));
        assert!(err.to_string().contains("already in the active queue"));
        assert_eq!(store.inserts.load(Ordering::SeqCst), inserts_before);
    }

    #[tokio::test]
    async fn test_store_unique_violation_maps_to_duplicate_plate() {
        let (core, store, _) = setup();
        // Written behind the core's back, so only the store can catch it.
        store
            .inner
            .insert(
                Table::Cars,
                json!({ "plate": "ABC-1234", "size": "small", "status": "waiting" }),
            )
            .await
            .unwrap();
        let err = core
            .add_car(VehicleDraft::new("ABC-1234", "Vios", VehicleSize::Small))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::DuplicatePlate { ref plate } if plate == "ABC-1234"));
        assert!(core.cars().is_empty());
    }

    #[tokio::test]
    async fn test_refetch_keeps_update_that_lands_during_read() {
        let (core, store, _) = setup();
        let wash = add_wash(&core).await;
        let car = waiting_car(&core, "ABC-1234", &wash.id).await;
        let id = car.id().to_string();

        *store.select_delay.lock().unwrap() = Some(Duration::from_millis(100));
        let refetch = {
            let core = core.clone();
            tokio::spawn(async move { core.refetch(Table::Cars).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let updated = core
            .update_car(&id, VehiclePatch::status(VehicleStatus::InProgress))
            .await
            .unwrap()
            .expect("update applied");
        assert_eq!(updated.status(), VehicleStatus::InProgress);

        refetch.await.unwrap();
        let local = core.vehicle::<Car>(&id).unwrap();
        assert_eq!(local.status(), VehicleStatus::InProgress);
        assert!(local.base.time_in_progress.is_some());

        // With no write in between, the next refetch applies again.
        *store.select_delay.lock().unwrap() = None;
        store
            .inner
            .insert(
                Table::Cars,
                json!({ "plate": "NEW-0001", "size": "small", "status": "waiting" }),
            )
            .await
            .unwrap();
        core.refetch(Table::Cars).await;
        assert_eq!(core.cars().len(), 2);
        assert_eq!(
            core.vehicle::<Car>(&id).unwrap().status(),
            VehicleStatus::InProgress
        );
    }

    #[tokio::test]
    async fn test_initial_load_records_each_table_failure_independently() {
        let (core, store, _) = setup();
        store
            .inner
            .insert(
                Table::Cars,
                json!({ "plate": "ABC-1234", "size": "small", "status": "waiting" }),
            )
            .await
            .unwrap();
        store
            .inner
            .insert(Table::Crews, json!({ "name": "Ana" }))
            .await
            .unwrap();
        store
            .inner
            .insert(
                Table::Packages,
                json!({
                    "name": "Full Detail",
                    "prices": { "small": 500.0 },
                    "vehicle_type": "car",
                }),
            )
            .await
            .unwrap();
        store
            .inner
            .insert(
                Table::Services,
                json!({ "name": "Wash", "price": 200.0, "vehicle_type": "car" }),
            )
            .await
            .unwrap();
        *store.fail_select_for.lock().unwrap() = Some(Table::Services);

        core.load().await;

        assert_eq!(core.cars().len(), 1);
        assert_eq!(core.crews().len(), 1);
        assert_eq!(core.packages().len(), 1);
        assert!(core.services().is_empty());

        let state = core.snapshot();
        assert_eq!(
            state.table_errors.keys().copied().collect::<Vec<_>>(),
            vec![Table::Services]
        );
        assert!(core.last_error().is_some());
        assert!(!core.is_loading());

        // A later successful fetch clears the table's error.
        *store.fail_select_for.lock().unwrap() = None;
        core.refetch(Table::Services).await;
        assert_eq!(core.services().len(), 1);
        assert!(core.snapshot().table_errors.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_completion_sends_one_write() {
        let (core, store, _) = setup();
        let wash = add_wash(&core).await;
        let car = waiting_car(&core, "ABC-1234", &wash.id).await;
        let id = car.id().to_string();
        core.update_car(&id, VehiclePatch::status(VehicleStatus::InProgress))
            .await
            .unwrap();
        core.update_car(&id, VehiclePatch::status(VehicleStatus::PaymentPending))
            .await
            .unwrap();

        store.updates.store(0, Ordering::SeqCst);
        store.yield_on_update.store(true, Ordering::SeqCst);
        let (a, b) = tokio::join!(
            core.update_car(&id, VehiclePatch::status(VehicleStatus::Completed)),
            core.update_car(&id, VehiclePatch::status(VehicleStatus::Completed)),
        );

        let results = [a.unwrap(), b.unwrap()];
        assert_eq!(results.iter().filter(|r| r.is_some()).count(), 1);
        assert_eq!(store.updates.load(Ordering::SeqCst), 1);
        let done = results.into_iter().flatten().next().unwrap();
        assert_eq!(done.status(), VehicleStatus::Completed);
        assert!(done.base.completed_at.is_some());
        assert!(!core.tracker().any_active_with_prefix("car-"));
    }

    #[tokio::test]
    async fn test_completion_retries_after_transient_failure() {
        let (core, store, _) = setup();
        let wash = add_wash(&core).await;
        let car = waiting_car(&core, "ABC-1234", &wash.id).await;
        let id = car.id().to_string();
        core.update_car(&id, VehiclePatch::status(VehicleStatus::InProgress))
            .await
            .unwrap();
        core.update_car(&id, VehiclePatch::status(VehicleStatus::PaymentPending))
            .await
            .unwrap();

        store.updates.store(0, Ordering::SeqCst);
        store.fail_next_updates.store(1, Ordering::SeqCst);
        let done = core
            .update_car(&id, VehiclePatch::status(VehicleStatus::Completed))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(store.updates.load(Ordering::SeqCst), 2);
        assert_eq!(done.status(), VehicleStatus::Completed);

        let rows = store.inner.select(Table::Cars, &Query::by_id(&id)).await.unwrap();
        assert_eq!(rows[0]["status"], "completed");
    }

    #[tokio::test]
    async fn test_non_completion_write_failure_leaves_state_unchanged() {
        let (core, store, _) = setup();
        let wash = add_wash(&core).await;
        let car = waiting_car(&core, "ABC-1234", &wash.id).await;

        store.fail_next_updates.store(1, Ordering::SeqCst);
        let err = core
            .update_car(car.id(), VehiclePatch::status(VehicleStatus::InProgress))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        let local = core.vehicle::<Car>(car.id()).unwrap();
        assert_eq!(local.status(), VehicleStatus::Waiting);
        assert!(core.last_error().is_some());
        assert!(!core.tracker().is_active(&format!("car-update-{}", car.id())));
    }

    #[tokio::test]
    async fn test_invalid_transition_rejected() {
        let (core, store, _) = setup();
        let wash = add_wash(&core).await;
        let car = waiting_car(&core, "ABC-1234", &wash.id).await;
        store.updates.store(0, Ordering::SeqCst);

        let err = core
            .update_car(car.id(), VehiclePatch::status(VehicleStatus::Completed))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidTransition { .. }));
        assert_eq!(store.updates.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_motorcycle_needs_crew_unless_packaged() {
        let (core, _, _) = setup();
        let moto = core
            .add_motorcycle(VehicleDraft::new("123-ABC", "Click", VehicleSize::Small))
            .await
            .unwrap();
        let err = core
            .update_motorcycle(moto.id(), VehiclePatch::status(VehicleStatus::InProgress))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Validation(_)));

        let mut prices = PriceTable::new();
        prices.insert(VehicleSize::Small, 150.0);
        let package = core
            .add_package(PackageDraft {
                name: "Basic".into(),
                prices,
                vehicle_type: VehicleKind::Motorcycle,
                requires_crew: None,
            })
            .await
            .unwrap();
        let packaged = core
            .add_motorcycle(
                VehicleDraft::new("456-DEF", "Click", VehicleSize::Small)
                    .with_package(package.id.clone())
                    .with_status(VehicleStatus::InProgress),
            )
            .await
            .unwrap();
        assert_eq!(packaged.base.total_cost, 150.0);
        assert!(packaged.base.time_in_progress.is_some());
    }

    #[tokio::test]
    async fn test_lifecycle_stamps_survive_send_back() {
        let (core, _, _) = setup();
        let wash = add_wash(&core).await;
        let car = waiting_car(&core, "ABC-1234", &wash.id).await;
        let id = car.id().to_string();

        let started = core
            .update_car(&id, VehiclePatch::status(VehicleStatus::InProgress))
            .await
            .unwrap()
            .unwrap();
        let first_start = started.base.time_in_progress;
        assert!(first_start.is_some());

        core.update_car(&id, VehiclePatch::status(VehicleStatus::Waiting))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        let again = core
            .update_car(&id, VehiclePatch::status(VehicleStatus::InProgress))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.base.time_in_progress, first_start);
    }

    #[tokio::test]
    async fn test_plate_change_checked_against_other_active_vehicles() {
        let (core, _, _) = setup();
        let wash = add_wash(&core).await;
        waiting_car(&core, "ABC-1234", &wash.id).await;
        let other = waiting_car(&core, "XYZ-9876", &wash.id).await;

        let err = core
            .update_car(other.id(), VehiclePatch::default().with_plate("abc-1234"))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::DuplicatePlate { .. }));

        // Re-submitting its own plate is not a change.
        let same = core
            .update_car(other.id(), VehiclePatch::default().with_plate("xyz-9876"))
            .await
            .unwrap();
        assert!(same.is_some());
    }

    #[tokio::test]
    async fn test_cancel_requires_reason() {
        let (core, _, notifier) = setup();
        let wash = add_wash(&core).await;
        let car = waiting_car(&core, "ABC-1234", &wash.id).await;

        let err = core
            .update_car(car.id(), VehiclePatch::status(VehicleStatus::Cancelled))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Validation(_)));

        let cancelled = core
            .update_car(car.id(), VehiclePatch::cancel("  customer left  "))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cancelled.base.cancellation_reason.as_deref(), Some("customer left"));
        core.shutdown().await;
        assert!(notifier.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_hides_vehicle_locally_and_on_refetch() {
        let (core, _, _) = setup();
        let wash = add_wash(&core).await;
        let car = waiting_car(&core, "ABC-1234", &wash.id).await;

        assert!(core.remove_car(car.id()).await.unwrap());
        assert!(core.cars().is_empty());

        core.load().await;
        assert!(core.cars().is_empty());
        assert!(!core.is_loading());

        // The plate is free again.
        waiting_car(&core, "ABC-1234", &wash.id).await;
    }

    #[tokio::test]
    async fn test_refetch_skipped_while_write_in_flight() {
        let (core, store, _) = setup();
        store
            .inner
            .insert(
                Table::Cars,
                json!({ "plate": "ABC-1234", "size": "small", "status": "waiting" }),
            )
            .await
            .unwrap();

        core.tracker().start("car-update-x", OperationKind::Update, 0);
        core.refetch(Table::Cars).await;
        assert!(core.cars().is_empty());

        core.tracker().end("car-update-x");
        core.refetch(Table::Cars).await;
        assert_eq!(core.cars().len(), 1);
    }

    #[tokio::test]
    async fn test_change_event_triggers_debounced_refetch() {
        let (core, store, _) = setup();
        core.start().await;
        assert!(core.cars().is_empty());

        store
            .inner
            .insert(
                Table::Cars,
                json!({ "plate": "ABC-1234", "size": "small", "status": "waiting" }),
            )
            .await
            .unwrap();

        let arrived = tokio::time::timeout(Duration::from_secs(2), async {
            while core.cars().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(arrived.is_ok());
        core.shutdown().await;
    }

    #[tokio::test]
    async fn test_initial_load_filters_inactive_and_deleted() {
        let (core, store, _) = setup();
        let crew = store
            .inner
            .insert(Table::Crews, json!({ "name": "Ana" }))
            .await
            .unwrap();
        store
            .inner
            .insert(Table::Crews, json!({ "name": "Ben", "is_active": false }))
            .await
            .unwrap();
        store
            .inner
            .insert(Table::Services, json!({ "name": "Old", "vehicle_type": "car", "is_deleted": true }))
            .await
            .unwrap();

        core.load().await;
        let crews = core.crews();
        assert_eq!(crews.len(), 1);
        assert_eq!(crews[0].id, crew["id"].as_str().unwrap());
        assert!(core.services().is_empty());
        assert!(core.last_error().is_none());
    }

    #[tokio::test]
    async fn test_notifications_follow_committed_transitions() {
        let (core, _, notifier) = setup();
        let wash = add_wash(&core).await;
        let car = core
            .add_car(
                VehicleDraft::new("ABC-1234", "Vios", VehicleSize::Medium)
                    .with_services([wash.id.clone()])
                    .with_crew(["crew-1"])
                    .with_phone("09171234567"),
            )
            .await
            .unwrap();
        core.update_car(car.id(), VehiclePatch::status(VehicleStatus::InProgress))
            .await
            .unwrap();
        waiting_car(&core, "NOPHONE-1", &wash.id).await;
        core.shutdown().await;

        let sent = notifier.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 2);
        let added = sent.iter().find(|p| p.status == VehicleStatus::Waiting).unwrap();
        assert_eq!(added.queue_number, Some(1));
        assert_eq!(added.phone_number, "+639171234567");
        assert_eq!(added.service_type, "Wash");
        let started = sent.iter().find(|p| p.status == VehicleStatus::InProgress).unwrap();
        assert_eq!(started.queue_number, None);
    }

    #[tokio::test]
    async fn test_search_history_returns_latest_match() {
        let (core, _, _) = setup();
        let wash = add_wash(&core).await;
        let car = waiting_car(&core, "ABC-1234", &wash.id).await;
        core.update_car(car.id(), VehiclePatch::cancel("changed mind"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        core.add_car(
            VehicleDraft::new("ABC-1234", "Vios GR", VehicleSize::Large)
                .with_phone("09171234567"),
        )
        .await
        .unwrap();

        let found = core.search_car_history("bc-12").await.unwrap().unwrap();
        assert_eq!(found.model, "Vios GR");
        assert_eq!(found.size, VehicleSize::Large);
        assert!(core.search_car_history("ab").await.is_err());
        assert!(core.search_motorcycle_history("ZZZ").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_busy_crew_excludes_current_vehicle() {
        let (core, _, _) = setup();
        let wash = add_wash(&core).await;
        let car = waiting_car(&core, "ABC-1234", &wash.id).await;
        core.update_car(car.id(), VehiclePatch::status(VehicleStatus::InProgress))
            .await
            .unwrap();

        let now = Utc::now();
        assert!(core.busy_crew_at(None, &now).contains("crew-1"));
        assert!(core.busy_crew_at(Some(car.id()), &now).is_empty());
    }

    #[tokio::test]
    async fn test_crew_crud_round_trip() {
        let (core, _, _) = setup();
        let ana = core
            .add_crew(CrewDraft {
                name: " Ana ".into(),
                phone: Some("09171234567".into()),
                role: None,
            })
            .await
            .unwrap();
        assert_eq!(ana.name, "Ana");
        assert_eq!(core.crews().len(), 1);

        let renamed = core
            .update_crew(
                &ana.id,
                CrewPatch {
                    name: Some("Ana Cruz".into()),
                    ..CrewPatch::default()
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(renamed.name, "Ana Cruz");
        assert_eq!(renamed.phone.as_deref(), Some("+639171234567"));

        core.update_crew(
            &ana.id,
            CrewPatch {
                is_active: Some(false),
                ..CrewPatch::default()
            },
        )
        .await
        .unwrap();
        assert!(core.crews().is_empty());

        assert!(core.remove_crew(&ana.id).await.unwrap());
        let err = core.update_crew("missing", CrewPatch::default()).await.unwrap_err();
        assert!(matches!(err, QueueError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_revision_bumps_on_change() {
        let (core, store, _) = setup();
        let rx = core.revisions();
        let before = *rx.borrow();
        add_wash(&core).await;
        assert!(*rx.borrow() > before);

        store
            .inner
            .insert(Table::Crews, json!({ "name": "Ana" }))
            .await
            .unwrap();
        let seen = *rx.borrow();
        core.refetch(Table::Crews).await;
        assert!(*rx.borrow() > seen);
        assert_eq!(core.crews().len(), 1);
    }
}
