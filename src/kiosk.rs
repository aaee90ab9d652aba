//! Customer-facing queue board.
//!
//! A read-only snapshot of the live queue for the waiting-area display:
//! - **Waiting**: plate, kind and queue number, in queue order
//! - **In service**: plate with the names of the assigned crew
//! - **Ready for payment**: plate only
//!
//! Rendering pads or truncates each line to the board width so the text
//! layout never depends on plate or name lengths.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::derived::{self, crew_names};
use crate::lifecycle::{format_duration, time_section, TimeSection};
use crate::models::{Vehicle, VehicleKind, VehicleStatus};
use crate::queue::{QueueCore, QueueState};

/// Characters per rendered line.
const BOARD_WIDTH: usize = 40;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WaitingEntry {
    pub kind: VehicleKind,
    pub plate: String,
    pub queue_number: usize,
    pub waiting: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InServiceEntry {
    pub kind: VehicleKind,
    pub plate: String,
    pub crew: Vec<String>,
    pub processing: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PaymentEntry {
    pub kind: VehicleKind,
    pub plate: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct KioskBoard {
    pub waiting: Vec<WaitingEntry>,
    pub in_service: Vec<InServiceEntry>,
    pub payment_pending: Vec<PaymentEntry>,
}

fn waiting_entries<V: Vehicle>(vehicles: &[V], now: DateTime<Utc>) -> Vec<WaitingEntry> {
    derived::waiting_in_order(vehicles)
        .into_iter()
        .enumerate()
        .map(|(index, v)| {
            let waiting = match time_section(v.base(), now) {
                TimeSection::Waiting { waiting, .. } => format_duration(waiting),
                _ => String::new(),
            };
            WaitingEntry {
                kind: V::KIND,
                plate: v.base().plate.clone(),
                queue_number: index + 1,
                waiting,
            }
        })
        .collect()
}

fn in_service_entries<V: Vehicle>(
    vehicles: &[V],
    state: &QueueState,
    now: DateTime<Utc>,
) -> Vec<InServiceEntry> {
    let mut entries: Vec<(DateTime<Utc>, InServiceEntry)> = vehicles
        .iter()
        .filter(|v| v.status() == VehicleStatus::InProgress)
        .map(|v| {
            let base = v.base();
            let (since, processing) = match time_section(base, now) {
                TimeSection::InProgress {
                    since, processing, ..
                } => (since, format_duration(processing)),
                _ => (base.created_at, String::new()),
            };
            let entry = InServiceEntry {
                kind: V::KIND,
                plate: base.plate.clone(),
                crew: crew_names(&state.crews, &base.crew),
                processing,
            };
            (since, entry)
        })
        .collect();
    entries.sort_by_key(|(since, _)| *since);
    entries.into_iter().map(|(_, entry)| entry).collect()
}

fn payment_entries<V: Vehicle>(vehicles: &[V]) -> Vec<PaymentEntry> {
    vehicles
        .iter()
        .filter(|v| v.status() == VehicleStatus::PaymentPending)
        .map(|v| PaymentEntry {
            kind: V::KIND,
            plate: v.base().plate.clone(),
        })
        .collect()
}

impl KioskBoard {
    pub fn from_state(state: &QueueState, now: DateTime<Utc>) -> Self {
        let mut waiting = waiting_entries(&state.cars, now);
        waiting.extend(waiting_entries(&state.motorcycles, now));

        let mut in_service = in_service_entries(&state.cars, state, now);
        in_service.extend(in_service_entries(&state.motorcycles, state, now));

        let mut payment_pending = payment_entries(&state.cars);
        payment_pending.extend(payment_entries(&state.motorcycles));

        Self {
            waiting,
            in_service,
            payment_pending,
        }
    }

    pub fn capture(core: &QueueCore) -> Self {
        Self::from_state(&core.snapshot(), Utc::now())
    }

    pub fn is_empty(&self) -> bool {
        self.waiting.is_empty() && self.in_service.is_empty() && self.payment_pending.is_empty()
    }

    /// Fixed-width text rendering, one entry per line.
    pub fn render(&self) -> Vec<String> {
        let mut lines = Vec::new();
        lines.push(fit_line("NOW SERVING", BOARD_WIDTH));
        for entry in &self.in_service {
            let left = format!("{} {}", entry.plate, entry.crew.join(", "));
            lines.push(two_column(&left, &entry.processing));
        }
        lines.push(fit_line("WAITING", BOARD_WIDTH));
        for entry in &self.waiting {
            let left = format!("#{} {} ({})", entry.queue_number, entry.plate, entry.kind);
            lines.push(two_column(&left, &entry.waiting));
        }
        if !self.payment_pending.is_empty() {
            lines.push(fit_line("READY FOR PAYMENT", BOARD_WIDTH));
            for entry in &self.payment_pending {
                lines.push(fit_line(&entry.plate, BOARD_WIDTH));
            }
        }
        lines
    }
}

/// Pad or truncate to exactly `width` characters.
fn fit_line(text: &str, width: usize) -> String {
    let trimmed = text.trim();
    let truncated: String = trimmed.chars().take(width).collect();
    format!("{truncated:<width$}")
}

/// Left text truncated to leave room for right-aligned `right`.
fn two_column(left: &str, right: &str) -> String {
    let right = right.trim();
    let room = BOARD_WIDTH.saturating_sub(right.chars().count() + 1);
    let left = fit_line(left, room);
    let line = format!("{left} {right}");
    fit_line(&line, BOARD_WIDTH)
}
