//! Vehicle status state machine, set-once lifecycle timestamps and the
//! per-status elapsed-time facts shown on queue cards.
//!
//! ```text
//! waiting ──► in-progress ──► payment-pending ──► completed
//!    ▲             │                 │
//!    └─────────────┴─────────────────┘   (send back to waiting)
//! any active state ──► cancelled
//! ```

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::error::QueueError;
use crate::models::{LifecycleStamps, VehicleBase, VehicleStatus};

/// Statuses reachable from `from` in one step.
pub fn allowed_transitions(from: VehicleStatus) -> &'static [VehicleStatus] {
    use VehicleStatus::*;
    match from {
        Waiting => &[InProgress, Cancelled],
        InProgress => &[PaymentPending, Waiting, Cancelled],
        PaymentPending => &[Completed, Waiting, Cancelled],
        Completed | Cancelled => &[],
    }
}

pub fn can_transition(from: VehicleStatus, to: VehicleStatus) -> bool {
    allowed_transitions(from).contains(&to)
}

/// Reject any edge not in the table. Staying in the same status is not a
/// transition and is accepted.
pub fn check_transition(from: VehicleStatus, to: VehicleStatus) -> Result<(), QueueError> {
    if from == to || can_transition(from, to) {
        Ok(())
    } else {
        Err(QueueError::InvalidTransition { from, to })
    }
}

/// Stamps to write when a record enters `to`. Only unset fields are filled.
pub fn stamps_for(base: &VehicleBase, to: VehicleStatus, now: DateTime<Utc>) -> LifecycleStamps {
    let mut stamps = LifecycleStamps::default();
    match to {
        VehicleStatus::Waiting if base.time_waiting.is_none() => stamps.time_waiting = Some(now),
        VehicleStatus::InProgress if base.time_in_progress.is_none() => {
            stamps.time_in_progress = Some(now)
        }
        VehicleStatus::PaymentPending if base.time_ready_for_payment.is_none() => {
            stamps.time_ready_for_payment = Some(now)
        }
        VehicleStatus::Completed if base.completed_at.is_none() => stamps.completed_at = Some(now),
        _ => {}
    }
    stamps
}

/// Stamps for a vehicle inserted directly into `status`.
pub fn initial_stamps(status: VehicleStatus, now: DateTime<Utc>) -> LifecycleStamps {
    let mut stamps = LifecycleStamps {
        time_waiting: Some(now),
        ..LifecycleStamps::default()
    };
    if status == VehicleStatus::InProgress {
        stamps.time_in_progress = Some(now);
    }
    stamps
}

// ---------------------------------------------------------------------------
// Elapsed-time sections
// ---------------------------------------------------------------------------

/// Duration facts for a vehicle's current status. "Live" figures are
/// measured against the `now` passed in; consumers recompute periodically.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum TimeSection {
    Waiting {
        since: DateTime<Utc>,
        #[serde(serialize_with = "as_seconds")]
        waiting: Duration,
    },
    InProgress {
        #[serde(serialize_with = "as_seconds")]
        waited: Duration,
        since: DateTime<Utc>,
        #[serde(serialize_with = "as_seconds")]
        processing: Duration,
    },
    PaymentPending {
        #[serde(serialize_with = "as_seconds")]
        waited: Duration,
        #[serde(serialize_with = "as_seconds")]
        processed: Duration,
        since: DateTime<Utc>,
        #[serde(serialize_with = "as_seconds")]
        pending: Duration,
    },
    Completed {
        #[serde(serialize_with = "as_seconds")]
        waiting: Duration,
        #[serde(serialize_with = "as_seconds")]
        processing: Duration,
        #[serde(serialize_with = "as_seconds")]
        total: Duration,
    },
    Cancelled {
        #[serde(serialize_with = "as_seconds")]
        total: Duration,
    },
}

fn as_seconds<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_i64(d.num_seconds())
}

/// `to - from`, never negative (clock skew between terminals happens).
fn span(from: DateTime<Utc>, to: DateTime<Utc>) -> Duration {
    (to - from).max(Duration::zero())
}

pub fn time_section(base: &VehicleBase, now: DateTime<Utc>) -> TimeSection {
    let waiting_start = base.time_waiting.unwrap_or(base.created_at);
    let progress_start = base.time_in_progress.unwrap_or(waiting_start);

    match base.status {
        VehicleStatus::Waiting => TimeSection::Waiting {
            since: waiting_start,
            waiting: span(waiting_start, now),
        },
        VehicleStatus::InProgress => TimeSection::InProgress {
            waited: span(waiting_start, progress_start),
            since: progress_start,
            processing: span(progress_start, now),
        },
        VehicleStatus::PaymentPending => {
            let ready = base.time_ready_for_payment.unwrap_or(base.updated_at);
            TimeSection::PaymentPending {
                waited: span(waiting_start, progress_start),
                processed: span(progress_start, ready),
                since: ready,
                pending: span(ready, now),
            }
        }
        VehicleStatus::Completed => {
            let done = base.completed_at.unwrap_or(base.updated_at);
            let processing_end = base.time_ready_for_payment.unwrap_or(done);
            TimeSection::Completed {
                waiting: span(waiting_start, progress_start),
                processing: span(progress_start, processing_end),
                total: span(waiting_start, done),
            }
        }
        VehicleStatus::Cancelled => TimeSection::Cancelled {
            total: span(waiting_start, base.updated_at),
        },
    }
}

/// Short human form: `<1m`, `45m`, `1h 05m`.
pub fn format_duration(d: Duration) -> String {
    let minutes = d.num_minutes().max(0);
    if minutes < 1 {
        "<1m".to_string()
    } else if minutes < 60 {
        format!("{minutes}m")
    } else {
        format!("{}h {:02}m", minutes / 60, minutes % 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::VehicleSize;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, h, m, 0).unwrap()
    }

    fn base(status: VehicleStatus) -> VehicleBase {
        VehicleBase {
            id: "v-1".into(),
            plate: "ABC-1234".into(),
            model: "Vios".into(),
            size: VehicleSize::Medium,
            status,
            phone: None,
            crew: vec![],
            total_cost: 0.0,
            created_at: at(8, 0),
            updated_at: at(8, 0),
            is_deleted: false,
            cancellation_reason: None,
            time_waiting: None,
            time_in_progress: None,
            time_ready_for_payment: None,
            completed_at: None,
        }
    }

    #[test]
    fn test_transition_table() {
        use VehicleStatus::*;
        assert!(can_transition(Waiting, InProgress));
        assert!(can_transition(Waiting, Cancelled));
        assert!(!can_transition(Waiting, Completed));
        assert!(!can_transition(Waiting, PaymentPending));
        assert!(can_transition(InProgress, Waiting));
        assert!(can_transition(PaymentPending, Completed));
        assert!(can_transition(PaymentPending, Waiting));
        assert!(!can_transition(PaymentPending, InProgress));
        for to in VehicleStatus::ALL {
            assert!(!can_transition(Completed, to));
            assert!(!can_transition(Cancelled, to));
        }
    }

    #[test]
    fn test_check_transition_allows_same_status() {
        assert!(check_transition(VehicleStatus::Completed, VehicleStatus::Completed).is_ok());
        let err = check_transition(VehicleStatus::Waiting, VehicleStatus::Completed).unwrap_err();
        assert!(matches!(err, QueueError::InvalidTransition { .. }));
        assert_eq!(err.to_string(), "Cannot move a vehicle from waiting to completed");
    }

    #[test]
    fn test_stamps_are_set_once() {
        let mut b = base(VehicleStatus::Waiting);
        let first = stamps_for(&b, VehicleStatus::InProgress, at(8, 10));
        assert_eq!(first.time_in_progress, Some(at(8, 10)));

        b.time_in_progress = Some(at(8, 10));
        let again = stamps_for(&b, VehicleStatus::InProgress, at(9, 0));
        assert_eq!(again, LifecycleStamps::default());
    }

    #[test]
    fn test_initial_stamps_for_in_progress() {
        let stamps = initial_stamps(VehicleStatus::InProgress, at(8, 0));
        assert_eq!(stamps.time_waiting, Some(at(8, 0)));
        assert_eq!(stamps.time_in_progress, Some(at(8, 0)));
        assert!(initial_stamps(VehicleStatus::Waiting, at(8, 0))
            .time_in_progress
            .is_none());
    }

    #[test]
    fn test_waiting_section_falls_back_to_created_at() {
        let b = base(VehicleStatus::Waiting);
        match time_section(&b, at(8, 25)) {
            TimeSection::Waiting { since, waiting } => {
                assert_eq!(since, at(8, 0));
                assert_eq!(waiting.num_minutes(), 25);
            }
            other => panic!("unexpected section {other:?}"),
        }
    }

    #[test]
    fn test_in_progress_section() {
        let mut b = base(VehicleStatus::InProgress);
        b.time_waiting = Some(at(8, 0));
        b.time_in_progress = Some(at(8, 20));
        match time_section(&b, at(9, 0)) {
            TimeSection::InProgress {
                waited, processing, ..
            } => {
                assert_eq!(waited.num_minutes(), 20);
                assert_eq!(processing.num_minutes(), 40);
            }
            other => panic!("unexpected section {other:?}"),
        }
    }

    #[test]
    fn test_completed_section_is_static() {
        let mut b = base(VehicleStatus::Completed);
        b.time_waiting = Some(at(8, 0));
        b.time_in_progress = Some(at(8, 15));
        b.time_ready_for_payment = Some(at(9, 0));
        b.completed_at = Some(at(9, 5));
        let early = time_section(&b, at(10, 0));
        let late = time_section(&b, at(18, 0));
        assert_eq!(early, late);
        match early {
            TimeSection::Completed {
                waiting,
                processing,
                total,
            } => {
                assert_eq!(waiting.num_minutes(), 15);
                assert_eq!(processing.num_minutes(), 45);
                assert_eq!(total.num_minutes(), 65);
            }
            other => panic!("unexpected section {other:?}"),
        }
    }

    #[test]
    fn test_negative_spans_clamp_to_zero() {
        let b = base(VehicleStatus::Waiting);
        match time_section(&b, at(7, 0)) {
            TimeSection::Waiting { waiting, .. } => assert_eq!(waiting, Duration::zero()),
            other => panic!("unexpected section {other:?}"),
        }
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::seconds(30)), "<1m");
        assert_eq!(format_duration(Duration::minutes(45)), "45m");
        assert_eq!(format_duration(Duration::minutes(65)), "1h 05m");
        assert_eq!(format_duration(Duration::minutes(-5)), "<1m");
    }
}
