use chrono::{Datelike, Duration as ChronoDuration, NaiveDate};
use serde::Serialize;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionKind {
    Cancelled,
    Rescheduled,
}

impl ExceptionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::Rescheduled => "rescheduled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "cancelled" => Some(Self::Cancelled),
            "rescheduled" => Some(Self::Rescheduled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceKind {
    RecurringGenerated,
    OneOff,
    ExceptionRescheduled,
    ExceptionCancelled,
}

impl InstanceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RecurringGenerated => "recurring_generated",
            Self::OneOff => "one_off",
            Self::ExceptionRescheduled => "exception_rescheduled",
            Self::ExceptionCancelled => "exception_cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "recurring_generated" => Some(Self::RecurringGenerated),
            "one_off" => Some(Self::OneOff),
            "exception_rescheduled" => Some(Self::ExceptionRescheduled),
            "exception_cancelled" => Some(Self::ExceptionCancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attendance {
    Unset,
    Present,
    Absent,
}

impl Attendance {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unset => "unset",
            Self::Present => "present",
            Self::Absent => "absent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "unset" => Some(Self::Unset),
            "present" => Some(Self::Present),
            "absent" => Some(Self::Absent),
            _ => None,
        }
    }
}

/// A weekly recurrence template. `weekday` counts 0..=6 from Monday,
/// matching `NaiveDate::weekday().num_days_from_monday()`.
#[derive(Debug, Clone)]
pub struct StandardSlot {
    pub id: String,
    pub student_id: String,
    pub weekday: u32,
    pub start_time: String,
    pub duration_minutes: i64,
    pub active: bool,
}

#[derive(Debug, Clone)]
pub struct ExceptionEntry {
    pub slot_id: String,
    pub occurrence_date: NaiveDate,
    pub kind: ExceptionKind,
    pub start_time: Option<String>,
    pub duration_minutes: Option<i64>,
    pub observations: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ClassInstance {
    pub id: String,
    pub student_id: String,
    pub source_slot_id: Option<String>,
    pub occurrence_date: NaiveDate,
    pub start_time: String,
    pub duration_minutes: i64,
    pub kind: InstanceKind,
    pub attendance: Attendance,
    pub observations: Option<String>,
}

/// Half-open date range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MaterializeDiff {
    pub to_create: Vec<ClassInstance>,
    pub to_update: Vec<ClassInstance>,
}

impl MaterializeDiff {
    pub fn is_empty(&self) -> bool {
        self.to_create.is_empty() && self.to_update.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScheduleError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ScheduleError {
    fn invariant(message: impl Into<String>, details: serde_json::Value) -> Self {
        Self {
            code: "schedule_invariant".to_string(),
            message: message.into(),
            details: Some(details),
        }
    }
}

impl std::fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ScheduleError {}

/// Dates in `window` falling on `weekday`, ascending.
fn occurrence_dates(window: DateRange, weekday: u32) -> Vec<NaiveDate> {
    let mut out = Vec::new();
    if window.end <= window.start {
        return out;
    }
    let start_wd = window.start.weekday().num_days_from_monday();
    let offset = (7 + weekday - start_wd) % 7;
    let mut d = window.start + ChronoDuration::days(offset as i64);
    while d < window.end {
        out.push(d);
        d += ChronoDuration::days(7);
    }
    out
}

/// Computes the diff that makes the instance store agree with the active
/// templates and the exception ledger over `window`.
///
/// Pure over its inputs: re-running with unchanged inputs yields an empty
/// diff. Existing rows are never deleted; a cancelled occurrence is a row in
/// the `exception_cancelled` state, so the date can never be regenerated as
/// a normal recurring class. Attendance and observations on existing rows
/// are never overwritten by updates.
pub fn materialize(
    slots: &[StandardSlot],
    exceptions: &[ExceptionEntry],
    window: DateRange,
    existing: &[ClassInstance],
) -> Result<MaterializeDiff, ScheduleError> {
    let mut exc_by_key: HashMap<(&str, NaiveDate), &ExceptionEntry> = HashMap::new();
    for e in exceptions {
        if exc_by_key
            .insert((e.slot_id.as_str(), e.occurrence_date), e)
            .is_some()
        {
            return Err(ScheduleError::invariant(
                "duplicate exception entry for occurrence",
                serde_json::json!({
                    "slotId": e.slot_id,
                    "date": e.occurrence_date.to_string(),
                }),
            ));
        }
    }

    let mut existing_by_key: HashMap<(&str, NaiveDate), &ClassInstance> = HashMap::new();
    for inst in existing {
        let Some(slot_id) = inst.source_slot_id.as_deref() else {
            continue;
        };
        if existing_by_key
            .insert((slot_id, inst.occurrence_date), inst)
            .is_some()
        {
            return Err(ScheduleError::invariant(
                "duplicate class instance for identity key",
                serde_json::json!({
                    "slotId": slot_id,
                    "date": inst.occurrence_date.to_string(),
                }),
            ));
        }
    }

    let mut diff = MaterializeDiff::default();

    for slot in slots.iter().filter(|s| s.active) {
        for date in occurrence_dates(window, slot.weekday) {
            let exception = exc_by_key.get(&(slot.id.as_str(), date)).copied();
            match existing_by_key.get(&(slot.id.as_str(), date)).copied() {
                None => diff.to_create.push(new_instance(slot, date, exception)),
                Some(current) => {
                    if let Some(updated) = updated_instance(slot, current, exception) {
                        diff.to_update.push(updated);
                    }
                }
            }
        }
    }

    Ok(diff)
}

fn new_instance(
    slot: &StandardSlot,
    date: NaiveDate,
    exception: Option<&ExceptionEntry>,
) -> ClassInstance {
    let (kind, start_time, duration_minutes, observations) = match exception {
        Some(e) if e.kind == ExceptionKind::Cancelled => (
            // A cancellation is recorded even though no class happens, so
            // the date is never regenerated as a normal recurring class.
            InstanceKind::ExceptionCancelled,
            slot.start_time.clone(),
            slot.duration_minutes,
            e.observations.clone(),
        ),
        Some(e) => (
            InstanceKind::ExceptionRescheduled,
            e.start_time.clone().unwrap_or_else(|| slot.start_time.clone()),
            e.duration_minutes.unwrap_or(slot.duration_minutes),
            e.observations.clone(),
        ),
        None => (
            InstanceKind::RecurringGenerated,
            slot.start_time.clone(),
            slot.duration_minutes,
            None,
        ),
    };
    ClassInstance {
        id: Uuid::new_v4().to_string(),
        student_id: slot.student_id.clone(),
        source_slot_id: Some(slot.id.clone()),
        occurrence_date: date,
        start_time,
        duration_minutes,
        kind,
        attendance: Attendance::Unset,
        observations,
    }
}

/// Returns the row as it should look after this run, or None when the
/// existing row already agrees with templates + ledger.
fn updated_instance(
    slot: &StandardSlot,
    current: &ClassInstance,
    exception: Option<&ExceptionEntry>,
) -> Option<ClassInstance> {
    let (kind, start_time, duration_minutes) = match exception {
        Some(e) if e.kind == ExceptionKind::Cancelled => (
            // Keep the row's own time so the calendar still shows when the
            // cancelled class would have happened.
            InstanceKind::ExceptionCancelled,
            current.start_time.clone(),
            current.duration_minutes,
        ),
        Some(e) => (
            InstanceKind::ExceptionRescheduled,
            e.start_time.clone().unwrap_or_else(|| slot.start_time.clone()),
            e.duration_minutes.unwrap_or(slot.duration_minutes),
        ),
        // No exception: the row reverts to (or stays at) the slot's current
        // defaults. This also folds a removed exception back to normal.
        None => (
            InstanceKind::RecurringGenerated,
            slot.start_time.clone(),
            slot.duration_minutes,
        ),
    };

    let observations = current
        .observations
        .clone()
        .or_else(|| exception.and_then(|e| e.observations.clone()));

    if current.kind == kind
        && current.start_time == start_time
        && current.duration_minutes == duration_minutes
        && current.observations == observations
    {
        return None;
    }

    Some(ClassInstance {
        id: current.id.clone(),
        student_id: current.student_id.clone(),
        source_slot_id: current.source_slot_id.clone(),
        occurrence_date: current.occurrence_date,
        start_time,
        duration_minutes,
        kind,
        attendance: current.attendance,
        observations,
    })
}
