use crate::db;
use crate::schedule::{
    self, Attendance, ClassInstance, DateRange, ExceptionEntry, ExceptionKind, InstanceKind,
    MaterializeDiff, ScheduleError, StandardSlot,
};
use anyhow::anyhow;
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, error};

pub const DEFAULT_HORIZON_DAYS: i64 = 28;
pub const DEFAULT_CLASS_DURATION_MINUTES: i64 = 60;

#[derive(Debug, Clone)]
pub struct ScheduleDefaults {
    pub horizon_days: i64,
    pub default_duration_minutes: i64,
}

pub fn load_schedule_defaults(conn: &Connection) -> ScheduleDefaults {
    let obj = db::settings_get_json(conn, "setup.schedule")
        .ok()
        .flatten()
        .and_then(|v| v.as_object().cloned())
        .unwrap_or_default();
    let horizon_days = obj
        .get("horizonDays")
        .and_then(|v| v.as_i64())
        .filter(|v| *v > 0)
        .unwrap_or(DEFAULT_HORIZON_DAYS);
    let default_duration_minutes = obj
        .get("defaultDurationMinutes")
        .and_then(|v| v.as_i64())
        .filter(|v| *v > 0)
        .unwrap_or(DEFAULT_CLASS_DURATION_MINUTES);
    ScheduleDefaults {
        horizon_days,
        default_duration_minutes,
    }
}

fn parse_date(raw: &str) -> anyhow::Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| anyhow!("bad date in store: {}", raw))
}

// ---- Template store -------------------------------------------------------

struct SlotRow {
    id: String,
    student_id: String,
    weekday: i64,
    start_time: String,
    duration_minutes: i64,
    active: i64,
}

fn slot_from_row(row: SlotRow) -> anyhow::Result<StandardSlot> {
    if !(0..=6).contains(&row.weekday) {
        return Err(anyhow!("bad weekday in store: {}", row.weekday));
    }
    Ok(StandardSlot {
        id: row.id,
        student_id: row.student_id,
        weekday: row.weekday as u32,
        start_time: row.start_time,
        duration_minutes: row.duration_minutes,
        active: row.active != 0,
    })
}

fn query_slots(conn: &Connection, sql: &str, student_id: &str) -> anyhow::Result<Vec<StandardSlot>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map([student_id], |r| {
            Ok(SlotRow {
                id: r.get(0)?,
                student_id: r.get(1)?,
                weekday: r.get(2)?,
                start_time: r.get(3)?,
                duration_minutes: r.get(4)?,
                active: r.get(5)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(slot_from_row).collect()
}

pub fn list_slots(conn: &Connection, student_id: &str) -> anyhow::Result<Vec<StandardSlot>> {
    query_slots(
        conn,
        "SELECT id, student_id, weekday, start_time, duration_minutes, active
         FROM standard_slots
         WHERE student_id = ?
         ORDER BY weekday, start_time",
        student_id,
    )
}

pub fn get_active_slots(conn: &Connection, student_id: &str) -> anyhow::Result<Vec<StandardSlot>> {
    query_slots(
        conn,
        "SELECT id, student_id, weekday, start_time, duration_minutes, active
         FROM standard_slots
         WHERE student_id = ? AND active = 1
         ORDER BY weekday, start_time",
        student_id,
    )
}

pub fn get_slot(conn: &Connection, slot_id: &str) -> anyhow::Result<Option<StandardSlot>> {
    let mut stmt = conn.prepare(
        "SELECT id, student_id, weekday, start_time, duration_minutes, active
         FROM standard_slots
         WHERE id = ?",
    )?;
    let row = stmt
        .query_row([slot_id], |r| {
            Ok(SlotRow {
                id: r.get(0)?,
                student_id: r.get(1)?,
                weekday: r.get(2)?,
                start_time: r.get(3)?,
                duration_minutes: r.get(4)?,
                active: r.get(5)?,
            })
        })
        .optional()?;
    row.map(slot_from_row).transpose()
}

pub fn save_slot(conn: &Connection, slot: &StandardSlot, updated_at: &str) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO standard_slots(id, student_id, weekday, start_time, duration_minutes, active, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
           weekday = excluded.weekday,
           start_time = excluded.start_time,
           duration_minutes = excluded.duration_minutes,
           active = excluded.active,
           updated_at = excluded.updated_at",
        (
            &slot.id,
            &slot.student_id,
            slot.weekday as i64,
            &slot.start_time,
            slot.duration_minutes,
            slot.active as i64,
            updated_at,
        ),
    )?;
    Ok(())
}

pub fn deactivate_slot(conn: &Connection, slot_id: &str, updated_at: &str) -> anyhow::Result<bool> {
    let changed = conn.execute(
        "UPDATE standard_slots SET active = 0, updated_at = ? WHERE id = ?",
        (updated_at, slot_id),
    )?;
    Ok(changed > 0)
}

// ---- Exception ledger -----------------------------------------------------

pub fn upsert_exception(conn: &Connection, entry: &ExceptionEntry) -> anyhow::Result<()> {
    // One entry per (slot, date); the latest edit wins.
    conn.execute(
        "INSERT INTO schedule_exceptions(slot_id, occurrence_date, kind, start_time, duration_minutes, observations)
         VALUES(?, ?, ?, ?, ?, ?)
         ON CONFLICT(slot_id, occurrence_date) DO UPDATE SET
           kind = excluded.kind,
           start_time = excluded.start_time,
           duration_minutes = excluded.duration_minutes,
           observations = excluded.observations",
        (
            &entry.slot_id,
            entry.occurrence_date.to_string(),
            entry.kind.as_str(),
            &entry.start_time,
            entry.duration_minutes,
            &entry.observations,
        ),
    )?;
    Ok(())
}

pub fn remove_exception(conn: &Connection, slot_id: &str, date: NaiveDate) -> anyhow::Result<bool> {
    let changed = conn.execute(
        "DELETE FROM schedule_exceptions WHERE slot_id = ? AND occurrence_date = ?",
        (slot_id, date.to_string()),
    )?;
    Ok(changed > 0)
}

struct ExceptionRow {
    slot_id: String,
    occurrence_date: String,
    kind: String,
    start_time: Option<String>,
    duration_minutes: Option<i64>,
    observations: Option<String>,
}

fn exception_from_row(row: ExceptionRow) -> anyhow::Result<ExceptionEntry> {
    let kind = ExceptionKind::parse(&row.kind)
        .ok_or_else(|| anyhow!("bad exception kind in store: {}", row.kind))?;
    Ok(ExceptionEntry {
        slot_id: row.slot_id,
        occurrence_date: parse_date(&row.occurrence_date)?,
        kind,
        start_time: row.start_time,
        duration_minutes: row.duration_minutes,
        observations: row.observations,
    })
}

pub fn list_exceptions_for_student(
    conn: &Connection,
    student_id: &str,
    window: DateRange,
) -> anyhow::Result<Vec<ExceptionEntry>> {
    let mut stmt = conn.prepare(
        "SELECT e.slot_id, e.occurrence_date, e.kind, e.start_time, e.duration_minutes, e.observations
         FROM schedule_exceptions e
         JOIN standard_slots s ON s.id = e.slot_id
         WHERE s.student_id = ? AND e.occurrence_date >= ? AND e.occurrence_date < ?
         ORDER BY e.occurrence_date",
    )?;
    let rows = stmt
        .query_map(
            (student_id, window.start.to_string(), window.end.to_string()),
            |r| {
                Ok(ExceptionRow {
                    slot_id: r.get(0)?,
                    occurrence_date: r.get(1)?,
                    kind: r.get(2)?,
                    start_time: r.get(3)?,
                    duration_minutes: r.get(4)?,
                    observations: r.get(5)?,
                })
            },
        )?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(exception_from_row).collect()
}

// ---- Class instance store -------------------------------------------------

struct InstanceRow {
    id: String,
    student_id: String,
    source_slot_id: Option<String>,
    occurrence_date: String,
    start_time: String,
    duration_minutes: i64,
    kind: String,
    attendance: String,
    observations: Option<String>,
}

const INSTANCE_COLUMNS: &str = "id, student_id, source_slot_id, occurrence_date, start_time,
     duration_minutes, kind, attendance, observations";

fn instance_from_row(row: InstanceRow) -> anyhow::Result<ClassInstance> {
    let kind = InstanceKind::parse(&row.kind)
        .ok_or_else(|| anyhow!("bad instance kind in store: {}", row.kind))?;
    let attendance = Attendance::parse(&row.attendance)
        .ok_or_else(|| anyhow!("bad attendance in store: {}", row.attendance))?;
    Ok(ClassInstance {
        id: row.id,
        student_id: row.student_id,
        source_slot_id: row.source_slot_id,
        occurrence_date: parse_date(&row.occurrence_date)?,
        start_time: row.start_time,
        duration_minutes: row.duration_minutes,
        kind,
        attendance,
        observations: row.observations,
    })
}

fn map_instance_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<InstanceRow> {
    Ok(InstanceRow {
        id: r.get(0)?,
        student_id: r.get(1)?,
        source_slot_id: r.get(2)?,
        occurrence_date: r.get(3)?,
        start_time: r.get(4)?,
        duration_minutes: r.get(5)?,
        kind: r.get(6)?,
        attendance: r.get(7)?,
        observations: r.get(8)?,
    })
}

pub fn list_instances_in_range(
    conn: &Connection,
    student_id: &str,
    window: DateRange,
) -> anyhow::Result<Vec<ClassInstance>> {
    let sql = format!(
        "SELECT {INSTANCE_COLUMNS}
         FROM class_instances
         WHERE student_id = ? AND occurrence_date >= ? AND occurrence_date < ?
         ORDER BY occurrence_date, start_time"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(
            (student_id, window.start.to_string(), window.end.to_string()),
            map_instance_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(instance_from_row).collect()
}

pub fn get_instance(conn: &Connection, instance_id: &str) -> anyhow::Result<Option<ClassInstance>> {
    let sql = format!("SELECT {INSTANCE_COLUMNS} FROM class_instances WHERE id = ?");
    let mut stmt = conn.prepare(&sql)?;
    let row = stmt.query_row([instance_id], map_instance_row).optional()?;
    row.map(instance_from_row).transpose()
}

pub fn get_instance_by_key(
    conn: &Connection,
    slot_id: &str,
    date: NaiveDate,
) -> anyhow::Result<Option<ClassInstance>> {
    let sql = format!(
        "SELECT {INSTANCE_COLUMNS} FROM class_instances
         WHERE source_slot_id = ? AND occurrence_date = ?"
    );
    let mut stmt = conn.prepare(&sql)?;
    let row = stmt
        .query_row((slot_id, date.to_string()), map_instance_row)
        .optional()?;
    row.map(instance_from_row).transpose()
}

pub fn insert_one_off(conn: &Connection, instance: &ClassInstance) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO class_instances(id, student_id, source_slot_id, occurrence_date, start_time,
                                     duration_minutes, kind, attendance, observations)
         VALUES(?, ?, NULL, ?, ?, ?, ?, ?, ?)",
        (
            &instance.id,
            &instance.student_id,
            instance.occurrence_date.to_string(),
            &instance.start_time,
            instance.duration_minutes,
            instance.kind.as_str(),
            instance.attendance.as_str(),
            &instance.observations,
        ),
    )?;
    Ok(())
}

pub fn set_attendance(
    conn: &Connection,
    instance_id: &str,
    attendance: Attendance,
) -> anyhow::Result<bool> {
    let changed = conn.execute(
        "UPDATE class_instances SET attendance = ? WHERE id = ?",
        (attendance.as_str(), instance_id),
    )?;
    Ok(changed > 0)
}

// ---- Horizon --------------------------------------------------------------

pub fn get_horizon(conn: &Connection, student_id: &str) -> anyhow::Result<Option<NaiveDate>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT horizon_date FROM schedule_horizons WHERE student_id = ?",
            [student_id],
            |r| r.get(0),
        )
        .optional()?;
    raw.as_deref().map(parse_date).transpose()
}

fn set_horizon(conn: &Connection, student_id: &str, horizon: NaiveDate) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO schedule_horizons(student_id, horizon_date) VALUES(?, ?)
         ON CONFLICT(student_id) DO UPDATE SET horizon_date = excluded.horizon_date",
        (student_id, horizon.to_string()),
    )?;
    Ok(())
}

/// Standard materialization window for a student: from today through the
/// configured horizon, never shrinking past what was already materialized.
pub fn refresh_window(
    conn: &Connection,
    student_id: &str,
    defaults: &ScheduleDefaults,
) -> anyhow::Result<DateRange> {
    let today = chrono::Local::now().date_naive();
    let mut end = today + chrono::Duration::days(defaults.horizon_days);
    if let Some(h) = get_horizon(conn, student_id)? {
        end = end.max(h);
    }
    Ok(DateRange::new(today, end))
}

// ---- Materialization ------------------------------------------------------

#[derive(Debug)]
pub enum MaterializeError {
    Invariant(ScheduleError),
    Store(anyhow::Error),
}

impl From<anyhow::Error> for MaterializeError {
    fn from(e: anyhow::Error) -> Self {
        Self::Store(e)
    }
}

impl From<rusqlite::Error> for MaterializeError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Store(e.into())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MaterializeOutcome {
    pub created: usize,
    pub updated: usize,
    pub horizon: NaiveDate,
}

/// Brings the class-instance store in line with templates + ledger over
/// `window`, as one transaction. On any error nothing is committed and the
/// stored horizon stays where it was, so the next trigger simply retries.
pub fn materialize_student(
    conn: &Connection,
    student_id: &str,
    window: DateRange,
) -> Result<MaterializeOutcome, MaterializeError> {
    let slots = get_active_slots(conn, student_id)?;
    let exceptions = list_exceptions_for_student(conn, student_id, window)?;
    let existing = list_instances_in_range(conn, student_id, window)?;

    let diff = schedule::materialize(&slots, &exceptions, window, &existing).map_err(|e| {
        error!(student_id, code = %e.code, "materialization aborted: {}", e.message);
        MaterializeError::Invariant(e)
    })?;

    let prior_horizon = get_horizon(conn, student_id)?;
    let horizon = prior_horizon
        .map(|h| h.max(window.end))
        .unwrap_or(window.end);

    if diff.is_empty() && prior_horizon == Some(horizon) {
        return Ok(MaterializeOutcome {
            created: 0,
            updated: 0,
            horizon,
        });
    }

    let tx = conn.unchecked_transaction()?;
    apply_diff(&tx, &diff)?;
    set_horizon(&tx, student_id, horizon)?;
    tx.commit()?;

    debug!(
        student_id,
        created = diff.to_create.len(),
        updated = diff.to_update.len(),
        %horizon,
        "materialized window"
    );

    Ok(MaterializeOutcome {
        created: diff.to_create.len(),
        updated: diff.to_update.len(),
        horizon,
    })
}

fn apply_diff(conn: &Connection, diff: &MaterializeDiff) -> anyhow::Result<()> {
    for inst in &diff.to_create {
        // Upsert on the identity key: if a row for (slot, date) raced in
        // through another path, converge on it instead of duplicating.
        conn.execute(
            "INSERT INTO class_instances(id, student_id, source_slot_id, occurrence_date, start_time,
                                         duration_minutes, kind, attendance, observations)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(source_slot_id, occurrence_date) DO UPDATE SET
               start_time = excluded.start_time,
               duration_minutes = excluded.duration_minutes,
               kind = excluded.kind,
               observations = excluded.observations",
            (
                &inst.id,
                &inst.student_id,
                &inst.source_slot_id,
                inst.occurrence_date.to_string(),
                &inst.start_time,
                inst.duration_minutes,
                inst.kind.as_str(),
                inst.attendance.as_str(),
                &inst.observations,
            ),
        )?;
    }
    for inst in &diff.to_update {
        // Attendance is deliberately left out of the update set.
        conn.execute(
            "UPDATE class_instances
             SET start_time = ?, duration_minutes = ?, kind = ?, observations = ?
             WHERE id = ?",
            (
                &inst.start_time,
                inst.duration_minutes,
                inst.kind.as_str(),
                &inst.observations,
                &inst.id,
            ),
        )?;
    }
    Ok(())
}
