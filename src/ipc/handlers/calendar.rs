use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    get_opt_str, get_required_str, parse_date_param, parse_time_param, today, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::schedule::{
    Attendance, ClassInstance, DateRange, ExceptionEntry, ExceptionKind, InstanceKind,
};
use crate::store::{self, MaterializeError};
use chrono::{Datelike, Duration as ChronoDuration, NaiveDate};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn materialize_err(e: MaterializeError) -> HandlerErr {
    match e {
        MaterializeError::Invariant(inv) => HandlerErr {
            code: "schedule_invariant",
            message: inv.message,
            details: inv.details,
        },
        MaterializeError::Store(e) => HandlerErr::db("db_update_failed", e),
    }
}

fn instance_json(inst: &ClassInstance) -> serde_json::Value {
    json!({
        "id": inst.id,
        "studentId": inst.student_id,
        "sourceSlotId": inst.source_slot_id,
        "date": inst.occurrence_date.to_string(),
        "startTime": inst.start_time,
        "durationMinutes": inst.duration_minutes,
        "kind": inst.kind.as_str(),
        "attendance": inst.attendance.as_str(),
        "observations": inst.observations
    })
}

fn student_exists(conn: &Connection, student_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM students WHERE id = ?", [student_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(|e| HandlerErr::db("db_query_failed", e))
}

fn calendar_open(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    if !student_exists(conn, &student_id)? {
        return Err(HandlerErr::not_found("student not found"));
    }

    let today = today();
    let defaults = store::load_schedule_defaults(conn);
    let from = match params.get("from") {
        Some(v) if !v.is_null() => parse_date_param(params, "from")?,
        _ => today,
    };
    let to = match params.get("to") {
        Some(v) if !v.is_null() => parse_date_param(params, "to")?,
        _ => from + ChronoDuration::days(defaults.horizon_days),
    };
    if to <= from {
        return Err(HandlerErr::bad_params("to must be after from"));
    }

    // Generation only ever looks forward; opening a wider view than what
    // was materialized so far extends the horizon.
    let target_end = to.max(today + ChronoDuration::days(defaults.horizon_days));
    let stored = store::get_horizon(conn, &student_id)
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let mut materialized = None;
    if stored.map_or(true, |h| h < target_end) {
        let outcome =
            store::materialize_student(conn, &student_id, DateRange::new(today, target_end))
                .map_err(materialize_err)?;
        materialized = Some(json!({
            "created": outcome.created,
            "updated": outcome.updated
        }));
    }

    let instances = store::list_instances_in_range(conn, &student_id, DateRange::new(from, to))
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let horizon = store::get_horizon(conn, &student_id)
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    Ok(json!({
        "from": from.to_string(),
        "to": to.to_string(),
        "horizon": horizon.map(|h| h.to_string()),
        "materialized": materialized,
        "instances": instances.iter().map(instance_json).collect::<Vec<_>>()
    }))
}

/// Window used to fold an exception edit into the instance store. Future
/// dates ride the normal forward window (stretched to cover the target);
/// past dates are touched one day at a time so nothing else is backfilled.
fn occurrence_window(
    conn: &Connection,
    student_id: &str,
    date: NaiveDate,
) -> Result<DateRange, HandlerErr> {
    let today = today();
    if date < today {
        return Ok(DateRange::new(date, date + ChronoDuration::days(1)));
    }
    let defaults = store::load_schedule_defaults(conn);
    let window = store::refresh_window(conn, student_id, &defaults)
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    Ok(DateRange::new(
        window.start,
        window.end.max(date + ChronoDuration::days(1)),
    ))
}

struct OccurrenceTarget {
    slot_id: String,
    student_id: String,
    date: NaiveDate,
}

fn resolve_occurrence(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<OccurrenceTarget, HandlerErr> {
    let slot_id = get_required_str(params, "slotId")?;
    let date = parse_date_param(params, "date")?;
    let slot = store::get_slot(conn, &slot_id)
        .map_err(|e| HandlerErr::db("db_query_failed", e))?
        .ok_or_else(|| HandlerErr::not_found("slot not found"))?;
    if date.weekday().num_days_from_monday() != slot.weekday {
        return Err(HandlerErr {
            code: "bad_params",
            message: "date does not fall on the slot's weekday".to_string(),
            details: Some(json!({ "date": date.to_string(), "weekday": slot.weekday })),
        });
    }
    Ok(OccurrenceTarget {
        slot_id,
        student_id: slot.student_id,
        date,
    })
}

fn apply_exception(
    conn: &Connection,
    target: &OccurrenceTarget,
    entry: &ExceptionEntry,
) -> Result<serde_json::Value, HandlerErr> {
    store::upsert_exception(conn, entry).map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "schedule_exceptions" })),
    })?;

    let window = occurrence_window(conn, &target.student_id, target.date)?;
    store::materialize_student(conn, &target.student_id, window).map_err(materialize_err)?;

    let instance = store::get_instance_by_key(conn, &target.slot_id, target.date)
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    Ok(json!({
        "slotId": target.slot_id,
        "date": target.date.to_string(),
        "instance": instance.as_ref().map(instance_json)
    }))
}

fn calendar_cancel_occurrence(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let target = resolve_occurrence(conn, params)?;
    let entry = ExceptionEntry {
        slot_id: target.slot_id.clone(),
        occurrence_date: target.date,
        kind: ExceptionKind::Cancelled,
        start_time: None,
        duration_minutes: None,
        observations: get_opt_str(params, "observations"),
    };
    apply_exception(conn, &target, &entry)
}

fn calendar_reschedule_occurrence(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let target = resolve_occurrence(conn, params)?;
    let start_time = parse_time_param(params, "startTime")?;
    let duration_minutes = match params.get("durationMinutes") {
        Some(v) if !v.is_null() => {
            let d = v
                .as_i64()
                .ok_or_else(|| HandlerErr::bad_params("durationMinutes must be numeric"))?;
            if d <= 0 {
                return Err(HandlerErr::bad_params("durationMinutes must be > 0"));
            }
            Some(d)
        }
        _ => None,
    };
    let entry = ExceptionEntry {
        slot_id: target.slot_id.clone(),
        occurrence_date: target.date,
        kind: ExceptionKind::Rescheduled,
        start_time: Some(start_time),
        duration_minutes,
        observations: get_opt_str(params, "observations"),
    };
    apply_exception(conn, &target, &entry)
}

fn calendar_restore_occurrence(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let target = resolve_occurrence(conn, params)?;
    let removed = store::remove_exception(conn, &target.slot_id, target.date)
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    if !removed {
        return Err(HandlerErr::not_found("no exception for that occurrence"));
    }

    let window = occurrence_window(conn, &target.student_id, target.date)?;
    store::materialize_student(conn, &target.student_id, window).map_err(materialize_err)?;

    let instance = store::get_instance_by_key(conn, &target.slot_id, target.date)
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    Ok(json!({
        "slotId": target.slot_id,
        "date": target.date.to_string(),
        "instance": instance.as_ref().map(instance_json)
    }))
}

fn calendar_create_one_off(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    if !student_exists(conn, &student_id)? {
        return Err(HandlerErr::not_found("student not found"));
    }
    let date = parse_date_param(params, "date")?;
    let start_time = parse_time_param(params, "startTime")?;
    let defaults = store::load_schedule_defaults(conn);
    let duration_minutes = match params.get("durationMinutes") {
        Some(v) if !v.is_null() => {
            let d = v
                .as_i64()
                .ok_or_else(|| HandlerErr::bad_params("durationMinutes must be numeric"))?;
            if d <= 0 {
                return Err(HandlerErr::bad_params("durationMinutes must be > 0"));
            }
            d
        }
        _ => defaults.default_duration_minutes,
    };

    let instance = ClassInstance {
        id: Uuid::new_v4().to_string(),
        student_id: student_id.clone(),
        source_slot_id: None,
        occurrence_date: date,
        start_time,
        duration_minutes,
        kind: InstanceKind::OneOff,
        attendance: Attendance::Unset,
        observations: get_opt_str(params, "observations"),
    };
    store::insert_one_off(conn, &instance).map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "class_instances" })),
    })?;

    Ok(json!({ "instance": instance_json(&instance) }))
}

fn calendar_set_attendance(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let instance_id = get_required_str(params, "instanceId")?;
    let raw = get_required_str(params, "attendance")?;
    let attendance = Attendance::parse(&raw).ok_or_else(|| HandlerErr {
        code: "bad_params",
        message: "attendance must be unset, present or absent".to_string(),
        details: Some(json!({ "value": raw })),
    })?;

    let changed = store::set_attendance(conn, &instance_id, attendance)
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    if !changed {
        return Err(HandlerErr::not_found("class instance not found"));
    }
    let instance = store::get_instance(conn, &instance_id)
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    Ok(json!({ "instance": instance.as_ref().map(instance_json) }))
}

fn calendar_set_observations(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let instance_id = get_required_str(params, "instanceId")?;
    let observations = get_opt_str(params, "observations");
    let changed = conn
        .execute(
            "UPDATE class_instances SET observations = ? WHERE id = ?",
            (&observations, &instance_id),
        )
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    if changed == 0 {
        return Err(HandlerErr::not_found("class instance not found"));
    }
    Ok(json!({ "instanceId": instance_id }))
}

fn with_conn(
    state: &mut AppState,
    req: &Request,
    f: impl FnOnce(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match f(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "calendar.open" => Some(with_conn(state, req, calendar_open)),
        "calendar.cancelOccurrence" => Some(with_conn(state, req, calendar_cancel_occurrence)),
        "calendar.rescheduleOccurrence" => {
            Some(with_conn(state, req, calendar_reschedule_occurrence))
        }
        "calendar.restoreOccurrence" => Some(with_conn(state, req, calendar_restore_occurrence)),
        "calendar.createOneOff" => Some(with_conn(state, req, calendar_create_one_off)),
        "calendar.setAttendance" => Some(with_conn(state, req, calendar_set_attendance)),
        "calendar.setObservations" => Some(with_conn(state, req, calendar_set_observations)),
        _ => None,
    }
}
