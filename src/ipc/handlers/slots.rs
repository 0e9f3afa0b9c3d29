use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    get_opt_str, get_required_str, now_stamp, parse_positive_i64, parse_time_param, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::schedule::StandardSlot;
use crate::store::{self, MaterializeError, MaterializeOutcome};
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

fn outcome_json(outcome: &MaterializeOutcome) -> serde_json::Value {
    json!({
        "created": outcome.created,
        "updated": outcome.updated,
        "horizon": outcome.horizon.to_string()
    })
}

/// Re-runs generation for the student over the standard window. Called
/// after every slot write so the calendar reflects the template change.
fn rematerialize(conn: &Connection, student_id: &str) -> Result<MaterializeOutcome, HandlerErr> {
    let defaults = store::load_schedule_defaults(conn);
    let window = store::refresh_window(conn, student_id, &defaults)
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    store::materialize_student(conn, student_id, window).map_err(materialize_err)
}

fn slot_json(slot: &StandardSlot) -> serde_json::Value {
    json!({
        "id": slot.id,
        "studentId": slot.student_id,
        "weekday": slot.weekday,
        "startTime": slot.start_time,
        "durationMinutes": slot.duration_minutes,
        "active": slot.active
    })
}

fn slots_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let slots = store::list_slots(conn, &student_id)
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    Ok(json!({ "slots": slots.iter().map(slot_json).collect::<Vec<_>>() }))
}

fn slots_save(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let student_active: Option<i64> = conn
        .query_row(
            "SELECT active FROM students WHERE id = ?",
            [&student_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    match student_active {
        None => return Err(HandlerErr::not_found("student not found")),
        Some(0) => return Err(HandlerErr::bad_params("student is archived")),
        Some(_) => {}
    }

    // Template validation lives here, before anything reaches generation.
    let weekday = params
        .get("weekday")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| HandlerErr::bad_params("missing weekday"))?;
    if weekday > 6 {
        return Err(HandlerErr {
            code: "bad_params",
            message: "weekday must be 0 (Monday) through 6 (Sunday)".to_string(),
            details: Some(json!({ "value": weekday })),
        });
    }
    let start_time = parse_time_param(params, "startTime")?;
    let duration_minutes = parse_positive_i64(params, "durationMinutes")?;
    let active = params
        .get("active")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);

    let slot_id = match get_opt_str(params, "slotId") {
        Some(id) => {
            let owner: Option<String> = conn
                .query_row(
                    "SELECT student_id FROM standard_slots WHERE id = ?",
                    [&id],
                    |r| r.get(0),
                )
                .optional()
                .map_err(|e| HandlerErr::db("db_query_failed", e))?;
            match owner {
                None => return Err(HandlerErr::not_found("slot not found")),
                Some(o) if o != student_id => {
                    return Err(HandlerErr::bad_params("slot belongs to another student"))
                }
                Some(_) => {}
            }
            id
        }
        None => Uuid::new_v4().to_string(),
    };

    let slot = StandardSlot {
        id: slot_id.clone(),
        student_id: student_id.clone(),
        weekday: weekday as u32,
        start_time,
        duration_minutes,
        active,
    };
    store::save_slot(conn, &slot, &now_stamp()).map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "standard_slots" })),
    })?;

    let outcome = rematerialize(conn, &student_id)?;

    Ok(json!({
        "slot": slot_json(&slot),
        "materialized": outcome_json(&outcome)
    }))
}

fn slots_deactivate(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let slot_id = get_required_str(params, "slotId")?;
    let slot = store::get_slot(conn, &slot_id)
        .map_err(|e| HandlerErr::db("db_query_failed", e))?
        .ok_or_else(|| HandlerErr::not_found("slot not found"))?;

    store::deactivate_slot(conn, &slot_id, &now_stamp())
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;

    // Already-materialized classes stay put; the slot just stops feeding
    // new dates into the window.
    let outcome = rematerialize(conn, &slot.student_id)?;

    Ok(json!({
        "slotId": slot_id,
        "active": false,
        "materialized": outcome_json(&outcome)
    }))
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
        "schedule.slots.list" => Some(with_conn(state, req, slots_list)),
        "schedule.slots.save" => Some(with_conn(state, req, slots_save)),
        "schedule.slots.deactivate" => Some(with_conn(state, req, slots_deactivate)),
        _ => None,
    }
}
