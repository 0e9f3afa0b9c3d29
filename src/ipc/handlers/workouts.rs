use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_opt_str, get_required_str, parse_date_param, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const SET_EXERCISES_MAX: usize = 200;

fn student_exists(conn: &Connection, student_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM students WHERE id = ?", [student_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(|e| HandlerErr::db("db_query_failed", e))
}

fn exercises_for_sheet(
    conn: &Connection,
    sheet_id: &str,
) -> Result<Vec<serde_json::Value>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT id, sort_order, name, sets, reps, load, rest_seconds, notes
             FROM workout_exercises
             WHERE sheet_id = ?
             ORDER BY sort_order",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    stmt.query_map([sheet_id], |r| {
        Ok(json!({
            "id": r.get::<_, String>(0)?,
            "sortOrder": r.get::<_, i64>(1)?,
            "name": r.get::<_, String>(2)?,
            "sets": r.get::<_, Option<i64>>(3)?,
            "reps": r.get::<_, Option<String>>(4)?,
            "load": r.get::<_, Option<String>>(5)?,
            "restSeconds": r.get::<_, Option<i64>>(6)?,
            "notes": r.get::<_, Option<String>>(7)?
        }))
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(|e| HandlerErr::db("db_query_failed", e))
}

fn workouts_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    if !student_exists(conn, &student_id)? {
        return Err(HandlerErr::not_found("student not found"));
    }

    let mut stmt = conn
        .prepare(
            "SELECT id, title, starts_on, notes, sort_order
             FROM workout_sheets
             WHERE student_id = ?
             ORDER BY sort_order",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let sheets = stmt
        .query_map([&student_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, Option<String>>(2)?,
                r.get::<_, Option<String>>(3)?,
                r.get::<_, i64>(4)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    let mut out = Vec::with_capacity(sheets.len());
    for (id, title, starts_on, notes, sort_order) in sheets {
        let exercises = exercises_for_sheet(conn, &id)?;
        out.push(json!({
            "id": id,
            "title": title,
            "startsOn": starts_on,
            "notes": notes,
            "sortOrder": sort_order,
            "exercises": exercises
        }));
    }

    Ok(json!({ "sheets": out }))
}

fn workouts_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    if !student_exists(conn, &student_id)? {
        return Err(HandlerErr::not_found("student not found"));
    }
    let title = get_required_str(params, "title")?;
    let starts_on = match params.get("startsOn") {
        Some(v) if !v.is_null() => Some(parse_date_param(params, "startsOn")?.to_string()),
        _ => None,
    };
    let notes = get_opt_str(params, "notes");

    let next_sort: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM workout_sheets WHERE student_id = ?",
            [&student_id],
            |r| r.get(0),
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    let sheet_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO workout_sheets(id, student_id, title, starts_on, notes, sort_order)
         VALUES(?, ?, ?, ?, ?, ?)",
        (&sheet_id, &student_id, &title, &starts_on, &notes, next_sort),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "workout_sheets" })),
    })?;

    Ok(json!({ "sheetId": sheet_id, "title": title }))
}

fn workouts_update(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let sheet_id = get_required_str(params, "sheetId")?;
    let exists = conn
        .query_row("SELECT 1 FROM workout_sheets WHERE id = ?", [&sheet_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?
        .is_some();
    if !exists {
        return Err(HandlerErr::not_found("workout sheet not found"));
    }

    if let Some(title) = get_opt_str(params, "title") {
        conn.execute(
            "UPDATE workout_sheets SET title = ? WHERE id = ?",
            (&title, &sheet_id),
        )
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    }
    if params.get("startsOn").is_some() {
        let starts_on = match params.get("startsOn") {
            Some(v) if !v.is_null() => Some(parse_date_param(params, "startsOn")?.to_string()),
            _ => None,
        };
        conn.execute(
            "UPDATE workout_sheets SET starts_on = ? WHERE id = ?",
            (&starts_on, &sheet_id),
        )
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    }
    if params.get("notes").is_some() {
        let notes = get_opt_str(params, "notes");
        conn.execute(
            "UPDATE workout_sheets SET notes = ? WHERE id = ?",
            (&notes, &sheet_id),
        )
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    }

    Ok(json!({ "sheetId": sheet_id }))
}

fn workouts_delete(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let sheet_id = get_required_str(params, "sheetId")?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    tx.execute("DELETE FROM workout_exercises WHERE sheet_id = ?", [&sheet_id])
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    let changed = tx
        .execute("DELETE FROM workout_sheets WHERE id = ?", [&sheet_id])
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    if changed == 0 {
        return Err(HandlerErr::not_found("workout sheet not found"));
    }
    tx.commit()
        .map_err(|e| HandlerErr::db("db_commit_failed", e))?;

    Ok(json!({ "sheetId": sheet_id, "deleted": true }))
}

fn workouts_set_exercises(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let sheet_id = get_required_str(params, "sheetId")?;
    let exists = conn
        .query_row("SELECT 1 FROM workout_sheets WHERE id = ?", [&sheet_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?
        .is_some();
    if !exists {
        return Err(HandlerErr::not_found("workout sheet not found"));
    }

    let Some(exercises) = params.get("exercises").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("missing exercises"));
    };
    if exercises.len() > SET_EXERCISES_MAX {
        return Err(HandlerErr {
            code: "bad_params",
            message: format!("too many exercises (max {})", SET_EXERCISES_MAX),
            details: Some(json!({ "count": exercises.len() })),
        });
    }

    // The sheet's whole exercise list is replaced in one shot; partial
    // failures must not leave a half-written program.
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    tx.execute("DELETE FROM workout_exercises WHERE sheet_id = ?", [&sheet_id])
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    for (i, ex) in exercises.iter().enumerate() {
        let name = ex
            .get("name")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| HandlerErr::bad_params(format!("exercise {} missing name", i)))?;
        let sets = ex.get("sets").and_then(|v| v.as_i64());
        let reps = ex.get("reps").and_then(|v| v.as_str()).map(|s| s.to_string());
        let load = ex.get("load").and_then(|v| v.as_str()).map(|s| s.to_string());
        let rest_seconds = ex.get("restSeconds").and_then(|v| v.as_i64());
        let notes = ex.get("notes").and_then(|v| v.as_str()).map(|s| s.to_string());
        tx.execute(
            "INSERT INTO workout_exercises(id, sheet_id, sort_order, name, sets, reps, load, rest_seconds, notes)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
            (
                Uuid::new_v4().to_string(),
                &sheet_id,
                i as i64,
                &name,
                sets,
                &reps,
                &load,
                rest_seconds,
                &notes,
            ),
        )
        .map_err(|e| HandlerErr {
            code: "db_insert_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "workout_exercises" })),
        })?;
    }
    tx.commit()
        .map_err(|e| HandlerErr::db("db_commit_failed", e))?;

    Ok(json!({ "sheetId": sheet_id, "count": exercises.len() }))
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
        "workouts.list" => Some(with_conn(state, req, workouts_list)),
        "workouts.create" => Some(with_conn(state, req, workouts_create)),
        "workouts.update" => Some(with_conn(state, req, workouts_update)),
        "workouts.delete" => Some(with_conn(state, req, workouts_delete)),
        "workouts.setExercises" => Some(with_conn(state, req, workouts_set_exercises)),
        _ => None,
    }
}
