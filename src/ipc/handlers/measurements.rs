use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_opt_str, get_required_str, parse_date_param, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const NUMERIC_FIELDS: [(&str, &str); 7] = [
    ("weightKg", "weight_kg"),
    ("bodyFatPercent", "body_fat_percent"),
    ("chestCm", "chest_cm"),
    ("waistCm", "waist_cm"),
    ("hipCm", "hip_cm"),
    ("armCm", "arm_cm"),
    ("thighCm", "thigh_cm"),
];

fn get_opt_f64(params: &serde_json::Value, key: &str) -> Result<Option<f64>, HandlerErr> {
    let Some(v) = params.get(key) else {
        return Ok(None);
    };
    if v.is_null() {
        return Ok(None);
    }
    let Some(n) = v.as_f64() else {
        return Err(HandlerErr::bad_params(format!("{} must be numeric", key)));
    };
    if n < 0.0 {
        return Err(HandlerErr::bad_params(format!("{} must be >= 0", key)));
    }
    Ok(Some(n))
}

fn student_exists(conn: &Connection, student_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM students WHERE id = ?", [student_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(|e| HandlerErr::db("db_query_failed", e))
}

fn measurements_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    if !student_exists(conn, &student_id)? {
        return Err(HandlerErr::not_found("student not found"));
    }

    let mut stmt = conn
        .prepare(
            "SELECT id, taken_on, weight_kg, body_fat_percent, chest_cm, waist_cm, hip_cm,
                    arm_cm, thigh_cm, notes
             FROM measurements
             WHERE student_id = ?
             ORDER BY taken_on DESC",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let rows = stmt
        .query_map([&student_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "takenOn": r.get::<_, String>(1)?,
                "weightKg": r.get::<_, Option<f64>>(2)?,
                "bodyFatPercent": r.get::<_, Option<f64>>(3)?,
                "chestCm": r.get::<_, Option<f64>>(4)?,
                "waistCm": r.get::<_, Option<f64>>(5)?,
                "hipCm": r.get::<_, Option<f64>>(6)?,
                "armCm": r.get::<_, Option<f64>>(7)?,
                "thighCm": r.get::<_, Option<f64>>(8)?,
                "notes": r.get::<_, Option<String>>(9)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    Ok(json!({ "measurements": rows }))
}

fn measurements_add(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    if !student_exists(conn, &student_id)? {
        return Err(HandlerErr::not_found("student not found"));
    }
    let taken_on = parse_date_param(params, "takenOn")?;
    let notes = get_opt_str(params, "notes");

    let mut values: Vec<Option<f64>> = Vec::with_capacity(NUMERIC_FIELDS.len());
    for (key, _) in NUMERIC_FIELDS {
        values.push(get_opt_f64(params, key)?);
    }

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO measurements(id, student_id, taken_on, weight_kg, body_fat_percent,
                                  chest_cm, waist_cm, hip_cm, arm_cm, thigh_cm, notes)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            &student_id,
            taken_on.to_string(),
            values[0],
            values[1],
            values[2],
            values[3],
            values[4],
            values[5],
            values[6],
            &notes,
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "measurements" })),
    })?;

    Ok(json!({ "measurementId": id }))
}

fn measurements_update(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "measurementId")?;
    let exists = conn
        .query_row("SELECT 1 FROM measurements WHERE id = ?", [&id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?
        .is_some();
    if !exists {
        return Err(HandlerErr::not_found("measurement not found"));
    }

    if params.get("takenOn").is_some() {
        let taken_on = parse_date_param(params, "takenOn")?;
        conn.execute(
            "UPDATE measurements SET taken_on = ? WHERE id = ?",
            (taken_on.to_string(), &id),
        )
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    }
    for (key, column) in NUMERIC_FIELDS {
        if params.get(key).is_some() {
            let value = get_opt_f64(params, key)?;
            let sql = format!("UPDATE measurements SET {} = ? WHERE id = ?", column);
            conn.execute(&sql, (value, &id))
                .map_err(|e| HandlerErr::db("db_update_failed", e))?;
        }
    }
    if params.get("notes").is_some() {
        let notes = get_opt_str(params, "notes");
        conn.execute("UPDATE measurements SET notes = ? WHERE id = ?", (&notes, &id))
            .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    }

    Ok(json!({ "measurementId": id }))
}

fn measurements_delete(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "measurementId")?;
    let changed = conn
        .execute("DELETE FROM measurements WHERE id = ?", [&id])
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    if changed == 0 {
        return Err(HandlerErr::not_found("measurement not found"));
    }
    Ok(json!({ "measurementId": id, "deleted": true }))
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
        "measurements.list" => Some(with_conn(state, req, measurements_list)),
        "measurements.add" => Some(with_conn(state, req, measurements_add)),
        "measurements.update" => Some(with_conn(state, req, measurements_update)),
        "measurements.delete" => Some(with_conn(state, req, measurements_delete)),
        _ => None,
    }
}
