use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_opt_str, get_required_str, now_stamp, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "students": [] }));
    };

    // Include basic counts so the UI can show a useful dashboard.
    // Use correlated subqueries to avoid double-counting from joins.
    let mut stmt = match conn.prepare(
        "SELECT
           s.id,
           s.name,
           s.phone,
           s.email,
           s.birth_date,
           s.goal,
           s.active,
           s.sort_order,
           (SELECT COUNT(*) FROM measurements m WHERE m.student_id = s.id) AS measurement_count,
           (SELECT COUNT(*) FROM workout_sheets w WHERE w.student_id = s.id) AS sheet_count,
           (SELECT COUNT(*) FROM standard_slots sl WHERE sl.student_id = s.id AND sl.active = 1) AS slot_count
         FROM students s
         ORDER BY s.sort_order",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "name": row.get::<_, String>(1)?,
                "phone": row.get::<_, Option<String>>(2)?,
                "email": row.get::<_, Option<String>>(3)?,
                "birthDate": row.get::<_, Option<String>>(4)?,
                "goal": row.get::<_, Option<String>>(5)?,
                "active": row.get::<_, i64>(6)? != 0,
                "sortOrder": row.get::<_, i64>(7)?,
                "measurementCount": row.get::<_, i64>(8)?,
                "sheetCount": row.get::<_, i64>(9)?,
                "slotCount": row.get::<_, i64>(10)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(students) => ok(&req.id, json!({ "students": students })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn students_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?;
    let phone = get_opt_str(params, "phone");
    let email = get_opt_str(params, "email");
    let birth_date = get_opt_str(params, "birthDate");
    let goal = get_opt_str(params, "goal");

    let next_sort: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM students",
            [],
            |r| r.get(0),
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    let student_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO students(id, name, phone, email, birth_date, goal, active, sort_order, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, 1, ?, ?)",
        (
            &student_id,
            &name,
            &phone,
            &email,
            &birth_date,
            &goal,
            next_sort,
            now_stamp(),
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "students" })),
    })?;

    Ok(json!({ "studentId": student_id, "name": name }))
}

fn students_update(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let exists = conn
        .query_row("SELECT 1 FROM students WHERE id = ?", [&student_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?
        .is_some();
    if !exists {
        return Err(HandlerErr::not_found("student not found"));
    }

    let name = get_opt_str(params, "name");
    if let Some(ref n) = name {
        conn.execute(
            "UPDATE students SET name = ?, updated_at = ? WHERE id = ?",
            (n, now_stamp(), &student_id),
        )
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    }
    for (key, column) in [
        ("phone", "phone"),
        ("email", "email"),
        ("birthDate", "birth_date"),
        ("goal", "goal"),
    ] {
        if params.get(key).is_some() {
            let value = get_opt_str(params, key);
            let sql = format!("UPDATE students SET {} = ?, updated_at = ? WHERE id = ?", column);
            conn.execute(&sql, (&value, now_stamp(), &student_id))
                .map_err(|e| HandlerErr::db("db_update_failed", e))?;
        }
    }

    Ok(json!({ "studentId": student_id }))
}

fn students_archive(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;

    // Archiving also retires the student's standing slots so the calendar
    // stops generating classes; history stays in place.
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    let changed = tx
        .execute(
            "UPDATE students SET active = 0, updated_at = ? WHERE id = ?",
            (now_stamp(), &student_id),
        )
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    if changed == 0 {
        return Err(HandlerErr::not_found("student not found"));
    }
    tx.execute(
        "UPDATE standard_slots SET active = 0, updated_at = ? WHERE student_id = ?",
        (now_stamp(), &student_id),
    )
    .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    tx.commit()
        .map_err(|e| HandlerErr::db("db_commit_failed", e))?;

    Ok(json!({ "studentId": student_id, "active": false }))
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
        "students.list" => Some(handle_students_list(state, req)),
        "students.create" => Some(with_conn(state, req, students_create)),
        "students.update" => Some(with_conn(state, req, students_update)),
        "students.archive" => Some(with_conn(state, req, students_archive)),
        _ => None,
    }
}
