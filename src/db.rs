use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("trainer.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            phone TEXT,
            email TEXT,
            birth_date TEXT,
            goal TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            sort_order INTEGER NOT NULL,
            updated_at TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_sort ON students(sort_order)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS measurements(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            taken_on TEXT NOT NULL,
            weight_kg REAL,
            body_fat_percent REAL,
            chest_cm REAL,
            waist_cm REAL,
            hip_cm REAL,
            arm_cm REAL,
            thigh_cm REAL,
            notes TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_measurements_student ON measurements(student_id, taken_on)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS workout_sheets(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            title TEXT NOT NULL,
            starts_on TEXT,
            notes TEXT,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_workout_sheets_student ON workout_sheets(student_id, sort_order)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS workout_exercises(
            id TEXT PRIMARY KEY,
            sheet_id TEXT NOT NULL,
            sort_order INTEGER NOT NULL,
            name TEXT NOT NULL,
            sets INTEGER,
            reps TEXT,
            load TEXT,
            rest_seconds INTEGER,
            notes TEXT,
            FOREIGN KEY(sheet_id) REFERENCES workout_sheets(id),
            UNIQUE(sheet_id, sort_order)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_workout_exercises_sheet ON workout_exercises(sheet_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS standard_slots(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            weekday INTEGER NOT NULL,
            start_time TEXT NOT NULL,
            duration_minutes INTEGER NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            updated_at TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_standard_slots_student ON standard_slots(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS schedule_exceptions(
            slot_id TEXT NOT NULL,
            occurrence_date TEXT NOT NULL,
            kind TEXT NOT NULL,
            start_time TEXT,
            duration_minutes INTEGER,
            observations TEXT,
            PRIMARY KEY(slot_id, occurrence_date),
            FOREIGN KEY(slot_id) REFERENCES standard_slots(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_schedule_exceptions_date ON schedule_exceptions(occurrence_date)",
        [],
    )?;

    // Identity key for recurring-derived rows: at most one instance per
    // (source_slot_id, occurrence_date). One-offs carry NULL source_slot_id,
    // which SQLite treats as distinct, so any number of them may share a date.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS class_instances(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            source_slot_id TEXT,
            occurrence_date TEXT NOT NULL,
            start_time TEXT NOT NULL,
            duration_minutes INTEGER NOT NULL,
            kind TEXT NOT NULL,
            attendance TEXT NOT NULL DEFAULT 'unset',
            observations TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(source_slot_id) REFERENCES standard_slots(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_class_instances_slot_date
         ON class_instances(source_slot_id, occurrence_date)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_class_instances_student_date
         ON class_instances(student_id, occurrence_date)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS schedule_horizons(
            student_id TEXT PRIMARY KEY,
            horizon_date TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        [],
    )?;

    // Existing workspaces may predate these columns. Add if needed.
    ensure_students_goal(&conn)?;
    ensure_class_instances_observations(&conn)?;

    Ok(conn)
}

fn ensure_students_goal(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "students", "goal")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE students ADD COLUMN goal TEXT", [])?;
    Ok(())
}

fn ensure_class_instances_observations(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "class_instances", "observations")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE class_instances ADD COLUMN observations TEXT", [])?;
    Ok(())
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row("SELECT value FROM settings WHERE key = ?", [key], |r| {
            r.get(0)
        })
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
