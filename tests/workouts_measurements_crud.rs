use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_trainerd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn trainerd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn create_student(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &std::path::Path,
    name: &str,
) -> String {
    let _ = request_ok(
        stdin,
        reader,
        "setup-1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let created = request_ok(
        stdin,
        reader,
        "setup-2",
        "students.create",
        json!({ "name": name }),
    );
    created
        .get("studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string()
}

#[test]
fn measurement_history_is_ordered_and_editable() {
    let workspace = temp_dir("trainer-measurements");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let student_id = create_student(&mut stdin, &mut reader, &workspace, "Nina");

    for (id, taken_on, weight) in [
        ("1", "2025-01-05", 71.0),
        ("2", "2025-03-05", 69.4),
        ("3", "2025-02-05", 70.1),
    ] {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            id,
            "measurements.add",
            json!({
                "studentId": student_id,
                "takenOn": taken_on,
                "weightKg": weight,
                "waistCm": 80.0
            }),
        );
    }

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "measurements.list",
        json!({ "studentId": student_id }),
    );
    let measurements = listed
        .get("measurements")
        .and_then(|v| v.as_array())
        .expect("measurements")
        .clone();
    assert_eq!(measurements.len(), 3);
    // Most recent first.
    let dates: Vec<&str> = measurements
        .iter()
        .filter_map(|m| m.get("takenOn").and_then(|v| v.as_str()))
        .collect();
    assert_eq!(dates, ["2025-03-05", "2025-02-05", "2025-01-05"]);

    let target_id = measurements[0]
        .get("id")
        .and_then(|v| v.as_str())
        .expect("measurement id")
        .to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "measurements.update",
        json!({ "measurementId": target_id, "weightKg": 69.0, "notes": "after cut" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "measurements.delete",
        json!({ "measurementId": measurements[2].get("id").and_then(|v| v.as_str()).expect("id") }),
    );

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "measurements.list",
        json!({ "studentId": student_id }),
    );
    let measurements = listed
        .get("measurements")
        .and_then(|v| v.as_array())
        .expect("measurements")
        .clone();
    assert_eq!(measurements.len(), 2);
    assert_eq!(
        measurements[0].get("weightKg").and_then(|v| v.as_f64()),
        Some(69.0)
    );
    assert_eq!(
        measurements[0].get("notes").and_then(|v| v.as_str()),
        Some("after cut")
    );

    // Bad payloads are rejected.
    let bad = request(
        &mut stdin,
        &mut reader,
        "8",
        "measurements.add",
        json!({ "studentId": student_id, "takenOn": "05/01/2025" }),
    );
    assert_eq!(bad.get("ok").and_then(|v| v.as_bool()), Some(false));
    let bad = request(
        &mut stdin,
        &mut reader,
        "9",
        "measurements.add",
        json!({ "studentId": student_id, "takenOn": "2025-01-05", "weightKg": -3.0 }),
    );
    assert_eq!(bad.get("ok").and_then(|v| v.as_bool()), Some(false));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn workout_sheet_exercises_replace_atomically() {
    let workspace = temp_dir("trainer-workouts");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let student_id = create_student(&mut stdin, &mut reader, &workspace, "Otávio");

    let sheet = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workouts.create",
        json!({ "studentId": student_id, "title": "Lower body", "startsOn": "2025-04-01" }),
    );
    let sheet_id = sheet
        .get("sheetId")
        .and_then(|v| v.as_str())
        .expect("sheetId")
        .to_string();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "workouts.setExercises",
        json!({
            "sheetId": sheet_id,
            "exercises": [
                { "name": "Squat", "sets": 5, "reps": "5", "load": "100kg", "restSeconds": 180 },
                { "name": "Leg press", "sets": 3, "reps": "12" }
            ]
        }),
    );

    // A replacement list with an invalid row must leave the old program
    // untouched.
    let failed = request(
        &mut stdin,
        &mut reader,
        "3",
        "workouts.setExercises",
        json!({
            "sheetId": sheet_id,
            "exercises": [
                { "name": "Deadlift", "sets": 3 },
                { "sets": 3 }
            ]
        }),
    );
    assert_eq!(failed.get("ok").and_then(|v| v.as_bool()), Some(false));

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "workouts.list",
        json!({ "studentId": student_id }),
    );
    let sheets = listed
        .get("sheets")
        .and_then(|v| v.as_array())
        .expect("sheets")
        .clone();
    assert_eq!(sheets.len(), 1);
    let exercises = sheets[0]
        .get("exercises")
        .and_then(|v| v.as_array())
        .expect("exercises")
        .clone();
    assert_eq!(exercises.len(), 2);
    assert_eq!(
        exercises[0].get("name").and_then(|v| v.as_str()),
        Some("Squat")
    );

    // A clean replacement goes through.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "workouts.setExercises",
        json!({
            "sheetId": sheet_id,
            "exercises": [ { "name": "Front squat", "sets": 4, "reps": "6" } ]
        }),
    );
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "workouts.list",
        json!({ "studentId": student_id }),
    );
    let exercises = listed
        .get("sheets")
        .and_then(|v| v.as_array())
        .and_then(|a| a.first())
        .and_then(|s| s.get("exercises"))
        .and_then(|v| v.as_array())
        .expect("exercises")
        .clone();
    assert_eq!(exercises.len(), 1);
    assert_eq!(
        exercises[0].get("name").and_then(|v| v.as_str()),
        Some("Front squat")
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "workouts.delete",
        json!({ "sheetId": sheet_id }),
    );
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "workouts.list",
        json!({ "studentId": student_id }),
    );
    assert_eq!(
        listed.get("sheets").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(0)
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
