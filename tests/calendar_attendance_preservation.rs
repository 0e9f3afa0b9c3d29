use chrono::{Datelike, Duration, NaiveDate};
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

fn today() -> NaiveDate {
    chrono::Local::now().date_naive()
}

#[test]
fn attendance_and_notes_survive_regeneration() {
    let workspace = temp_dir("trainer-attendance-keep");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let created = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "students.create",
        json!({ "name": "Elisa" }),
    );
    let student_id = created
        .get("studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string();

    let d0 = today();
    let weekday = d0.weekday().num_days_from_monday();

    let saved = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "schedule.slots.save",
        json!({
            "studentId": student_id,
            "weekday": weekday,
            "startTime": "18:00",
            "durationMinutes": 60
        }),
    );
    let slot_id = saved
        .get("slot")
        .and_then(|v| v.get("id"))
        .and_then(|v| v.as_str())
        .expect("slot id")
        .to_string();

    let opened = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "calendar.open",
        json!({ "studentId": student_id }),
    );
    let first = opened
        .get("instances")
        .and_then(|v| v.as_array())
        .and_then(|a| {
            a.iter()
                .find(|i| i.get("date").and_then(|v| v.as_str()) == Some(d0.to_string().as_str()))
        })
        .expect("today's instance")
        .clone();
    let instance_id = first
        .get("id")
        .and_then(|v| v.as_str())
        .expect("instance id")
        .to_string();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "calendar.setAttendance",
        json!({ "instanceId": instance_id, "attendance": "present" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "calendar.setObservations",
        json!({ "instanceId": instance_id, "observations": "knee still sore" }),
    );

    // A reschedule of the same occurrence rewrites time and kind, but the
    // attendance mark and the note stay.
    let rescheduled = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "calendar.rescheduleOccurrence",
        json!({
            "slotId": slot_id,
            "date": d0.to_string(),
            "startTime": "19:30"
        }),
    );
    let inst = rescheduled.get("instance").expect("instance");
    assert_eq!(inst.get("id").and_then(|v| v.as_str()), Some(instance_id.as_str()));
    assert_eq!(inst.get("startTime").and_then(|v| v.as_str()), Some("19:30"));
    assert_eq!(inst.get("attendance").and_then(|v| v.as_str()), Some("present"));
    assert_eq!(
        inst.get("observations").and_then(|v| v.as_str()),
        Some("knee still sore")
    );

    // An unrelated template edit re-runs generation for every occurrence;
    // the marked one must come through untouched.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "schedule.slots.save",
        json!({
            "studentId": student_id,
            "slotId": slot_id,
            "weekday": weekday,
            "startTime": "18:00",
            "durationMinutes": 90
        }),
    );
    let reopened = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "calendar.open",
        json!({ "studentId": student_id }),
    );
    let first = reopened
        .get("instances")
        .and_then(|v| v.as_array())
        .and_then(|a| {
            a.iter()
                .find(|i| i.get("id").and_then(|v| v.as_str()) == Some(instance_id.as_str()))
        })
        .expect("marked instance")
        .clone();
    assert_eq!(first.get("attendance").and_then(|v| v.as_str()), Some("present"));
    assert_eq!(
        first.get("observations").and_then(|v| v.as_str()),
        Some("knee still sore")
    );
    assert_eq!(first.get("kind").and_then(|v| v.as_str()), Some("exception_rescheduled"));
    assert_eq!(first.get("startTime").and_then(|v| v.as_str()), Some("19:30"));
    // Exceptions without an explicit duration follow the template's.
    assert_eq!(first.get("durationMinutes").and_then(|v| v.as_i64()), Some(90));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn one_off_attendance_is_untouched_by_generation() {
    let workspace = temp_dir("trainer-oneoff-attendance");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let created = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "students.create",
        json!({ "name": "Fábio" }),
    );
    let student_id = created
        .get("studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string();

    let d0 = today();
    let one_off = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "calendar.createOneOff",
        json!({
            "studentId": student_id,
            "date": d0.to_string(),
            "startTime": "09:00",
            "durationMinutes": 45
        }),
    );
    let instance_id = one_off
        .get("instance")
        .and_then(|v| v.get("id"))
        .and_then(|v| v.as_str())
        .expect("instance id")
        .to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "calendar.setAttendance",
        json!({ "instanceId": instance_id, "attendance": "absent" }),
    );

    // Adding a recurring slot on the same weekday generates alongside the
    // one-off without colliding with it.
    let weekday = d0.weekday().num_days_from_monday();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "schedule.slots.save",
        json!({
            "studentId": student_id,
            "weekday": weekday,
            "startTime": "18:00",
            "durationMinutes": 60
        }),
    );

    let opened = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "calendar.open",
        json!({
            "studentId": student_id,
            "to": (d0 + Duration::days(1)).to_string()
        }),
    );
    let instances = opened
        .get("instances")
        .and_then(|v| v.as_array())
        .expect("instances")
        .clone();
    assert_eq!(instances.len(), 2, "one-off plus generated: {:?}", instances);
    let one_off_row = instances
        .iter()
        .find(|i| i.get("kind").and_then(|v| v.as_str()) == Some("one_off"))
        .expect("one-off row");
    assert_eq!(
        one_off_row.get("attendance").and_then(|v| v.as_str()),
        Some("absent")
    );
    assert!(instances
        .iter()
        .any(|i| i.get("kind").and_then(|v| v.as_str()) == Some("recurring_generated")));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
