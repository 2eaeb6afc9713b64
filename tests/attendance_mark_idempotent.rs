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
    let exe = env!("CARGO_BIN_EXE_campusd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn campusd");
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

fn seed_course_and_student(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &PathBuf,
) -> (String, String) {
    let _ = request_ok(
        stdin,
        reader,
        "seed-1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let course = request_ok(
        stdin,
        reader,
        "seed-2",
        "courses.create",
        json!({ "name": "Full Stack Web Development", "code": "FSWD-101" }),
    );
    let course_id = course
        .get("courseId")
        .and_then(|v| v.as_str())
        .expect("courseId")
        .to_string();
    let student = request_ok(
        stdin,
        reader,
        "seed-3",
        "students.create",
        json!({ "courseId": course_id, "fullName": "Asha Verma" }),
    );
    let student_id = student
        .get("studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string();
    (course_id, student_id)
}

#[test]
fn repeated_mark_for_same_key_updates_in_place() {
    let workspace = temp_dir("campus-att-idem");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let (course_id, student_id) = seed_course_and_student(&mut stdin, &mut reader, &workspace);

    let first = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "attendance.mark",
        json!({
            "studentId": student_id,
            "courseId": course_id,
            "date": "2026-03-02",
            "period": 1,
            "status": "absent"
        }),
    );
    assert_eq!(first.get("status").and_then(|v| v.as_str()), Some("absent"));

    // Duplicate submission for the same (student, date, period): no second
    // row, and the later status wins.
    let second = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "attendance.mark",
        json!({
            "studentId": student_id,
            "courseId": course_id,
            "date": "2026-03-02",
            "period": 1,
            "status": "present",
            "remarks": "arrived after re-check"
        }),
    );
    assert_eq!(second.get("status").and_then(|v| v.as_str()), Some("present"));

    let agg = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "attendance.aggregate",
        json!({ "studentId": student_id }),
    );
    assert_eq!(agg.get("totalCount").and_then(|v| v.as_i64()), Some(1));
    assert_eq!(agg.get("presentCount").and_then(|v| v.as_i64()), Some(1));
    assert_eq!(agg.get("absentCount").and_then(|v| v.as_i64()), Some(0));

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn timestamp_and_plain_date_collide_on_the_same_day_key() {
    let workspace = temp_dir("campus-att-daykey");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let (course_id, student_id) = seed_course_and_student(&mut stdin, &mut reader, &workspace);

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "attendance.mark",
        json!({
            "studentId": student_id,
            "courseId": course_id,
            "date": "2026-03-02T07:45:13+05:30",
            "status": "late"
        }),
    );
    let day = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "attendance.mark",
        json!({
            "studentId": student_id,
            "courseId": course_id,
            "date": "2026-03-02",
            "status": "present"
        }),
    );
    assert_eq!(day.get("date").and_then(|v| v.as_str()), Some("2026-03-02"));

    let agg = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "attendance.aggregate",
        json!({ "studentId": student_id }),
    );
    assert_eq!(agg.get("totalCount").and_then(|v| v.as_i64()), Some(1));
    assert_eq!(agg.get("presentCount").and_then(|v| v.as_i64()), Some(1));

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn distinct_periods_keep_distinct_rows() {
    let workspace = temp_dir("campus-att-periods");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let (course_id, student_id) = seed_course_and_student(&mut stdin, &mut reader, &workspace);

    // Period defaults to 1 when omitted.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "attendance.mark",
        json!({
            "studentId": student_id,
            "courseId": course_id,
            "date": "2026-03-02",
            "status": "present"
        }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "attendance.mark",
        json!({
            "studentId": student_id,
            "courseId": course_id,
            "date": "2026-03-02",
            "period": 2,
            "status": "absent"
        }),
    );

    let agg = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "attendance.aggregate",
        json!({ "studentId": student_id }),
    );
    assert_eq!(agg.get("totalCount").and_then(|v| v.as_i64()), Some(2));
    assert_eq!(agg.get("presentCount").and_then(|v| v.as_i64()), Some(1));
    assert_eq!(agg.get("absentCount").and_then(|v| v.as_i64()), Some(1));

    let day = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "attendance.dayOpen",
        json!({ "courseId": course_id, "date": "2026-03-02" }),
    );
    let records = day
        .get("records")
        .and_then(|v| v.as_array())
        .expect("records");
    assert_eq!(records.len(), 2);
    assert_eq!(
        records[0].get("period").and_then(|v| v.as_i64()),
        Some(1)
    );
    assert_eq!(
        records[1].get("period").and_then(|v| v.as_i64()),
        Some(2)
    );

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn mark_validation_and_not_found_errors() {
    let workspace = temp_dir("campus-att-errors");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let (course_id, student_id) = seed_course_and_student(&mut stdin, &mut reader, &workspace);

    let bad_status = request(
        &mut stdin,
        &mut reader,
        "1",
        "attendance.mark",
        json!({
            "studentId": student_id,
            "courseId": course_id,
            "date": "2026-03-02",
            "status": "snoozing"
        }),
    );
    assert_eq!(
        bad_status
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str()),
        Some("bad_params")
    );

    let bad_period = request(
        &mut stdin,
        &mut reader,
        "2",
        "attendance.mark",
        json!({
            "studentId": student_id,
            "courseId": course_id,
            "date": "2026-03-02",
            "period": 0,
            "status": "present"
        }),
    );
    assert_eq!(
        bad_period
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str()),
        Some("bad_params")
    );

    let ghost = request(
        &mut stdin,
        &mut reader,
        "3",
        "attendance.mark",
        json!({
            "studentId": "no-such-student",
            "courseId": course_id,
            "date": "2026-03-02",
            "status": "present"
        }),
    );
    assert_eq!(
        ghost
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str()),
        Some("not_found")
    );

    // Nothing was recorded by the failed calls.
    let agg = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "attendance.aggregate",
        json!({ "studentId": student_id }),
    );
    assert_eq!(agg.get("totalCount").and_then(|v| v.as_i64()), Some(0));

    let _ = std::fs::remove_dir_all(workspace);
}
