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

struct Campus {
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    seq: u64,
}

impl Campus {
    fn call(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        self.seq += 1;
        request_ok(
            &mut self.stdin,
            &mut self.reader,
            &self.seq.to_string(),
            method,
            params,
        )
    }

    fn call_raw(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        self.seq += 1;
        request(
            &mut self.stdin,
            &mut self.reader,
            &self.seq.to_string(),
            method,
            params,
        )
    }

    fn str_of(value: &serde_json::Value, key: &str) -> String {
        value
            .get(key)
            .and_then(|v| v.as_str())
            .unwrap_or_else(|| panic!("missing {key}: {value}"))
            .to_string()
    }

    fn submit_and_approve(&mut self, student_id: &str, task_id: &str) -> serde_json::Value {
        let submitted = self.call(
            "portfolio.submit",
            json!({
                "studentId": student_id,
                "taskId": task_id,
                "workUrl": format!("https://git.example.com/{task_id}")
            }),
        );
        let submission_id = Self::str_of(&submitted, "submissionId");
        self.call(
            "portfolio.review",
            json!({
                "submissionId": submission_id,
                "status": "approved",
                "reviewerId": "trainer-1"
            }),
        )
    }

    fn certificate_locked(&mut self, student_id: &str) -> bool {
        let student = self.call("students.get", json!({ "studentId": student_id }));
        student
            .get("certificateLocked")
            .and_then(|v| v.as_bool())
            .expect("certificateLocked")
    }
}

fn seed(workspace: &PathBuf) -> (Campus, String, String, Vec<String>) {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "seed-ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let mut campus = Campus {
        stdin,
        reader,
        seq: 100,
    };

    let course = campus.call(
        "courses.create",
        json!({ "name": "Full Stack Web Development", "code": "FSWD-101" }),
    );
    let course_id = Campus::str_of(&course, "courseId");

    let student = campus.call(
        "students.create",
        json!({ "courseId": course_id, "fullName": "Sana Qureshi" }),
    );
    let student_id = Campus::str_of(&student, "studentId");

    let mut task_ids = Vec::new();
    for (i, title) in ["Landing page", "REST API", "Capstone"].iter().enumerate() {
        let task = campus.call(
            "portfolio.tasks.create",
            json!({ "courseId": course_id, "title": title, "sortOrder": i }),
        );
        task_ids.push(Campus::str_of(&task, "taskId"));
    }

    (campus, course_id, student_id, task_ids)
}

#[test]
fn cascade_unlocks_on_the_final_task_only() {
    let workspace = temp_dir("campus-cascade");
    let (mut campus, _course_id, student_id, tasks) = seed(&workspace);

    assert!(campus.certificate_locked(&student_id));

    let r1 = campus.submit_and_approve(&student_id, &tasks[0]);
    assert_eq!(
        r1.get("portfolioComplete").and_then(|v| v.as_bool()),
        Some(false)
    );
    let r2 = campus.submit_and_approve(&student_id, &tasks[1]);
    assert_eq!(
        r2.get("certificateUnlocked").and_then(|v| v.as_bool()),
        Some(false)
    );
    assert!(campus.certificate_locked(&student_id));

    let r3 = campus.submit_and_approve(&student_id, &tasks[2]);
    assert_eq!(
        r3.get("portfolioComplete").and_then(|v| v.as_bool()),
        Some(true)
    );
    assert_eq!(
        r3.get("certificateUnlocked").and_then(|v| v.as_bool()),
        Some(true)
    );
    assert!(!campus.certificate_locked(&student_id));

    // Approving yet another submission for a complete course is a no-op.
    let r4 = campus.submit_and_approve(&student_id, &tasks[0]);
    assert_eq!(
        r4.get("portfolioComplete").and_then(|v| v.as_bool()),
        Some(true)
    );
    assert_eq!(
        r4.get("certificateUnlocked").and_then(|v| v.as_bool()),
        Some(false)
    );
    assert!(!campus.certificate_locked(&student_id));

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn resubmission_after_rejection_still_counts() {
    let workspace = temp_dir("campus-resubmit");
    let (mut campus, _course_id, student_id, tasks) = seed(&workspace);

    let _ = campus.submit_and_approve(&student_id, &tasks[0]);
    let _ = campus.submit_and_approve(&student_id, &tasks[1]);

    // First attempt at the capstone is rejected.
    let submitted = campus.call(
        "portfolio.submit",
        json!({
            "studentId": student_id,
            "taskId": tasks[2],
            "workUrl": "https://git.example.com/capstone-draft"
        }),
    );
    let rejected_id = Campus::str_of(&submitted, "submissionId");
    let rejected = campus.call(
        "portfolio.review",
        json!({
            "submissionId": rejected_id,
            "status": "rejected",
            "remarks": "tests missing",
            "reviewerId": "trainer-1"
        }),
    );
    assert_eq!(
        rejected.get("certificateUnlocked").and_then(|v| v.as_bool()),
        Some(false)
    );
    assert!(campus.certificate_locked(&student_id));

    // A fresh submission, not a state transition on the rejected one.
    let retried = campus.submit_and_approve(&student_id, &tasks[2]);
    assert_eq!(
        retried.get("certificateUnlocked").and_then(|v| v.as_bool()),
        Some(true)
    );
    assert!(!campus.certificate_locked(&student_id));

    // History keeps both attempts.
    let history = campus.call(
        "portfolio.submissions.list",
        json!({ "studentId": student_id, "taskId": tasks[2] }),
    );
    let submissions = history
        .get("submissions")
        .and_then(|v| v.as_array())
        .expect("submissions");
    assert_eq!(submissions.len(), 2);

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn tasks_added_later_raise_the_bar_again() {
    let workspace = temp_dir("campus-growing-course");
    let (mut campus, course_id, student_id, tasks) = seed(&workspace);

    for task_id in &tasks {
        let _ = campus.submit_and_approve(&student_id, task_id);
    }
    assert!(!campus.certificate_locked(&student_id));

    // A new deliverable lands after completion. The next approval recomputes
    // against the current total and no longer reports completion.
    let extra = campus.call(
        "portfolio.tasks.create",
        json!({ "courseId": course_id, "title": "Deployment runbook", "sortOrder": 9 }),
    );
    let extra_id = Campus::str_of(&extra, "taskId");

    let partial = campus.submit_and_approve(&student_id, &tasks[0]);
    assert_eq!(
        partial.get("portfolioComplete").and_then(|v| v.as_bool()),
        Some(false)
    );

    let finished = campus.submit_and_approve(&student_id, &extra_id);
    assert_eq!(
        finished.get("portfolioComplete").and_then(|v| v.as_bool()),
        Some(true)
    );

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn review_failure_semantics() {
    let workspace = temp_dir("campus-review-errors");
    let (mut campus, _course_id, student_id, tasks) = seed(&workspace);

    let submitted = campus.call(
        "portfolio.submit",
        json!({
            "studentId": student_id,
            "taskId": tasks[0],
            "workUrl": "https://git.example.com/landing"
        }),
    );
    let submission_id = Campus::str_of(&submitted, "submissionId");

    // Verdict outside the closed set: rejected before any state change.
    let bad = campus.call_raw(
        "portfolio.review",
        json!({
            "submissionId": submission_id,
            "status": "maybe-later",
            "reviewerId": "trainer-1"
        }),
    );
    assert_eq!(
        bad.get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str()),
        Some("bad_params")
    );
    let history = campus.call(
        "portfolio.submissions.list",
        json!({ "studentId": student_id, "taskId": tasks[0] }),
    );
    assert_eq!(
        history["submissions"][0].get("status").and_then(|v| v.as_str()),
        Some("pending")
    );

    let missing = campus.call_raw(
        "portfolio.review",
        json!({
            "submissionId": "no-such-submission",
            "status": "approved",
            "reviewerId": "trainer-1"
        }),
    );
    assert_eq!(
        missing
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str()),
        Some("not_found")
    );

    let _ = campus.call(
        "portfolio.review",
        json!({
            "submissionId": submission_id,
            "status": "approved",
            "reviewerId": "trainer-1"
        }),
    );
    // Approved and rejected are terminal; a second review conflicts.
    let again = campus.call_raw(
        "portfolio.review",
        json!({
            "submissionId": submission_id,
            "status": "rejected",
            "reviewerId": "trainer-2"
        }),
    );
    assert_eq!(
        again
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str()),
        Some("conflict")
    );

    let ghost_task = campus.call_raw(
        "portfolio.submit",
        json!({
            "studentId": student_id,
            "taskId": "no-such-task",
            "workUrl": "https://git.example.com/x"
        }),
    );
    assert_eq!(
        ghost_task
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str()),
        Some("not_found")
    );

    let _ = std::fs::remove_dir_all(workspace);
}
