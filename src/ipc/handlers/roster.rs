use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

// Minimal roster surface: enough course/batch/student plumbing to feed the
// attendance and eligibility engine. Full admin CRUD lives in the main backend.

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

fn db_err(e: rusqlite::Error) -> HandlerErr {
    HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    }
}

fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: format!("missing {}", key),
            details: None,
        })
}

fn get_optional_str(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn course_exists(conn: &Connection, course_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM courses WHERE id = ?", [course_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(db_err)
}

fn student_exists(conn: &Connection, student_id: &str) -> Result<bool, rusqlite::Error> {
    conn.query_row("SELECT 1 FROM students WHERE id = ?", [student_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
}

fn courses_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?;
    let code = get_optional_str(params, "code");

    let course_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO courses(id, name, code) VALUES(?, ?, ?)",
        (&course_id, &name, &code),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "courses" })),
    })?;

    Ok(json!({ "courseId": course_id, "name": name }))
}

fn courses_list(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    // Correlated subqueries keep the counts join-free.
    let mut stmt = conn
        .prepare(
            "SELECT
               c.id,
               c.name,
               c.code,
               (SELECT COUNT(*) FROM students s WHERE s.course_id = c.id) AS student_count,
               (SELECT COUNT(*) FROM portfolio_tasks t WHERE t.course_id = c.id) AS task_count
             FROM courses c
             ORDER BY c.name",
        )
        .map_err(db_err)?;
    let courses = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let code: Option<String> = row.get(2)?;
            let student_count: i64 = row.get(3)?;
            let task_count: i64 = row.get(4)?;
            Ok(json!({
                "id": id,
                "name": name,
                "code": code,
                "studentCount": student_count,
                "taskCount": task_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    Ok(json!({ "courses": courses }))
}

fn batches_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let course_id = get_required_str(params, "courseId")?;
    let name = get_required_str(params, "name")?;

    if !course_exists(conn, &course_id)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "course not found".to_string(),
            details: None,
        });
    }

    let batch_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO batches(id, course_id, name) VALUES(?, ?, ?)",
        (&batch_id, &course_id, &name),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "batches" })),
    })?;

    Ok(json!({ "batchId": batch_id, "courseId": course_id, "name": name }))
}

fn students_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let course_id = get_required_str(params, "courseId")?;
    let full_name = get_required_str(params, "fullName")?;
    let batch_id = get_optional_str(params, "batchId");
    let fee_balance = params
        .get("feeBalance")
        .and_then(|v| v.as_f64())
        .unwrap_or(0.0);

    if !course_exists(conn, &course_id)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "course not found".to_string(),
            details: None,
        });
    }
    if let Some(bid) = &batch_id {
        let batch_ok = conn
            .query_row(
                "SELECT 1 FROM batches WHERE id = ? AND course_id = ?",
                (bid, &course_id),
                |r| r.get::<_, i64>(0),
            )
            .optional()
            .map_err(db_err)?
            .is_some();
        if !batch_ok {
            return Err(HandlerErr {
                code: "not_found",
                message: "batch not found for course".to_string(),
                details: Some(json!({ "batchId": bid })),
            });
        }
    }

    let student_id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO students(id, course_id, batch_id, full_name, active, fee_balance, certificate_locked, placement_eligible, updated_at)
         VALUES(?, ?, ?, ?, 1, ?, 1, 0, ?)",
        (&student_id, &course_id, &batch_id, &full_name, fee_balance, &now),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "students" })),
    })?;

    Ok(json!({ "studentId": student_id, "courseId": course_id, "fullName": full_name }))
}

fn students_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let course_id = get_optional_str(params, "courseId");
    let batch_id = get_optional_str(params, "batchId");

    let (sql, filter) = match (&course_id, &batch_id) {
        (_, Some(bid)) => (
            "SELECT id, course_id, batch_id, full_name, active, certificate_locked, placement_eligible
             FROM students WHERE batch_id = ? ORDER BY full_name",
            Some(bid.clone()),
        ),
        (Some(cid), None) => (
            "SELECT id, course_id, batch_id, full_name, active, certificate_locked, placement_eligible
             FROM students WHERE course_id = ? ORDER BY full_name",
            Some(cid.clone()),
        ),
        (None, None) => (
            "SELECT id, course_id, batch_id, full_name, active, certificate_locked, placement_eligible
             FROM students ORDER BY full_name",
            None,
        ),
    };

    let mut stmt = conn.prepare(sql).map_err(db_err)?;
    let map_row = |row: &rusqlite::Row<'_>| {
        let id: String = row.get(0)?;
        let course_id: String = row.get(1)?;
        let batch_id: Option<String> = row.get(2)?;
        let full_name: String = row.get(3)?;
        let active: i64 = row.get(4)?;
        let certificate_locked: i64 = row.get(5)?;
        let placement_eligible: i64 = row.get(6)?;
        Ok(json!({
            "id": id,
            "courseId": course_id,
            "batchId": batch_id,
            "fullName": full_name,
            "active": active != 0,
            "certificateLocked": certificate_locked != 0,
            "placementEligible": placement_eligible != 0
        }))
    };
    let students = match filter {
        Some(value) => stmt
            .query_map([value], map_row)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>()),
        None => stmt
            .query_map([], map_row)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>()),
    }
    .map_err(db_err)?;

    Ok(json!({ "students": students }))
}

fn students_get(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let student = conn
        .query_row(
            "SELECT id, course_id, batch_id, full_name, active, fee_balance, certificate_locked, placement_eligible
             FROM students WHERE id = ?",
            [&student_id],
            |row| {
                let id: String = row.get(0)?;
                let course_id: String = row.get(1)?;
                let batch_id: Option<String> = row.get(2)?;
                let full_name: String = row.get(3)?;
                let active: i64 = row.get(4)?;
                let fee_balance: f64 = row.get(5)?;
                let certificate_locked: i64 = row.get(6)?;
                let placement_eligible: i64 = row.get(7)?;
                Ok(json!({
                    "id": id,
                    "courseId": course_id,
                    "batchId": batch_id,
                    "fullName": full_name,
                    "active": active != 0,
                    "feeBalance": fee_balance,
                    "certificateLocked": certificate_locked != 0,
                    "placementEligible": placement_eligible != 0
                }))
            },
        )
        .optional()
        .map_err(db_err)?;

    student.ok_or_else(|| HandlerErr {
        code: "not_found",
        message: "student not found".to_string(),
        details: None,
    })
}

// Write seam for the test-management side: it records pass/fail facts, the
// eligibility evaluator reads them.
fn tests_record(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let title = get_required_str(params, "title")?;
    let passed = params
        .get("passed")
        .and_then(|v| v.as_bool())
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: "missing passed".to_string(),
            details: None,
        })?;
    let score = params.get("score").and_then(|v| v.as_f64());

    if !student_exists(conn, &student_id).map_err(db_err)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "student not found".to_string(),
            details: None,
        });
    }

    let result_id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO test_results(id, student_id, title, passed, score, recorded_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (&result_id, &student_id, &title, passed as i64, score, &now),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "test_results" })),
    })?;

    Ok(json!({ "resultId": result_id, "studentId": student_id, "passed": passed }))
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
        "courses.create" => Some(with_conn(state, req, courses_create)),
        "courses.list" => Some(with_conn(state, req, |c, _| courses_list(c))),
        "batches.create" => Some(with_conn(state, req, batches_create)),
        "students.create" => Some(with_conn(state, req, students_create)),
        "students.list" => Some(with_conn(state, req, students_list)),
        "students.get" => Some(with_conn(state, req, students_get)),
        "tests.record" => Some(with_conn(state, req, tests_record)),
        _ => None,
    }
}
