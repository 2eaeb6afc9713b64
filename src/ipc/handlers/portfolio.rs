use crate::eligibility::SubmissionStatus;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

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

fn query_err(e: rusqlite::Error) -> HandlerErr {
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
    .map_err(query_err)
}

fn tasks_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let course_id = get_required_str(params, "courseId")?;
    let title = get_required_str(params, "title")?;
    let description = get_optional_str(params, "description");
    let sort_order = params.get("sortOrder").and_then(|v| v.as_i64()).unwrap_or(0);

    if !course_exists(conn, &course_id)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "course not found".to_string(),
            details: None,
        });
    }

    let task_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO portfolio_tasks(id, course_id, title, description, sort_order)
         VALUES(?, ?, ?, ?, ?)",
        (&task_id, &course_id, &title, &description, sort_order),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "portfolio_tasks" })),
    })?;

    Ok(json!({ "taskId": task_id, "courseId": course_id, "title": title }))
}

fn tasks_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let course_id = get_required_str(params, "courseId")?;

    if !course_exists(conn, &course_id)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "course not found".to_string(),
            details: None,
        });
    }

    let mut stmt = conn
        .prepare(
            "SELECT id, title, description, sort_order
             FROM portfolio_tasks WHERE course_id = ?
             ORDER BY sort_order, title",
        )
        .map_err(query_err)?;
    let tasks = stmt
        .query_map([&course_id], |r| {
            let id: String = r.get(0)?;
            let title: String = r.get(1)?;
            let description: Option<String> = r.get(2)?;
            let sort_order: i64 = r.get(3)?;
            Ok(json!({
                "id": id,
                "title": title,
                "description": description,
                "sortOrder": sort_order
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;

    Ok(json!({ "courseId": course_id, "tasks": tasks }))
}

fn submit_work(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let task_id = get_required_str(params, "taskId")?;
    let work_url = get_required_str(params, "workUrl")?;
    let remarks = get_optional_str(params, "remarks");

    let task_known = conn
        .query_row("SELECT 1 FROM portfolio_tasks WHERE id = ?", [&task_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()
        .map_err(query_err)?
        .is_some();
    if !task_known {
        return Err(HandlerErr {
            code: "not_found",
            message: "task not found".to_string(),
            details: Some(json!({ "taskId": task_id })),
        });
    }
    let student_known = conn
        .query_row("SELECT 1 FROM students WHERE id = ?", [&student_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()
        .map_err(query_err)?
        .is_some();
    if !student_known {
        return Err(HandlerErr {
            code: "not_found",
            message: "student not found".to_string(),
            details: None,
        });
    }

    // Always a fresh pending row; earlier submissions for the task stay as
    // history (a rejected task is resubmitted as a new entity).
    let submission_id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO portfolio_submissions(
            id, student_id, task_id, work_url, remarks, status, submitted_at)
         VALUES(?, ?, ?, ?, ?, 'pending', ?)",
        (&submission_id, &student_id, &task_id, &work_url, &remarks, &now),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "portfolio_submissions" })),
    })?;

    Ok(json!({
        "submissionId": submission_id,
        "studentId": student_id,
        "taskId": task_id,
        "status": "pending"
    }))
}

struct SubmissionRow {
    student_id: String,
    course_id: String,
    status: String,
}

fn load_submission(conn: &Connection, submission_id: &str) -> Result<Option<SubmissionRow>, HandlerErr> {
    conn.query_row(
        "SELECT s.student_id, t.course_id, s.status
         FROM portfolio_submissions s
         JOIN portfolio_tasks t ON t.id = s.task_id
         WHERE s.id = ?",
        [submission_id],
        |r| {
            Ok(SubmissionRow {
                student_id: r.get(0)?,
                course_id: r.get(1)?,
                status: r.get(2)?,
            })
        },
    )
    .optional()
    .map_err(query_err)
}

/// Full-course approval check. Counts are always taken against the current
/// task list, so tasks added after partial completion push the bar back up.
/// The flag flip is a conditional update and therefore a safe no-op when the
/// certificate is already unlocked.
fn run_certificate_cascade(
    conn: &Connection,
    student_id: &str,
    course_id: &str,
) -> Result<(bool, bool), HandlerErr> {
    let total_tasks: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM portfolio_tasks WHERE course_id = ?",
            [course_id],
            |r| r.get(0),
        )
        .map_err(query_err)?;
    let approved_tasks: i64 = conn
        .query_row(
            "SELECT COUNT(DISTINCT t.id)
             FROM portfolio_tasks t
             JOIN portfolio_submissions s ON s.task_id = t.id
             WHERE t.course_id = ? AND s.student_id = ? AND s.status = 'approved'",
            (course_id, student_id),
            |r| r.get(0),
        )
        .map_err(query_err)?;

    let complete = total_tasks > 0 && approved_tasks >= total_tasks;
    if !complete {
        return Ok((false, false));
    }

    let now = Utc::now().to_rfc3339();
    let unlocked = conn
        .execute(
            "UPDATE students SET certificate_locked = 0, updated_at = ?
             WHERE id = ? AND certificate_locked = 1",
            (&now, student_id),
        )
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "students" })),
        })?;

    Ok((true, unlocked > 0))
}

fn review_submission(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let submission_id = get_required_str(params, "submissionId")?;
    let raw_status = get_required_str(params, "status")?;
    let reviewer_id = get_required_str(params, "reviewerId")?;
    let remarks = get_optional_str(params, "remarks");

    // Validate the verdict before touching anything.
    let Some(verdict) = SubmissionStatus::parse_review(&raw_status) else {
        return Err(HandlerErr {
            code: "bad_params",
            message: "status must be approved or rejected".to_string(),
            details: Some(json!({ "status": raw_status })),
        });
    };

    let Some(submission) = load_submission(conn, &submission_id)? else {
        return Err(HandlerErr {
            code: "not_found",
            message: "submission not found".to_string(),
            details: Some(json!({ "submissionId": submission_id })),
        });
    };
    if submission.status != SubmissionStatus::Pending.as_str() {
        return Err(HandlerErr {
            code: "conflict",
            message: "submission already reviewed".to_string(),
            details: Some(json!({ "status": submission.status })),
        });
    }

    // Conditional on pending: of two concurrent reviews one wins, the other
    // sees zero rows and reports conflict.
    let now = Utc::now().to_rfc3339();
    let changed = conn
        .execute(
            "UPDATE portfolio_submissions
             SET status = ?, remarks = ?, reviewer_id = ?, reviewed_at = ?
             WHERE id = ? AND status = 'pending'",
            (
                verdict.as_str(),
                &remarks,
                &reviewer_id,
                &now,
                &submission_id,
            ),
        )
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "portfolio_submissions" })),
        })?;
    if changed == 0 {
        return Err(HandlerErr {
            code: "conflict",
            message: "submission already reviewed".to_string(),
            details: None,
        });
    }

    let (portfolio_complete, certificate_unlocked) = if verdict == SubmissionStatus::Approved {
        run_certificate_cascade(conn, &submission.student_id, &submission.course_id)?
    } else {
        (false, false)
    };

    Ok(json!({
        "submissionId": submission_id,
        "status": verdict.as_str(),
        "portfolioComplete": portfolio_complete,
        "certificateUnlocked": certificate_unlocked
    }))
}

fn submissions_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let task_id = get_optional_str(params, "taskId");

    let student_known = conn
        .query_row("SELECT 1 FROM students WHERE id = ?", [&student_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()
        .map_err(query_err)?
        .is_some();
    if !student_known {
        return Err(HandlerErr {
            code: "not_found",
            message: "student not found".to_string(),
            details: None,
        });
    }

    let map_row = |r: &rusqlite::Row<'_>| {
        let id: String = r.get(0)?;
        let task_id: String = r.get(1)?;
        let work_url: String = r.get(2)?;
        let remarks: Option<String> = r.get(3)?;
        let status: String = r.get(4)?;
        let reviewer_id: Option<String> = r.get(5)?;
        let submitted_at: String = r.get(6)?;
        let reviewed_at: Option<String> = r.get(7)?;
        Ok(json!({
            "id": id,
            "taskId": task_id,
            "workUrl": work_url,
            "remarks": remarks,
            "status": status,
            "reviewerId": reviewer_id,
            "submittedAt": submitted_at,
            "reviewedAt": reviewed_at
        }))
    };

    let submissions = match &task_id {
        Some(tid) => {
            let mut stmt = conn
                .prepare(
                    "SELECT id, task_id, work_url, remarks, status, reviewer_id, submitted_at, reviewed_at
                     FROM portfolio_submissions
                     WHERE student_id = ? AND task_id = ?
                     ORDER BY submitted_at DESC, rowid DESC",
                )
                .map_err(query_err)?;
            stmt.query_map((&student_id, tid), map_row)
                .and_then(|it| it.collect::<Result<Vec<_>, _>>())
                .map_err(query_err)?
        }
        None => {
            let mut stmt = conn
                .prepare(
                    "SELECT id, task_id, work_url, remarks, status, reviewer_id, submitted_at, reviewed_at
                     FROM portfolio_submissions
                     WHERE student_id = ?
                     ORDER BY submitted_at DESC, rowid DESC",
                )
                .map_err(query_err)?;
            stmt.query_map([&student_id], map_row)
                .and_then(|it| it.collect::<Result<Vec<_>, _>>())
                .map_err(query_err)?
        }
    };

    Ok(json!({ "studentId": student_id, "submissions": submissions }))
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
        "portfolio.tasks.create" => Some(with_conn(state, req, tasks_create)),
        "portfolio.tasks.list" => Some(with_conn(state, req, tasks_list)),
        "portfolio.submit" => Some(with_conn(state, req, submit_work)),
        "portfolio.review" => Some(with_conn(state, req, review_submission)),
        "portfolio.submissions.list" => Some(with_conn(state, req, submissions_list)),
        _ => None,
    }
}
