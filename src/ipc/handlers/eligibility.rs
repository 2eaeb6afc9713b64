use crate::eligibility::{self, AttendanceStatus, EligibilityModel};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

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

struct StudentRow {
    course_id: String,
    batch_id: Option<String>,
    full_name: String,
    active: bool,
    fee_balance: f64,
    certificate_locked: bool,
    placement_eligible: bool,
}

fn load_student(conn: &Connection, student_id: &str) -> Result<Option<StudentRow>, HandlerErr> {
    conn.query_row(
        "SELECT course_id, batch_id, full_name, active, fee_balance, certificate_locked, placement_eligible
         FROM students WHERE id = ?",
        [student_id],
        |r| {
            Ok(StudentRow {
                course_id: r.get(0)?,
                batch_id: r.get(1)?,
                full_name: r.get(2)?,
                active: r.get::<_, i64>(3)? != 0,
                fee_balance: r.get(4)?,
                certificate_locked: r.get::<_, i64>(5)? != 0,
                placement_eligible: r.get::<_, i64>(6)? != 0,
            })
        },
    )
    .optional()
    .map_err(query_err)
}

/// Pull-based evaluation: everything except the persisted placement flag is
/// re-derived from current ledger and workflow state on every call.
fn evaluate_student(
    conn: &Connection,
    student_id: &str,
    student: &StudentRow,
) -> Result<(EligibilityModel, eligibility::AttendanceSummary), HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT status FROM attendance_records
             WHERE student_id = ?
             ORDER BY date DESC, period DESC",
        )
        .map_err(query_err)?;
    let statuses = stmt
        .query_map([student_id], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;
    let attendance = eligibility::attendance_summary(
        statuses
            .iter()
            .filter_map(|s| AttendanceStatus::parse(s)),
    );

    let total_tasks: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM portfolio_tasks WHERE course_id = ?",
            [&student.course_id],
            |r| r.get(0),
        )
        .map_err(query_err)?;
    let approved_tasks: i64 = conn
        .query_row(
            "SELECT COUNT(DISTINCT t.id)
             FROM portfolio_tasks t
             JOIN portfolio_submissions s ON s.task_id = t.id
             WHERE t.course_id = ? AND s.student_id = ? AND s.status = 'approved'",
            (&student.course_id, student_id),
            |r| r.get(0),
        )
        .map_err(query_err)?;
    let portfolio = eligibility::PortfolioProgress {
        approved_tasks,
        total_tasks,
    };

    let mut stmt = conn
        .prepare("SELECT passed FROM test_results WHERE student_id = ?")
        .map_err(query_err)?;
    let passed_flags = stmt
        .query_map([student_id], |r| r.get::<_, i64>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;
    let tests = eligibility::test_status(passed_flags.iter().map(|v| *v != 0));

    let model = eligibility::evaluate(&attendance, &portfolio, tests, student.certificate_locked);
    Ok((model, attendance))
}

fn eligibility_get(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let Some(student) = load_student(conn, &student_id)? else {
        return Err(HandlerErr {
            code: "not_found",
            message: "student not found".to_string(),
            details: None,
        });
    };

    let (model, attendance) = evaluate_student(conn, &student_id, &student)?;

    Ok(json!({
        "studentId": student_id,
        "fullName": student.full_name,
        "batchId": student.batch_id,
        "active": student.active,
        "attendancePercentage": model.attendance_percentage,
        "attendanceEligible": model.attendance_eligible,
        "maxConsecutiveAbsences": attendance.max_consecutive_absences,
        "consecutiveAbsenceAlert": attendance.consecutive_absence_alert(),
        "portfolioPercentage": model.portfolio_percentage,
        "portfolioComplete": model.portfolio_complete,
        "testStatus": model.test_status,
        "certificateLocked": student.certificate_locked,
        "certificateEligible": model.certificate_eligible,
        "placementEligible": model.placement_eligible,
        // The cached flag as dashboards see it; may lag the fresh computation
        // until the next sweep.
        "storedPlacementEligible": student.placement_eligible,
        // Display only; fees never gate the booleans.
        "feeBalance": student.fee_balance,
        "missingRequirements": model.missing_requirements
    }))
}

fn sweep_batch(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let batch_id = get_required_str(params, "batchId")?;

    let batch_known = conn
        .query_row("SELECT 1 FROM batches WHERE id = ?", [&batch_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()
        .map_err(query_err)?
        .is_some();
    if !batch_known {
        return Err(HandlerErr {
            code: "not_found",
            message: "batch not found".to_string(),
            details: None,
        });
    }

    let mut stmt = conn
        .prepare("SELECT id FROM students WHERE batch_id = ? AND active = 1 ORDER BY full_name")
        .map_err(query_err)?;
    let student_ids = stmt
        .query_map([&batch_id], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;

    // The sweep is the single writer of the persisted flag. The conditional
    // update only touches rows whose stored value differs, so re-running the
    // sweep with unchanged inputs writes nothing.
    let now = Utc::now().to_rfc3339();
    let mut changed: i64 = 0;
    for student_id in &student_ids {
        let Some(student) = load_student(conn, student_id)? else {
            continue;
        };
        let (model, _) = evaluate_student(conn, student_id, &student)?;
        let desired = model.placement_eligible as i64;
        let rows = conn
            .execute(
                "UPDATE students SET placement_eligible = ?, updated_at = ?
                 WHERE id = ? AND placement_eligible != ?",
                (desired, &now, student_id, desired),
            )
            .map_err(|e| HandlerErr {
                code: "db_update_failed",
                message: e.to_string(),
                details: Some(json!({ "table": "students" })),
            })?;
        changed += rows as i64;
    }

    Ok(json!({
        "batchId": batch_id,
        "studentCount": student_ids.len(),
        "changedCount": changed
    }))
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
        "eligibility.get" => Some(with_conn(state, req, eligibility_get)),
        "eligibility.sweepBatch" => Some(with_conn(state, req, sweep_batch)),
        _ => None,
    }
}
