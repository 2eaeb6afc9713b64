use crate::eligibility::{self, AttendanceStatus};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension};
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

// A constraint violation escaping the keyed upsert means the atomic-write
// guarantee was broken somewhere; surface it as its own code instead of
// folding it into generic db failures.
fn write_err(e: rusqlite::Error, table: &str) -> HandlerErr {
    if let rusqlite::Error::SqliteFailure(f, _) = &e {
        if f.code == rusqlite::ErrorCode::ConstraintViolation {
            return HandlerErr {
                code: "conflict",
                message: e.to_string(),
                details: Some(json!({ "table": table })),
            };
        }
    }
    HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": table })),
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

/// Attendance is keyed at day granularity. Accepts a plain date or a full
/// timestamp; either way the stored key is the calendar date, so two calls
/// within the same day always collide on the same (student, date, period).
fn normalize_date(raw: &str) -> Result<String, HandlerErr> {
    let t = raw.trim();
    if let Ok(d) = NaiveDate::parse_from_str(t, "%Y-%m-%d") {
        return Ok(d.format("%Y-%m-%d").to_string());
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(t) {
        return Ok(dt.date_naive().format("%Y-%m-%d").to_string());
    }
    Err(HandlerErr {
        code: "bad_params",
        message: "date must be YYYY-MM-DD or an RFC 3339 timestamp".to_string(),
        details: Some(json!({ "date": t })),
    })
}

fn parse_period(params: &serde_json::Value) -> Result<i64, HandlerErr> {
    let Some(v) = params.get("period") else {
        return Ok(1);
    };
    if v.is_null() {
        return Ok(1);
    }
    match v.as_i64() {
        Some(p) if p >= 1 => Ok(p),
        _ => Err(HandlerErr {
            code: "bad_params",
            message: "period must be an integer >= 1".to_string(),
            details: None,
        }),
    }
}

fn parse_status(params: &serde_json::Value) -> Result<AttendanceStatus, HandlerErr> {
    let raw = get_required_str(params, "status")?;
    AttendanceStatus::parse(&raw).ok_or_else(|| HandlerErr {
        code: "bad_params",
        message: "status must be one of: present, absent, late, excused".to_string(),
        details: Some(json!({ "status": raw })),
    })
}

fn course_exists(conn: &Connection, course_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM courses WHERE id = ?", [course_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(query_err)
}

fn student_batch(conn: &Connection, student_id: &str) -> Result<Option<Option<String>>, HandlerErr> {
    conn.query_row(
        "SELECT batch_id FROM students WHERE id = ?",
        [student_id],
        |r| r.get::<_, Option<String>>(0),
    )
    .optional()
    .map_err(query_err)
}

struct MarkInput {
    student_id: String,
    period: i64,
    status: AttendanceStatus,
    remarks: Option<String>,
    check_in: Option<String>,
    check_out: Option<String>,
}

fn parse_mark_input(params: &serde_json::Value) -> Result<MarkInput, HandlerErr> {
    Ok(MarkInput {
        student_id: get_required_str(params, "studentId")?,
        period: parse_period(params)?,
        status: parse_status(params)?,
        remarks: get_optional_str(params, "remarks"),
        check_in: get_optional_str(params, "checkIn"),
        check_out: get_optional_str(params, "checkOut"),
    })
}

/// One record's upsert. The INSERT .. ON CONFLICT on the
/// (student_id, date, period) unique key is a single atomic write; concurrent
/// duplicate marks for the same key land on the same row instead of racing an
/// existence check.
fn apply_mark(
    conn: &Connection,
    course_id: &str,
    date: &str,
    trainer_id: Option<&str>,
    input: &MarkInput,
) -> Result<serde_json::Value, HandlerErr> {
    let Some(batch_id) = student_batch(conn, &input.student_id)? else {
        return Err(HandlerErr {
            code: "not_found",
            message: "student not found".to_string(),
            details: Some(json!({ "studentId": input.student_id })),
        });
    };

    let record_id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO attendance_records(
            id, student_id, course_id, batch_id, date, period,
            status, remarks, trainer_id, check_in, check_out, verified, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?)
         ON CONFLICT(student_id, date, period) DO UPDATE SET
           status = excluded.status,
           remarks = excluded.remarks,
           trainer_id = excluded.trainer_id,
           check_in = COALESCE(excluded.check_in, attendance_records.check_in),
           check_out = COALESCE(excluded.check_out, attendance_records.check_out),
           updated_at = excluded.updated_at",
        (
            &record_id,
            &input.student_id,
            course_id,
            &batch_id,
            date,
            input.period,
            input.status.as_str(),
            &input.remarks,
            trainer_id,
            &input.check_in,
            &input.check_out,
            &now,
        ),
    )
    .map_err(|e| write_err(e, "attendance_records"))?;

    Ok(json!({
        "studentId": input.student_id,
        "date": date,
        "period": input.period,
        "status": input.status.as_str()
    }))
}

fn attendance_mark(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let course_id = get_required_str(params, "courseId")?;
    let date = normalize_date(&get_required_str(params, "date")?)?;
    let trainer_id = get_optional_str(params, "trainerId");
    let input = parse_mark_input(params)?;

    if !course_exists(conn, &course_id)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "course not found".to_string(),
            details: None,
        });
    }

    apply_mark(conn, &course_id, &date, trainer_id.as_deref(), &input)
}

fn attendance_bulk_mark(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let course_id = get_required_str(params, "courseId")?;
    let date = normalize_date(&get_required_str(params, "date")?)?;
    let trainer_id = get_optional_str(params, "trainerId");
    let Some(records) = params.get("records").and_then(|v| v.as_array()) else {
        return Err(HandlerErr {
            code: "bad_params",
            message: "missing records".to_string(),
            details: None,
        });
    };

    if !course_exists(conn, &course_id)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "course not found".to_string(),
            details: None,
        });
    }

    // Each record is its own atomic upsert; one bad record takes only its own
    // result slot and never unwinds records already applied.
    let mut results: Vec<serde_json::Value> = Vec::with_capacity(records.len());
    let mut applied: i64 = 0;
    let mut failed: i64 = 0;
    for record in records {
        let outcome = parse_mark_input(record)
            .and_then(|input| apply_mark(conn, &course_id, &date, trainer_id.as_deref(), &input));
        match outcome {
            Ok(applied_record) => {
                applied += 1;
                let mut slot = applied_record;
                slot["ok"] = json!(true);
                results.push(slot);
            }
            Err(e) => {
                failed += 1;
                results.push(json!({
                    "ok": false,
                    "studentId": record.get("studentId").cloned().unwrap_or(json!(null)),
                    "error": { "code": e.code, "message": e.message }
                }));
            }
        }
    }

    Ok(json!({
        "courseId": course_id,
        "date": date,
        "appliedCount": applied,
        "failedCount": failed,
        "results": results
    }))
}

fn attendance_aggregate(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let from = match get_optional_str(params, "from") {
        Some(raw) => Some(normalize_date(&raw)?),
        None => None,
    };
    let to = match get_optional_str(params, "to") {
        Some(raw) => Some(normalize_date(&raw)?),
        None => None,
    };

    if student_batch(conn, &student_id)?.is_none() {
        return Err(HandlerErr {
            code: "not_found",
            message: "student not found".to_string(),
            details: None,
        });
    }

    let mut sql = String::from("SELECT status FROM attendance_records WHERE student_id = ?");
    let mut binds: Vec<Value> = vec![Value::from(student_id.clone())];
    if let Some(f) = &from {
        sql.push_str(" AND date >= ?");
        binds.push(Value::from(f.clone()));
    }
    if let Some(t) = &to {
        sql.push_str(" AND date <= ?");
        binds.push(Value::from(t.clone()));
    }
    sql.push_str(" ORDER BY date DESC, period DESC");

    let mut stmt = conn.prepare(&sql).map_err(query_err)?;
    let statuses = stmt
        .query_map(params_from_iter(binds), |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;

    let summary = eligibility::attendance_summary(
        statuses
            .iter()
            .filter_map(|s| AttendanceStatus::parse(s)),
    );

    Ok(json!({
        "studentId": student_id,
        "from": from,
        "to": to,
        "presentCount": summary.present_count,
        "absentCount": summary.absent_count,
        "lateCount": summary.late_count,
        "excusedCount": summary.excused_count,
        "totalCount": summary.total_count,
        "percentage": summary.percentage,
        "eligibilityStatus": if summary.eligible() { "eligible" } else { "not_eligible" },
        "maxConsecutiveAbsences": summary.max_consecutive_absences,
        "consecutiveAbsenceAlert": summary.consecutive_absence_alert()
    }))
}

fn attendance_day_open(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let course_id = get_required_str(params, "courseId")?;
    let date = normalize_date(&get_required_str(params, "date")?)?;

    if !course_exists(conn, &course_id)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "course not found".to_string(),
            details: None,
        });
    }

    let mut stmt = conn
        .prepare(
            "SELECT id, full_name, active FROM students
             WHERE course_id = ? ORDER BY full_name",
        )
        .map_err(query_err)?;
    let students = stmt
        .query_map([&course_id], |r| {
            let id: String = r.get(0)?;
            let full_name: String = r.get(1)?;
            let active: i64 = r.get(2)?;
            Ok(json!({
                "id": id,
                "fullName": full_name,
                "active": active != 0
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;

    let mut stmt = conn
        .prepare(
            "SELECT student_id, period, status, remarks, trainer_id
             FROM attendance_records
             WHERE course_id = ? AND date = ?
             ORDER BY student_id, period",
        )
        .map_err(query_err)?;
    let records = stmt
        .query_map((&course_id, &date), |r| {
            let student_id: String = r.get(0)?;
            let period: i64 = r.get(1)?;
            let status: String = r.get(2)?;
            let remarks: Option<String> = r.get(3)?;
            let trainer_id: Option<String> = r.get(4)?;
            Ok(json!({
                "studentId": student_id,
                "period": period,
                "status": status,
                "remarks": remarks,
                "trainerId": trainer_id
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;

    Ok(json!({
        "courseId": course_id,
        "date": date,
        "students": students,
        "records": records
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
        "attendance.mark" => Some(with_conn(state, req, attendance_mark)),
        "attendance.bulkMark" => Some(with_conn(state, req, attendance_bulk_mark)),
        "attendance.aggregate" => Some(with_conn(state, req, attendance_aggregate)),
        "attendance.dayOpen" => Some(with_conn(state, req, attendance_day_open)),
        _ => None,
    }
}
