use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("campus.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS courses(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            code TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS batches(
            id TEXT PRIMARY KEY,
            course_id TEXT NOT NULL,
            name TEXT NOT NULL,
            FOREIGN KEY(course_id) REFERENCES courses(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_batches_course ON batches(course_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            course_id TEXT NOT NULL,
            batch_id TEXT,
            full_name TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            fee_balance REAL NOT NULL DEFAULT 0,
            certificate_locked INTEGER NOT NULL DEFAULT 1,
            placement_eligible INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT,
            FOREIGN KEY(course_id) REFERENCES courses(id),
            FOREIGN KEY(batch_id) REFERENCES batches(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_course ON students(course_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_batch ON students(batch_id)",
        [],
    )?;

    // Workspaces created before fee tracking landed lack the column. Add and
    // backfill to the zero-balance default.
    ensure_students_fee_balance(&conn)?;

    // One row per (student, date, period). The unique index is the idempotence
    // key for attendance marking; the upsert relies on it.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance_records(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            course_id TEXT NOT NULL,
            batch_id TEXT,
            date TEXT NOT NULL,
            period INTEGER NOT NULL DEFAULT 1,
            status TEXT NOT NULL,
            remarks TEXT,
            trainer_id TEXT,
            check_in TEXT,
            check_out TEXT,
            verified INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT,
            UNIQUE(student_id, date, period),
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(course_id) REFERENCES courses(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_student ON attendance_records(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_student_date ON attendance_records(student_id, date)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_course_date ON attendance_records(course_id, date)",
        [],
    )?;
    ensure_attendance_check_times(&conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS portfolio_tasks(
            id TEXT PRIMARY KEY,
            course_id TEXT NOT NULL,
            title TEXT NOT NULL,
            description TEXT,
            sort_order INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(course_id) REFERENCES courses(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_portfolio_tasks_course ON portfolio_tasks(course_id)",
        [],
    )?;

    // Submission history is append-only; resubmission after rejection is a new
    // row, never an update of the rejected one.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS portfolio_submissions(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            task_id TEXT NOT NULL,
            work_url TEXT NOT NULL,
            remarks TEXT,
            status TEXT NOT NULL,
            reviewer_id TEXT,
            submitted_at TEXT NOT NULL,
            reviewed_at TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(task_id) REFERENCES portfolio_tasks(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_portfolio_submissions_student ON portfolio_submissions(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_portfolio_submissions_task ON portfolio_submissions(task_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_portfolio_submissions_student_task
         ON portfolio_submissions(student_id, task_id)",
        [],
    )?;

    // Owned by the test-management subsystem; the eligibility evaluator only
    // reads it.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS test_results(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            title TEXT NOT NULL,
            passed INTEGER NOT NULL,
            score REAL,
            recorded_at TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_test_results_student ON test_results(student_id)",
        [],
    )?;

    Ok(conn)
}

fn ensure_students_fee_balance(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "students", "fee_balance")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE students ADD COLUMN fee_balance REAL NOT NULL DEFAULT 0",
        [],
    )?;
    Ok(())
}

fn ensure_attendance_check_times(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "attendance_records", "check_in")? {
        conn.execute("ALTER TABLE attendance_records ADD COLUMN check_in TEXT", [])?;
    }
    if !table_has_column(conn, "attendance_records", "check_out")? {
        conn.execute(
            "ALTER TABLE attendance_records ADD COLUMN check_out TEXT",
            [],
        )?;
    }
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
