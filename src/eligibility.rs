use serde::Serialize;

pub const ATTENDANCE_ELIGIBLE_PERCENT: i64 = 75;
pub const CONSECUTIVE_ABSENCE_ALERT_AT: i64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttendanceStatus {
    Present,
    Absent,
    Late,
    Excused,
}

impl AttendanceStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "present" => Some(Self::Present),
            "absent" => Some(Self::Absent),
            "late" => Some(Self::Late),
            "excused" => Some(Self::Excused),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Present => "present",
            Self::Absent => "absent",
            Self::Late => "late",
            Self::Excused => "excused",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionStatus {
    Pending,
    Approved,
    Rejected,
}

impl SubmissionStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }

    /// The two legal review outcomes. `pending` is the initial state, never a
    /// review target.
    pub fn parse_review(s: &str) -> Option<Self> {
        match Self::parse(s) {
            Some(Self::Approved) => Some(Self::Approved),
            Some(Self::Rejected) => Some(Self::Rejected),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestStatus {
    Pending,
    Partial,
    Passed,
}

impl TestStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Partial => "partial",
            Self::Passed => "passed",
        }
    }
}

/// `pending` when nothing is recorded, `passed` only when every recorded test
/// passed, `partial` otherwise.
pub fn test_status<I>(passed_flags: I) -> TestStatus
where
    I: IntoIterator<Item = bool>,
{
    let mut total = 0usize;
    let mut passed = 0usize;
    for flag in passed_flags {
        total += 1;
        if flag {
            passed += 1;
        }
    }
    if total == 0 {
        TestStatus::Pending
    } else if passed == total {
        TestStatus::Passed
    } else {
        TestStatus::Partial
    }
}

pub fn round_percent(part: i64, total: i64) -> i64 {
    if total <= 0 {
        return 0;
    }
    ((part as f64) * 100.0 / (total as f64)).round() as i64
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceSummary {
    pub present_count: i64,
    pub absent_count: i64,
    pub late_count: i64,
    pub excused_count: i64,
    pub total_count: i64,
    pub percentage: i64,
    pub max_consecutive_absences: i64,
}

impl AttendanceSummary {
    pub fn eligible(&self) -> bool {
        self.percentage >= ATTENDANCE_ELIGIBLE_PERCENT
    }

    pub fn consecutive_absence_alert(&self) -> bool {
        self.max_consecutive_absences >= CONSECUTIVE_ABSENCE_ALERT_AT
    }
}

/// Summarize marks for one student. `statuses` must be ordered by date (and
/// period) descending; the consecutive-absence run is counted over that order.
/// Only `present` feeds the percentage numerator; every mark feeds the
/// denominator.
pub fn attendance_summary<I>(statuses: I) -> AttendanceSummary
where
    I: IntoIterator<Item = AttendanceStatus>,
{
    let mut summary = AttendanceSummary::default();
    let mut run: i64 = 0;

    for status in statuses {
        summary.total_count += 1;
        match status {
            AttendanceStatus::Present => summary.present_count += 1,
            AttendanceStatus::Absent => summary.absent_count += 1,
            AttendanceStatus::Late => summary.late_count += 1,
            AttendanceStatus::Excused => summary.excused_count += 1,
        }
        if status == AttendanceStatus::Absent {
            run += 1;
            if run > summary.max_consecutive_absences {
                summary.max_consecutive_absences = run;
            }
        } else {
            run = 0;
        }
    }

    summary.percentage = round_percent(summary.present_count, summary.total_count);
    summary
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PortfolioProgress {
    pub approved_tasks: i64,
    pub total_tasks: i64,
}

impl PortfolioProgress {
    pub fn percentage(&self) -> i64 {
        round_percent(self.approved_tasks, self.total_tasks)
    }

    /// A course with zero defined tasks can never reach completion. Completion
    /// compares raw counts, not the rounded percentage, so 199/200 approved
    /// never reads as done.
    pub fn complete(&self) -> bool {
        self.total_tasks > 0 && self.approved_tasks >= self.total_tasks
    }
}

pub const MISSING_ATTENDANCE: &str = "Attendance below 75%";
pub const MISSING_PORTFOLIO: &str = "Portfolio not completed";
pub const MISSING_TESTS: &str = "Tests not passed";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EligibilityModel {
    pub attendance_percentage: i64,
    pub attendance_eligible: bool,
    pub portfolio_percentage: i64,
    pub portfolio_complete: bool,
    pub test_status: &'static str,
    pub certificate_eligible: bool,
    pub placement_eligible: bool,
    pub missing_requirements: Vec<String>,
}

/// Combine the three gates. `certificate_locked` is the portfolio-owned flag on
/// the student; placement eligibility additionally requires it to be cleared.
pub fn evaluate(
    attendance: &AttendanceSummary,
    portfolio: &PortfolioProgress,
    tests: TestStatus,
    certificate_locked: bool,
) -> EligibilityModel {
    let attendance_eligible = attendance.eligible();
    let portfolio_complete = portfolio.complete();
    let tests_passed = tests == TestStatus::Passed;

    let mut missing = Vec::new();
    if !attendance_eligible {
        missing.push(MISSING_ATTENDANCE.to_string());
    }
    if !portfolio_complete {
        missing.push(MISSING_PORTFOLIO.to_string());
    }
    if !tests_passed {
        missing.push(MISSING_TESTS.to_string());
    }

    let certificate_eligible = attendance_eligible && portfolio_complete && tests_passed;

    EligibilityModel {
        attendance_percentage: attendance.percentage,
        attendance_eligible,
        portfolio_percentage: portfolio.percentage(),
        portfolio_complete,
        test_status: tests.as_str(),
        certificate_eligible,
        placement_eligible: certificate_eligible && !certificate_locked,
        missing_requirements: missing,
    }
}
