use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime};
use serde::Serialize;

/// One scheduled class session for a day.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CourseRecord {
    pub lesson_key: String,
    pub lesson_name: String,
    pub teacher_name: String,
    pub teacher_id: String,
    pub class_room_name: String,
    pub date: NaiveDate,
    pub scheduled_start: NaiveDateTime,
    pub scheduled_end: NaiveDateTime,
}

/// One student's attendance record for a session, as reported upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignRecord {
    pub lesson_key: String,
    pub session_user_key: String,
    pub window_before_open: NaiveDateTime,
    pub scheduled_start: NaiveDateTime,
    pub window_after_open: NaiveDateTime,
    pub window_before_close: NaiveDateTime,
    pub scheduled_end: NaiveDateTime,
    pub window_after_close: NaiveDateTime,
    pub actual_sign_in: Option<NaiveDateTime>,
    pub actual_sign_out: Option<NaiveDateTime>,
    pub is_absent: bool,
    pub is_late: bool,
    pub is_early_leave: bool,
    pub is_on_leave: bool,
    pub late_minutes: i64,
    pub early_leave_minutes: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttendanceStatus {
    NotSignedIn,
    SignedIn,
    SignedOut,
    Late,
    EarlyLeave,
}

impl AttendanceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotSignedIn => "not_signed_in",
            Self::SignedIn => "signed_in",
            Self::SignedOut => "signed_out",
            Self::Late => "late",
            Self::EarlyLeave => "early_leave",
        }
    }
}

impl fmt::Display for AttendanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttendanceStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_signed_in" => Ok(Self::NotSignedIn),
            "signed_in" => Ok(Self::SignedIn),
            "signed_out" => Ok(Self::SignedOut),
            "late" => Ok(Self::Late),
            "early_leave" => Ok(Self::EarlyLeave),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// Secondary classification used to flag anomalies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Situation {
    None,
    Late,
    EarlyLeave,
    Absent,
    OnLeave,
}

impl Situation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Late => "late",
            Self::EarlyLeave => "early_leave",
            Self::Absent => "absent",
            Self::OnLeave => "on_leave",
        }
    }
}

impl fmt::Display for Situation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Situation {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "late" => Ok(Self::Late),
            "early_leave" => Ok(Self::EarlyLeave),
            "absent" => Ok(Self::Absent),
            "on_leave" => Ok(Self::OnLeave),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown variant `{0}`")]
pub struct UnknownVariant(pub String);

/// One reconciled row of the day's schedule.
///
/// `status` is `None` when the record is absent or on leave; those rows are
/// described by `situation` alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassAttendanceEntry {
    pub order_index: usize,
    pub lesson_key: String,
    pub lesson_name: String,
    pub teacher_name: String,
    pub teacher_id: String,
    pub class_room_name: String,
    pub lesson_date: NaiveDate,
    pub scheduled_start: NaiveDateTime,
    pub scheduled_end: NaiveDateTime,
    pub should_sign_in_from: NaiveDateTime,
    pub sign_in_closes_at: NaiveDateTime,
    pub sign_out_opens_at: NaiveDateTime,
    pub should_sign_out_by: NaiveDateTime,
    pub sign_in: Option<NaiveDateTime>,
    pub sign_out: Option<NaiveDateTime>,
    pub status: Option<AttendanceStatus>,
    pub situation: Situation,
    /// Upstream's own late/early-leave verdicts, kept alongside the derived
    /// ones.
    pub reported_late: bool,
    pub reported_early_leave: bool,
    pub late_minutes: i64,
    pub early_leave_minutes: i64,
    pub session_user_key: String,
}

#[derive(Debug, Clone)]
pub struct SituationCount {
    pub lesson_name: String,
    pub situation: Situation,
    pub count: i64,
}

#[derive(Debug, Clone)]
pub struct ArchivedEntry {
    pub lesson_date: NaiveDate,
    pub order_index: i32,
    pub lesson_name: String,
    pub class_room_name: String,
    pub status: Option<AttendanceStatus>,
    pub situation: Situation,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn situation_text_form_is_stable() {
        for situation in [
            Situation::None,
            Situation::Late,
            Situation::EarlyLeave,
            Situation::Absent,
            Situation::OnLeave,
        ] {
            assert_eq!(situation.as_str().parse::<Situation>(), Ok(situation));
        }
        assert!("skipped".parse::<Situation>().is_err());
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&AttendanceStatus::NotSignedIn).unwrap();
        assert_eq!(json, "\"not_signed_in\"");
        assert_eq!(
            "early_leave".parse::<AttendanceStatus>(),
            Ok(AttendanceStatus::EarlyLeave)
        );
    }
}
