//! Wire records returned by the roll-call backend and the one step that turns
//! them into typed [`CourseRecord`]s and [`SignRecord`]s.
//!
//! The backend is loose about types: flags arrive as `"0"`/`"1"` (sometimes as
//! numbers), counters as numbers or numeric strings, and times either as a bare
//! time of day or as a full datetime. Everything past this module only sees
//! `chrono` values.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Deserializer};

use crate::models::{CourseRecord, SignRecord};

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RawCourse {
    #[serde(deserialize_with = "lenient_string")]
    pub pk_anlaxy_lesson: String,
    #[serde(deserialize_with = "lenient_string")]
    pub lesson_date: String,
    #[serde(deserialize_with = "lenient_string")]
    pub begin_time: String,
    #[serde(deserialize_with = "lenient_string")]
    pub end_time: String,
    #[serde(deserialize_with = "lenient_string")]
    pub lesson_name: String,
    #[serde(deserialize_with = "lenient_string")]
    pub teacher_id: String,
    #[serde(deserialize_with = "lenient_string")]
    pub teacher_name: String,
    #[serde(deserialize_with = "lenient_string")]
    pub class_room_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RawSignRecord {
    #[serde(deserialize_with = "lenient_string")]
    pub pk_lesson: String,
    #[serde(deserialize_with = "lenient_string")]
    pub pk_anlaxy_syllabus_user: String,
    #[serde(deserialize_with = "lenient_string")]
    pub lesson_date: String,
    #[serde(deserialize_with = "lenient_string")]
    pub before_class_time: String,
    #[serde(deserialize_with = "lenient_string")]
    pub begin_time: String,
    #[serde(deserialize_with = "lenient_string")]
    pub after_class_time: String,
    #[serde(deserialize_with = "lenient_string")]
    pub before_class_over_time: String,
    #[serde(deserialize_with = "lenient_string")]
    pub end_time: String,
    #[serde(deserialize_with = "lenient_string")]
    pub after_class_over_time: String,
    #[serde(deserialize_with = "lenient_string")]
    pub u_begin_time: String,
    #[serde(deserialize_with = "lenient_string")]
    pub u_end_time: String,
    #[serde(deserialize_with = "lenient_string")]
    pub absent_num: String,
    #[serde(deserialize_with = "lenient_string")]
    pub late_num: String,
    #[serde(deserialize_with = "lenient_string")]
    pub leave_num: String,
    #[serde(deserialize_with = "lenient_string")]
    pub ask_leave_num: String,
    #[serde(deserialize_with = "lenient_string")]
    pub late_time_length: String,
    #[serde(deserialize_with = "lenient_string")]
    pub leave_ago_time_length: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CourseListResponse {
    #[serde(deserialize_with = "lenient_string")]
    pub state: String,
    pub info: Option<String>,
    #[serde(deserialize_with = "null_as_empty")]
    pub sourcelist: Vec<RawCourse>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SignListResponse {
    #[serde(deserialize_with = "lenient_string")]
    pub state: String,
    pub info: Option<String>,
    #[serde(deserialize_with = "null_as_empty")]
    pub sign_record_list: Vec<RawSignRecord>,
}

/// Reply to a sign-in or sign-out.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SubmitResponse {
    #[serde(deserialize_with = "lenient_string")]
    pub state: String,
    pub info: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed {record} record {lesson_key:?}: field `{field}` has unusable value {value:?}")]
pub struct MalformedRecordError {
    pub record: &'static str,
    pub lesson_key: String,
    pub field: &'static str,
    pub value: String,
}

pub fn normalize_course(raw: &RawCourse) -> Result<CourseRecord, MalformedRecordError> {
    let bad = |field: &'static str, value: &str| MalformedRecordError {
        record: "course",
        lesson_key: raw.pk_anlaxy_lesson.clone(),
        field,
        value: value.to_string(),
    };

    let date = parse_date(&raw.lesson_date).ok_or_else(|| bad("lesson_date", &raw.lesson_date))?;
    let scheduled_start =
        parse_moment(date, &raw.begin_time).ok_or_else(|| bad("begin_time", &raw.begin_time))?;
    let scheduled_end =
        parse_moment(date, &raw.end_time).ok_or_else(|| bad("end_time", &raw.end_time))?;

    Ok(CourseRecord {
        lesson_key: raw.pk_anlaxy_lesson.clone(),
        lesson_name: raw.lesson_name.clone(),
        teacher_name: raw.teacher_name.clone(),
        teacher_id: raw.teacher_id.clone(),
        class_room_name: raw.class_room_name.clone(),
        date,
        scheduled_start,
        scheduled_end,
    })
}

pub fn normalize_sign_record(raw: &RawSignRecord) -> Result<SignRecord, MalformedRecordError> {
    let bad = |field: &'static str, value: &str| MalformedRecordError {
        record: "sign",
        lesson_key: raw.pk_lesson.clone(),
        field,
        value: value.to_string(),
    };

    let date = parse_date(&raw.lesson_date).ok_or_else(|| bad("lesson_date", &raw.lesson_date))?;
    let boundary = |field: &'static str, value: &str| {
        parse_moment(date, value).ok_or_else(|| bad(field, value))
    };
    let actual = |field: &'static str, value: &str| {
        if value.trim().is_empty() {
            Ok(None)
        } else {
            parse_moment(date, value).map(Some).ok_or_else(|| bad(field, value))
        }
    };
    let flag = |field: &'static str, value: &str| parse_flag(value).ok_or_else(|| bad(field, value));
    let minutes =
        |field: &'static str, value: &str| parse_minutes(value).ok_or_else(|| bad(field, value));

    Ok(SignRecord {
        lesson_key: raw.pk_lesson.clone(),
        session_user_key: raw.pk_anlaxy_syllabus_user.clone(),
        window_before_open: boundary("before_class_time", &raw.before_class_time)?,
        scheduled_start: boundary("begin_time", &raw.begin_time)?,
        window_after_open: boundary("after_class_time", &raw.after_class_time)?,
        window_before_close: boundary("before_class_over_time", &raw.before_class_over_time)?,
        scheduled_end: boundary("end_time", &raw.end_time)?,
        window_after_close: boundary("after_class_over_time", &raw.after_class_over_time)?,
        actual_sign_in: actual("u_begin_time", &raw.u_begin_time)?,
        actual_sign_out: actual("u_end_time", &raw.u_end_time)?,
        is_absent: flag("absent_num", &raw.absent_num)?,
        is_late: flag("late_num", &raw.late_num)?,
        is_early_leave: flag("leave_num", &raw.leave_num)?,
        is_on_leave: flag("ask_leave_num", &raw.ask_leave_num)?,
        late_minutes: minutes("late_time_length", &raw.late_time_length)?,
        early_leave_minutes: minutes("leave_ago_time_length", &raw.leave_ago_time_length)?,
    })
}

const DATETIME_FORMATS: [&str; 6] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y/%m/%d %H:%M:%S",
    "%Y/%m/%d %H:%M",
];

const TIME_FORMATS: [&str; 2] = ["%H:%M:%S", "%H:%M"];

pub fn parse_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d").ok()
}

/// Parses either a full datetime or a time of day; the latter is placed on
/// `date`.
pub fn parse_moment(date: NaiveDate, value: &str) -> Option<NaiveDateTime> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    DATETIME_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .or_else(|| {
            TIME_FORMATS
                .iter()
                .find_map(|format| NaiveTime::parse_from_str(value, format).ok())
                .map(|time| date.and_time(time))
        })
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim() {
        "1" => Some(true),
        "0" | "" => Some(false),
        _ => None,
    }
}

fn parse_minutes(value: &str) -> Option<i64> {
    let value = value.trim();
    if value.is_empty() {
        return Some(0);
    }
    if let Ok(minutes) = value.parse::<i64>() {
        return Some(minutes);
    }
    // `as` saturates, so NaN, infinities and huge values must be caught first.
    let minutes = value.parse::<f64>().ok()?.round();
    let in_range = minutes.is_finite() && minutes >= i64::MIN as f64 && minutes < i64::MAX as f64;
    in_range.then_some(minutes as i64)
}

fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s,
        serde_json::Value::Bool(b) => (if b { "1" } else { "0" }).to_string(),
        other => other.to_string(),
    })
}

fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}
