//! Reconciles a day's schedule against its sign records.

use std::collections::HashMap;

use chrono::{NaiveDate, NaiveDateTime};
use tracing::debug;

use crate::models::{AttendanceStatus, ClassAttendanceEntry, CourseRecord, Situation, SignRecord};
use crate::source::{AttendanceSource, FetchError};
use crate::upstream::{normalize_course, normalize_sign_record, MalformedRecordError};

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Malformed(#[from] MalformedRecordError),
}

/// Fetches the day's courses and sign records and reconciles them against
/// `now`.
///
/// A blank `session_key` means nobody is logged in: the result is empty and
/// the source is never called.
pub async fn reconcile(
    source: &dyn AttendanceSource,
    date: NaiveDate,
    session_key: &str,
    now: NaiveDateTime,
) -> Result<Vec<ClassAttendanceEntry>, ReconcileError> {
    if session_key.trim().is_empty() {
        debug!("no session key, skipping reconciliation");
        return Ok(Vec::new());
    }

    let (raw_courses, raw_signs) = tokio::try_join!(
        source.fetch_day_course_list(date, session_key),
        source.fetch_day_sign_list(date, session_key),
    )?;

    let courses = raw_courses
        .iter()
        .map(normalize_course)
        .collect::<Result<Vec<_>, _>>()?;
    let signs = raw_signs
        .iter()
        .map(normalize_sign_record)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(reconcile_records(&courses, &signs, now))
}

/// Joins courses to sign records by lesson key, derives status and
/// situation for each pair, then orders the rows by priority.
///
/// Courses without a sign record are dropped.
pub fn reconcile_records(
    courses: &[CourseRecord],
    signs: &[SignRecord],
    now: NaiveDateTime,
) -> Vec<ClassAttendanceEntry> {
    let by_lesson: HashMap<&str, &SignRecord> = signs
        .iter()
        .map(|sign| (sign.lesson_key.as_str(), sign))
        .collect();

    let mut entries: Vec<ClassAttendanceEntry> = courses
        .iter()
        .enumerate()
        .filter_map(|(index, course)| {
            let Some(sign) = by_lesson.get(course.lesson_key.as_str()) else {
                debug!(lesson_key = %course.lesson_key, "no sign record for course, dropping");
                return None;
            };
            Some(build_entry(index + 1, course, sign, now))
        })
        .collect();

    debug!(
        courses = courses.len(),
        signs = signs.len(),
        entries = entries.len(),
        "reconciled day"
    );

    // sort_by_key is stable, so schedule order holds within a bucket.
    entries.sort_by_key(priority);
    entries
}

fn build_entry(
    order_index: usize,
    course: &CourseRecord,
    sign: &SignRecord,
    now: NaiveDateTime,
) -> ClassAttendanceEntry {
    if sign.scheduled_start != course.scheduled_start || sign.scheduled_end != course.scheduled_end {
        debug!(
            lesson_key = %course.lesson_key,
            course_start = %course.scheduled_start,
            sign_start = %sign.scheduled_start,
            "sign record schedule differs from course, using course times"
        );
    }

    let status = derive_status(course, sign, now);
    let situation = derive_situation(sign, status);

    ClassAttendanceEntry {
        order_index,
        lesson_key: course.lesson_key.clone(),
        lesson_name: course.lesson_name.clone(),
        teacher_name: course.teacher_name.clone(),
        teacher_id: course.teacher_id.clone(),
        class_room_name: course.class_room_name.clone(),
        lesson_date: course.date,
        scheduled_start: course.scheduled_start,
        scheduled_end: course.scheduled_end,
        should_sign_in_from: sign.window_before_open,
        sign_in_closes_at: sign.window_after_open,
        sign_out_opens_at: sign.window_before_close,
        should_sign_out_by: sign.window_after_close,
        sign_in: sign.actual_sign_in,
        sign_out: sign.actual_sign_out,
        status,
        situation,
        reported_late: sign.is_late,
        reported_early_leave: sign.is_early_leave,
        late_minutes: sign.late_minutes,
        early_leave_minutes: sign.early_leave_minutes,
        session_user_key: sign.session_user_key.clone(),
    }
}

/// Status of one class; `None` for absent or on-leave records.
///
/// Rules are checked in order and the first match wins. A late arrival who
/// also leaves early is `EarlyLeave`.
pub fn derive_status(
    course: &CourseRecord,
    sign: &SignRecord,
    now: NaiveDateTime,
) -> Option<AttendanceStatus> {
    if sign.is_absent || sign.is_on_leave {
        return None;
    }

    let start = course.scheduled_start;
    let end = course.scheduled_end;
    let left_early = sign.actual_sign_out.is_some_and(|out| out < end);

    let status = match (sign.actual_sign_in, sign.actual_sign_out) {
        (Some(sign_in), sign_out) if sign_in > start => match sign_out {
            Some(_) if left_early => AttendanceStatus::EarlyLeave,
            Some(_) => AttendanceStatus::SignedOut,
            None => AttendanceStatus::Late,
        },
        (_, Some(_)) if left_early => AttendanceStatus::EarlyLeave,
        (_, Some(_)) => AttendanceStatus::SignedOut,
        (Some(_), None) => AttendanceStatus::SignedIn,
        (None, None) if now > start => AttendanceStatus::Late,
        (None, None) => AttendanceStatus::NotSignedIn,
    };
    Some(status)
}

pub fn derive_situation(sign: &SignRecord, status: Option<AttendanceStatus>) -> Situation {
    if sign.is_absent {
        return Situation::Absent;
    }
    if sign.is_on_leave {
        return Situation::OnLeave;
    }
    match status {
        Some(AttendanceStatus::Late) => Situation::Late,
        Some(AttendanceStatus::EarlyLeave) => Situation::EarlyLeave,
        _ => Situation::None,
    }
}

/// 1 = still needs something, 2 = signed in and out, 3 = absent or on leave.
pub fn priority(entry: &ClassAttendanceEntry) -> u8 {
    match entry.situation {
        Situation::Absent | Situation::OnLeave => 3,
        _ if entry.sign_in.is_some() && entry.sign_out.is_some() => 2,
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use proptest::prelude::*;

    use super::*;
    use crate::upstream::tests::{raw_course, raw_sign};
    use crate::upstream::{RawCourse, RawSignRecord};

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, 6).unwrap()
    }

    fn at(hour: u32, minute: u32) -> NaiveDateTime {
        day().and_hms_opt(hour, minute, 0).unwrap()
    }

    fn course(key: &str) -> CourseRecord {
        CourseRecord {
            lesson_key: key.to_string(),
            lesson_name: format!("Lesson {key}"),
            teacher_name: "Li Wei".to_string(),
            teacher_id: "20410".to_string(),
            class_room_name: "B-204".to_string(),
            date: day(),
            scheduled_start: at(8, 0),
            scheduled_end: at(9, 40),
        }
    }

    fn sign(key: &str) -> SignRecord {
        SignRecord {
            lesson_key: key.to_string(),
            session_user_key: format!("su-{key}"),
            window_before_open: at(7, 50),
            scheduled_start: at(8, 0),
            window_after_open: at(8, 10),
            window_before_close: at(9, 30),
            scheduled_end: at(9, 40),
            window_after_close: at(9, 50),
            actual_sign_in: None,
            actual_sign_out: None,
            is_absent: false,
            is_late: false,
            is_early_leave: false,
            is_on_leave: false,
            late_minutes: 0,
            early_leave_minutes: 0,
        }
    }

    fn signed(key: &str, sign_in: Option<NaiveDateTime>, sign_out: Option<NaiveDateTime>) -> SignRecord {
        SignRecord {
            actual_sign_in: sign_in,
            actual_sign_out: sign_out,
            ..sign(key)
        }
    }

    fn only(entries: Vec<ClassAttendanceEntry>) -> ClassAttendanceEntry {
        assert_eq!(entries.len(), 1);
        entries.into_iter().next().unwrap()
    }

    #[test]
    fn late_sign_in_without_sign_out_is_late() {
        let entry = only(reconcile_records(
            &[course("L1")],
            &[signed("L1", Some(at(8, 10)), None)],
            at(8, 30),
        ));
        assert_eq!(entry.status, Some(AttendanceStatus::Late));
        assert_eq!(entry.situation, Situation::Late);
    }

    #[test]
    fn early_sign_out_is_early_leave() {
        let entry = only(reconcile_records(
            &[course("L1")],
            &[signed("L1", Some(at(7, 58)), Some(at(9, 30)))],
            at(10, 0),
        ));
        assert_eq!(entry.status, Some(AttendanceStatus::EarlyLeave));
        assert_eq!(entry.situation, Situation::EarlyLeave);
    }

    #[test]
    fn on_time_in_and_out_is_signed_out() {
        let entry = only(reconcile_records(
            &[course("L1")],
            &[signed("L1", Some(at(7, 58)), Some(at(9, 45)))],
            at(10, 0),
        ));
        assert_eq!(entry.status, Some(AttendanceStatus::SignedOut));
        assert_eq!(entry.situation, Situation::None);
    }

    #[test]
    fn absent_has_no_status_whatever_the_time() {
        let record = SignRecord {
            is_absent: true,
            ..sign("L1")
        };
        for now in [at(7, 0), at(8, 30), at(12, 0)] {
            let entry = only(reconcile_records(&[course("L1")], &[record.clone()], now));
            assert_eq!(entry.status, None);
            assert_eq!(entry.situation, Situation::Absent);
        }
    }

    #[test]
    fn absent_wins_over_on_leave_and_times() {
        let record = SignRecord {
            is_absent: true,
            is_on_leave: true,
            actual_sign_in: Some(at(8, 20)),
            ..sign("L1")
        };
        let entry = only(reconcile_records(&[course("L1")], &[record], at(9, 0)));
        assert_eq!(entry.status, None);
        assert_eq!(entry.situation, Situation::Absent);
    }

    #[test]
    fn on_leave_has_no_status() {
        let record = SignRecord {
            is_on_leave: true,
            ..sign("L1")
        };
        let entry = only(reconcile_records(&[course("L1")], &[record], at(9, 0)));
        assert_eq!(entry.status, None);
        assert_eq!(entry.situation, Situation::OnLeave);
    }

    #[test]
    fn course_without_sign_record_is_dropped() {
        let entries = reconcile_records(
            &[course("L1"), course("L2"), course("L3")],
            &[sign("L1"), sign("L3")],
            at(7, 0),
        );
        let names: Vec<&str> = entries.iter().map(|e| e.lesson_name.as_str()).collect();
        assert_eq!(names, ["Lesson L1", "Lesson L3"]);
        assert_eq!(entries[1].order_index, 3);
    }

    #[test]
    fn late_in_and_early_out_is_early_leave() {
        let status = derive_status(
            &course("L1"),
            &signed("L1", Some(at(8, 5)), Some(at(9, 0))),
            at(10, 0),
        );
        assert_eq!(status, Some(AttendanceStatus::EarlyLeave));
    }

    #[test]
    fn late_in_and_on_time_out_is_signed_out() {
        let status = derive_status(
            &course("L1"),
            &signed("L1", Some(at(8, 5)), Some(at(9, 40))),
            at(10, 0),
        );
        assert_eq!(status, Some(AttendanceStatus::SignedOut));
    }

    #[test]
    fn sign_out_without_sign_in() {
        let early = derive_status(&course("L1"), &signed("L1", None, Some(at(9, 0))), at(10, 0));
        assert_eq!(early, Some(AttendanceStatus::EarlyLeave));
        let on_time = derive_status(&course("L1"), &signed("L1", None, Some(at(9, 41))), at(10, 0));
        assert_eq!(on_time, Some(AttendanceStatus::SignedOut));
    }

    #[test]
    fn sign_in_exactly_at_start_is_signed_in() {
        let status = derive_status(&course("L1"), &signed("L1", Some(at(8, 0)), None), at(8, 30));
        assert_eq!(status, Some(AttendanceStatus::SignedIn));
    }

    #[test]
    fn not_signed_in_until_class_starts() {
        let record = sign("L1");
        assert_eq!(
            derive_status(&course("L1"), &record, at(7, 30)),
            Some(AttendanceStatus::NotSignedIn)
        );
        assert_eq!(
            derive_status(&course("L1"), &record, at(8, 0)),
            Some(AttendanceStatus::NotSignedIn)
        );
        assert_eq!(
            derive_status(&course("L1"), &record, at(8, 1)),
            Some(AttendanceStatus::Late)
        );
    }

    #[test]
    fn upstream_flags_do_not_override_derived_late() {
        let record = SignRecord {
            is_late: true,
            late_minutes: 5,
            ..signed("L1", Some(at(7, 55)), None)
        };
        let entry = only(reconcile_records(&[course("L1")], &[record], at(8, 30)));
        assert_eq!(entry.status, Some(AttendanceStatus::SignedIn));
        assert_eq!(entry.situation, Situation::None);
        assert!(entry.reported_late);
        assert_eq!(entry.late_minutes, 5);
    }

    #[test]
    fn duplicate_lesson_keys_use_last_sign_record() {
        let first = signed("L1", Some(at(7, 55)), None);
        let second = SignRecord {
            session_user_key: "su-second".to_string(),
            ..signed("L1", Some(at(8, 15)), None)
        };
        let entry = only(reconcile_records(&[course("L1")], &[first, second], at(8, 30)));
        assert_eq!(entry.session_user_key, "su-second");
        assert_eq!(entry.status, Some(AttendanceStatus::Late));
    }

    #[test]
    fn entries_carry_course_and_window_fields() {
        let entry = only(reconcile_records(&[course("L1")], &[sign("L1")], at(7, 0)));
        assert_eq!(entry.order_index, 1);
        assert_eq!(entry.teacher_name, "Li Wei");
        assert_eq!(entry.class_room_name, "B-204");
        assert_eq!(entry.should_sign_in_from, at(7, 50));
        assert_eq!(entry.sign_in_closes_at, at(8, 10));
        assert_eq!(entry.sign_out_opens_at, at(9, 30));
        assert_eq!(entry.should_sign_out_by, at(9, 50));
        assert_eq!(entry.session_user_key, "su-L1");
    }

    #[test]
    fn ordering_puts_open_first_then_done_then_special() {
        let courses: Vec<CourseRecord> = ["A", "B", "C", "D", "E", "F"].iter().map(|k| course(k)).collect();
        let signs = vec![
            SignRecord { is_on_leave: true, ..sign("A") },
            signed("B", Some(at(7, 55)), Some(at(9, 45))),
            sign("C"),
            SignRecord { is_absent: true, ..sign("D") },
            signed("E", Some(at(7, 58)), None),
            signed("F", Some(at(7, 59)), Some(at(9, 41))),
        ];
        let entries = reconcile_records(&courses, &signs, at(8, 30));
        let order: Vec<usize> = entries.iter().map(|e| e.order_index).collect();
        assert_eq!(order, [3, 5, 2, 6, 1, 4]);
    }

    #[test]
    fn reconcile_records_is_deterministic() {
        let courses = vec![course("L1"), course("L2")];
        let signs = vec![signed("L1", Some(at(8, 3)), None), sign("L2")];
        let first = reconcile_records(&courses, &signs, at(8, 30));
        let second = reconcile_records(&courses, &signs, at(8, 30));
        assert_eq!(first, second);
    }

    struct StubSource {
        courses: Vec<RawCourse>,
        signs: Vec<RawSignRecord>,
        fail_courses: bool,
        fail_signs: bool,
        calls: AtomicUsize,
    }

    impl StubSource {
        fn new(courses: Vec<RawCourse>, signs: Vec<RawSignRecord>) -> Self {
            Self {
                courses,
                signs,
                fail_courses: false,
                fail_signs: false,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl AttendanceSource for StubSource {
        async fn fetch_day_course_list(
            &self,
            _date: NaiveDate,
            _session_key: &str,
        ) -> Result<Vec<RawCourse>, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_courses {
                return Err(FetchError::Status {
                    comm: "RollCall_SourceListDay",
                    status: reqwest::StatusCode::BAD_GATEWAY,
                });
            }
            Ok(self.courses.clone())
        }

        async fn fetch_day_sign_list(
            &self,
            _date: NaiveDate,
            _session_key: &str,
        ) -> Result<Vec<RawSignRecord>, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_signs {
                return Err(FetchError::Rejected {
                    comm: "RollCall_SourceSignList",
                    state: "0".to_string(),
                    info: "userKey expired".to_string(),
                });
            }
            Ok(self.signs.clone())
        }
    }

    #[tokio::test]
    async fn blank_session_key_returns_empty_without_fetching() {
        let source = StubSource::new(vec![raw_course("L1", "08:00", "09:40")], vec![raw_sign("L1", "", "")]);
        for key in ["", "   "] {
            let entries = reconcile(&source, day(), key, at(9, 0)).await.unwrap();
            assert!(entries.is_empty());
        }
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn reconcile_fetches_both_lists_and_joins() {
        let source = StubSource::new(
            vec![
                raw_course("L1", "08:00", "09:40"),
                raw_course("L2", "10:00", "11:40"),
            ],
            vec![raw_sign("L1", "2025-03-06 08:10:00", "")],
        );
        let entries = reconcile(&source, day(), "token", at(8, 30)).await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        let entry = only(entries);
        assert_eq!(entry.lesson_name, "Lesson L1");
        assert_eq!(entry.status, Some(AttendanceStatus::Late));
        assert_eq!(entry.sign_in, Some(at(8, 10)));
    }

    #[tokio::test]
    async fn fetch_failure_propagates() {
        let mut source = StubSource::new(vec![raw_course("L1", "08:00", "09:40")], Vec::new());
        source.fail_signs = true;
        let err = reconcile(&source, day(), "token", at(8, 30)).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Fetch(FetchError::Rejected { .. })));
    }

    #[tokio::test]
    async fn course_list_failure_propagates() {
        let mut source = StubSource::new(Vec::new(), vec![raw_sign("L1", "", "")]);
        source.fail_courses = true;
        let err = reconcile(&source, day(), "token", at(8, 30)).await.unwrap_err();
        assert!(matches!(
            err,
            ReconcileError::Fetch(FetchError::Status { comm: "RollCall_SourceListDay", .. })
        ));
    }

    #[tokio::test]
    async fn malformed_record_fails_the_whole_day() {
        let source = StubSource::new(
            vec![
                raw_course("L1", "08:00", "09:40"),
                raw_course("L2", "10:00", "11:40"),
            ],
            vec![raw_sign("L1", "", ""), raw_sign("L2", "ten past", "")],
        );
        let err = reconcile(&source, day(), "token", at(8, 30)).await.unwrap_err();
        match err {
            ReconcileError::Malformed(bad) => {
                assert_eq!(bad.lesson_key, "L2");
                assert_eq!(bad.field, "u_begin_time");
            }
            other => panic!("expected Malformed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn demo_fixture_day_reconciles() {
        let dir = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("demos/fixtures");
        let source = crate::source::FixtureSource::new(dir);
        let entries = reconcile(&source, day(), "demo", at(10, 30)).await.unwrap();

        let rows: Vec<(usize, Option<AttendanceStatus>, Situation)> = entries
            .iter()
            .map(|e| (e.order_index, e.status, e.situation))
            .collect();
        assert_eq!(
            rows,
            [
                (2, Some(AttendanceStatus::Late), Situation::Late),
                (1, Some(AttendanceStatus::SignedOut), Situation::None),
                (3, None, Situation::OnLeave),
            ]
        );
        assert_eq!(entries[0].late_minutes, 7);
    }

    fn arb_time() -> impl Strategy<Value = Option<NaiveDateTime>> {
        prop::option::of((7u32..11, 0u32..60).prop_map(|(h, m)| at(h, m)))
    }

    fn arb_sign(key: String) -> impl Strategy<Value = SignRecord> {
        (arb_time(), arb_time(), any::<bool>(), any::<bool>()).prop_map(
            move |(sign_in, sign_out, is_absent, is_on_leave)| SignRecord {
                is_absent,
                is_on_leave,
                ..signed(&key, sign_in, sign_out)
            },
        )
    }

    fn arb_day() -> impl Strategy<Value = (Vec<CourseRecord>, Vec<SignRecord>, NaiveDateTime)> {
        (1usize..8)
            .prop_flat_map(|n| {
                let courses: Vec<CourseRecord> = (0..n).map(|i| course(&format!("L{i}"))).collect();
                let signs = (0..n)
                    .map(|i| prop::option::of(arb_sign(format!("L{i}"))))
                    .collect::<Vec<_>>();
                (Just(courses), signs, (6u32..12, 0u32..60))
            })
            .prop_map(|(courses, signs, (h, m))| {
                (courses, signs.into_iter().flatten().collect(), at(h, m))
            })
    }

    proptest! {
        #[test]
        fn only_courses_with_sign_records_appear((courses, signs, now) in arb_day()) {
            let entries = reconcile_records(&courses, &signs, now);
            prop_assert_eq!(entries.len(), signs.len());
            for entry in &entries {
                let key = &courses[entry.order_index - 1].lesson_key;
                prop_assert!(signs.iter().any(|s| &s.lesson_key == key));
            }
        }

        #[test]
        fn absent_records_are_always_absent((courses, signs, now) in arb_day()) {
            let entries = reconcile_records(&courses, &signs, now);
            for entry in &entries {
                let key = &courses[entry.order_index - 1].lesson_key;
                let record = signs.iter().find(|s| &s.lesson_key == key).unwrap();
                if record.is_absent {
                    prop_assert_eq!(entry.situation, Situation::Absent);
                    prop_assert_eq!(entry.status, None);
                }
            }
        }

        #[test]
        fn unsigned_status_depends_only_on_now(now_minute in 0u32..240) {
            let now = at(6, 0) + chrono::Duration::minutes(i64::from(now_minute));
            let status = derive_status(&course("L1"), &sign("L1"), now);
            if now > at(8, 0) {
                prop_assert_eq!(status, Some(AttendanceStatus::Late));
            } else {
                prop_assert_eq!(status, Some(AttendanceStatus::NotSignedIn));
            }
        }

        #[test]
        fn priorities_never_decrease((courses, signs, now) in arb_day()) {
            let entries = reconcile_records(&courses, &signs, now);
            let priorities: Vec<u8> = entries.iter().map(priority).collect();
            prop_assert!(priorities.windows(2).all(|w| w[0] <= w[1]));
            for bucket in 1..=3u8 {
                let indexes: Vec<usize> = entries
                    .iter()
                    .filter(|e| priority(e) == bucket)
                    .map(|e| e.order_index)
                    .collect();
                prop_assert!(indexes.windows(2).all(|w| w[0] < w[1]));
            }
        }

        #[test]
        fn same_inputs_same_output((courses, signs, now) in arb_day()) {
            prop_assert_eq!(
                reconcile_records(&courses, &signs, now),
                reconcile_records(&courses, &signs, now)
            );
        }
    }
}
