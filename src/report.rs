use std::fmt::Write;

use chrono::{NaiveDate, NaiveDateTime};
use serde::Serialize;

use crate::models::{AttendanceStatus, ClassAttendanceEntry, Situation, SituationCount};
use crate::reconcile::priority;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SituationSummary {
    pub situation: Situation,
    pub count: usize,
}

pub fn summarize_by_situation(entries: &[ClassAttendanceEntry]) -> Vec<SituationSummary> {
    let mut map: std::collections::BTreeMap<Situation, usize> = std::collections::BTreeMap::new();

    for entry in entries {
        *map.entry(entry.situation).or_insert(0) += 1;
    }

    let mut summaries: Vec<SituationSummary> = map
        .into_iter()
        .map(|(situation, count)| SituationSummary { situation, count })
        .collect();

    summaries.sort_by(|a, b| b.count.cmp(&a.count));
    summaries
}

pub fn situation_label(situation: Situation) -> &'static str {
    match situation {
        Situation::None => "normal",
        Situation::Late => "late",
        Situation::EarlyLeave => "left early",
        Situation::Absent => "absent",
        Situation::OnLeave => "on leave",
    }
}

pub fn status_label(entry: &ClassAttendanceEntry) -> &'static str {
    match entry.status {
        Some(status) => match status {
            AttendanceStatus::NotSignedIn => "not signed in",
            AttendanceStatus::SignedIn => "signed in",
            AttendanceStatus::SignedOut => "signed out",
            AttendanceStatus::Late => "late",
            AttendanceStatus::EarlyLeave => "left early",
        },
        None => situation_label(entry.situation),
    }
}

fn clock(moment: Option<NaiveDateTime>) -> String {
    moment
        .map(|m| m.format("%H:%M").to_string())
        .unwrap_or_else(|| "--:--".to_string())
}

fn minutes_note(entry: &ClassAttendanceEntry) -> String {
    let mut notes = Vec::new();
    if entry.late_minutes > 0 {
        notes.push(format!("{} min late", entry.late_minutes));
    }
    if entry.early_leave_minutes > 0 {
        notes.push(format!("{} min early", entry.early_leave_minutes));
    }
    if notes.is_empty() {
        String::new()
    } else {
        format!(" ({})", notes.join(", "))
    }
}

/// One line per class, as printed by `show` and used in the report.
pub fn entry_line(entry: &ClassAttendanceEntry) -> String {
    format!(
        "#{} {} ({}-{}, {}, {}) in {} out {}: {}{}",
        entry.order_index,
        entry.lesson_name,
        entry.scheduled_start.format("%H:%M"),
        entry.scheduled_end.format("%H:%M"),
        entry.class_room_name,
        entry.teacher_name,
        clock(entry.sign_in),
        clock(entry.sign_out),
        status_label(entry),
        minutes_note(entry)
    )
}

pub fn build_day_report(
    date: NaiveDate,
    now: NaiveDateTime,
    entries: &[ClassAttendanceEntry],
) -> String {
    let summaries = summarize_by_situation(entries);

    let mut output = String::new();

    let _ = writeln!(output, "# Attendance Report");
    let _ = writeln!(
        output,
        "Generated for {} (as of {})",
        date,
        now.format("%Y-%m-%d %H:%M")
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Situation Mix");

    if summaries.is_empty() {
        let _ = writeln!(output, "No classes recorded for this day.");
    } else {
        for summary in summaries.iter() {
            let _ = writeln!(
                output,
                "- {}: {} classes",
                situation_label(summary.situation),
                summary.count
            );
        }
    }

    let open: Vec<&ClassAttendanceEntry> = entries.iter().filter(|e| priority(e) == 1).collect();
    let _ = writeln!(output);
    let _ = writeln!(output, "## Needs Attention");

    if open.is_empty() {
        let _ = writeln!(output, "Nothing left to do today.");
    } else {
        for entry in open {
            let _ = writeln!(output, "- {}", entry_line(entry));
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Schedule");

    if entries.is_empty() {
        let _ = writeln!(output, "No classes recorded for this day.");
    } else {
        for entry in entries {
            let _ = writeln!(output, "- {}", entry_line(entry));
        }
    }

    output
}

/// Markdown summary of archived situation counts over a window.
pub fn build_summary(since: NaiveDate, until: NaiveDate, counts: &[SituationCount]) -> String {
    let mut output = String::new();
    let _ = writeln!(output, "# Attendance Summary");
    let _ = writeln!(output, "Archived classes from {} to {}", since, until);
    let _ = writeln!(output);

    if counts.is_empty() {
        let _ = writeln!(output, "No late, early-leave, absent or on-leave classes in this window.");
        return output;
    }

    for count in counts {
        let _ = writeln!(
            output,
            "- {}: {} x{}",
            count.lesson_name,
            situation_label(count.situation),
            count.count
        );
    }
    output
}

#[derive(Serialize)]
struct CsvRow<'a> {
    order_index: usize,
    lesson_date: NaiveDate,
    lesson_name: &'a str,
    teacher_name: &'a str,
    class_room_name: &'a str,
    scheduled_start: String,
    scheduled_end: String,
    sign_in: Option<String>,
    sign_out: Option<String>,
    status: &'static str,
    situation: &'static str,
    reported_late: bool,
    reported_early_leave: bool,
    late_minutes: i64,
    early_leave_minutes: i64,
}

pub fn write_csv<W: std::io::Write>(
    entries: &[ClassAttendanceEntry],
    writer: W,
) -> Result<(), csv::Error> {
    let fmt = |m: NaiveDateTime| m.format("%Y-%m-%d %H:%M:%S").to_string();
    let mut csv_writer = csv::Writer::from_writer(writer);

    for entry in entries {
        csv_writer.serialize(CsvRow {
            order_index: entry.order_index,
            lesson_date: entry.lesson_date,
            lesson_name: &entry.lesson_name,
            teacher_name: &entry.teacher_name,
            class_room_name: &entry.class_room_name,
            scheduled_start: fmt(entry.scheduled_start),
            scheduled_end: fmt(entry.scheduled_end),
            sign_in: entry.sign_in.map(fmt),
            sign_out: entry.sign_out.map(fmt),
            status: entry.status.map(|s| s.as_str()).unwrap_or(""),
            situation: entry.situation.as_str(),
            reported_late: entry.reported_late,
            reported_early_leave: entry.reported_early_leave,
            late_minutes: entry.late_minutes,
            early_leave_minutes: entry.early_leave_minutes,
        })?;
    }

    csv_writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, 6).unwrap()
    }

    fn at(hour: u32, minute: u32) -> NaiveDateTime {
        day().and_hms_opt(hour, minute, 0).unwrap()
    }

    fn entry(
        order_index: usize,
        name: &str,
        sign_in: Option<NaiveDateTime>,
        sign_out: Option<NaiveDateTime>,
        status: Option<AttendanceStatus>,
        situation: Situation,
    ) -> ClassAttendanceEntry {
        ClassAttendanceEntry {
            order_index,
            lesson_key: format!("L{order_index}"),
            lesson_name: name.to_string(),
            teacher_name: "Li Wei".to_string(),
            teacher_id: "20410".to_string(),
            class_room_name: "B-204".to_string(),
            lesson_date: day(),
            scheduled_start: at(8, 0),
            scheduled_end: at(9, 40),
            should_sign_in_from: at(7, 50),
            sign_in_closes_at: at(8, 10),
            sign_out_opens_at: at(9, 30),
            should_sign_out_by: at(9, 50),
            sign_in,
            sign_out,
            status,
            situation,
            reported_late: false,
            reported_early_leave: false,
            late_minutes: 0,
            early_leave_minutes: 0,
            session_user_key: format!("su-{order_index}"),
        }
    }

    fn sample() -> Vec<ClassAttendanceEntry> {
        vec![
            entry(2, "Physics", None, None, Some(AttendanceStatus::Late), Situation::Late),
            entry(
                1,
                "Calculus",
                Some(at(7, 55)),
                Some(at(9, 45)),
                Some(AttendanceStatus::SignedOut),
                Situation::None,
            ),
            entry(3, "History", None, None, None, Situation::OnLeave),
        ]
    }

    #[test]
    fn summaries_count_each_situation() {
        let mut entries = sample();
        entries.push(entry(4, "Art", None, None, Some(AttendanceStatus::Late), Situation::Late));
        let summaries = summarize_by_situation(&entries);
        assert_eq!(
            summaries[0],
            SituationSummary {
                situation: Situation::Late,
                count: 2
            }
        );
        assert_eq!(summaries.len(), 3);
    }

    #[test]
    fn report_lists_open_classes_under_needs_attention() {
        let report = build_day_report(day(), at(8, 30), &sample());
        assert!(report.contains("Generated for 2025-03-06 (as of 2025-03-06 08:30)"));
        assert!(report.contains("- late: 1 classes"));

        let attention = report.split("## Needs Attention").nth(1).unwrap();
        let attention = attention.split("## Schedule").next().unwrap();
        assert!(attention.contains("Physics"));
        assert!(!attention.contains("Calculus"));
        assert!(!attention.contains("History"));

        assert!(report.contains("#3 History (08:00-09:40, B-204, Li Wei) in --:-- out --:--: on leave"));
    }

    #[test]
    fn entry_line_mentions_reported_minutes() {
        let mut late = entry(5, "Chemistry", Some(at(8, 12)), None, Some(AttendanceStatus::Late), Situation::Late);
        late.late_minutes = 12;
        assert_eq!(
            entry_line(&late),
            "#5 Chemistry (08:00-09:40, B-204, Li Wei) in 08:12 out --:--: late (12 min late)"
        );
    }

    #[test]
    fn empty_day_report() {
        let report = build_day_report(day(), at(8, 30), &[]);
        assert!(report.contains("No classes recorded for this day."));
        assert!(report.contains("Nothing left to do today."));
    }

    #[test]
    fn summary_lists_counts() {
        let counts = vec![SituationCount {
            lesson_name: "Physics".to_string(),
            situation: Situation::Absent,
            count: 2,
        }];
        let summary = build_summary(day(), day(), &counts);
        assert!(summary.contains("- Physics: absent x2"));
        assert!(build_summary(day(), day(), &[]).contains("No late"));
    }

    #[test]
    fn csv_has_header_and_blank_status_for_special_rows() {
        let mut buffer = Vec::new();
        write_csv(&sample(), &mut buffer).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next().unwrap(),
            "order_index,lesson_date,lesson_name,teacher_name,class_room_name,scheduled_start,\
             scheduled_end,sign_in,sign_out,status,situation,reported_late,reported_early_leave,\
             late_minutes,early_leave_minutes"
        );
        assert_eq!(
            lines.next().unwrap(),
            "2,2025-03-06,Physics,Li Wei,B-204,2025-03-06 08:00:00,2025-03-06 09:40:00,,,late,late,\
             false,false,0,0"
        );
        let last = lines.last().unwrap();
        assert!(last.ends_with(",,on_leave,false,false,0,0"));
    }
}
