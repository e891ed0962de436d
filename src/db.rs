use anyhow::Context;
use chrono::NaiveDate;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::models::{ArchivedEntry, AttendanceStatus, ClassAttendanceEntry, Situation, SituationCount};

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub async fn archive_entries(pool: &PgPool, entries: &[ClassAttendanceEntry]) -> anyhow::Result<usize> {
    let mut written = 0usize;
    let mut tx = pool.begin().await?;

    for entry in entries {
        let order_index = i32::try_from(entry.order_index).context("order index out of range")?;
        let result = sqlx::query(
            r#"
            INSERT INTO rollcall_archive.attendance_entries
            (id, session_user_key, lesson_date, order_index, lesson_name, teacher_name,
             class_room_name, scheduled_start, scheduled_end, sign_in, sign_out, status, situation)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (session_user_key) DO UPDATE
            SET sign_in = EXCLUDED.sign_in,
                sign_out = EXCLUDED.sign_out,
                status = EXCLUDED.status,
                situation = EXCLUDED.situation,
                order_index = EXCLUDED.order_index,
                archived_at = now()
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&entry.session_user_key)
        .bind(entry.lesson_date)
        .bind(order_index)
        .bind(&entry.lesson_name)
        .bind(&entry.teacher_name)
        .bind(&entry.class_room_name)
        .bind(entry.scheduled_start)
        .bind(entry.scheduled_end)
        .bind(entry.sign_in)
        .bind(entry.sign_out)
        .bind(entry.status.map(AttendanceStatus::as_str))
        .bind(entry.situation.as_str())
        .execute(&mut *tx)
        .await?;

        written += result.rows_affected() as usize;
    }

    tx.commit().await?;
    Ok(written)
}

pub async fn fetch_history(
    pool: &PgPool,
    since: NaiveDate,
    until: NaiveDate,
) -> anyhow::Result<Vec<ArchivedEntry>> {
    let rows = sqlx::query(
        "SELECT lesson_date, order_index, lesson_name, class_room_name, status, situation \
         FROM rollcall_archive.attendance_entries \
         WHERE lesson_date BETWEEN $1 AND $2 \
         ORDER BY lesson_date, order_index",
    )
    .bind(since)
    .bind(until)
    .fetch_all(pool)
    .await?;

    let mut history = Vec::new();

    for row in rows {
        let status: Option<String> = row.get("status");
        let situation: String = row.get("situation");
        history.push(ArchivedEntry {
            lesson_date: row.get("lesson_date"),
            order_index: row.get("order_index"),
            lesson_name: row.get("lesson_name"),
            class_room_name: row.get("class_room_name"),
            status: status
                .map(|s| s.parse::<AttendanceStatus>())
                .transpose()
                .context("archived status is not recognised")?,
            situation: situation
                .parse::<Situation>()
                .context("archived situation is not recognised")?,
        });
    }

    Ok(history)
}

pub async fn fetch_situation_counts(
    pool: &PgPool,
    since: NaiveDate,
    until: NaiveDate,
) -> anyhow::Result<Vec<SituationCount>> {
    let rows = sqlx::query(
        "SELECT lesson_name, situation, COUNT(*) AS total \
         FROM rollcall_archive.attendance_entries \
         WHERE lesson_date BETWEEN $1 AND $2 AND situation <> 'none' \
         GROUP BY lesson_name, situation \
         ORDER BY total DESC, lesson_name",
    )
    .bind(since)
    .bind(until)
    .fetch_all(pool)
    .await?;

    let mut counts = Vec::new();

    for row in rows {
        let situation: String = row.get("situation");
        counts.push(SituationCount {
            lesson_name: row.get("lesson_name"),
            situation: situation
                .parse::<Situation>()
                .context("archived situation is not recognised")?,
            count: row.get("total"),
        });
    }

    Ok(counts)
}
