use chrono::NaiveDate;
use rusqlite::Connection;
use uuid::Uuid;

/// Note attached to auto-inserted rows so they are distinguishable from
/// marks a teacher actually took.
pub const AUTO_ABSENCE_NOTE: &str = "auto-marked absent: no attendance recorded for elapsed session";

pub const AUTO_ABSENCE_RECORDER: &str = "system";

#[derive(Debug, Clone)]
pub struct ReconcileOutcome {
    pub session_id: String,
    pub inserted: usize,
}

/// Backfills absence rows for sessions that have elapsed without any
/// attendance being taken: every active enrollment in the session's course
/// gets an `absent` record. A session qualifies only while it has zero
/// records, so a second run (or any manual mark) makes it a no-op for that
/// session. Scope narrows to one course or one session when given.
pub fn reconcile_past_sessions(
    conn: &Connection,
    course_id: Option<&str>,
    session_id: Option<&str>,
    today: NaiveDate,
) -> rusqlite::Result<Vec<ReconcileOutcome>> {
    let today_str = today.format("%Y-%m-%d").to_string();
    let mut stmt = conn.prepare(
        "SELECT s.id, s.course_id
         FROM sessions s
         WHERE s.date < ?1
           AND (?2 IS NULL OR s.course_id = ?2)
           AND (?3 IS NULL OR s.id = ?3)
           AND NOT EXISTS (
             SELECT 1 FROM attendance_records ar WHERE ar.session_id = s.id
           )
         ORDER BY s.date, s.session_number",
    )?;
    let unrecorded = stmt
        .query_map((&today_str, course_id, session_id), |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    if unrecorded.is_empty() {
        return Ok(Vec::new());
    }

    let now = chrono::Local::now().format("%Y-%m-%dT%H:%M:%S").to_string();
    let tx = conn.unchecked_transaction()?;
    let mut outcomes = Vec::with_capacity(unrecorded.len());
    for (sid, cid) in unrecorded {
        let mut enrolled = tx.prepare(
            "SELECT student_id FROM enrollments
             WHERE course_id = ? AND status = 'active'",
        )?;
        let student_ids = enrolled
            .query_map([&cid], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        let mut inserted = 0usize;
        for student_id in student_ids {
            tx.execute(
                "INSERT INTO attendance_records(
                   id, session_id, student_id, status, notes, recorded_by, recorded_at
                 ) VALUES(?, ?, ?, 'absent', ?, ?, ?)
                 ON CONFLICT(session_id, student_id) DO NOTHING",
                (
                    Uuid::new_v4().to_string(),
                    &sid,
                    &student_id,
                    AUTO_ABSENCE_NOTE,
                    AUTO_ABSENCE_RECORDER,
                    &now,
                ),
            )?;
            inserted += 1;
        }
        outcomes.push(ReconcileOutcome {
            session_id: sid,
            inserted,
        });
    }
    tx.commit()?;
    Ok(outcomes)
}
