use crate::auth::{authorize, Action, Role};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    get_optional_str, get_required_str, load_session_ctx, now_stamp, parse_caller, parse_today,
    resource_ctx, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::reconcile;
use crate::schedule::{self, ComputedStatus};
use rusqlite::{params_from_iter, types::Value as SqlValue, Connection, ErrorCode, OptionalExtension};
use serde_json::json;
use std::collections::BTreeSet;
use uuid::Uuid;

const DEFAULT_PAGE_SIZE: i64 = 50;

#[derive(Debug, Clone)]
struct SessionRow {
    id: String,
    course_id: String,
    course_name: String,
    session_number: i64,
    title: String,
    date: String,
    start_time: String,
    end_time: String,
    room: Option<String>,
    lesson_id: Option<String>,
    substitute_teacher_id: Option<String>,
    is_cancelled: bool,
    cancellation_reason: Option<String>,
    is_completed: bool,
}

const SESSION_COLUMNS: &str = "s.id, s.course_id, c.name, s.session_number, s.title, s.date,
       s.start_time, s.end_time, s.room, s.lesson_id, s.substitute_teacher_id,
       s.is_cancelled, s.cancellation_reason, s.is_completed";

fn row_to_session(r: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRow> {
    Ok(SessionRow {
        id: r.get(0)?,
        course_id: r.get(1)?,
        course_name: r.get(2)?,
        session_number: r.get(3)?,
        title: r.get(4)?,
        date: r.get(5)?,
        start_time: r.get(6)?,
        end_time: r.get(7)?,
        room: r.get(8)?,
        lesson_id: r.get(9)?,
        substitute_teacher_id: r.get(10)?,
        is_cancelled: r.get::<_, i64>(11)? != 0,
        cancellation_reason: r.get(12)?,
        is_completed: r.get::<_, i64>(13)? != 0,
    })
}

fn session_json(s: &SessionRow) -> serde_json::Value {
    json!({
        "id": s.id,
        "courseId": s.course_id,
        "courseName": s.course_name,
        "sessionNumber": s.session_number,
        "title": s.title,
        "date": s.date,
        "startTime": s.start_time,
        "endTime": s.end_time,
        "room": s.room,
        "lessonId": s.lesson_id,
        "substituteTeacherId": s.substitute_teacher_id,
        "isCancelled": s.is_cancelled,
        "cancellationReason": s.cancellation_reason,
        "isCompleted": s.is_completed,
    })
}

/// Roster size counts active enrollments whose student account is active;
/// recorded counts existing attendance rows for the session.
fn attendance_summary(conn: &Connection, s: &SessionRow) -> Result<serde_json::Value, HandlerErr> {
    let total_students: i64 = conn
        .query_row(
            "SELECT COUNT(*)
             FROM enrollments e
             JOIN students st ON st.id = e.student_id
             WHERE e.course_id = ? AND e.status = 'active' AND st.active = 1",
            [&s.course_id],
            |r| r.get(0),
        )
        .map_err(HandlerErr::db)?;
    let recorded: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM attendance_records WHERE session_id = ?",
            [&s.id],
            |r| r.get(0),
        )
        .map_err(HandlerErr::db)?;
    Ok(json!({
        "totalStudents": total_students,
        "recorded": recorded,
        "notRecorded": (total_students - recorded).max(0),
    }))
}

fn parse_weekdays(params: &serde_json::Value) -> Result<BTreeSet<u8>, HandlerErr> {
    let Some(raw) = params.get("weekdays").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("missing weekdays"));
    };
    let mut out = BTreeSet::new();
    for v in raw {
        let Some(n) = v.as_u64().filter(|n| *n <= 6) else {
            return Err(HandlerErr::bad_params(
                "weekdays must be integers 0 (Sunday) through 6 (Saturday)",
            ));
        };
        out.insert(n as u8);
    }
    if out.is_empty() {
        return Err(HandlerErr::bad_params("weekdays must not be empty"));
    }
    Ok(out)
}

fn sessions_generate(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let caller = parse_caller(params)?;
    if !authorize(&caller, Action::GenerateSessions, &Default::default()) {
        return Err(HandlerErr::forbidden());
    }

    let course_id = get_required_str(params, "courseId")?;
    let weekdays = parse_weekdays(params)?;
    let start_time = get_required_str(params, "startTime")?;
    let end_time = get_required_str(params, "endTime")?;

    let course: Option<(String, Option<String>, Option<String>, Option<String>)> = conn
        .query_row(
            "SELECT name, start_date, end_date, room FROM courses WHERE id = ?",
            [&course_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()
        .map_err(HandlerErr::db)?;
    let Some((course_name, start_date, end_date, course_room)) = course else {
        return Err(HandlerErr::not_found("course"));
    };

    let (Some(start_raw), Some(end_raw)) = (start_date, end_date) else {
        return Err(HandlerErr::bad_params(
            "course has no start/end date range to generate from",
        ));
    };
    let (Some(start), Some(end)) = (
        schedule::parse_date(&start_raw),
        schedule::parse_date(&end_raw),
    ) else {
        return Err(HandlerErr::bad_params("course date range is malformed"));
    };

    let existing: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM sessions WHERE course_id = ? LIMIT 1",
            [&course_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db)?;
    if existing.is_some() {
        return Err(HandlerErr::conflict(
            "sessions already generated for this course",
        ));
    }

    let dates = schedule::plan_session_dates(start, end, &weekdays);
    if dates.is_empty() {
        return Err(HandlerErr::bad_params(
            "no sessions generated: no day in the course range matches the weekday pattern",
        ));
    }

    let room = get_optional_str(params, "room").or(course_room);

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;

    // The claim row is what actually closes the check-then-act race: the
    // existence probe above is only for a friendly error. A concurrent
    // generate that also passed the probe dies here on the primary key.
    if let Err(e) = tx.execute(
        "INSERT INTO session_generation(course_id, generated_at) VALUES(?, ?)",
        (&course_id, now_stamp()),
    ) {
        let _ = tx.rollback();
        return Err(match e {
            rusqlite::Error::SqliteFailure(f, _) if f.code == ErrorCode::ConstraintViolation => {
                HandlerErr::conflict("sessions already generated for this course")
            }
            other => HandlerErr::new("db_insert_failed", other.to_string()),
        });
    }

    let mut created = Vec::with_capacity(dates.len());
    for (i, date) in dates.iter().enumerate() {
        let session_number = (i + 1) as i64;
        let id = Uuid::new_v4().to_string();
        let title = format!("{} - Session {}", course_name, session_number);
        if let Err(e) = tx.execute(
            "INSERT INTO sessions(
               id, course_id, session_number, title, date, start_time, end_time, room
             ) VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
            (
                &id,
                &course_id,
                session_number,
                &title,
                date.format("%Y-%m-%d").to_string(),
                &start_time,
                &end_time,
                &room,
            ),
        ) {
            let _ = tx.rollback();
            return Err(HandlerErr::new("db_insert_failed", e.to_string()));
        }
        created.push(json!({
            "id": id,
            "courseId": course_id,
            "sessionNumber": session_number,
            "title": title,
            "date": date.format("%Y-%m-%d").to_string(),
            "startTime": start_time,
            "endTime": end_time,
            "room": room,
        }));
    }

    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(json!({ "total": created.len(), "sessions": created }))
}

fn sessions_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let caller = parse_caller(params)?;
    let today = parse_today(params)?;
    let course_id = get_optional_str(params, "courseId");
    let status_filter = match params.get("computedStatus").and_then(|v| v.as_str()) {
        Some(raw) => Some(
            ComputedStatus::parse(raw)
                .ok_or_else(|| HandlerErr::bad_params(format!("unknown computedStatus: {}", raw)))?,
        ),
        None => None,
    };
    for key in ["fromDate", "toDate"] {
        if let Some(raw) = params.get(key).and_then(|v| v.as_str()) {
            if schedule::parse_date(raw).is_none() {
                return Err(HandlerErr::bad_params(format!("{} must be YYYY-MM-DD", key)));
            }
        }
    }
    let from_date = get_optional_str(params, "fromDate");
    let to_date = get_optional_str(params, "toDate");
    let limit = params
        .get("limit")
        .and_then(|v| v.as_i64())
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .max(1);
    let offset = params
        .get("offset")
        .and_then(|v| v.as_i64())
        .unwrap_or(0)
        .max(0);

    // Listing deliberately settles elapsed, unrecorded sessions first so
    // attendance summaries never report "unknown" for past dates.
    reconcile::reconcile_past_sessions(conn, course_id.as_deref(), None, today)
        .map_err(HandlerErr::db)?;

    let mut sql = format!(
        "SELECT {}
         FROM sessions s
         JOIN courses c ON c.id = s.course_id
         WHERE (?1 IS NULL OR s.course_id = ?1)
           AND (?2 IS NULL OR s.date >= ?2)
           AND (?3 IS NULL OR s.date <= ?3)",
        SESSION_COLUMNS
    );
    let opt_text = |v: &Option<String>| match v {
        Some(s) => SqlValue::Text(s.clone()),
        None => SqlValue::Null,
    };
    let mut bind: Vec<SqlValue> = vec![
        opt_text(&course_id),
        opt_text(&from_date),
        opt_text(&to_date),
    ];
    match caller.role {
        Role::Admin => {}
        Role::Teacher => {
            sql.push_str(" AND (c.teacher_id = ?4 OR s.substitute_teacher_id = ?4)");
            bind.push(SqlValue::Text(caller.user_id.clone()));
        }
        Role::Student => {
            sql.push_str(
                " AND EXISTS (
                    SELECT 1 FROM enrollments e
                    WHERE e.course_id = s.course_id
                      AND e.student_id = ?4
                      AND e.status = 'active'
                  )",
            );
            bind.push(SqlValue::Text(caller.user_id.clone()));
        }
    }
    sql.push_str(" ORDER BY s.date, s.course_id, s.session_number");

    let mut stmt = conn.prepare(&sql).map_err(HandlerErr::db)?;
    let rows = stmt
        .query_map(params_from_iter(bind), row_to_session)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    // Status is derived, so the computedStatus filter applies after the
    // rows come back; pagination then slices the filtered set.
    let mut matching = Vec::new();
    for row in rows {
        let status = schedule::computed_status(
            row.is_cancelled,
            schedule::parse_date(&row.date)
                .ok_or_else(|| HandlerErr::new("db_query_failed", "stored date is malformed"))?,
            today,
        );
        if let Some(want) = status_filter {
            if status != want {
                continue;
            }
        }
        matching.push((row, status));
    }

    let total = matching.len();
    let mut page = Vec::new();
    for (row, status) in matching
        .into_iter()
        .skip(offset as usize)
        .take(limit as usize)
    {
        let mut v = session_json(&row);
        v["computedStatus"] = json!(status.as_str());
        v["attendanceSummary"] = attendance_summary(conn, &row)?;
        page.push(v);
    }

    Ok(json!({
        "sessions": page,
        "total": total,
        "limit": limit,
        "offset": offset,
    }))
}

/// Present-but-null clears a nullable field; an absent key keeps it.
fn patch_nullable(
    params: &serde_json::Value,
    key: &str,
    current: Option<String>,
) -> Result<Option<String>, HandlerErr> {
    match params.get(key) {
        None => Ok(current),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => match v.as_str() {
            Some(s) => Ok(Some(s.to_string())),
            None => Err(HandlerErr::bad_params(format!(
                "{} must be a string or null",
                key
            ))),
        },
    }
}

fn patch_required(
    params: &serde_json::Value,
    key: &str,
    current: String,
) -> Result<String, HandlerErr> {
    match params.get(key) {
        None => Ok(current),
        Some(v) => v
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be a string", key))),
    }
}

fn sessions_update(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let caller = parse_caller(params)?;
    let session_id = get_required_str(params, "sessionId")?;
    let ctx = load_session_ctx(conn, &session_id)?;
    if !authorize(
        &caller,
        Action::UpdateSession,
        &resource_ctx(conn, &ctx, &caller)?,
    ) {
        return Err(HandlerErr::forbidden());
    }

    let mut current = conn
        .query_row(
            &format!(
                "SELECT {} FROM sessions s JOIN courses c ON c.id = s.course_id WHERE s.id = ?",
                SESSION_COLUMNS
            ),
            [&session_id],
            row_to_session,
        )
        .map_err(HandlerErr::db)?;

    current.date = patch_required(params, "date", current.date)?;
    if schedule::parse_date(&current.date).is_none() {
        return Err(HandlerErr::bad_params("date must be YYYY-MM-DD"));
    }
    current.start_time = patch_required(params, "startTime", current.start_time)?;
    current.end_time = patch_required(params, "endTime", current.end_time)?;
    current.room = patch_nullable(params, "room", current.room)?;
    current.lesson_id = patch_nullable(params, "lessonId", current.lesson_id)?;
    current.substitute_teacher_id =
        patch_nullable(params, "substituteTeacherId", current.substitute_teacher_id)?;
    current.is_cancelled = params
        .get("isCancelled")
        .and_then(|v| v.as_bool())
        .unwrap_or(current.is_cancelled);
    current.cancellation_reason =
        patch_nullable(params, "cancellationReason", current.cancellation_reason)?;

    // Edits never renumber: session_number stays as generated even when
    // the date moves out of order.
    conn.execute(
        "UPDATE sessions SET
           date = ?, start_time = ?, end_time = ?, room = ?, lesson_id = ?,
           substitute_teacher_id = ?, is_cancelled = ?, cancellation_reason = ?
         WHERE id = ?",
        (
            &current.date,
            &current.start_time,
            &current.end_time,
            &current.room,
            &current.lesson_id,
            &current.substitute_teacher_id,
            current.is_cancelled as i64,
            &current.cancellation_reason,
            &session_id,
        ),
    )
    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;

    Ok(session_json(&current))
}

fn sessions_delete(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let caller = parse_caller(params)?;
    let session_id = get_required_str(params, "sessionId")?;
    let ctx = load_session_ctx(conn, &session_id)?;
    if !authorize(
        &caller,
        Action::DeleteSession,
        &resource_ctx(conn, &ctx, &caller)?,
    ) {
        return Err(HandlerErr::forbidden());
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    if let Err(e) = tx.execute(
        "DELETE FROM attendance_records WHERE session_id = ?",
        [&session_id],
    ) {
        let _ = tx.rollback();
        return Err(HandlerErr::new("db_delete_failed", e.to_string()));
    }
    if let Err(e) = tx.execute("DELETE FROM sessions WHERE id = ?", [&session_id]) {
        let _ = tx.rollback();
        return Err(HandlerErr::new("db_delete_failed", e.to_string()));
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    Ok(json!({ "ok": true }))
}

fn sessions_delete_by_course(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let caller = parse_caller(params)?;
    if !authorize(&caller, Action::DeleteSession, &Default::default()) {
        return Err(HandlerErr::forbidden());
    }
    let course_id = get_required_str(params, "courseId")?;
    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM courses WHERE id = ?", [&course_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(HandlerErr::db)?;
    if exists.is_none() {
        return Err(HandlerErr::not_found("course"));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    if let Err(e) = tx.execute(
        "DELETE FROM attendance_records
         WHERE session_id IN (SELECT id FROM sessions WHERE course_id = ?)",
        [&course_id],
    ) {
        let _ = tx.rollback();
        return Err(HandlerErr::new("db_delete_failed", e.to_string()));
    }
    let deleted = match tx.execute("DELETE FROM sessions WHERE course_id = ?", [&course_id]) {
        Ok(n) => n,
        Err(e) => {
            let _ = tx.rollback();
            return Err(HandlerErr::new("db_delete_failed", e.to_string()));
        }
    };
    // Clearing the claim lets the calendar be regenerated from scratch.
    if let Err(e) = tx.execute(
        "DELETE FROM session_generation WHERE course_id = ?",
        [&course_id],
    ) {
        let _ = tx.rollback();
        return Err(HandlerErr::new("db_delete_failed", e.to_string()));
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    Ok(json!({ "deletedCount": deleted }))
}

fn sessions_reconcile(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let today = parse_today(params)?;
    let course_id = get_optional_str(params, "courseId");
    let session_id = get_optional_str(params, "sessionId");
    let outcomes = reconcile::reconcile_past_sessions(
        conn,
        course_id.as_deref(),
        session_id.as_deref(),
        today,
    )
    .map_err(HandlerErr::db)?;
    let reconciled: Vec<serde_json::Value> = outcomes
        .iter()
        .map(|o| json!({ "sessionId": o.session_id, "inserted": o.inserted }))
        .collect();
    Ok(json!({ "reconciled": reconciled }))
}

fn with_db(
    state: &mut AppState,
    req: &Request,
    f: impl Fn(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
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
        "sessions.generate" => Some(with_db(state, req, sessions_generate)),
        "sessions.list" => Some(with_db(state, req, sessions_list)),
        "sessions.update" => Some(with_db(state, req, sessions_update)),
        "sessions.delete" => Some(with_db(state, req, sessions_delete)),
        "sessions.deleteByCourse" => Some(with_db(state, req, sessions_delete_by_course)),
        "sessions.reconcile" => Some(with_db(state, req, sessions_reconcile)),
        _ => None,
    }
}
