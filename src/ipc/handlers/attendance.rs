use crate::auth::{authorize, Action, Role};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    get_required_str, has_active_enrollment, load_session_ctx, now_stamp, parse_caller,
    parse_today, resource_ctx, HandlerErr, SessionCtx,
};
use crate::ipc::types::{AppState, Request};
use crate::reconcile;
use crate::schedule;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashMap;
use uuid::Uuid;

const ATTENDANCE_STATUSES: [&str; 4] = ["present", "absent", "late", "excused"];

fn is_valid_status(s: &str) -> bool {
    ATTENDANCE_STATUSES.contains(&s)
}

#[derive(Debug, Clone)]
struct RosterStudent {
    id: String,
    name: String,
}

#[derive(Debug, Clone)]
struct RecordRow {
    id: String,
    student_id: String,
    status: String,
    notes: Option<String>,
    recorded_by: String,
    recorded_at: String,
}

/// Active enrollments whose backing student account is active, in name
/// order. Dropped/completed enrollments and deactivated accounts never
/// appear on a roster.
fn load_roster(conn: &Connection, course_id: &str) -> Result<Vec<RosterStudent>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT st.id, st.name
             FROM enrollments e
             JOIN students st ON st.id = e.student_id
             WHERE e.course_id = ? AND e.status = 'active' AND st.active = 1
             ORDER BY st.name, st.id",
        )
        .map_err(HandlerErr::db)?;
    stmt.query_map([course_id], |r| {
        Ok(RosterStudent {
            id: r.get(0)?,
            name: r.get(1)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(HandlerErr::db)
}

fn load_records_by_student(
    conn: &Connection,
    session_id: &str,
) -> Result<HashMap<String, RecordRow>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT id, student_id, status, notes, recorded_by, recorded_at
             FROM attendance_records
             WHERE session_id = ?",
        )
        .map_err(HandlerErr::db)?;
    let rows = stmt
        .query_map([session_id], |r| {
            Ok(RecordRow {
                id: r.get(0)?,
                student_id: r.get(1)?,
                status: r.get(2)?,
                notes: r.get(3)?,
                recorded_by: r.get(4)?,
                recorded_at: r.get(5)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;
    Ok(rows.into_iter().map(|r| (r.student_id.clone(), r)).collect())
}

fn teacher_json(conn: &Connection, teacher_id: &str) -> Result<serde_json::Value, HandlerErr> {
    let found: Option<(String, i64)> = conn
        .query_row(
            "SELECT name, active FROM teachers WHERE id = ?",
            [teacher_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(HandlerErr::db)?;
    let Some((name, active)) = found else {
        return Err(HandlerErr::not_found("teacher"));
    };
    Ok(json!({ "id": teacher_id, "name": name, "active": active != 0 }))
}

fn get_for_session(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let caller = parse_caller(params)?;
    let today = parse_today(params)?;
    let session_id = get_required_str(params, "sessionId")?;
    let ctx = load_session_ctx(conn, &session_id)?;
    if !authorize(&caller, Action::ViewSession, &resource_ctx(conn, &ctx, &caller)?) {
        return Err(HandlerErr::forbidden());
    }

    // Reading a single session's attendance settles it first if it has
    // elapsed unrecorded, same as the listing path.
    reconcile::reconcile_past_sessions(conn, None, Some(&session_id), today)
        .map_err(HandlerErr::db)?;

    let session: (String, String, String, i64, Option<String>, i64) = conn
        .query_row(
            "SELECT date, start_time, end_time, session_number, room, is_cancelled
             FROM sessions WHERE id = ?",
            [&session_id],
            |r| {
                Ok((
                    r.get(0)?,
                    r.get(1)?,
                    r.get(2)?,
                    r.get(3)?,
                    r.get(4)?,
                    r.get(5)?,
                ))
            },
        )
        .map_err(HandlerErr::db)?;
    let (date, start_time, end_time, session_number, room, is_cancelled) = session;
    let status = schedule::computed_status(
        is_cancelled != 0,
        schedule::parse_date(&date)
            .ok_or_else(|| HandlerErr::new("db_query_failed", "stored date is malformed"))?,
        today,
    );

    let course: (Option<String>, Option<String>, Option<String>) = conn
        .query_row(
            "SELECT start_date, end_date, room FROM courses WHERE id = ?",
            [&ctx.course_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .map_err(HandlerErr::db)?;

    let main_teacher = match ctx.main_teacher_id.as_deref() {
        Some(id) => Some(teacher_json(conn, id)?),
        None => None,
    };
    let substitute_teacher = match ctx.substitute_teacher_id.as_deref() {
        Some(id) => Some(teacher_json(conn, id)?),
        None => None,
    };

    let roster = load_roster(conn, &ctx.course_id)?;
    let by_student = load_records_by_student(conn, &session_id)?;

    let mut recorded = 0usize;
    let mut students = Vec::with_capacity(roster.len());
    for s in &roster {
        let rec = by_student.get(&s.id);
        if rec.is_some() {
            recorded += 1;
        }
        // A student caller only ever sees their own attendance row.
        if caller.role == Role::Student && s.id != caller.user_id {
            continue;
        }
        students.push(json!({
            "studentId": s.id,
            "name": s.name,
            "status": rec.map(|r| r.status.clone()),
            "notes": rec.and_then(|r| r.notes.clone()),
            "recordedAt": rec.map(|r| r.recorded_at.clone()),
        }));
    }

    Ok(json!({
        "session": {
            "id": ctx.session_id,
            "courseId": ctx.course_id,
            "sessionNumber": session_number,
            "date": date,
            "startTime": start_time,
            "endTime": end_time,
            "room": room,
            "isCancelled": is_cancelled != 0,
            "computedStatus": status.as_str(),
        },
        "course": {
            "id": ctx.course_id,
            "name": ctx.course_name,
            "startDate": course.0,
            "endDate": course.1,
            "room": course.2,
        },
        "mainTeacher": main_teacher,
        "substituteTeacher": substitute_teacher,
        "students": students,
        "summary": {
            "totalStudents": roster.len(),
            "recorded": recorded,
            "notRecorded": roster.len() - recorded,
        },
    }))
}

fn upsert_record(
    conn: &Connection,
    session_id: &str,
    student_id: &str,
    status: &str,
    notes: Option<&str>,
    recorded_by: &str,
    recorded_at: &str,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO attendance_records(
           id, session_id, student_id, status, notes, recorded_by, recorded_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(session_id, student_id) DO UPDATE SET
           status = excluded.status,
           notes = excluded.notes,
           recorded_by = excluded.recorded_by,
           recorded_at = excluded.recorded_at",
        (
            Uuid::new_v4().to_string(),
            session_id,
            student_id,
            status,
            notes,
            recorded_by,
            recorded_at,
        ),
    )?;
    Ok(())
}

fn record_batch(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let caller = parse_caller(params)?;
    let session_id = get_required_str(params, "sessionId")?;
    let ctx: SessionCtx = load_session_ctx(conn, &session_id)?;
    if !authorize(
        &caller,
        Action::RecordAttendance,
        &resource_ctx(conn, &ctx, &caller)?,
    ) {
        return Err(HandlerErr::forbidden());
    }

    let Some(entries) = params.get("entries").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("missing entries"));
    };
    let mark_completed = params
        .get("markCompleted")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let now = now_stamp();
    let mut successful: Vec<serde_json::Value> = Vec::new();
    let mut failed: Vec<serde_json::Value> = Vec::new();

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    for entry in entries {
        // A shapeless entry is a malformed request, not a per-student
        // failure; it aborts the whole call.
        let student_id = get_required_str(entry, "studentId")
            .map_err(|_| HandlerErr::bad_params("each entry needs a studentId"))?;
        let status = entry
            .get("status")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let notes = entry.get("notes").and_then(|v| v.as_str());

        if !is_valid_status(&status) {
            failed.push(json!({
                "studentId": student_id,
                "reason": format!("invalid status: {:?}", status),
            }));
            continue;
        }
        if !has_active_enrollment(&tx, &ctx.course_id, &student_id)? {
            failed.push(json!({
                "studentId": student_id,
                "reason": "student has no active enrollment in this course",
            }));
            continue;
        }

        if let Err(e) = upsert_record(
            &tx,
            &session_id,
            &student_id,
            &status,
            notes,
            &caller.user_id,
            &now,
        ) {
            let _ = tx.rollback();
            return Err(HandlerErr::new("db_update_failed", e.to_string()));
        }
        successful.push(json!({ "studentId": student_id, "status": status }));
    }

    // Handler-level side effect; the ledger itself only writes rows.
    if mark_completed {
        if let Err(e) = tx.execute(
            "UPDATE sessions SET is_completed = 1 WHERE id = ?",
            [&session_id],
        ) {
            let _ = tx.rollback();
            return Err(HandlerErr::new("db_update_failed", e.to_string()));
        }
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(json!({
        "summary": {
            "requested": entries.len(),
            "succeeded": successful.len(),
            "failed": failed.len(),
        },
        "successful": successful,
        "failed": failed,
    }))
}

fn update_single(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let caller = parse_caller(params)?;
    let session_id = get_required_str(params, "sessionId")?;
    let attendance_id = get_required_str(params, "attendanceId")?;
    let ctx = load_session_ctx(conn, &session_id)?;
    if !authorize(
        &caller,
        Action::RecordAttendance,
        &resource_ctx(conn, &ctx, &caller)?,
    ) {
        return Err(HandlerErr::forbidden());
    }

    let existing: Option<(String, String, Option<String>)> = conn
        .query_row(
            "SELECT student_id, status, notes
             FROM attendance_records
             WHERE id = ? AND session_id = ?",
            (&attendance_id, &session_id),
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
        .map_err(HandlerErr::db)?;
    let Some((student_id, mut status, mut notes)) = existing else {
        return Err(HandlerErr::not_found("attendance record"));
    };

    if let Some(raw) = params.get("status") {
        let Some(s) = raw.as_str().filter(|s| is_valid_status(s)) else {
            return Err(HandlerErr::bad_params(
                "status must be one of present, absent, late, excused",
            ));
        };
        status = s.to_string();
    }
    match params.get("notes") {
        None => {}
        Some(v) if v.is_null() => notes = None,
        Some(v) => match v.as_str() {
            Some(s) => notes = Some(s.to_string()),
            None => return Err(HandlerErr::bad_params("notes must be a string or null")),
        },
    }

    let now = now_stamp();
    conn.execute(
        "UPDATE attendance_records
         SET status = ?, notes = ?, recorded_by = ?, recorded_at = ?
         WHERE id = ?",
        (&status, &notes, &caller.user_id, &now, &attendance_id),
    )
    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;

    Ok(json!({
        "id": attendance_id,
        "sessionId": session_id,
        "studentId": student_id,
        "status": status,
        "notes": notes,
        "recordedBy": caller.user_id,
        "recordedAt": now,
    }))
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
        "attendance.getForSession" => Some(with_db(state, req, get_for_session)),
        "attendance.record" => Some(with_db(state, req, record_batch)),
        "attendance.updateSingle" => Some(with_db(state, req, update_single)),
        _ => None,
    }
}
