use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_optional_str, get_required_str, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::schedule;
use rusqlite::Connection;
use serde_json::json;
use uuid::Uuid;

// External-owned CRUD (courses, people, enrollments) is consumed read-only
// by the scheduling core; this thin surface exists so the daemon is
// self-contained and drivable end to end.

fn parse_active_flag(params: &serde_json::Value) -> bool {
    params.get("active").and_then(|v| v.as_bool()).unwrap_or(true)
}

fn create_person(
    conn: &Connection,
    table: &str,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?;
    if name.trim().is_empty() {
        return Err(HandlerErr::bad_params("name must not be empty"));
    }
    let id = Uuid::new_v4().to_string();
    let active = parse_active_flag(params);
    let sql = format!("INSERT INTO {}(id, name, active) VALUES(?, ?, ?)", table);
    conn.execute(&sql, (&id, name.trim(), active as i64))
        .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;
    Ok(json!({ "id": id, "name": name.trim(), "active": active }))
}

fn courses_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?;
    if name.trim().is_empty() {
        return Err(HandlerErr::bad_params("name must not be empty"));
    }
    for key in ["startDate", "endDate"] {
        if let Some(raw) = params.get(key).and_then(|v| v.as_str()) {
            if schedule::parse_date(raw).is_none() {
                return Err(HandlerErr::bad_params(format!("{} must be YYYY-MM-DD", key)));
            }
        }
    }
    let course_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO courses(id, name, start_date, end_date, room, teacher_id)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &course_id,
            name.trim(),
            get_optional_str(params, "startDate"),
            get_optional_str(params, "endDate"),
            get_optional_str(params, "room"),
            get_optional_str(params, "teacherId"),
        ),
    )
    .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;
    Ok(json!({ "courseId": course_id, "name": name.trim() }))
}

fn enrollments_set(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let course_id = get_required_str(params, "courseId")?;
    let student_id = get_required_str(params, "studentId")?;
    let status = get_required_str(params, "status")?;
    if !matches!(status.as_str(), "active" | "completed" | "dropped") {
        return Err(HandlerErr::bad_params(format!(
            "unknown enrollment status: {}",
            status
        )));
    }
    conn.execute(
        "INSERT INTO enrollments(course_id, student_id, status)
         VALUES(?, ?, ?)
         ON CONFLICT(course_id, student_id) DO UPDATE SET
           status = excluded.status",
        (&course_id, &student_id, &status),
    )
    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    Ok(json!({ "courseId": course_id, "studentId": student_id, "status": status }))
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
        "courses.create" => Some(with_db(state, req, courses_create)),
        "teachers.create" => Some(with_db(state, req, |c, p| create_person(c, "teachers", p))),
        "students.create" => Some(with_db(state, req, |c, p| create_person(c, "students", p))),
        "enrollments.set" => Some(with_db(state, req, enrollments_set)),
        _ => None,
    }
}
