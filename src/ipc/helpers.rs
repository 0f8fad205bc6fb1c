use crate::auth::{Caller, ResourceContext, Role};
use crate::ipc::error::err;
use crate::schedule;
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};

/// Handler-internal error carrying the wire code; converted to the error
/// envelope at the handler boundary.
pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        HandlerErr {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn bad_params(message: impl Into<String>) -> Self {
        Self::new("bad_params", message)
    }

    pub fn not_found(what: &str) -> Self {
        Self::new("not_found", format!("{} not found", what))
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new("conflict", message)
    }

    pub fn forbidden() -> Self {
        Self::new("forbidden", "caller may not perform this operation")
    }

    pub fn db(e: rusqlite::Error) -> Self {
        Self::new("db_query_failed", e.to_string())
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

pub fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

/// Absent and explicit-null both read as None.
pub fn get_optional_str(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

/// Caller context `{userId, role}` supplied by the authentication layer.
pub fn parse_caller(params: &serde_json::Value) -> Result<Caller, HandlerErr> {
    let caller = params
        .get("caller")
        .ok_or_else(|| HandlerErr::bad_params("missing caller"))?;
    let user_id = get_required_str(caller, "userId")?;
    let role_raw = get_required_str(caller, "role")?;
    let role = Role::parse(&role_raw)
        .ok_or_else(|| HandlerErr::bad_params(format!("unknown role: {}", role_raw)))?;
    Ok(Caller { user_id, role })
}

/// Optional `today` override (YYYY-MM-DD) so tests can pin the clock;
/// defaults to the local date.
pub fn parse_today(params: &serde_json::Value) -> Result<NaiveDate, HandlerErr> {
    match params.get("today").and_then(|v| v.as_str()) {
        Some(raw) => schedule::parse_date(raw)
            .ok_or_else(|| HandlerErr::bad_params("today must be YYYY-MM-DD")),
        None => Ok(chrono::Local::now().date_naive()),
    }
}

/// Ownership facts for a session, resolved once and handed to `authorize`.
pub struct SessionCtx {
    pub session_id: String,
    pub course_id: String,
    pub course_name: String,
    pub main_teacher_id: Option<String>,
    pub substitute_teacher_id: Option<String>,
}

pub fn load_session_ctx(conn: &Connection, session_id: &str) -> Result<SessionCtx, HandlerErr> {
    conn.query_row(
        "SELECT s.id, s.course_id, c.name, c.teacher_id, s.substitute_teacher_id
         FROM sessions s
         JOIN courses c ON c.id = s.course_id
         WHERE s.id = ?",
        [session_id],
        |r| {
            Ok(SessionCtx {
                session_id: r.get(0)?,
                course_id: r.get(1)?,
                course_name: r.get(2)?,
                main_teacher_id: r.get(3)?,
                substitute_teacher_id: r.get(4)?,
            })
        },
    )
    .optional()
    .map_err(HandlerErr::db)?
    .ok_or_else(|| HandlerErr::not_found("session"))
}

pub fn has_active_enrollment(
    conn: &Connection,
    course_id: &str,
    student_id: &str,
) -> Result<bool, HandlerErr> {
    conn.query_row(
        "SELECT 1 FROM enrollments
         WHERE course_id = ? AND student_id = ? AND status = 'active'",
        (course_id, student_id),
        |r| r.get::<_, i64>(0),
    )
    .optional()
    .map(|v| v.is_some())
    .map_err(HandlerErr::db)
}

pub fn resource_ctx(
    conn: &Connection,
    session: &SessionCtx,
    caller: &Caller,
) -> Result<ResourceContext, HandlerErr> {
    let caller_has_active_enrollment = match caller.role {
        Role::Student => has_active_enrollment(conn, &session.course_id, &caller.user_id)?,
        _ => false,
    };
    Ok(ResourceContext {
        main_teacher_id: session.main_teacher_id.clone(),
        substitute_teacher_id: session.substitute_teacher_id.clone(),
        caller_has_active_enrollment,
    })
}

pub fn now_stamp() -> String {
    chrono::Local::now().format("%Y-%m-%dT%H:%M:%S").to_string()
}
