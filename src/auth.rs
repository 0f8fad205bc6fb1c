#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Admin,
    Teacher,
    Student,
}

impl Role {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "admin" => Some(Role::Admin),
            "teacher" => Some(Role::Teacher),
            "student" => Some(Role::Student),
            _ => None,
        }
    }
}

/// Caller identity as supplied by the authentication layer.
#[derive(Debug, Clone)]
pub struct Caller {
    pub user_id: String,
    pub role: Role,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    GenerateSessions,
    ViewSession,
    RecordAttendance,
    UpdateSession,
    DeleteSession,
}

/// Ownership facts about the session/course being acted on, resolved by
/// the handler before the check. `substitute_teacher_id` is a per-session
/// override, not a course-wide reassignment.
#[derive(Debug, Clone, Default)]
pub struct ResourceContext {
    pub main_teacher_id: Option<String>,
    pub substitute_teacher_id: Option<String>,
    pub caller_has_active_enrollment: bool,
}

impl ResourceContext {
    fn teacher_owns(&self, user_id: &str) -> bool {
        self.main_teacher_id.as_deref() == Some(user_id)
            || self.substitute_teacher_id.as_deref() == Some(user_id)
    }
}

/// The whole role/ownership matrix in one place. Handlers resolve the
/// context and call this; they never branch on role themselves.
pub fn authorize(caller: &Caller, action: Action, ctx: &ResourceContext) -> bool {
    match caller.role {
        Role::Admin => true,
        Role::Teacher => match action {
            Action::GenerateSessions | Action::DeleteSession => false,
            Action::ViewSession | Action::RecordAttendance | Action::UpdateSession => {
                ctx.teacher_owns(&caller.user_id)
            }
        },
        Role::Student => match action {
            Action::ViewSession => ctx.caller_has_active_enrollment,
            _ => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caller(role: Role, user_id: &str) -> Caller {
        Caller {
            user_id: user_id.to_string(),
            role,
        }
    }

    fn course_of(main: &str, substitute: Option<&str>) -> ResourceContext {
        ResourceContext {
            main_teacher_id: Some(main.to_string()),
            substitute_teacher_id: substitute.map(|s| s.to_string()),
            caller_has_active_enrollment: false,
        }
    }

    const ALL_ACTIONS: [Action; 5] = [
        Action::GenerateSessions,
        Action::ViewSession,
        Action::RecordAttendance,
        Action::UpdateSession,
        Action::DeleteSession,
    ];

    #[test]
    fn admin_is_allowed_everything() {
        let admin = caller(Role::Admin, "a1");
        for action in ALL_ACTIONS {
            assert!(authorize(&admin, action, &ResourceContext::default()));
        }
    }

    #[test]
    fn main_teacher_owns_course_actions_but_not_generate_or_delete() {
        let t = caller(Role::Teacher, "t1");
        let ctx = course_of("t1", None);
        assert!(authorize(&t, Action::ViewSession, &ctx));
        assert!(authorize(&t, Action::RecordAttendance, &ctx));
        assert!(authorize(&t, Action::UpdateSession, &ctx));
        assert!(!authorize(&t, Action::GenerateSessions, &ctx));
        assert!(!authorize(&t, Action::DeleteSession, &ctx));
    }

    #[test]
    fn substitute_gains_ownership_for_that_session_only() {
        let sub = caller(Role::Teacher, "t2");
        let with_sub = course_of("t1", Some("t2"));
        let without_sub = course_of("t1", None);
        assert!(authorize(&sub, Action::RecordAttendance, &with_sub));
        assert!(authorize(&sub, Action::UpdateSession, &with_sub));
        assert!(!authorize(&sub, Action::RecordAttendance, &without_sub));
        assert!(!authorize(&sub, Action::ViewSession, &without_sub));
    }

    #[test]
    fn unrelated_teacher_is_denied() {
        let other = caller(Role::Teacher, "t9");
        let ctx = course_of("t1", Some("t2"));
        for action in ALL_ACTIONS {
            assert!(!authorize(&other, action, &ctx));
        }
    }

    #[test]
    fn student_may_only_view_with_active_enrollment() {
        let s = caller(Role::Student, "s1");
        let enrolled = ResourceContext {
            caller_has_active_enrollment: true,
            ..ResourceContext::default()
        };
        let not_enrolled = ResourceContext::default();
        assert!(authorize(&s, Action::ViewSession, &enrolled));
        assert!(!authorize(&s, Action::ViewSession, &not_enrolled));
        assert!(!authorize(&s, Action::RecordAttendance, &enrolled));
        assert!(!authorize(&s, Action::UpdateSession, &enrolled));
        assert!(!authorize(&s, Action::GenerateSessions, &enrolled));
        assert!(!authorize(&s, Action::DeleteSession, &enrolled));
    }

    #[test]
    fn role_parse_accepts_known_roles_only() {
        assert_eq!(Role::parse("admin"), Some(Role::Admin));
        assert_eq!(Role::parse("teacher"), Some(Role::Teacher));
        assert_eq!(Role::parse("student"), Some(Role::Student));
        assert_eq!(Role::parse("principal"), None);
    }
}
