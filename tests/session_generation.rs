use rusqlite::Connection;
use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_coursebookd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn coursebookd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({ "id": id, "method": method, "params": params });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown error")
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn request_err(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> String {
    let value = request(stdin, reader, id, method, params);
    assert!(
        !value.get("ok").and_then(|v| v.as_bool()).unwrap_or(true),
        "{} unexpectedly succeeded: {}",
        method,
        value
    );
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .expect("error code")
        .to_string()
}

fn admin() -> serde_json::Value {
    json!({ "userId": "admin1", "role": "admin" })
}

fn setup_course(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    start_date: Option<&str>,
    end_date: Option<&str>,
) -> (String, String) {
    let teacher = request_ok(
        stdin,
        reader,
        "t",
        "teachers.create",
        json!({ "name": "Ms. Frizzle" }),
    );
    let teacher_id = teacher.get("id").and_then(|v| v.as_str()).expect("teacher id");
    let course = request_ok(
        stdin,
        reader,
        "c",
        "courses.create",
        json!({
            "name": "Algebra I",
            "startDate": start_date,
            "endDate": end_date,
            "room": "B2",
            "teacherId": teacher_id,
        }),
    );
    let course_id = course
        .get("courseId")
        .and_then(|v| v.as_str())
        .expect("courseId");
    (course_id.to_string(), teacher_id.to_string())
}

#[test]
fn generates_one_session_per_matching_weekday_with_room_fallback() {
    let workspace = temp_dir("coursebook-gen");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    // 2024-02-01 is a Thursday; Mon/Wed/Fri pattern lands on 5 days.
    let (course_id, _) = setup_course(
        &mut stdin,
        &mut reader,
        Some("2024-02-01"),
        Some("2024-02-14"),
    );

    let result = request_ok(
        &mut stdin,
        &mut reader,
        "gen",
        "sessions.generate",
        json!({
            "courseId": &course_id,
            "weekdays": [1, 3, 5],
            "startTime": "09:00",
            "endTime": "10:30",
            "caller": admin(),
        }),
    );
    assert_eq!(result.get("total").and_then(|v| v.as_u64()), Some(5));
    let sessions = result
        .get("sessions")
        .and_then(|v| v.as_array())
        .expect("sessions array");
    let dates: Vec<&str> = sessions
        .iter()
        .map(|s| s.get("date").and_then(|v| v.as_str()).expect("date"))
        .collect();
    assert_eq!(
        dates,
        vec![
            "2024-02-05",
            "2024-02-07",
            "2024-02-09",
            "2024-02-12",
            "2024-02-14"
        ]
    );
    for (i, s) in sessions.iter().enumerate() {
        assert_eq!(
            s.get("sessionNumber").and_then(|v| v.as_u64()),
            Some((i + 1) as u64)
        );
        // No room was supplied, so the course default applies.
        assert_eq!(s.get("room").and_then(|v| v.as_str()), Some("B2"));
        let title = s.get("title").and_then(|v| v.as_str()).expect("title");
        assert!(title.contains("Algebra I"), "title was {}", title);
    }

    // The generation claim landed with the calendar.
    let conn = Connection::open(workspace.join("coursebook.sqlite3")).expect("open db");
    let claims: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM session_generation WHERE course_id = ?",
            [&course_id],
            |r| r.get(0),
        )
        .expect("claim count");
    assert_eq!(claims, 1);

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn regenerating_an_existing_calendar_is_a_conflict_until_deleted() {
    let workspace = temp_dir("coursebook-regen");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let (course_id, _) = setup_course(
        &mut stdin,
        &mut reader,
        Some("2024-02-01"),
        Some("2024-02-14"),
    );

    let gen_params = json!({
        "courseId": &course_id,
        "weekdays": [1, 3, 5],
        "startTime": "09:00",
        "endTime": "10:30",
        "caller": admin(),
    });
    request_ok(
        &mut stdin,
        &mut reader,
        "g1",
        "sessions.generate",
        gen_params.clone(),
    );
    let code = request_err(
        &mut stdin,
        &mut reader,
        "g2",
        "sessions.generate",
        gen_params.clone(),
    );
    assert_eq!(code, "conflict");

    // Different input does not help; existing sessions always conflict.
    let code = request_err(
        &mut stdin,
        &mut reader,
        "g3",
        "sessions.generate",
        json!({
            "courseId": &course_id,
            "weekdays": [0],
            "startTime": "13:00",
            "endTime": "14:00",
            "caller": admin(),
        }),
    );
    assert_eq!(code, "conflict");

    // Bulk delete clears the calendar and the claim; generation works again.
    let deleted = request_ok(
        &mut stdin,
        &mut reader,
        "d1",
        "sessions.deleteByCourse",
        json!({ "courseId": &course_id, "caller": admin() }),
    );
    assert_eq!(deleted.get("deletedCount").and_then(|v| v.as_u64()), Some(5));
    let result = request_ok(
        &mut stdin,
        &mut reader,
        "g4",
        "sessions.generate",
        gen_params,
    );
    assert_eq!(result.get("total").and_then(|v| v.as_u64()), Some(5));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn generation_validates_input_and_role() {
    let workspace = temp_dir("coursebook-genval");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let (course_id, teacher_id) = setup_course(
        &mut stdin,
        &mut reader,
        Some("2024-02-01"),
        Some("2024-02-02"),
    );

    // Teachers and students may not generate calendars.
    for (id, role, user) in [("f1", "teacher", teacher_id.as_str()), ("f2", "student", "s1")] {
        let code = request_err(
            &mut stdin,
            &mut reader,
            id,
            "sessions.generate",
            json!({
                "courseId": &course_id,
                "weekdays": [1],
                "startTime": "09:00",
                "endTime": "10:00",
                "caller": { "userId": user, "role": role },
            }),
        );
        assert_eq!(code, "forbidden");
    }

    // Empty or out-of-range weekday sets are validation errors.
    for (id, weekdays) in [("v1", json!([])), ("v2", json!([7])), ("v3", json!(["mon"]))] {
        let code = request_err(
            &mut stdin,
            &mut reader,
            id,
            "sessions.generate",
            json!({
                "courseId": &course_id,
                "weekdays": weekdays,
                "startTime": "09:00",
                "endTime": "10:00",
                "caller": admin(),
            }),
        );
        assert_eq!(code, "bad_params");
    }

    // Thu..Fri range with a Sundays-only pattern yields nothing, and
    // nothing may be persisted.
    let code = request_err(
        &mut stdin,
        &mut reader,
        "v4",
        "sessions.generate",
        json!({
            "courseId": &course_id,
            "weekdays": [0],
            "startTime": "09:00",
            "endTime": "10:00",
            "caller": admin(),
        }),
    );
    assert_eq!(code, "bad_params");
    let conn = Connection::open(workspace.join("coursebook.sqlite3")).expect("open db");
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM sessions WHERE course_id = ?",
            [&course_id],
            |r| r.get(0),
        )
        .expect("session count");
    assert_eq!(count, 0);
    let claims: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM session_generation WHERE course_id = ?",
            [&course_id],
            |r| r.get(0),
        )
        .expect("claim count");
    assert_eq!(claims, 0);

    // A course without a date range cannot generate.
    let (bare_course, _) = setup_course(&mut stdin, &mut reader, None, None);
    let code = request_err(
        &mut stdin,
        &mut reader,
        "v5",
        "sessions.generate",
        json!({
            "courseId": &bare_course,
            "weekdays": [1],
            "startTime": "09:00",
            "endTime": "10:00",
            "caller": admin(),
        }),
    );
    assert_eq!(code, "bad_params");

    // And an unknown course is not found.
    let code = request_err(
        &mut stdin,
        &mut reader,
        "v6",
        "sessions.generate",
        json!({
            "courseId": "nope",
            "weekdays": [1],
            "startTime": "09:00",
            "endTime": "10:00",
            "caller": admin(),
        }),
    );
    assert_eq!(code, "not_found");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
