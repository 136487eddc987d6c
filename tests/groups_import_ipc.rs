use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_groupimportd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn groupimportd");
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
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
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
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn request_err_code(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> String {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(false),
        "{} unexpectedly succeeded: {}",
        method,
        value
    );
    value
        .pointer("/error/code")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

fn row_codes(report: &serde_json::Value, index: usize) -> Vec<String> {
    report
        .pointer(&format!("/rows/{}/notifications", index))
        .and_then(|v| v.as_array())
        .map(|ns| {
            ns.iter()
                .filter_map(|n| n.get("code").and_then(|c| c.as_str()).map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

struct Course {
    id: String,
}

fn setup_course(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &std::path::Path,
) -> Course {
    let _ = request_ok(
        stdin,
        reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let course = request_ok(
        stdin,
        reader,
        "course",
        "courses.create",
        json!({ "shortname": "MATH101", "fullname": "Mathematics" }),
    );
    Course {
        id: course["courseId"].as_str().expect("courseId").to_string(),
    }
}

fn add_user(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    course_id: Option<&str>,
    username: &str,
    idnumber: &str,
) -> String {
    let created = request_ok(
        stdin,
        reader,
        &format!("user-{}", username),
        "users.create",
        json!({ "username": username, "idnumber": idnumber }),
    );
    let user_id = created["userId"].as_str().expect("userId").to_string();
    if let Some(course_id) = course_id {
        let _ = request_ok(
            stdin,
            reader,
            &format!("enrol-{}", username),
            "enrolments.add",
            json!({ "courseId": course_id, "userId": user_id }),
        );
    }
    user_id
}

#[test]
fn group_import_creates_members_and_groupings_and_reimport_is_idempotent() {
    let workspace = tempfile::tempdir().expect("temp dir");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let course = setup_course(&mut stdin, &mut reader, workspace.path());
    add_user(&mut stdin, &mut reader, Some(&course.id), "ada", "S1");
    add_user(&mut stdin, &mut reader, Some(&course.id), "bob", "S2");

    let csv = "groupname,groupidnumber,description,member,groupingname\n\
               Alpha,G-A,First group,ada,Term 1\n\
               Alpha,,,bob,Term 1\n\
               Beta,G-B,,ada,Term 1\n";

    let first = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "groups.import",
        json!({ "courseId": course.id, "text": csv }),
    );
    assert_eq!(first["rowsTotal"].as_u64(), Some(3));
    assert_eq!(first["lang"].as_str(), Some("en"));
    assert_eq!(first.pointer("/rows/0/line").and_then(|v| v.as_u64()), Some(2));
    assert_eq!(first.pointer("/rows/0/subject").and_then(|v| v.as_str()), Some("Alpha"));
    assert_eq!(
        row_codes(&first, 0),
        vec!["group_created", "membership_added", "grouping_created", "added_to_grouping"]
    );
    assert_eq!(
        row_codes(&first, 1),
        vec!["group_exists", "membership_added", "already_associated"]
    );
    assert_eq!(
        row_codes(&first, 2),
        vec!["group_created", "membership_added", "added_to_grouping"]
    );
    assert_eq!(
        first.get("created").cloned(),
        Some(json!({ "groups": 2, "groupings": 1, "memberships": 3, "associations": 2 }))
    );
    assert_eq!(
        first.pointer("/rows/0/notifications/0/level").and_then(|v| v.as_str()),
        Some("success")
    );

    let second = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "groups.import",
        json!({ "courseId": course.id, "text": csv }),
    );
    assert_eq!(
        second.get("created").cloned(),
        Some(json!({ "groups": 0, "groupings": 0, "memberships": 0, "associations": 0 }))
    );
    // Same name, same idnumber: no duplicate-idnumber warning on reimport.
    assert_eq!(
        row_codes(&second, 0),
        vec!["group_exists", "already_member", "already_associated"]
    );

    let groups = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "groups.list",
        json!({ "courseId": course.id }),
    );
    let list = groups["groups"].as_array().expect("groups");
    assert_eq!(list.len(), 2);
    assert_eq!(list[0]["name"].as_str(), Some("Alpha"));
    assert_eq!(list[0]["idnumber"].as_str(), Some("G-A"));
    assert_eq!(list[0]["description"].as_str(), Some("First group"));
    assert_eq!(list[0]["members"], json!(["ada", "bob"]));
    assert_eq!(list[1]["members"], json!(["ada"]));

    let groupings = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "groupings.list",
        json!({ "courseId": course.id }),
    );
    assert_eq!(
        groupings.pointer("/groupings/0/groups").cloned(),
        Some(json!(["Alpha", "Beta"]))
    );
}

#[test]
fn member_problems_are_row_warnings_not_batch_failures() {
    let workspace = tempfile::tempdir().expect("temp dir");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let course = setup_course(&mut stdin, &mut reader, workspace.path());
    add_user(&mut stdin, &mut reader, Some(&course.id), "ada", "S1");
    add_user(&mut stdin, &mut reader, Some(&course.id), "twin1", "X9");
    add_user(&mut stdin, &mut reader, Some(&course.id), "twin2", "X9");
    add_user(&mut stdin, &mut reader, None, "carl", "S3");

    let csv = "groupname,groupidnumber,idnumber\n\
               Alpha,G1,S1\n\
               Beta,G1,X9\n\
               Gamma,,S404\n\
               Delta,,S3\n";
    let report = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "groups.import",
        json!({ "courseId": course.id, "text": csv }),
    );

    assert_eq!(row_codes(&report, 0), vec!["group_created", "membership_added"]);
    assert_eq!(
        row_codes(&report, 1),
        vec!["duplicate_idnumber", "group_created", "ambiguous_user"]
    );
    assert_eq!(
        report.pointer("/rows/1/notifications/0/level").and_then(|v| v.as_str()),
        Some("warning")
    );
    let ambiguous = report
        .pointer("/rows/1/notifications/2/message")
        .and_then(|v| v.as_str())
        .expect("message");
    assert!(ambiguous.contains("'twin1'") && ambiguous.contains("'twin2'"), "{}", ambiguous);
    assert_eq!(row_codes(&report, 2), vec!["group_created", "user_not_found"]);
    assert_eq!(row_codes(&report, 3), vec!["group_created", "not_enrolled"]);
    assert_eq!(report.pointer("/created/groups").and_then(|v| v.as_u64()), Some(4));
    assert_eq!(report.pointer("/created/memberships").and_then(|v| v.as_u64()), Some(1));

    let groups = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "groups.list",
        json!({ "courseId": course.id }),
    );
    let beta = groups["groups"]
        .as_array()
        .expect("groups")
        .iter()
        .find(|g| g["name"] == "Beta")
        .cloned()
        .expect("Beta");
    assert_eq!(beta["idnumber"].as_str(), Some(""));
    assert_eq!(beta["members"], json!([]));
}

#[test]
fn deleted_users_are_not_matched() {
    let workspace = tempfile::tempdir().expect("temp dir");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let course = setup_course(&mut stdin, &mut reader, workspace.path());
    let gone = add_user(&mut stdin, &mut reader, Some(&course.id), "gone", "S7");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "del",
        "users.delete",
        json!({ "userId": gone }),
    );

    let report = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "groups.import",
        json!({ "courseId": course.id, "text": "groupname,member\nAlpha,gone\n" }),
    );
    assert_eq!(row_codes(&report, 0), vec!["group_created", "user_not_found"]);
}

#[test]
fn actor_capabilities_gate_creation_membership_and_idnumbers() {
    let workspace = tempfile::tempdir().expect("temp dir");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let course = setup_course(&mut stdin, &mut reader, workspace.path());
    add_user(&mut stdin, &mut reader, Some(&course.id), "ada", "S1");

    let csv = "groupname,groupidnumber,member\nAlpha,G1,ada\n";
    let denied = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "groups.import",
        json!({
            "courseId": course.id,
            "text": csv,
            "actor": { "username": "teacher", "lang": "fr", "canManageGroups": false }
        }),
    );
    assert_eq!(denied["lang"].as_str(), Some("fr"));
    assert_eq!(row_codes(&denied, 0), vec!["no_permission_for_creation"]);
    assert_eq!(
        denied.pointer("/rows/0/notifications/0/level").and_then(|v| v.as_str()),
        Some("error")
    );

    let limited = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "groups.import",
        json!({
            "courseId": course.id,
            "text": csv,
            "actor": { "canChangeIdnumber": false, "canManageMembers": false }
        }),
    );
    assert_eq!(row_codes(&limited, 0), vec!["group_created", "permission_denied"]);

    let groups = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "groups.list",
        json!({ "courseId": course.id }),
    );
    assert_eq!(groups.pointer("/groups/0/idnumber").and_then(|v| v.as_str()), Some(""));
    assert_eq!(groups.pointer("/groups/0/members").cloned(), Some(json!([])));

    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "4",
        "groups.import",
        json!({ "courseId": course.id, "text": csv, "actor": "admin" }),
    );
    assert_eq!(code, "bad_params");
}

#[test]
fn quoted_multiline_description_is_kept_whole() {
    let workspace = tempfile::tempdir().expect("temp dir");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let course = setup_course(&mut stdin, &mut reader, workspace.path());

    let csv = "groupname,description\nAlpha,\"line one\nline two\"\nBeta,plain\n";
    let report = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "groups.import",
        json!({ "courseId": course.id, "text": csv }),
    );
    assert_eq!(report["rowsTotal"].as_u64(), Some(2));
    assert_eq!(report.pointer("/rows/1/line").and_then(|v| v.as_u64()), Some(4));

    let groups = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "groups.list",
        json!({ "courseId": course.id }),
    );
    assert_eq!(
        groups.pointer("/groups/0/description").and_then(|v| v.as_str()),
        Some("line one\nline two")
    );
}
