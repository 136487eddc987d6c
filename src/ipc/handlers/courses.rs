use crate::ipc::error::{err, get_optional_str, get_required_str, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

pub(crate) fn course_exists(conn: &Connection, course_id: &str) -> rusqlite::Result<bool> {
    let hit: Option<i64> = conn
        .query_row("SELECT 1 FROM courses WHERE id = ?", [course_id], |r| {
            r.get(0)
        })
        .optional()?;
    Ok(hit.is_some())
}

fn handle_courses_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "courses": [] }));
    };

    // Correlated subqueries keep the counts independent of each other.
    let mut stmt = match conn.prepare(
        "SELECT
           c.id,
           c.shortname,
           c.fullname,
           (SELECT COUNT(*) FROM course_groups g WHERE g.course_id = c.id) AS group_count,
           (SELECT COUNT(*) FROM groupings gg WHERE gg.course_id = c.id) AS grouping_count,
           (SELECT COUNT(*) FROM enrolments e WHERE e.course_id = c.id) AS enrolled_count
         FROM courses c
         ORDER BY c.shortname",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let shortname: String = row.get(1)?;
            let fullname: String = row.get(2)?;
            let group_count: i64 = row.get(3)?;
            let grouping_count: i64 = row.get(4)?;
            let enrolled_count: i64 = row.get(5)?;
            Ok(json!({
                "id": id,
                "shortname": shortname,
                "fullname": fullname,
                "groupCount": group_count,
                "groupingCount": grouping_count,
                "enrolledCount": enrolled_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(courses) => ok(&req.id, json!({ "courses": courses })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_courses_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let shortname = match get_required_str(&req.params, "shortname") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let fullname = get_optional_str(&req.params, "fullname").unwrap_or_else(|| shortname.clone());

    let course_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO courses(id, shortname, fullname) VALUES(?, ?, ?)",
        (&course_id, &shortname, &fullname),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "courses" })),
        );
    }

    ok(
        &req.id,
        json!({ "courseId": course_id, "shortname": shortname, "fullname": fullname }),
    )
}

fn handle_enrolments_add(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let course_id = match get_required_str(&req.params, "courseId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let user_id = match get_required_str(&req.params, "userId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    match course_exists(conn, &course_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "course not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    // Re-enrolling is a no-op.
    match conn.execute(
        "INSERT OR IGNORE INTO enrolments(course_id, user_id) VALUES(?, ?)",
        (&course_id, &user_id),
    ) {
        Ok(n) => ok(
            &req.id,
            json!({ "courseId": course_id, "userId": user_id, "added": n > 0 }),
        ),
        Err(e) => err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "enrolments" })),
        ),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "courses.list" => Some(handle_courses_list(state, req)),
        "courses.create" => Some(handle_courses_create(state, req)),
        "enrolments.add" => Some(handle_enrolments_add(state, req)),
        _ => None,
    }
}
