use super::courses::course_exists;
use crate::ipc::error::{err, get_required_str, ok, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;

fn require_course(conn: &Connection, req: &Request) -> Result<String, HandlerErr> {
    let course_id = get_required_str(&req.params, "courseId")?;
    match course_exists(conn, &course_id) {
        Ok(true) => Ok(course_id),
        Ok(false) => Err(HandlerErr::new("not_found", "course not found")),
        Err(e) => Err(HandlerErr::new("db_query_failed", e.to_string())),
    }
}

fn list_groups(conn: &Connection, course_id: &str) -> rusqlite::Result<Vec<serde_json::Value>> {
    let mut stmt = conn.prepare(
        "SELECT id, name, idnumber, description, enrolmentkey, enablemessaging, picture, hidepicture
         FROM course_groups
         WHERE course_id = ?
         ORDER BY name",
    )?;
    let groups = stmt
        .query_map([course_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, Option<String>>(3)?,
                r.get::<_, Option<String>>(4)?,
                r.get::<_, i64>(5)?,
                r.get::<_, Option<String>>(6)?,
                r.get::<_, i64>(7)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut members_stmt = conn.prepare(
        "SELECT u.username
         FROM group_members m
         JOIN users u ON u.id = m.user_id
         WHERE m.group_id = ?
         ORDER BY u.username",
    )?;

    let mut out = Vec::with_capacity(groups.len());
    for (id, name, idnumber, description, enrolmentkey, messaging, picture, hidepicture) in groups
    {
        let members = members_stmt
            .query_map([&id], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        out.push(json!({
            "id": id,
            "name": name,
            "idnumber": idnumber,
            "description": description,
            "enrolmentkey": enrolmentkey,
            "enablemessaging": messaging != 0,
            "picture": picture,
            "hidepicture": hidepicture != 0,
            "members": members
        }));
    }
    Ok(out)
}

fn list_groupings(conn: &Connection, course_id: &str) -> rusqlite::Result<Vec<serde_json::Value>> {
    let mut stmt = conn.prepare(
        "SELECT id, name FROM groupings WHERE course_id = ? ORDER BY name",
    )?;
    let groupings = stmt
        .query_map([course_id], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut groups_stmt = conn.prepare(
        "SELECT g.name
         FROM groupings_groups gg
         JOIN course_groups g ON g.id = gg.group_id
         WHERE gg.grouping_id = ?
         ORDER BY g.name",
    )?;

    let mut out = Vec::with_capacity(groupings.len());
    for (id, name) in groupings {
        let groups = groups_stmt
            .query_map([&id], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        out.push(json!({ "id": id, "name": name, "groups": groups }));
    }
    Ok(out)
}

fn handle_groups_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let course_id = match require_course(conn, req) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    match list_groups(conn, &course_id) {
        Ok(groups) => ok(&req.id, json!({ "courseId": course_id, "groups": groups })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_groupings_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let course_id = match require_course(conn, req) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    match list_groupings(conn, &course_id) {
        Ok(groupings) => ok(
            &req.id,
            json!({ "courseId": course_id, "groupings": groupings }),
        ),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "groups.list" => Some(handle_groups_list(state, req)),
        "groupings.list" => Some(handle_groupings_list(state, req)),
        _ => None,
    }
}
