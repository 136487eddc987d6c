use crate::ipc::error::{err, get_optional_str, get_required_str, ok};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use uuid::Uuid;

fn handle_users_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "users": [] }));
    };
    let include_deleted = req
        .params
        .get("includeDeleted")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let mut stmt = match conn.prepare(
        "SELECT id, username, idnumber, firstname, lastname, deleted
         FROM users
         WHERE deleted = 0 OR ?
         ORDER BY username",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([include_deleted], |r| {
            let id: String = r.get(0)?;
            let username: String = r.get(1)?;
            let idnumber: String = r.get(2)?;
            let firstname: String = r.get(3)?;
            let lastname: String = r.get(4)?;
            let deleted: i64 = r.get(5)?;
            Ok(json!({
                "id": id,
                "username": username,
                "idnumber": idnumber,
                "firstname": firstname,
                "lastname": lastname,
                "deleted": deleted != 0
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(users) => ok(&req.id, json!({ "users": users })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_users_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let username = match get_required_str(&req.params, "username") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let idnumber = get_optional_str(&req.params, "idnumber").unwrap_or_default();
    let firstname = get_optional_str(&req.params, "firstname").unwrap_or_default();
    let lastname = get_optional_str(&req.params, "lastname").unwrap_or_default();

    let user_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO users(id, username, idnumber, firstname, lastname) VALUES(?, ?, ?, ?, ?)",
        (&user_id, &username, &idnumber, &firstname, &lastname),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "users" })),
        );
    }

    ok(
        &req.id,
        json!({ "userId": user_id, "username": username, "idnumber": idnumber }),
    )
}

fn handle_users_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let user_id = match get_required_str(&req.params, "userId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    // Soft delete: the row stays so existing memberships keep their reference.
    match conn.execute("UPDATE users SET deleted = 1 WHERE id = ?", [&user_id]) {
        Ok(0) => err(&req.id, "not_found", "user not found", None),
        Ok(_) => ok(&req.id, json!({ "userId": user_id, "deleted": true })),
        Err(e) => err(&req.id, "db_update_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "users.list" => Some(handle_users_list(state, req)),
        "users.create" => Some(handle_users_create(state, req)),
        "users.delete" => Some(handle_users_delete(state, req)),
        _ => None,
    }
}
