use super::courses::course_exists;
use super::setup::{load_import_settings, ImportSettings};
use crate::import::fields::{normalize, HeaderMap, ImportRow};
use crate::import::reconcile::{import_groupings, import_groups, Actor, ImportContext};
use crate::import::source::{self, encoding_for_label, Delimiter};
use crate::import::{ImportError, ImportKind};
use crate::ipc::error::{err, get_optional_str, get_required_str, ok, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::store::SqliteStore;
use rusqlite::Connection;
use serde_json::{json, Map, Value};
use tracing::info;

const PREVIEW_ROWS: usize = 20;

struct PreparedImport {
    course_id: String,
    header: HeaderMap,
    rows: Vec<ImportRow>,
}

fn parse_actor(params: &Value) -> Result<Actor, HandlerErr> {
    let mut actor = Actor::default();
    let Some(raw) = params.get("actor") else {
        return Ok(actor);
    };
    if raw.is_null() {
        return Ok(actor);
    }
    let Some(obj) = raw.as_object() else {
        return Err(HandlerErr::new("bad_params", "actor must be an object"));
    };
    if let Some(u) = obj.get("username").and_then(|v| v.as_str()) {
        actor.username = u.trim().to_string();
    }
    if let Some(l) = obj.get("lang").and_then(|v| v.as_str()) {
        if !l.trim().is_empty() {
            actor.lang = l.trim().to_string();
        }
    }
    for (key, slot) in [
        ("canManageGroups", &mut actor.can_manage_groups),
        ("canChangeIdnumber", &mut actor.can_change_idnumber),
        ("canManageMembers", &mut actor.can_manage_members),
    ] {
        match obj.get(key) {
            None | Some(Value::Null) => {}
            Some(Value::Bool(b)) => *slot = *b,
            Some(_) => {
                return Err(HandlerErr::new(
                    "bad_params",
                    format!("actor.{} must be boolean", key),
                ))
            }
        }
    }
    Ok(actor)
}

/// Raw upload bytes plus the encoding they are in. Inline `text` arrived as
/// a JSON string and is always UTF-8; `encoding` only applies to `inPath`.
fn read_upload(
    params: &Value,
    settings: &ImportSettings,
) -> Result<(Vec<u8>, &'static encoding_rs::Encoding), HandlerErr> {
    if let Some(text) = params.get("text").and_then(|v| v.as_str()) {
        return Ok((text.as_bytes().to_vec(), encoding_rs::UTF_8));
    }
    let Some(path) = get_optional_str(params, "inPath") else {
        return Err(HandlerErr::new("bad_params", "missing text or inPath"));
    };
    let encoding = match get_optional_str(params, "encoding") {
        Some(label) => encoding_for_label(&label)?,
        None => settings.default_encoding,
    };
    if let Ok(meta) = std::fs::metadata(&path) {
        if meta.len() as usize > settings.max_upload_bytes {
            return Err(ImportError::UploadTooLarge {
                size: meta.len() as usize,
                max: settings.max_upload_bytes,
            }
            .into());
        }
    }
    let bytes = std::fs::read(&path).map_err(|e| HandlerErr {
        code: "csv_file_error",
        message: format!("failed to read {}: {}", path, e),
        details: Some(json!({ "path": path })),
    })?;
    Ok((bytes, encoding))
}

fn resolve_delimiter(params: &Value, settings: &ImportSettings) -> Result<char, HandlerErr> {
    let delimiter = match get_optional_str(params, "delimiter") {
        Some(raw) => Delimiter::parse(&raw).ok_or(ImportError::UnknownDelimiter(raw))?,
        None => Delimiter::Cfg,
    };
    Ok(delimiter.resolve(settings.csv_delimiter))
}

/// Everything up to and including header normalization. Any failure here is
/// fatal and happens before the store is touched.
fn prepare(conn: &Connection, params: &Value, kind: ImportKind) -> Result<PreparedImport, HandlerErr> {
    let course_id = get_required_str(params, "courseId")?;
    match course_exists(conn, &course_id) {
        Ok(true) => {}
        Ok(false) => return Err(HandlerErr::new("not_found", "course not found")),
        Err(e) => return Err(HandlerErr::new("db_query_failed", e.to_string())),
    }
    let settings = load_import_settings(conn)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;

    let delimiter = resolve_delimiter(params, &settings)?;
    let (bytes, encoding) = read_upload(params, &settings)?;
    let table = source::load(&bytes, encoding, delimiter, settings.max_upload_bytes)?;
    let (header, rows) = normalize(kind, &table)?;
    Ok(PreparedImport {
        course_id,
        header,
        rows,
    })
}

fn preview_json(prepared: &PreparedImport) -> Value {
    let header: Vec<Value> = prepared
        .header
        .columns
        .iter()
        .map(|(raw, field)| json!({ "raw": raw, "field": field.name() }))
        .collect();
    let sample: Vec<Value> = prepared
        .rows
        .iter()
        .take(PREVIEW_ROWS)
        .map(|row| {
            let mut values = Map::new();
            for (field, value) in row.fields() {
                values.insert(field.name().to_string(), Value::String(value.to_string()));
            }
            json!({ "line": row.line, "values": values })
        })
        .collect();
    json!({
        "courseId": prepared.course_id,
        "header": header,
        "rowsTotal": prepared.rows.len(),
        "rows": sample
    })
}

fn handle_preview(state: &mut AppState, req: &Request, kind: ImportKind) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match prepare(conn, &req.params, kind) {
        Ok(prepared) => ok(&req.id, preview_json(&prepared)),
        Err(e) => e.response(&req.id),
    }
}

fn handle_apply(state: &mut AppState, req: &Request, kind: ImportKind) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let actor = match parse_actor(&req.params) {
        Ok(a) => a,
        Err(e) => return e.response(&req.id),
    };
    let prepared = match prepare(conn, &req.params, kind) {
        Ok(p) => p,
        Err(e) => return e.response(&req.id),
    };
    info!(
        course_id = %prepared.course_id,
        kind = ?kind,
        rows = prepared.rows.len(),
        "import started"
    );

    let store = SqliteStore::new(conn);
    let ctx = ImportContext {
        course_id: &prepared.course_id,
        actor: &actor,
    };
    let report = match kind {
        ImportKind::Groups => import_groups(&store, &ctx, &prepared.rows),
        ImportKind::Groupings => import_groupings(&store, &ctx, &prepared.rows),
    };
    match serde_json::to_value(&report) {
        Ok(v) => ok(&req.id, v),
        Err(e) => err(&req.id, "internal", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "groups.import.preview" => Some(handle_preview(state, req, ImportKind::Groups)),
        "groups.import" => Some(handle_apply(state, req, ImportKind::Groups)),
        "groupings.import.preview" => Some(handle_preview(state, req, ImportKind::Groupings)),
        "groupings.import" => Some(handle_apply(state, req, ImportKind::Groupings)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actor_defaults_to_full_capabilities() {
        let a = parse_actor(&json!({})).expect("actor");
        assert!(a.can_manage_groups && a.can_change_idnumber && a.can_manage_members);
        assert_eq!(a.lang, "en");
    }

    #[test]
    fn actor_flags_and_language_are_read() {
        let a = parse_actor(&json!({
            "actor": { "username": "teacher1", "lang": "fr", "canManageMembers": false }
        }))
        .expect("actor");
        assert_eq!(a.username, "teacher1");
        assert_eq!(a.lang, "fr");
        assert!(a.can_manage_groups);
        assert!(!a.can_manage_members);
        assert!(parse_actor(&json!({ "actor": { "canManageGroups": "no" } })).is_err());
    }

    #[test]
    fn unknown_delimiter_is_bad_params() {
        let settings = ImportSettings {
            csv_delimiter: Delimiter::Semicolon,
            default_encoding: encoding_rs::UTF_8,
            max_upload_bytes: 1024,
        };
        assert_eq!(resolve_delimiter(&json!({}), &settings).ok(), Some(';'));
        assert_eq!(
            resolve_delimiter(&json!({ "delimiter": "tab" }), &settings).ok(),
            Some('\t')
        );
        let e = resolve_delimiter(&json!({ "delimiter": "pipe" }), &settings).unwrap_err();
        assert_eq!(e.code, "bad_params");
    }
}
