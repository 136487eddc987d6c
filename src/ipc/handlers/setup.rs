use crate::db;
use crate::import::source::{encoding_for_label, Delimiter};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use anyhow::Context;
use encoding_rs::Encoding;
use serde_json::{json, Map, Value};

pub const MIN_UPLOAD_BYTES: i64 = 1024;
pub const MAX_UPLOAD_BYTES: i64 = 100 * 1024 * 1024;

#[derive(Clone, Copy)]
enum SetupSection {
    Import,
}

impl SetupSection {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "import" => Some(Self::Import),
            _ => None,
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Import => "setup.import",
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Import => "import",
        }
    }
}

fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::Import => json!({
            "csvDelimiter": "comma",
            "defaultEncoding": "UTF-8",
            "maxUploadBytes": 10 * 1024 * 1024
        }),
    }
}

/// Effective import settings, defaults overlaid with whatever the workspace saved.
#[derive(Clone, Copy, Debug)]
pub struct ImportSettings {
    pub csv_delimiter: Delimiter,
    pub default_encoding: &'static Encoding,
    pub max_upload_bytes: usize,
}

fn as_object_mut(value: &mut Value) -> Result<&mut Map<String, Value>, String> {
    value
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v
        .as_i64()
        .ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn parse_string_max(v: &Value, key: &str, max_len: usize) -> Result<String, String> {
    let s = v.as_str().ok_or_else(|| format!("{} must be string", key))?;
    let s = s.trim();
    if s.len() > max_len {
        return Err(format!("{} length must be <= {}", key, max_len));
    }
    Ok(s.to_string())
}

fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = as_object_mut(current)?;
    for (k, v) in patch {
        match section {
            SetupSection::Import => match k.as_str() {
                "csvDelimiter" => {
                    let s = parse_string_max(v, k, 16)?;
                    // `cfg` would point back at this very setting.
                    match Delimiter::parse(&s) {
                        Some(d) if d != Delimiter::Cfg => {
                            obj.insert(k.clone(), Value::String(d.name().to_string()));
                        }
                        _ => {
                            return Err(
                                "csvDelimiter must be one of: comma, semicolon, tab, colon".into(),
                            )
                        }
                    }
                }
                "defaultEncoding" => {
                    let s = parse_string_max(v, k, 40)?;
                    let enc = encoding_for_label(&s).map_err(|e| e.to_string())?;
                    obj.insert(k.clone(), Value::String(enc.name().to_string()));
                }
                "maxUploadBytes" => {
                    obj.insert(
                        k.clone(),
                        Value::from(parse_i64_range(v, k, MIN_UPLOAD_BYTES, MAX_UPLOAD_BYTES)?),
                    );
                }
                _ => return Err(format!("unknown {} field: {}", section.name(), k)),
            },
        }
    }
    Ok(())
}

fn load_section(conn: &rusqlite::Connection, section: SetupSection) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // Best-effort apply: a stale saved value falls back to its default.
            let _ = merge_section_patch(section, &mut current, saved_obj);
        }
    }
    Ok(current)
}

pub fn load_import_settings(conn: &rusqlite::Connection) -> anyhow::Result<ImportSettings> {
    let section = load_section(conn, SetupSection::Import)?;
    let csv_delimiter = section
        .get("csvDelimiter")
        .and_then(|v| v.as_str())
        .and_then(Delimiter::parse)
        .unwrap_or(Delimiter::Comma);
    let label = section
        .get("defaultEncoding")
        .and_then(|v| v.as_str())
        .unwrap_or("UTF-8");
    let default_encoding =
        encoding_for_label(label).with_context(|| format!("saved encoding {label}"))?;
    let max_upload_bytes = section
        .get("maxUploadBytes")
        .and_then(|v| v.as_u64())
        .context("maxUploadBytes missing from import settings")?;
    Ok(ImportSettings {
        csv_delimiter,
        default_encoding,
        max_upload_bytes: max_upload_bytes as usize,
    })
}

fn handle_setup_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let import = match load_section(conn, SetupSection::Import) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    ok(&req.id, json!({ "import": import }))
}

fn handle_setup_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(section_raw) = req.params.get("section").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing section", None);
    };
    let Some(section) = SetupSection::parse(section_raw) else {
        return err(&req.id, "bad_params", "unknown section", None);
    };
    let Some(patch_obj) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let mut current = match load_section(conn, section) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Err(msg) = merge_section_patch(section, &mut current, patch_obj) {
        return err(&req.id, "bad_params", msg, None);
    }
    if let Err(e) = db::settings_set_json(conn, section.key(), &current) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    tracing::info!(section = section.name(), "settings updated");
    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.get" => Some(handle_setup_get(state, req)),
        "setup.update" => Some(handle_setup_update(state, req)),
        _ => None,
    }
}
