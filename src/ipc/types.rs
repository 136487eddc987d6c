use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

/// One stdin line. `params` defaults to `null` when omitted.
#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// State kept between requests. There is no database until `workspace.select`.
#[derive(Default)]
pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
}

impl AppState {
    /// Switches to another workspace; the previous connection is dropped.
    pub fn open_workspace(&mut self, path: PathBuf, conn: Connection) {
        self.workspace = Some(path);
        self.db = Some(conn);
    }
}
