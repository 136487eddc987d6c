use anyhow::Context;
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub const DB_FILE_NAME: &str = "groupimport.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace).with_context(|| {
        format!(
            "failed to create workspace {}",
            workspace.to_string_lossy()
        )
    })?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(&db_path)
        .with_context(|| format!("failed to open database {}", db_path.to_string_lossy()))?;
    init_schema(&conn)?;
    Ok(conn)
}

#[cfg(test)]
pub fn open_memory_db() -> anyhow::Result<Connection> {
    let conn = Connection::open_in_memory()?;
    init_schema(&conn)?;
    Ok(conn)
}

fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS courses(
            id TEXT PRIMARY KEY,
            shortname TEXT NOT NULL UNIQUE,
            fullname TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS users(
            id TEXT PRIMARY KEY,
            username TEXT NOT NULL UNIQUE,
            idnumber TEXT NOT NULL DEFAULT '',
            firstname TEXT NOT NULL DEFAULT '',
            lastname TEXT NOT NULL DEFAULT ''
        )",
        [],
    )?;
    // Workspaces created before user deletion existed have no deleted flag.
    ensure_users_deleted(conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_users_idnumber ON users(idnumber)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS enrolments(
            course_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            PRIMARY KEY(course_id, user_id),
            FOREIGN KEY(course_id) REFERENCES courses(id),
            FOREIGN KEY(user_id) REFERENCES users(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS course_groups(
            id TEXT PRIMARY KEY,
            course_id TEXT NOT NULL,
            name TEXT NOT NULL,
            idnumber TEXT NOT NULL DEFAULT '',
            description TEXT,
            enrolmentkey TEXT,
            enablemessaging INTEGER NOT NULL DEFAULT 0,
            picture TEXT,
            hidepicture INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(course_id) REFERENCES courses(id),
            UNIQUE(course_id, name)
        )",
        [],
    )?;
    // Empty idnumbers are "no idnumber" and may repeat.
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_groups_course_idnumber
         ON course_groups(course_id, idnumber) WHERE idnumber <> ''",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS groupings(
            id TEXT PRIMARY KEY,
            course_id TEXT NOT NULL,
            name TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(course_id) REFERENCES courses(id),
            UNIQUE(course_id, name)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS groupings_groups(
            grouping_id TEXT NOT NULL,
            group_id TEXT NOT NULL,
            added_at TEXT NOT NULL,
            PRIMARY KEY(grouping_id, group_id),
            FOREIGN KEY(grouping_id) REFERENCES groupings(id),
            FOREIGN KEY(group_id) REFERENCES course_groups(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_groupings_groups_group ON groupings_groups(group_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS group_members(
            group_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            added_at TEXT NOT NULL,
            PRIMARY KEY(group_id, user_id),
            FOREIGN KEY(group_id) REFERENCES course_groups(id),
            FOREIGN KEY(user_id) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_group_members_user ON group_members(user_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    Ok(())
}

fn ensure_users_deleted(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "users", "deleted")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE users ADD COLUMN deleted INTEGER NOT NULL DEFAULT 0",
        [],
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(s) => {
            let v = serde_json::from_str(&s)
                .with_context(|| format!("malformed settings value for {}", key))?;
            Ok(Some(v))
        }
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn settings_roundtrip_overwrites_previous_value() {
        let conn = open_memory_db().expect("db");
        assert!(settings_get_json(&conn, "setup.import").expect("get").is_none());
        settings_set_json(&conn, "setup.import", &json!({ "csvDelimiter": "tab" })).expect("set");
        settings_set_json(&conn, "setup.import", &json!({ "csvDelimiter": "colon" })).expect("set");
        let v = settings_get_json(&conn, "setup.import").expect("get").expect("value");
        assert_eq!(v["csvDelimiter"], "colon");
    }

    #[test]
    fn legacy_users_table_gains_deleted_column() {
        let conn = Connection::open_in_memory().expect("db");
        conn.execute(
            "CREATE TABLE users(
                id TEXT PRIMARY KEY,
                username TEXT NOT NULL UNIQUE,
                idnumber TEXT NOT NULL DEFAULT '',
                firstname TEXT NOT NULL DEFAULT '',
                lastname TEXT NOT NULL DEFAULT ''
            )",
            [],
        )
        .expect("legacy table");
        conn.execute(
            "INSERT INTO users(id, username) VALUES('u1', 'old')",
            [],
        )
        .expect("legacy row");

        init_schema(&conn).expect("migrate");
        assert!(table_has_column(&conn, "users", "deleted").expect("pragma"));
        let deleted: i64 = conn
            .query_row("SELECT deleted FROM users WHERE id = 'u1'", [], |r| r.get(0))
            .expect("row");
        assert_eq!(deleted, 0);
    }

    #[test]
    fn group_idnumber_unique_only_when_non_empty() {
        let conn = open_memory_db().expect("db");
        conn.execute("INSERT INTO courses(id, shortname, fullname) VALUES('c1', 'C1', 'Course')", [])
            .expect("course");
        let now = now_rfc3339();
        for (id, name) in [("g1", "A"), ("g2", "B")] {
            conn.execute(
                "INSERT INTO course_groups(id, course_id, name, idnumber, created_at, updated_at)
                 VALUES(?, 'c1', ?, '', ?, ?)",
                (id, name, &now, &now),
            )
            .expect("empty idnumbers may repeat");
        }
        conn.execute(
            "UPDATE course_groups SET idnumber = 'X' WHERE id = 'g1'",
            [],
        )
        .expect("set idnumber");
        let dup = conn.execute("UPDATE course_groups SET idnumber = 'X' WHERE id = 'g2'", []);
        assert!(dup.is_err());
    }
}
