//! Persistence operations the import reconciler needs, behind the `GroupStore`
//! trait. `SqliteStore` is the workspace implementation; uniqueness of group
//! names, group idnumbers and grouping names is enforced by the schema, and
//! a constraint hit surfaces as `StoreError::AlreadyExists`.

use crate::db;
use rusqlite::{ffi, Connection, ErrorCode, OptionalExtension};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} already exists")]
    AlreadyExists { entity: &'static str },
    #[error("user {user_id} is not enrolled in course {course_id}")]
    NotEnrolled { course_id: String, user_id: String },
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupRef {
    pub id: String,
    pub name: String,
    pub idnumber: String,
}

#[derive(Clone, Debug, Default)]
pub struct NewGroup {
    pub course_id: String,
    pub name: String,
    pub idnumber: Option<String>,
    pub description: Option<String>,
    pub enrolmentkey: Option<String>,
    pub enablemessaging: bool,
    pub picture: Option<String>,
    pub hidepicture: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserRef {
    pub id: String,
    pub username: String,
    pub idnumber: String,
}

/// Lookup keys for a member. Both present means both must match.
#[derive(Clone, Copy, Debug, Default)]
pub struct UserFilter<'a> {
    pub username: Option<&'a str>,
    pub idnumber: Option<&'a str>,
}

pub trait GroupStore {
    fn group_by_name(&self, course_id: &str, name: &str) -> StoreResult<Option<GroupRef>>;
    fn group_by_idnumber(&self, course_id: &str, idnumber: &str)
        -> StoreResult<Option<GroupRef>>;
    fn create_group(&self, group: &NewGroup) -> StoreResult<String>;

    fn grouping_by_name(&self, course_id: &str, name: &str) -> StoreResult<Option<String>>;
    fn create_grouping(&self, course_id: &str, name: &str) -> StoreResult<String>;
    /// Fails with `AlreadyExists` when the group is already in the grouping.
    fn assign_grouping(&self, grouping_id: &str, group_id: &str) -> StoreResult<()>;

    fn find_users(&self, filter: &UserFilter<'_>) -> StoreResult<Vec<UserRef>>;
    fn is_member(&self, group_id: &str, user_id: &str) -> StoreResult<bool>;
    /// Fails with `NotEnrolled` when the user is not enrolled in the group's course.
    fn add_member(&self, group_id: &str, user_id: &str) -> StoreResult<()>;
    fn is_enrolled(&self, course_id: &str, user_id: &str) -> StoreResult<bool>;

    /// Runs one import row. Implementations may wrap it in a transaction.
    fn in_row_scope<T>(&self, f: impl FnOnce(&Self) -> T) -> StoreResult<T>
    where
        Self: Sized,
    {
        Ok(f(self))
    }
}

pub struct SqliteStore<'c> {
    conn: &'c Connection,
}

impl<'c> SqliteStore<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }
}

/// Unique and primary-key hits only; a foreign-key failure is a real error.
fn is_duplicate_key(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _)
            if f.code == ErrorCode::ConstraintViolation
                && (f.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE
                    || f.extended_code == ffi::SQLITE_CONSTRAINT_PRIMARYKEY)
    )
}

fn map_insert_err(e: rusqlite::Error, entity: &'static str) -> StoreError {
    if is_duplicate_key(&e) {
        StoreError::AlreadyExists { entity }
    } else {
        StoreError::Db(e)
    }
}

fn non_empty(s: Option<&str>) -> Option<&str> {
    s.map(str::trim).filter(|s| !s.is_empty())
}

impl GroupStore for SqliteStore<'_> {
    fn group_by_name(&self, course_id: &str, name: &str) -> StoreResult<Option<GroupRef>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, name, idnumber FROM course_groups WHERE course_id = ? AND name = ?",
                (course_id, name),
                |r| {
                    Ok(GroupRef {
                        id: r.get(0)?,
                        name: r.get(1)?,
                        idnumber: r.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    fn group_by_idnumber(
        &self,
        course_id: &str,
        idnumber: &str,
    ) -> StoreResult<Option<GroupRef>> {
        if idnumber.is_empty() {
            return Ok(None);
        }
        let row = self
            .conn
            .query_row(
                "SELECT id, name, idnumber FROM course_groups WHERE course_id = ? AND idnumber = ?",
                (course_id, idnumber),
                |r| {
                    Ok(GroupRef {
                        id: r.get(0)?,
                        name: r.get(1)?,
                        idnumber: r.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    fn create_group(&self, group: &NewGroup) -> StoreResult<String> {
        let id = Uuid::new_v4().to_string();
        let now = db::now_rfc3339();
        self.conn
            .execute(
                "INSERT INTO course_groups(
                    id, course_id, name, idnumber, description, enrolmentkey,
                    enablemessaging, picture, hidepicture, created_at, updated_at
                 ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                rusqlite::params![
                    id,
                    group.course_id,
                    group.name,
                    non_empty(group.idnumber.as_deref()).unwrap_or(""),
                    non_empty(group.description.as_deref()),
                    non_empty(group.enrolmentkey.as_deref()),
                    group.enablemessaging as i64,
                    non_empty(group.picture.as_deref()),
                    group.hidepicture as i64,
                    now,
                    now,
                ],
            )
            .map_err(|e| map_insert_err(e, "group"))?;
        Ok(id)
    }

    fn grouping_by_name(&self, course_id: &str, name: &str) -> StoreResult<Option<String>> {
        let id = self
            .conn
            .query_row(
                "SELECT id FROM groupings WHERE course_id = ? AND name = ?",
                (course_id, name),
                |r| r.get(0),
            )
            .optional()?;
        Ok(id)
    }

    fn create_grouping(&self, course_id: &str, name: &str) -> StoreResult<String> {
        let id = Uuid::new_v4().to_string();
        self.conn
            .execute(
                "INSERT INTO groupings(id, course_id, name, created_at) VALUES(?, ?, ?, ?)",
                (&id, course_id, name, db::now_rfc3339()),
            )
            .map_err(|e| map_insert_err(e, "grouping"))?;
        Ok(id)
    }

    fn assign_grouping(&self, grouping_id: &str, group_id: &str) -> StoreResult<()> {
        self.conn
            .execute(
                "INSERT INTO groupings_groups(grouping_id, group_id, added_at) VALUES(?, ?, ?)",
                (grouping_id, group_id, db::now_rfc3339()),
            )
            .map_err(|e| map_insert_err(e, "grouping association"))?;
        Ok(())
    }

    fn find_users(&self, filter: &UserFilter<'_>) -> StoreResult<Vec<UserRef>> {
        let (sql, args): (&str, Vec<&str>) = match (
            non_empty(filter.username),
            non_empty(filter.idnumber),
        ) {
            (Some(u), Some(i)) => (
                "SELECT id, username, idnumber FROM users
                 WHERE username = ? AND idnumber = ? AND deleted = 0
                 ORDER BY username",
                vec![u, i],
            ),
            (Some(u), None) => (
                "SELECT id, username, idnumber FROM users
                 WHERE username = ? AND deleted = 0
                 ORDER BY username",
                vec![u],
            ),
            (None, Some(i)) => (
                "SELECT id, username, idnumber FROM users
                 WHERE idnumber = ? AND deleted = 0
                 ORDER BY username",
                vec![i],
            ),
            (None, None) => return Ok(Vec::new()),
        };
        let mut stmt = self.conn.prepare(sql)?;
        let users = stmt
            .query_map(rusqlite::params_from_iter(args), |r| {
                Ok(UserRef {
                    id: r.get(0)?,
                    username: r.get(1)?,
                    idnumber: r.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(users)
    }

    fn is_member(&self, group_id: &str, user_id: &str) -> StoreResult<bool> {
        let hit: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM group_members WHERE group_id = ? AND user_id = ?",
                (group_id, user_id),
                |r| r.get(0),
            )
            .optional()?;
        Ok(hit.is_some())
    }

    fn add_member(&self, group_id: &str, user_id: &str) -> StoreResult<()> {
        let course_id: Option<String> = self
            .conn
            .query_row(
                "SELECT course_id FROM course_groups WHERE id = ?",
                [group_id],
                |r| r.get(0),
            )
            .optional()?;
        let Some(course_id) = course_id else {
            return Err(StoreError::NotFound {
                entity: "group",
                id: group_id.to_string(),
            });
        };
        if !self.is_enrolled(&course_id, user_id)? {
            return Err(StoreError::NotEnrolled {
                course_id,
                user_id: user_id.to_string(),
            });
        }
        self.conn
            .execute(
                "INSERT INTO group_members(group_id, user_id, added_at) VALUES(?, ?, ?)",
                (group_id, user_id, db::now_rfc3339()),
            )
            .map_err(|e| map_insert_err(e, "group membership"))?;
        Ok(())
    }

    fn is_enrolled(&self, course_id: &str, user_id: &str) -> StoreResult<bool> {
        let hit: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM enrolments WHERE course_id = ? AND user_id = ?",
                (course_id, user_id),
                |r| r.get(0),
            )
            .optional()?;
        Ok(hit.is_some())
    }

    fn in_row_scope<T>(&self, f: impl FnOnce(&Self) -> T) -> StoreResult<T> {
        let tx = self.conn.unchecked_transaction()?;
        let out = f(self);
        // Earlier steps of a row stay committed even when a later step reported a failure.
        tx.commit()?;
        Ok(out)
    }
}
