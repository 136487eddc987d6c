//! Row-by-row reconciliation of an uploaded group or grouping list against
//! the workspace: find-or-create the group, resolve and add the member,
//! find-or-create the grouping and attach the group to it.
//!
//! Nothing in here aborts the batch. Every problem becomes an `Outcome` on the
//! row that caused it and the next row is processed.

use super::fields::{ImportField, ImportRow};
use super::outcome::{CreatedCounts, ImportReport, Outcome, RowReport};
use crate::store::{GroupStore, NewGroup, StoreError, UserFilter};
use tracing::{debug, info, warn};

/// Who is importing. Passed in explicitly on every call.
#[derive(Clone, Debug)]
pub struct Actor {
    pub username: String,
    pub lang: String,
    pub can_manage_groups: bool,
    pub can_change_idnumber: bool,
    pub can_manage_members: bool,
}

impl Default for Actor {
    fn default() -> Self {
        Self {
            username: String::new(),
            lang: "en".to_string(),
            can_manage_groups: true,
            can_change_idnumber: true,
            can_manage_members: true,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ImportContext<'a> {
    pub course_id: &'a str,
    pub actor: &'a Actor,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GroupResolution {
    Created(String),
    Reused(String),
    Failed,
}

impl GroupResolution {
    pub fn group_id(&self) -> Option<&str> {
        match self {
            Self::Created(id) | Self::Reused(id) => Some(id),
            Self::Failed => None,
        }
    }
}

fn parse_boolish(s: Option<&str>) -> bool {
    matches!(
        s.map(|v| v.trim().to_ascii_lowercase()).as_deref(),
        Some("1" | "true" | "yes" | "y")
    )
}

fn new_group_from_row(course_id: &str, name: &str, row: &ImportRow) -> NewGroup {
    NewGroup {
        course_id: course_id.to_string(),
        name: name.to_string(),
        idnumber: row.value(ImportField::GroupIdNumber).map(str::to_string),
        description: row.value(ImportField::Description).map(str::to_string),
        enrolmentkey: row.value(ImportField::EnrolmentKey).map(str::to_string),
        enablemessaging: parse_boolish(row.value(ImportField::EnableMessaging)),
        picture: row.value(ImportField::Picture).map(str::to_string),
        hidepicture: parse_boolish(row.value(ImportField::HidePicture)),
    }
}

/// Finds the group by name or creates it. An idnumber already used by a
/// different group is dropped with a warning rather than failing the row.
pub fn resolve_group<S: GroupStore>(
    store: &S,
    actor: &Actor,
    mut group: NewGroup,
    out: &mut Vec<Outcome>,
) -> GroupResolution {
    if !actor.can_change_idnumber {
        group.idnumber = None;
    }

    if let Some(idnumber) = group.idnumber.clone() {
        match store.group_by_idnumber(&group.course_id, &idnumber) {
            Ok(Some(existing)) if existing.name != group.name => {
                out.push(Outcome::DuplicateIdnumber {
                    group: group.name.clone(),
                    existing: existing.name,
                    idnumber,
                });
                group.idnumber = None;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(group = %group.name, error = %e, "idnumber lookup failed");
                out.push(Outcome::GroupCreateFailed {
                    group: group.name.clone(),
                    reason: e.to_string(),
                });
                return GroupResolution::Failed;
            }
        }
    }

    match store.group_by_name(&group.course_id, &group.name) {
        Ok(Some(existing)) => {
            out.push(Outcome::GroupExists {
                group: group.name.clone(),
            });
            return GroupResolution::Reused(existing.id);
        }
        Ok(None) => {}
        Err(e) => {
            warn!(group = %group.name, error = %e, "group lookup failed");
            out.push(Outcome::GroupCreateFailed {
                group: group.name.clone(),
                reason: e.to_string(),
            });
            return GroupResolution::Failed;
        }
    }

    match store.create_group(&group) {
        Ok(id) => group_created(group, id, out),
        Err(StoreError::AlreadyExists { .. }) => {
            // Lost a race with another writer; whoever won owns the name now.
            if let Ok(Some(existing)) = store.group_by_name(&group.course_id, &group.name) {
                out.push(Outcome::GroupExists {
                    group: group.name.clone(),
                });
                return GroupResolution::Reused(existing.id);
            }
            // Or the idnumber was taken since it was checked: drop it and try once more.
            if let Some(idnumber) = group.idnumber.take() {
                if let Ok(Some(existing)) = store.group_by_idnumber(&group.course_id, &idnumber) {
                    out.push(Outcome::DuplicateIdnumber {
                        group: group.name.clone(),
                        existing: existing.name,
                        idnumber,
                    });
                    match store.create_group(&group) {
                        Ok(id) => return group_created(group, id, out),
                        Err(StoreError::AlreadyExists { .. }) => {}
                        Err(e) => return group_create_failed(group, e.to_string(), out),
                    }
                }
            }
            group_create_failed(group, "a conflicting group already exists".to_string(), out)
        }
        Err(e) => {
            warn!(group = %group.name, error = %e, "group create failed");
            group_create_failed(group, e.to_string(), out)
        }
    }
}

fn group_created(group: NewGroup, id: String, out: &mut Vec<Outcome>) -> GroupResolution {
    debug!(group = %group.name, group_id = %id, "group created");
    out.push(Outcome::GroupCreated { group: group.name });
    GroupResolution::Created(id)
}

fn group_create_failed(group: NewGroup, reason: String, out: &mut Vec<Outcome>) -> GroupResolution {
    out.push(Outcome::GroupCreateFailed {
        group: group.name,
        reason,
    });
    GroupResolution::Failed
}

/// Resolves the row's member and adds them to the group.
pub fn resolve_membership<S: GroupStore>(
    store: &S,
    actor: &Actor,
    group_id: &str,
    group_name: &str,
    username: Option<&str>,
    idnumber: Option<&str>,
    out: &mut Vec<Outcome>,
) {
    let filter = UserFilter { username, idnumber };
    let users = match store.find_users(&filter) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "user lookup failed");
            out.push(Outcome::MembershipAddFailed {
                user: username.or(idnumber).unwrap_or_default().to_string(),
                group: group_name.to_string(),
                reason: e.to_string(),
            });
            return;
        }
    };

    let user = match users.as_slice() {
        [] => {
            out.push(Outcome::UserNotFound {
                username: username.map(str::to_string),
                idnumber: idnumber.map(str::to_string),
            });
            return;
        }
        [one] => one,
        many => {
            out.push(Outcome::AmbiguousUser {
                idnumber: idnumber
                    .or(username)
                    .map(str::to_string)
                    .unwrap_or_else(|| many[0].idnumber.clone()),
                usernames: many.iter().map(|u| u.username.clone()).collect(),
            });
            return;
        }
    };

    if !actor.can_manage_members {
        out.push(Outcome::PermissionDenied {
            user: user.username.clone(),
            group: group_name.to_string(),
        });
        return;
    }

    let already = Outcome::AlreadyMember {
        user: user.username.clone(),
        group: group_name.to_string(),
    };
    match store.is_member(group_id, &user.id) {
        Ok(true) => {
            out.push(already);
            return;
        }
        Ok(false) => {}
        Err(e) => {
            out.push(Outcome::MembershipAddFailed {
                user: user.username.clone(),
                group: group_name.to_string(),
                reason: e.to_string(),
            });
            return;
        }
    }

    match store.add_member(group_id, &user.id) {
        Ok(()) => out.push(Outcome::MembershipAdded {
            user: user.username.clone(),
            group: group_name.to_string(),
        }),
        Err(StoreError::NotEnrolled { .. }) => out.push(Outcome::NotEnrolled {
            user: user.username.clone(),
        }),
        Err(StoreError::AlreadyExists { .. }) => out.push(already),
        Err(e) => {
            warn!(user = %user.username, group = %group_name, error = %e, "membership add failed");
            out.push(Outcome::MembershipAddFailed {
                user: user.username.clone(),
                group: group_name.to_string(),
                reason: e.to_string(),
            });
        }
    }
}

/// Finds or creates the grouping. `report_existing` adds a success line when it was found.
pub fn resolve_grouping<S: GroupStore>(
    store: &S,
    course_id: &str,
    name: &str,
    report_existing: bool,
    out: &mut Vec<Outcome>,
) -> Option<String> {
    let found = |out: &mut Vec<Outcome>, id: String| {
        if report_existing {
            out.push(Outcome::GroupingExists {
                grouping: name.to_string(),
            });
        }
        Some(id)
    };

    match store.grouping_by_name(course_id, name) {
        Ok(Some(id)) => return found(out, id),
        Ok(None) => {}
        Err(e) => {
            out.push(Outcome::GroupingCreateFailed {
                grouping: name.to_string(),
                reason: e.to_string(),
            });
            return None;
        }
    }

    match store.create_grouping(course_id, name) {
        Ok(id) => {
            out.push(Outcome::GroupingCreated {
                grouping: name.to_string(),
            });
            Some(id)
        }
        Err(StoreError::AlreadyExists { .. }) => match store.grouping_by_name(course_id, name) {
            Ok(Some(id)) => found(out, id),
            _ => {
                out.push(Outcome::GroupingCreateFailed {
                    grouping: name.to_string(),
                    reason: "a conflicting grouping already exists".to_string(),
                });
                None
            }
        },
        Err(e) => {
            warn!(grouping = %name, error = %e, "grouping create failed");
            out.push(Outcome::GroupingCreateFailed {
                grouping: name.to_string(),
                reason: e.to_string(),
            });
            None
        }
    }
}

pub fn attach_to_grouping<S: GroupStore>(
    store: &S,
    grouping_id: &str,
    grouping_name: &str,
    group_id: &str,
    group_name: &str,
    out: &mut Vec<Outcome>,
) {
    match store.assign_grouping(grouping_id, group_id) {
        Ok(()) => out.push(Outcome::AddedToGrouping {
            group: group_name.to_string(),
            grouping: grouping_name.to_string(),
        }),
        Err(StoreError::AlreadyExists { .. }) => out.push(Outcome::AlreadyAssociated {
            group: group_name.to_string(),
            grouping: grouping_name.to_string(),
        }),
        Err(e) => {
            warn!(group = %group_name, grouping = %grouping_name, error = %e, "grouping assign failed");
            out.push(Outcome::AssociationFailed {
                group: group_name.to_string(),
                grouping: grouping_name.to_string(),
                reason: e.to_string(),
            });
        }
    }
}

fn reconcile_group_row<S: GroupStore>(store: &S, ctx: &ImportContext<'_>, row: &ImportRow) -> Vec<Outcome> {
    let mut out = Vec::new();
    let name = row.value(ImportField::GroupName).unwrap_or_default();

    if !ctx.actor.can_manage_groups {
        out.push(Outcome::NoPermissionForCreation {
            subject: name.to_string(),
        });
        return out;
    }

    let group = new_group_from_row(ctx.course_id, name, row);
    let resolution = resolve_group(store, ctx.actor, group, &mut out);
    let Some(group_id) = resolution.group_id() else {
        return out;
    };

    let username = row.value(ImportField::Member);
    let idnumber = row.value(ImportField::IdNumber);
    if username.is_some() || idnumber.is_some() {
        resolve_membership(store, ctx.actor, group_id, name, username, idnumber, &mut out);
    }

    if let Some(grouping) = row.value(ImportField::GroupingName) {
        if let Some(grouping_id) = resolve_grouping(store, ctx.course_id, grouping, false, &mut out) {
            attach_to_grouping(store, &grouping_id, grouping, group_id, name, &mut out);
        }
    }
    out
}

fn reconcile_grouping_row<S: GroupStore>(
    store: &S,
    ctx: &ImportContext<'_>,
    row: &ImportRow,
) -> Vec<Outcome> {
    let mut out = Vec::new();
    let grouping = row.value(ImportField::Grouping).unwrap_or_default();

    if !ctx.actor.can_manage_groups {
        out.push(Outcome::NoPermissionForCreation {
            subject: grouping.to_string(),
        });
        return out;
    }

    let Some(grouping_id) = resolve_grouping(store, ctx.course_id, grouping, true, &mut out) else {
        return out;
    };

    if let Some(group_name) = row.value(ImportField::GroupName) {
        let group = NewGroup {
            course_id: ctx.course_id.to_string(),
            name: group_name.to_string(),
            ..Default::default()
        };
        if let Some(group_id) = resolve_group(store, ctx.actor, group, &mut out).group_id() {
            attach_to_grouping(store, &grouping_id, grouping, group_id, group_name, &mut out);
        }
    }
    out
}

fn run_batch<S, F>(
    store: &S,
    ctx: &ImportContext<'_>,
    rows: &[ImportRow],
    subject_field: ImportField,
    reconcile_row: F,
) -> ImportReport
where
    S: GroupStore,
    F: Fn(&S, &ImportContext<'_>, &ImportRow) -> Vec<Outcome>,
{
    let mut reports = Vec::with_capacity(rows.len());
    for row in rows {
        let subject = row.value(subject_field).unwrap_or_default();
        debug!(course_id = %ctx.course_id, line = row.line, subject = %subject, "reconciling row");
        let outcomes = match store.in_row_scope(|s| reconcile_row(s, ctx, row)) {
            Ok(v) => v,
            Err(e) => {
                warn!(line = row.line, error = %e, "row transaction failed");
                vec![Outcome::RowFailed {
                    reason: e.to_string(),
                }]
            }
        };
        reports.push(RowReport::new(row.line, subject, outcomes));
    }

    let created = CreatedCounts::tally(reports.iter().flat_map(|r| r.outcomes.iter()));
    info!(
        course_id = %ctx.course_id,
        actor = %ctx.actor.username,
        rows = rows.len(),
        groups = created.groups,
        groupings = created.groupings,
        memberships = created.memberships,
        associations = created.associations,
        "import finished"
    );
    ImportReport {
        course_id: ctx.course_id.to_string(),
        lang: ctx.actor.lang.clone(),
        rows_total: rows.len(),
        created,
        rows: reports,
    }
}

/// Group upload: one group per row, optionally with a member and a grouping.
pub fn import_groups<S: GroupStore>(store: &S, ctx: &ImportContext<'_>, rows: &[ImportRow]) -> ImportReport {
    run_batch(store, ctx, rows, ImportField::GroupName, reconcile_group_row)
}

/// Grouping upload: one grouping per row, optionally with a group to put in it.
pub fn import_groupings<S: GroupStore>(
    store: &S,
    ctx: &ImportContext<'_>,
    rows: &[ImportRow],
) -> ImportReport {
    run_batch(store, ctx, rows, ImportField::Grouping, reconcile_grouping_row)
}
