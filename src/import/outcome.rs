use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Success,
    Warning,
    Error,
}

/// One row-level result. None of these stop the batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    NoPermissionForCreation {
        subject: String,
    },
    GroupCreated {
        group: String,
    },
    GroupExists {
        group: String,
    },
    DuplicateIdnumber {
        group: String,
        existing: String,
        idnumber: String,
    },
    GroupCreateFailed {
        group: String,
        reason: String,
    },
    UserNotFound {
        username: Option<String>,
        idnumber: Option<String>,
    },
    AmbiguousUser {
        idnumber: String,
        usernames: Vec<String>,
    },
    PermissionDenied {
        user: String,
        group: String,
    },
    AlreadyMember {
        user: String,
        group: String,
    },
    NotEnrolled {
        user: String,
    },
    MembershipAddFailed {
        user: String,
        group: String,
        reason: String,
    },
    MembershipAdded {
        user: String,
        group: String,
    },
    GroupingCreated {
        grouping: String,
    },
    GroupingExists {
        grouping: String,
    },
    GroupingCreateFailed {
        grouping: String,
        reason: String,
    },
    AddedToGrouping {
        group: String,
        grouping: String,
    },
    AlreadyAssociated {
        group: String,
        grouping: String,
    },
    AssociationFailed {
        group: String,
        grouping: String,
        reason: String,
    },
    RowFailed {
        reason: String,
    },
}

impl Outcome {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoPermissionForCreation { .. } => "no_permission_for_creation",
            Self::GroupCreated { .. } => "group_created",
            Self::GroupExists { .. } => "group_exists",
            Self::DuplicateIdnumber { .. } => "duplicate_idnumber",
            Self::GroupCreateFailed { .. } => "group_create_failed",
            Self::UserNotFound { .. } => "user_not_found",
            Self::AmbiguousUser { .. } => "ambiguous_user",
            Self::PermissionDenied { .. } => "permission_denied",
            Self::AlreadyMember { .. } => "already_member",
            Self::NotEnrolled { .. } => "not_enrolled",
            Self::MembershipAddFailed { .. } => "membership_add_failed",
            Self::MembershipAdded { .. } => "membership_added",
            Self::GroupingCreated { .. } => "grouping_created",
            Self::GroupingExists { .. } => "grouping_exists",
            Self::GroupingCreateFailed { .. } => "grouping_create_failed",
            Self::AddedToGrouping { .. } => "added_to_grouping",
            Self::AlreadyAssociated { .. } => "already_associated",
            Self::AssociationFailed { .. } => "association_failed",
            Self::RowFailed { .. } => "row_failed",
        }
    }

    pub fn level(&self) -> Level {
        match self {
            Self::GroupCreated { .. }
            | Self::GroupExists { .. }
            | Self::MembershipAdded { .. }
            | Self::GroupingCreated { .. }
            | Self::GroupingExists { .. }
            | Self::AddedToGrouping { .. }
            | Self::AlreadyAssociated { .. } => Level::Success,
            Self::DuplicateIdnumber { .. }
            | Self::UserNotFound { .. }
            | Self::AmbiguousUser { .. }
            | Self::AlreadyMember { .. }
            | Self::NotEnrolled { .. } => Level::Warning,
            Self::NoPermissionForCreation { .. }
            | Self::GroupCreateFailed { .. }
            | Self::PermissionDenied { .. }
            | Self::MembershipAddFailed { .. }
            | Self::GroupingCreateFailed { .. }
            | Self::AssociationFailed { .. }
            | Self::RowFailed { .. } => Level::Error,
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::NoPermissionForCreation { subject } => {
                format!("You do not have permission to create '{subject}' in this course")
            }
            Self::GroupCreated { group } => format!("Group '{group}' added"),
            Self::GroupExists { group } => format!("Group '{group}' already exists"),
            Self::DuplicateIdnumber {
                group,
                existing,
                idnumber,
            } => format!(
                "Group '{existing}' already uses ID number '{idnumber}'; '{group}' was created without it"
            ),
            Self::GroupCreateFailed { group, reason } => {
                format!("Group '{group}' could not be created: {reason}")
            }
            Self::UserNotFound {
                username: Some(u),
                idnumber: Some(i),
            } => format!("No user has both username '{u}' and ID number '{i}'; skipping"),
            Self::UserNotFound { username, idnumber } => format!(
                "User '{}' not found; skipping",
                username.as_deref().or(idnumber.as_deref()).unwrap_or("")
            ),
            Self::AmbiguousUser {
                idnumber,
                usernames,
            } => format!(
                "Several users match '{idnumber}': {}; nobody was added",
                usernames
                    .iter()
                    .map(|u| format!("'{u}'"))
                    .collect::<Vec<_>>()
                    .join(" ")
            ),
            Self::PermissionDenied { user, group } => {
                format!("You do not have permission to add '{user}' to '{group}'")
            }
            Self::AlreadyMember { user, group } => {
                format!("'{user}' is already a member of '{group}'")
            }
            Self::NotEnrolled { user } => format!("'{user}' is not enrolled in this course"),
            Self::MembershipAddFailed {
                user,
                group,
                reason,
            } => format!("Could not add '{user}' to '{group}': {reason}"),
            Self::MembershipAdded { user, group } => format!("'{user}' added to '{group}'"),
            Self::GroupingCreated { grouping } => format!("Grouping '{grouping}' added"),
            Self::GroupingExists { grouping } => format!("Grouping '{grouping}' already exists"),
            Self::GroupingCreateFailed { grouping, reason } => {
                format!("Grouping '{grouping}' could not be created: {reason}")
            }
            Self::AddedToGrouping { group, grouping } => {
                format!("Group '{group}' added to grouping '{grouping}'")
            }
            Self::AlreadyAssociated { group, grouping } => {
                format!("Group '{group}' is already in grouping '{grouping}'")
            }
            Self::AssociationFailed {
                group,
                grouping,
                reason,
            } => format!("Group '{group}' could not be added to grouping '{grouping}': {reason}"),
            Self::RowFailed { reason } => format!("Row could not be saved: {reason}"),
        }
    }

    pub fn notification(&self) -> Notification {
        Notification {
            code: self.code(),
            level: self.level(),
            message: self.message(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct Notification {
    pub code: &'static str,
    pub level: Level,
    pub message: String,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RowReport {
    pub line: usize,
    /// Group name for group imports, grouping name for grouping imports.
    pub subject: String,
    pub notifications: Vec<Notification>,
    #[serde(skip)]
    pub outcomes: Vec<Outcome>,
}

impl RowReport {
    pub fn new(line: usize, subject: &str, outcomes: Vec<Outcome>) -> Self {
        Self {
            line,
            subject: subject.to_string(),
            notifications: outcomes.iter().map(Outcome::notification).collect(),
            outcomes,
        }
    }

    #[cfg(test)]
    pub fn codes(&self) -> Vec<&'static str> {
        self.outcomes.iter().map(Outcome::code).collect()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CreatedCounts {
    pub groups: usize,
    pub groupings: usize,
    pub memberships: usize,
    pub associations: usize,
}

impl CreatedCounts {
    pub fn tally<'a>(outcomes: impl IntoIterator<Item = &'a Outcome>) -> Self {
        let mut c = Self::default();
        for o in outcomes {
            match o {
                Outcome::GroupCreated { .. } => c.groups += 1,
                Outcome::GroupingCreated { .. } => c.groupings += 1,
                Outcome::MembershipAdded { .. } => c.memberships += 1,
                Outcome::AddedToGrouping { .. } => c.associations += 1,
                _ => {}
            }
        }
        c
    }
}

/// The combined report handed back once the whole batch has run.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportReport {
    pub course_id: String,
    pub lang: String,
    pub rows_total: usize,
    pub created: CreatedCounts,
    pub rows: Vec<RowReport>,
}
