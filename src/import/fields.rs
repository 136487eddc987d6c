//! Header normalization: maps uploaded column labels onto the closed set of
//! canonical import fields and turns raw rows into `ImportRow`s.
//!
//! Each field may carry recognition patterns for alternative spellings
//! ("Group Name" -> `groupname`). Patterns are tried in declaration order,
//! required fields first, and the first match wins.

use super::source::RawTable;
use super::{ImportError, ImportKind};
use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ImportField {
    GroupName,
    CourseName,
    IdNumber,
    GroupIdNumber,
    Description,
    EnrolmentKey,
    GroupingName,
    EnableMessaging,
    Picture,
    HidePicture,
    Member,
    Grouping,
}

impl ImportField {
    pub fn name(self) -> &'static str {
        match self {
            Self::GroupName => "groupname",
            Self::CourseName => "coursename",
            Self::IdNumber => "idnumber",
            Self::GroupIdNumber => "groupidnumber",
            Self::Description => "description",
            Self::EnrolmentKey => "enrolmentkey",
            Self::GroupingName => "groupingname",
            Self::EnableMessaging => "enablemessaging",
            Self::Picture => "picture",
            Self::HidePicture => "hidepicture",
            Self::Member => "member",
            Self::Grouping => "grouping",
        }
    }

    fn patterns(self) -> &'static [&'static str] {
        match self {
            Self::GroupName => &["^group$", "^group name$"],
            Self::IdNumber => &[
                "^id number$",
                "^studentid$",
                "^student id$",
                "^user id$",
                "^userid$",
            ],
            Self::Description => &["^desc$"],
            Self::EnrolmentKey => &["^enrolment key$", "^enrolkey$", "^enrol key$"],
            // `^user` is a prefix match: "User", "Username", "user_name" all mean member.
            Self::Member => &["^user", "^username$", "^login$", "^login name$"],
            _ => &[],
        }
    }
}

struct FieldSpec {
    field: ImportField,
    patterns: Vec<Regex>,
}

impl FieldSpec {
    fn new(field: ImportField) -> Self {
        let patterns = field
            .patterns()
            .iter()
            .map(|p| {
                RegexBuilder::new(p)
                    .case_insensitive(true)
                    .build()
                    .unwrap_or_else(|e| panic!("bad header pattern {p} for {}: {e}", field.name()))
            })
            .collect();
        Self { field, patterns }
    }

    fn recognizes(&self, header: &str) -> bool {
        self.patterns.iter().any(|re| re.is_match(header))
    }
}

pub struct FieldSet {
    required: Vec<FieldSpec>,
    optional: Vec<FieldSpec>,
}

static GROUP_FIELDS: Lazy<FieldSet> = Lazy::new(|| {
    FieldSet::new(
        &[ImportField::GroupName],
        &[
            ImportField::CourseName,
            ImportField::IdNumber,
            ImportField::GroupIdNumber,
            ImportField::Description,
            ImportField::EnrolmentKey,
            ImportField::GroupingName,
            ImportField::EnableMessaging,
            ImportField::Picture,
            ImportField::HidePicture,
            ImportField::Member,
        ],
    )
});

static GROUPING_FIELDS: Lazy<FieldSet> =
    Lazy::new(|| FieldSet::new(&[ImportField::Grouping], &[ImportField::GroupName]));

impl FieldSet {
    fn new(required: &[ImportField], optional: &[ImportField]) -> Self {
        Self {
            required: required.iter().copied().map(FieldSpec::new).collect(),
            optional: optional.iter().copied().map(FieldSpec::new).collect(),
        }
    }

    pub fn for_kind(kind: ImportKind) -> &'static FieldSet {
        match kind {
            ImportKind::Groups => &GROUP_FIELDS,
            ImportKind::Groupings => &GROUPING_FIELDS,
        }
    }

    fn all(&self) -> impl Iterator<Item = &FieldSpec> {
        self.required.iter().chain(self.optional.iter())
    }

    #[cfg(test)]
    pub fn is_required(&self, field: ImportField) -> bool {
        self.required.iter().any(|s| s.field == field)
    }

    fn resolve_one(&self, header: &str) -> Option<ImportField> {
        if let Some(spec) = self.all().find(|s| s.field.name() == header) {
            return Some(spec.field);
        }
        self.all().find(|s| s.recognizes(header)).map(|s| s.field)
    }

    /// Maps every header position to its canonical field.
    pub fn resolve_header(&self, raw: &[String]) -> Result<HeaderMap, ImportError> {
        let mut columns = Vec::with_capacity(raw.len());
        let mut invalid = Vec::new();
        for h in raw {
            let label = h.trim_matches(|c| c == ' ' || c == '"' || c == '\'');
            match self.resolve_one(label) {
                Some(field) => columns.push((label.to_string(), field)),
                None => invalid.push(label.to_string()),
            }
        }
        if !invalid.is_empty() {
            return Err(ImportError::InvalidFieldName(invalid));
        }

        let mut seen = BTreeMap::<ImportField, usize>::new();
        for (_, field) in &columns {
            *seen.entry(*field).or_default() += 1;
        }
        let duplicated: Vec<String> = seen
            .iter()
            .filter(|(_, n)| **n > 1)
            .map(|(f, _)| f.name().to_string())
            .collect();
        if !duplicated.is_empty() {
            return Err(ImportError::DuplicateFieldName(duplicated));
        }

        let missing: Vec<String> = self
            .required
            .iter()
            .filter(|s| !seen.contains_key(&s.field))
            .map(|s| s.field.name().to_string())
            .collect();
        if !missing.is_empty() {
            return Err(ImportError::MissingRequiredField(missing));
        }

        Ok(HeaderMap { columns })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeaderMap {
    /// (trimmed raw label, canonical field) per column position.
    pub columns: Vec<(String, ImportField)>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ImportRow {
    pub line: usize,
    values: BTreeMap<ImportField, String>,
}

impl ImportRow {
    pub fn new(line: usize) -> Self {
        Self {
            line,
            values: BTreeMap::new(),
        }
    }

    pub fn with(mut self, field: ImportField, value: &str) -> Self {
        self.values.insert(field, value.trim().to_string());
        self
    }

    /// Trimmed value, `None` when the column is absent or blank.
    pub fn value(&self, field: ImportField) -> Option<&str> {
        self.values
            .get(&field)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    pub fn fields(&self) -> impl Iterator<Item = (ImportField, &str)> {
        self.values.iter().map(|(f, v)| (*f, v.as_str()))
    }
}

/// Normalizes the header and every row. Fails before returning anything when a
/// required value is blank on any line, so callers never act on a partial file.
pub fn normalize(kind: ImportKind, table: &RawTable) -> Result<(HeaderMap, Vec<ImportRow>), ImportError> {
    let set = FieldSet::for_kind(kind);
    let header = set.resolve_header(&table.header)?;

    let mut rows = Vec::with_capacity(table.rows.len());
    for raw in &table.rows {
        let mut row = ImportRow::new(raw.line);
        for ((_, field), value) in header.columns.iter().zip(raw.fields.iter()) {
            row = row.with(*field, value);
        }
        for spec in &set.required {
            if row.value(spec.field).is_none() {
                return Err(ImportError::MissingField {
                    field: spec.field.name(),
                    line: raw.line,
                });
            }
        }
        rows.push(row);
    }
    Ok((header, rows))
}
