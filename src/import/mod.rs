pub mod fields;
pub mod outcome;
pub mod reconcile;
pub mod source;

use serde_json::{json, Value};
use thiserror::Error;

/// Which upload form the rows came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImportKind {
    Groups,
    Groupings,
}

/// Conditions that stop an import before any row is reconciled.
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("the uploaded file is empty")]
    EmptyFile,
    #[error("the uploaded file has a header line but no data")]
    NoData,
    #[error("unknown character encoding: {0}")]
    UnknownEncoding(String),
    #[error("the uploaded file is not valid {0} text")]
    Malformed(String),
    #[error("line {line} has {found} columns, expected {expected}")]
    ColumnCount {
        line: usize,
        expected: usize,
        found: usize,
    },
    #[error("upload of {size} bytes exceeds the {max} byte limit")]
    UploadTooLarge { size: usize, max: usize },
    #[error("unknown delimiter: {0}")]
    UnknownDelimiter(String),
    #[error("invalid field name: {}", .0.join(","))]
    InvalidFieldName(Vec<String>),
    #[error("required field missing: {}", .0.join(","))]
    MissingRequiredField(Vec<String>),
    #[error("field given more than once: {}", .0.join(","))]
    DuplicateFieldName(Vec<String>),
    #[error("line {line}: {field} must not be empty")]
    MissingField { field: &'static str, line: usize },
}

impl ImportError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::EmptyFile => "csv_empty_file",
            Self::NoData => "csv_no_data",
            Self::UnknownEncoding(_) | Self::Malformed(_) | Self::ColumnCount { .. } => {
                "csv_file_error"
            }
            Self::UploadTooLarge { .. } => "upload_too_large",
            Self::UnknownDelimiter(_) => "bad_params",
            Self::InvalidFieldName(_) => "invalid_field_name",
            Self::MissingRequiredField(_) => "missing_required_field",
            Self::DuplicateFieldName(_) => "duplicate_field_name",
            Self::MissingField { .. } => "missing_field",
        }
    }

    pub fn details(&self) -> Option<Value> {
        match self {
            Self::ColumnCount {
                line,
                expected,
                found,
            } => Some(json!({ "line": line, "expected": expected, "found": found })),
            Self::UploadTooLarge { size, max } => Some(json!({ "size": size, "max": max })),
            Self::InvalidFieldName(fields)
            | Self::MissingRequiredField(fields)
            | Self::DuplicateFieldName(fields) => Some(json!({ "fields": fields })),
            Self::MissingField { field, line } => Some(json!({ "field": field, "line": line })),
            _ => None,
        }
    }
}
