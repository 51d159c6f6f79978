//! Validation reports.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// One validation finding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ValidationIssue {
    /// Machine-readable code, e.g. `duplicate_segment_id`
    pub code: String,

    /// Dotted path of the offending field, e.g. `segments[2].image.url`
    pub field: String,

    pub message: String,
}

impl ValidationIssue {
    pub fn new(
        code: impl Into<String>,
        field: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            code: code.into(),
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Outcome of the validation stage. Errors are fatal; warnings are surfaced
/// but do not stop the pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ValidationReport {
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn error(
        &mut self,
        code: impl Into<String>,
        field: impl Into<String>,
        message: impl Into<String>,
    ) {
        self.errors.push(ValidationIssue::new(code, field, message));
    }

    pub fn warning(
        &mut self,
        code: impl Into<String>,
        field: impl Into<String>,
        message: impl Into<String>,
    ) {
        self.warnings.push(ValidationIssue::new(code, field, message));
    }

    /// Single-line summary of all errors, for error messages.
    pub fn error_summary(&self) -> String {
        self.errors
            .iter()
            .map(|issue| format!("{}: {}", issue.field, issue.message))
            .collect::<Vec<_>>()
            .join("; ")
    }
}
