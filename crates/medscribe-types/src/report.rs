//! Report metadata, generation results and persisted records.

use serde::{Deserialize, Serialize};

use crate::Timestamp;

/// Placeholder rendered for any metadata field that was not supplied.
pub const NOT_SPECIFIED: &str = "Not specified";

/// Which prompt template drives a generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateKind {
    /// Free-text editorial correction of a dictated or typed report.
    Correction,
    /// Structured report generation from clinical notes.
    Generation,
}

impl TemplateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Correction => "correction",
            Self::Generation => "generation",
        }
    }

    /// Origin tag stored on persisted reports.
    pub fn origin_tag(&self) -> &'static str {
        match self {
            Self::Correction => "correction_flow",
            Self::Generation => "template_flow",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "correction" | "correct" => Some(Self::Correction),
            "generation" | "generate" | "template" => Some(Self::Generation),
            _ => None,
        }
    }
}

impl std::fmt::Display for TemplateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Patient and report metadata. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportMetadata {
    pub patient_name: Option<String>,
    pub age: Option<String>,
    pub file_number: Option<String>,
    pub doctor_name: Option<String>,
    pub department: Option<String>,
}

impl ReportMetadata {
    pub fn with_patient_name(mut self, name: impl Into<String>) -> Self {
        self.patient_name = Some(name.into());
        self
    }

    pub fn with_age(mut self, age: impl Into<String>) -> Self {
        self.age = Some(age.into());
        self
    }

    pub fn with_file_number(mut self, file_number: impl Into<String>) -> Self {
        self.file_number = Some(file_number.into());
        self
    }

    pub fn with_doctor_name(mut self, name: impl Into<String>) -> Self {
        self.doctor_name = Some(name.into());
        self
    }

    pub fn with_department(mut self, department: impl Into<String>) -> Self {
        self.department = Some(department.into());
        self
    }

    /// Field value, or [`NOT_SPECIFIED`] when absent or blank.
    pub fn display(field: &Option<String>) -> &str {
        match field.as_deref().map(str::trim) {
            Some(value) if !value.is_empty() => value,
            _ => NOT_SPECIFIED,
        }
    }
}

/// Terminal status of a generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    Complete,
    Partial,
    Failed,
}

impl CompletionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::Partial => "partial",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "complete" => Some(Self::Complete),
            "partial" => Some(Self::Partial),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Accumulated output of one generation call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationResult {
    pub text: String,
    pub status: CompletionStatus,
}

impl GenerationResult {
    pub fn is_complete(&self) -> bool {
        self.status == CompletionStatus::Complete
    }
}

/// Reference to a content-addressed blob (lowercase SHA-256 hex).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlobRef(pub String);

impl BlobRef {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// The durable artifact of a completed generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedReport {
    pub id: String,
    pub kind: TemplateKind,
    pub metadata: ReportMetadata,
    pub text: String,
    pub status: CompletionStatus,
    /// Identity of whoever requested the generation.
    pub author: Option<String>,
    /// Origin tag, see [`TemplateKind::origin_tag`].
    pub generated_by: String,
    pub template_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature_ref: Option<BlobRef>,
    pub created_at: Timestamp,
}

/// Record of a generation that did not complete. Never carries body text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationIncident {
    pub id: String,
    pub kind: TemplateKind,
    pub metadata: ReportMetadata,
    pub author: Option<String>,
    pub status: CompletionStatus,
    pub reason: String,
    /// Bytes delivered to the caller before the stream ended.
    pub streamed_bytes: usize,
    pub created_at: Timestamp,
}

/// Filter for finding persisted reports. Empty fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportQuery {
    pub file_number: Option<String>,
    pub patient_name: Option<String>,
    pub author: Option<String>,
    pub kind: Option<TemplateKind>,
    pub limit: Option<usize>,
}
