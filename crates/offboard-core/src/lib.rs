//! Core domain model for the offboarding pipeline.

use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "offboard-core";

/// Longest error-body excerpt carried into logs and reports.
pub const MAX_DETAIL_LEN: usize = 200;

/// One email-keyed unit of work flowing through all three stages.
///
/// `provider_id: None` means the email was not found in the identity
/// provider, as opposed to "not yet looked up": records only exist after
/// the resolve stage has run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub email: String,
    pub display_name: String,
    pub provider_id: Option<String>,
}

impl UserRecord {
    pub fn new(email: impl Into<String>, name_hint: &str) -> Self {
        let email = email.into();
        let display_name = derive_display_name(&email, name_hint);
        Self {
            email,
            display_name,
            provider_id: None,
        }
    }

    pub fn with_provider_id(mut self, provider_id: impl Into<String>) -> Self {
        self.provider_id = Some(provider_id.into());
        self
    }
}

/// Picks the human label for a record.
///
/// A non-empty hint that differs from the email wins verbatim. Otherwise the
/// name is derived from the email local part: split on `.` and `_`, each
/// token capitalized, joined with single spaces.
pub fn derive_display_name(email: &str, name_hint: &str) -> String {
    let hint = name_hint.trim();
    if !hint.is_empty() && hint != email {
        return hint.to_string();
    }
    let local = email.split('@').next().unwrap_or(email);
    local
        .split(['.', '_'])
        .filter(|token| !token.is_empty())
        .map(capitalize)
        .collect::<Vec<_>>()
        .join(" ")
}

fn capitalize(token: &str) -> String {
    let mut chars = token.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

/// Flattens an error body to a single line and bounds its length.
pub fn truncate_detail(body: &str) -> String {
    let flat = body
        .chars()
        .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
        .collect::<String>();
    let flat = flat.trim();
    if flat.chars().count() <= MAX_DETAIL_LEN {
        flat.to_string()
    } else {
        flat.chars().take(MAX_DETAIL_LEN).collect()
    }
}

/// Result of one provider lookup during the resolve stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolutionOutcome {
    Found { provider_id: String },
    NotFound,
    LookupError { status: u16, detail: String },
}

/// Result of one delete attempt against either service.
///
/// The admin directory only ever produces `Deleted`, `NotFound`, or `Error`;
/// the identity provider adds the auth variants and `Skipped` (no provider
/// ID, no call made). 404 is deliberately a success variant so re-runs stay
/// idempotent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeletionOutcome {
    Deleted,
    NotFound,
    Unauthorized,
    Forbidden,
    Skipped,
    Error { status: u16, detail: String },
}

impl DeletionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, DeletionOutcome::Deleted | DeletionOutcome::NotFound)
    }

    /// 401/403 signal a token or scope problem that will likely hit every
    /// remaining record, so they are surfaced apart from generic failures.
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            DeletionOutcome::Unauthorized | DeletionOutcome::Forbidden
        )
    }
}

/// Result of one existence check during the verify stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerificationOutcome {
    Gone,
    StillExists { detail: String },
    CheckError { status: u16 },
    Skipped,
}

/// Running totals for the resolve stage, threaded through the record loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolveCounts {
    pub found: usize,
    pub not_found: usize,
    pub errors: usize,
}

impl ResolveCounts {
    pub fn record(&mut self, outcome: &ResolutionOutcome) {
        match outcome {
            ResolutionOutcome::Found { .. } => self.found += 1,
            ResolutionOutcome::NotFound => self.not_found += 1,
            ResolutionOutcome::LookupError { .. } => self.errors += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.found + self.not_found + self.errors
    }
}

/// Per-service totals for the delete stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteCounts {
    pub deleted: usize,
    pub not_found: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl DeleteCounts {
    pub fn record(&mut self, outcome: &DeletionOutcome) {
        match outcome {
            DeletionOutcome::Deleted => self.deleted += 1,
            DeletionOutcome::NotFound => self.not_found += 1,
            DeletionOutcome::Skipped => self.skipped += 1,
            DeletionOutcome::Unauthorized
            | DeletionOutcome::Forbidden
            | DeletionOutcome::Error { .. } => self.failed += 1,
        }
    }
}

/// Per-service totals for the verify stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyCounts {
    pub gone: usize,
    pub still_exists: usize,
    pub check_errors: usize,
    pub skipped: usize,
}

impl VerifyCounts {
    pub fn record(&mut self, outcome: &VerificationOutcome) {
        match outcome {
            VerificationOutcome::Gone => self.gone += 1,
            VerificationOutcome::StillExists { .. } => self.still_exists += 1,
            VerificationOutcome::CheckError { .. } => self.check_errors += 1,
            VerificationOutcome::Skipped => self.skipped += 1,
        }
    }
}
