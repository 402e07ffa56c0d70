//! Stage orchestration for the offboarding pipeline.
//!
//! Three stage drivers share one contract: read a CSV, walk it strictly in
//! order with a single request in flight, append categorized log lines as
//! they go, and return an accumulated summary. State between stages lives
//! only in the artifact file; no stage reads another stage's logs.

use std::env;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use offboard_clients::{build_http_client, AdminClient, ClientError, ProviderClient};
use offboard_core::{
    derive_display_name, DeleteCounts, DeletionOutcome, ResolutionOutcome, ResolveCounts,
    UserRecord, VerificationOutcome, VerifyCounts,
};
use offboard_storage::{read_artifact, read_roster, write_run_report, ArtifactWriter, StageLog};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "offboard-pipeline";

const LOOKUP_FOUND_LOG: &str = "lookup_found.log";
const LOOKUP_NOT_FOUND_LOG: &str = "lookup_not_found.log";
const LOOKUP_ERRORS_LOG: &str = "lookup_errors.log";
const ADMIN_DELETED_LOG: &str = "admin_deleted.log";
const ADMIN_ERRORS_LOG: &str = "admin_errors.log";
const PROVIDER_DELETED_LOG: &str = "provider_deleted.log";
const PROVIDER_ERRORS_LOG: &str = "provider_errors.log";
const VERIFY_DISCREPANCIES_LOG: &str = "verify_discrepancies.log";
const VERIFY_CHECK_ERRORS_LOG: &str = "verify_check_errors.log";

// ── Configuration ─────────────────────────────────────────────────────

/// Deployment region hosting both services.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    Eu,
    Us,
}

impl Region {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "eu" => Some(Region::Eu),
            "us" => Some(Region::Us),
            _ => None,
        }
    }

    pub fn admin_base_url(self) -> &'static str {
        match self {
            Region::Eu => "https://admin.eu.port.internal/api/v1",
            Region::Us => "https://admin.us.port.internal/api/v1",
        }
    }

    pub fn provider_base_url(self) -> &'static str {
        match self {
            Region::Eu => "https://corp-eu.eu.auth0.com/api/v2",
            Region::Us => "https://corp-us.us.auth0.com/api/v2",
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Region::Eu => write!(f, "eu"),
            Region::Us => write!(f, "us"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no region configured; pass --region or set OFFBOARD_REGION (eu|us)")]
    MissingRegion,
    #[error("unknown region {0:?} (supported: eu, us)")]
    UnknownRegion(String),
    #[error("OFFBOARD_AUTH_TOKEN is not set; identity-provider calls cannot authenticate")]
    MissingToken,
}

/// Everything a run needs, resolved once at startup.
///
/// The stage drivers take this by reference and never read the environment
/// themselves.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub region: Region,
    pub admin_base_url: String,
    pub provider_base_url: String,
    pub provider_token: String,
    pub roster_path: PathBuf,
    pub artifact_path: PathBuf,
    pub log_dir: PathBuf,
    pub report_dir: PathBuf,
    pub lookup_delay: Duration,
    pub http_timeout: Duration,
}

impl RunConfig {
    pub fn from_env(region_flag: Option<&str>) -> Result<Self, ConfigError> {
        let raw_region = match region_flag {
            Some(value) => value.to_string(),
            None => env::var("OFFBOARD_REGION")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .ok_or(ConfigError::MissingRegion)?,
        };
        let region =
            Region::parse(&raw_region).ok_or_else(|| ConfigError::UnknownRegion(raw_region.clone()))?;
        let provider_token = env::var("OFFBOARD_AUTH_TOKEN")
            .ok()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or(ConfigError::MissingToken)?;

        Ok(Self {
            region,
            admin_base_url: env::var("OFFBOARD_ADMIN_URL")
                .unwrap_or_else(|_| region.admin_base_url().to_string()),
            provider_base_url: env::var("OFFBOARD_PROVIDER_URL")
                .unwrap_or_else(|_| region.provider_base_url().to_string()),
            provider_token,
            roster_path: env_path("OFFBOARD_INPUT_CSV", "users.csv"),
            artifact_path: env_path("OFFBOARD_ARTIFACT_CSV", "resolved_users.csv"),
            log_dir: env_path("OFFBOARD_LOG_DIR", "logs"),
            report_dir: env_path("OFFBOARD_REPORT_DIR", "reports"),
            lookup_delay: Duration::from_millis(env_u64("OFFBOARD_LOOKUP_DELAY_MS", 250)),
            http_timeout: Duration::from_secs(env_u64("OFFBOARD_HTTP_TIMEOUT_SECS", 20)),
        })
    }
}

fn env_path(key: &str, default: &str) -> PathBuf {
    env::var(key)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(default))
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// The two service clients, sharing one HTTP client and timeout.
pub struct ServiceClients {
    pub admin: AdminClient,
    pub provider: ProviderClient,
}

impl ServiceClients {
    pub fn from_config(config: &RunConfig) -> Result<Self, ClientError> {
        let http = build_http_client(config.http_timeout)?;
        Ok(Self {
            admin: AdminClient::new(config.admin_base_url.clone(), http.clone()),
            provider: ProviderClient::new(
                config.provider_base_url.clone(),
                config.provider_token.clone(),
                http,
            ),
        })
    }
}

// ── Summaries ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct ResolveSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub counts: ResolveCounts,
    pub artifact_path: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeleteSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub records: usize,
    pub admin: DeleteCounts,
    pub provider: DeleteCounts,
    /// 401/403 count against the provider, split out because one of these
    /// usually means every remaining record failed the same way.
    pub provider_auth_failures: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifySummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub records: usize,
    pub admin: VerifyCounts,
    pub provider: VerifyCounts,
}

impl VerifySummary {
    /// The batch verifies iff nothing still exists in either service.
    /// Inconclusive checks are reported separately and do not fail the
    /// verdict.
    pub fn passed(&self) -> bool {
        self.admin.still_exists == 0 && self.provider.still_exists == 0
    }
}

// ── Stage 1: resolve ──────────────────────────────────────────────────

/// Looks every roster email up in the identity provider and writes the
/// artifact the later stages consume.
///
/// Every input gets exactly one artifact row, lookup failures included, so
/// the delete stage always has a complete worklist.
pub async fn run_resolve(config: &RunConfig, clients: &ServiceClients) -> Result<ResolveSummary> {
    let run_id = Uuid::new_v4();
    let started_at = Utc::now();
    let roster = read_roster(&config.roster_path)?;
    info!(%run_id, records = roster.len(), "resolve stage starting");

    let mut artifact = ArtifactWriter::create(&config.artifact_path)
        .with_context(|| format!("creating artifact {}", config.artifact_path.display()))?;
    let mut found_log = StageLog::create(config.log_dir.join(LOOKUP_FOUND_LOG))?;
    let mut not_found_log = StageLog::create(config.log_dir.join(LOOKUP_NOT_FOUND_LOG))?;
    let mut error_log = StageLog::create(config.log_dir.join(LOOKUP_ERRORS_LOG))?;

    let total = roster.len();
    let mut counts = ResolveCounts::default();
    for (index, entry) in roster.iter().enumerate() {
        let display_name = derive_display_name(&entry.email, &entry.name_hint);
        let outcome = clients.provider.find_user_by_email(&entry.email).await;

        let record = UserRecord {
            email: entry.email.clone(),
            display_name: display_name.clone(),
            provider_id: match &outcome {
                ResolutionOutcome::Found { provider_id } => Some(provider_id.clone()),
                _ => None,
            },
        };
        artifact.append(&record)?;
        counts.record(&outcome);

        match &outcome {
            ResolutionOutcome::Found { provider_id } => {
                println!("[{}/{}] {} -> {}", index + 1, total, entry.email, provider_id);
                found_log.append(&format!("{} ({display_name}) -> {provider_id}", entry.email))?;
            }
            ResolutionOutcome::NotFound => {
                println!("[{}/{}] {} not in provider", index + 1, total, entry.email);
                not_found_log.append(&format!("{} ({display_name})", entry.email))?;
            }
            ResolutionOutcome::LookupError { status, detail } => {
                println!(
                    "[{}/{}] {} lookup failed (HTTP {status})",
                    index + 1,
                    total,
                    entry.email
                );
                error_log.append(&format!(
                    "{} ({display_name}) HTTP {status}: {detail}",
                    entry.email
                ))?;
            }
        }

        // Rate-limit courtesy toward the provider; not applied after the
        // final lookup.
        if index + 1 < total && !config.lookup_delay.is_zero() {
            tokio::time::sleep(config.lookup_delay).await;
        }
    }

    let summary = ResolveSummary {
        run_id,
        started_at,
        finished_at: Utc::now(),
        counts,
        artifact_path: config.artifact_path.display().to_string(),
    };
    write_run_report(&config.report_dir, "resolve", &summary)?;
    info!(
        %run_id,
        found = counts.found,
        not_found = counts.not_found,
        errors = counts.errors,
        "resolve stage finished"
    );
    Ok(summary)
}

// ── Stage 2: delete ───────────────────────────────────────────────────

/// Deletes every artifact record from the admin directory (by email) and,
/// where an ID was resolved, from the identity provider (by ID).
///
/// The two attempts per record are independent: a failure on one side never
/// suppresses the other. Safe to re-run; 404 counts as success.
pub async fn run_delete(config: &RunConfig, clients: &ServiceClients) -> Result<DeleteSummary> {
    let run_id = Uuid::new_v4();
    let started_at = Utc::now();
    let records = read_artifact(&config.artifact_path)?;
    info!(%run_id, records = records.len(), "delete stage starting");

    let mut admin_deleted_log = StageLog::create(config.log_dir.join(ADMIN_DELETED_LOG))?;
    let mut admin_error_log = StageLog::create(config.log_dir.join(ADMIN_ERRORS_LOG))?;
    let mut provider_deleted_log = StageLog::create(config.log_dir.join(PROVIDER_DELETED_LOG))?;
    let mut provider_error_log = StageLog::create(config.log_dir.join(PROVIDER_ERRORS_LOG))?;

    let total = records.len();
    let mut admin_counts = DeleteCounts::default();
    let mut provider_counts = DeleteCounts::default();
    let mut provider_auth_failures = 0usize;

    for (index, record) in records.iter().enumerate() {
        // Fixed order within a record: admin first, then provider.
        let admin_outcome = clients.admin.delete_user_by_email(&record.email).await;
        admin_counts.record(&admin_outcome);
        log_deletion(&mut admin_deleted_log, &mut admin_error_log, record, &admin_outcome)?;

        let provider_outcome = match record.provider_id.as_deref() {
            Some(provider_id) => clients.provider.delete_user(provider_id).await,
            None => DeletionOutcome::Skipped,
        };
        provider_counts.record(&provider_outcome);
        if provider_outcome.is_auth_failure() {
            provider_auth_failures += 1;
            warn!(
                email = %record.email,
                outcome = ?provider_outcome,
                "provider rejected credentials; remaining records will likely fail the same way"
            );
        }
        log_deletion(
            &mut provider_deleted_log,
            &mut provider_error_log,
            record,
            &provider_outcome,
        )?;

        println!(
            "[{}/{}] {} admin={} provider={}",
            index + 1,
            total,
            record.email,
            deletion_label(&admin_outcome),
            deletion_label(&provider_outcome)
        );
    }

    let summary = DeleteSummary {
        run_id,
        started_at,
        finished_at: Utc::now(),
        records: total,
        admin: admin_counts,
        provider: provider_counts,
        provider_auth_failures,
    };
    write_run_report(&config.report_dir, "delete", &summary)?;
    info!(
        %run_id,
        admin_failed = admin_counts.failed,
        provider_failed = provider_counts.failed,
        "delete stage finished"
    );
    Ok(summary)
}

fn log_deletion(
    success_log: &mut StageLog,
    error_log: &mut StageLog,
    record: &UserRecord,
    outcome: &DeletionOutcome,
) -> Result<()> {
    match outcome {
        DeletionOutcome::Deleted => {
            success_log.append(&format!("DELETED {} ({})", record.email, record.display_name))?;
        }
        DeletionOutcome::NotFound => {
            success_log.append(&format!(
                "NOT_FOUND {} ({})",
                record.email, record.display_name
            ))?;
        }
        DeletionOutcome::Unauthorized => {
            error_log.append(&format!("UNAUTHORIZED {}", record.email))?;
        }
        DeletionOutcome::Forbidden => {
            error_log.append(&format!("FORBIDDEN {}", record.email))?;
        }
        DeletionOutcome::Error { status, detail } => {
            error_log.append(&format!("ERROR {} HTTP {status}: {detail}", record.email))?;
        }
        // Skipped means no call was made; it is counted but not logged.
        DeletionOutcome::Skipped => {}
    }
    Ok(())
}

fn deletion_label(outcome: &DeletionOutcome) -> &'static str {
    match outcome {
        DeletionOutcome::Deleted => "deleted",
        DeletionOutcome::NotFound => "not-found",
        DeletionOutcome::Unauthorized => "unauthorized",
        DeletionOutcome::Forbidden => "forbidden",
        DeletionOutcome::Skipped => "skipped",
        DeletionOutcome::Error { .. } => "error",
    }
}

// ── Stage 3: verify ───────────────────────────────────────────────────

/// Re-queries both services for every artifact record and reports anything
/// left behind.
///
/// Reads the artifact, never the delete stage's logs: verification is an
/// independent check, not an audit of stage 2's self-reporting.
pub async fn run_verify(config: &RunConfig, clients: &ServiceClients) -> Result<VerifySummary> {
    let run_id = Uuid::new_v4();
    let started_at = Utc::now();
    let records = read_artifact(&config.artifact_path)?;
    info!(%run_id, records = records.len(), "verify stage starting");

    let mut discrepancy_log = StageLog::create(config.log_dir.join(VERIFY_DISCREPANCIES_LOG))?;
    let mut check_error_log = StageLog::create(config.log_dir.join(VERIFY_CHECK_ERRORS_LOG))?;

    let total = records.len();
    let mut admin_counts = VerifyCounts::default();
    let mut provider_counts = VerifyCounts::default();

    for (index, record) in records.iter().enumerate() {
        let admin_outcome = clients.admin.get_user_by_email(&record.email).await;
        admin_counts.record(&admin_outcome);
        log_verification(
            &mut discrepancy_log,
            &mut check_error_log,
            "admin",
            record,
            &admin_outcome,
        )?;

        let provider_outcome = match record.provider_id.as_deref() {
            Some(provider_id) => clients.provider.get_user(provider_id).await,
            None => VerificationOutcome::Skipped,
        };
        provider_counts.record(&provider_outcome);
        log_verification(
            &mut discrepancy_log,
            &mut check_error_log,
            "provider",
            record,
            &provider_outcome,
        )?;

        println!(
            "[{}/{}] {} admin={} provider={}",
            index + 1,
            total,
            record.email,
            verification_label(&admin_outcome),
            verification_label(&provider_outcome)
        );
    }

    let summary = VerifySummary {
        run_id,
        started_at,
        finished_at: Utc::now(),
        records: total,
        admin: admin_counts,
        provider: provider_counts,
    };
    write_run_report(&config.report_dir, "verify", &summary)?;
    if summary.passed() {
        info!(%run_id, "verification passed");
    } else {
        warn!(
            %run_id,
            admin_still_exists = admin_counts.still_exists,
            provider_still_exists = provider_counts.still_exists,
            "verification failed; see the discrepancy log"
        );
    }
    Ok(summary)
}

fn log_verification(
    discrepancy_log: &mut StageLog,
    check_error_log: &mut StageLog,
    service: &str,
    record: &UserRecord,
    outcome: &VerificationOutcome,
) -> Result<()> {
    match outcome {
        VerificationOutcome::StillExists { detail } => {
            discrepancy_log.append(&format!(
                "{service} STILL_EXISTS {}: {detail}",
                record.email
            ))?;
        }
        VerificationOutcome::CheckError { status } => {
            check_error_log.append(&format!(
                "{service} CHECK_ERROR {} HTTP {status}",
                record.email
            ))?;
        }
        VerificationOutcome::Gone | VerificationOutcome::Skipped => {}
    }
    Ok(())
}

fn verification_label(outcome: &VerificationOutcome) -> &'static str {
    match outcome {
        VerificationOutcome::Gone => "gone",
        VerificationOutcome::StillExists { .. } => "still-exists",
        VerificationOutcome::CheckError { .. } => "check-error",
        VerificationOutcome::Skipped => "skipped",
    }
}
