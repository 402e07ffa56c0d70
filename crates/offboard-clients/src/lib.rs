//! HTTP clients for the two offboarding targets.
//!
//! Both services reduce to the same shape: build a request, send it, fold
//! `(status, body)` into a stage outcome. A single generic helper does the
//! sending and each endpoint supplies its own classification. Transport
//! failures classify as status `0`: a dead service is a per-record event,
//! never a batch abort.

use std::time::Duration;

use offboard_core::{truncate_detail, DeletionOutcome, ResolutionOutcome, VerificationOutcome};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "offboard-clients";

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("building HTTP client: {0}")]
    Build(#[source] reqwest::Error),
}

/// Shared client for both services; the timeout comes from run config.
pub fn build_http_client(timeout: Duration) -> Result<Client, ClientError> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(ClientError::Build)
}

/// Sends a prepared request and classifies the response into an outcome.
///
/// Every endpoint of both services goes through here; only the mapping
/// closures differ.
async fn send_classified<T>(
    request: RequestBuilder,
    classify: impl FnOnce(StatusCode, String) -> T,
    transport_error: impl FnOnce(String) -> T,
) -> T {
    match request.send().await {
        Ok(response) => {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            classify(status, body)
        }
        Err(err) => transport_error(truncate_detail(&err.to_string())),
    }
}

// ── Status classification ─────────────────────────────────────────────

/// Provider deletes distinguish auth failures from generic errors.
pub fn classify_provider_delete(status: StatusCode, body: String) -> DeletionOutcome {
    match status {
        StatusCode::OK | StatusCode::NO_CONTENT => DeletionOutcome::Deleted,
        StatusCode::NOT_FOUND => DeletionOutcome::NotFound,
        StatusCode::UNAUTHORIZED => DeletionOutcome::Unauthorized,
        StatusCode::FORBIDDEN => DeletionOutcome::Forbidden,
        other => DeletionOutcome::Error {
            status: other.as_u16(),
            detail: truncate_detail(&body),
        },
    }
}

/// The admin directory only speaks 200/404; everything else is an error.
pub fn classify_admin_delete(status: StatusCode, body: String) -> DeletionOutcome {
    match status {
        StatusCode::OK => DeletionOutcome::Deleted,
        StatusCode::NOT_FOUND => DeletionOutcome::NotFound,
        other => DeletionOutcome::Error {
            status: other.as_u16(),
            detail: truncate_detail(&body),
        },
    }
}

/// Existence checks share one trichotomy: 200 exists, 404 gone, rest unknown.
pub fn classify_existence(status: StatusCode, body: String) -> VerificationOutcome {
    match status {
        StatusCode::OK => VerificationOutcome::StillExists {
            detail: truncate_detail(&body),
        },
        StatusCode::NOT_FOUND => VerificationOutcome::Gone,
        other => VerificationOutcome::CheckError {
            status: other.as_u16(),
        },
    }
}

// ── Identity provider ─────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ProviderUser {
    user_id: String,
}

/// Client for the identity provider's management API. Every call carries the
/// bearer token.
#[derive(Debug, Clone)]
pub struct ProviderClient {
    base_url: String,
    token: String,
    http: Client,
}

impl ProviderClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>, http: Client) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            http,
        }
    }

    /// Looks an email up in the provider. An empty 200 result list is the
    /// provider's "no such user", a terminal outcome rather than an error.
    pub async fn find_user_by_email(&self, email: &str) -> ResolutionOutcome {
        let url = format!(
            "{}/users-by-email?email={}",
            self.base_url,
            urlencoding::encode(email)
        );
        debug!("provider GET {url}");
        send_classified(
            self.http.get(&url).bearer_auth(&self.token),
            |status, body| {
                if status != StatusCode::OK {
                    return ResolutionOutcome::LookupError {
                        status: status.as_u16(),
                        detail: truncate_detail(&body),
                    };
                }
                match serde_json::from_str::<Vec<ProviderUser>>(&body) {
                    Ok(users) => match users.into_iter().next() {
                        Some(user) => ResolutionOutcome::Found {
                            provider_id: user.user_id,
                        },
                        None => ResolutionOutcome::NotFound,
                    },
                    Err(err) => ResolutionOutcome::LookupError {
                        status: status.as_u16(),
                        detail: truncate_detail(&format!("unparseable lookup response: {err}")),
                    },
                }
            },
            |detail| ResolutionOutcome::LookupError { status: 0, detail },
        )
        .await
    }

    pub async fn delete_user(&self, provider_id: &str) -> DeletionOutcome {
        let url = format!(
            "{}/users/{}",
            self.base_url,
            urlencoding::encode(provider_id)
        );
        debug!("provider DELETE {url}");
        send_classified(
            self.http.delete(&url).bearer_auth(&self.token),
            classify_provider_delete,
            |detail| DeletionOutcome::Error { status: 0, detail },
        )
        .await
    }

    pub async fn get_user(&self, provider_id: &str) -> VerificationOutcome {
        let url = format!(
            "{}/users/{}",
            self.base_url,
            urlencoding::encode(provider_id)
        );
        debug!("provider GET {url}");
        send_classified(
            self.http.get(&url).bearer_auth(&self.token),
            classify_existence,
            |_| VerificationOutcome::CheckError { status: 0 },
        )
        .await
    }
}

// ── Admin directory ───────────────────────────────────────────────────

/// Client for the internal admin directory. Keys on email; no auth header
/// (the service is reachable only from the internal network).
#[derive(Debug, Clone)]
pub struct AdminClient {
    base_url: String,
    http: Client,
}

impl AdminClient {
    pub fn new(base_url: impl Into<String>, http: Client) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        }
    }

    pub async fn delete_user_by_email(&self, email: &str) -> DeletionOutcome {
        let url = format!(
            "{}/users/email/{}",
            self.base_url,
            urlencoding::encode(email)
        );
        debug!("admin DELETE {url}");
        send_classified(
            self.http.delete(&url),
            classify_admin_delete,
            |detail| DeletionOutcome::Error { status: 0, detail },
        )
        .await
    }

    pub async fn get_user_by_email(&self, email: &str) -> VerificationOutcome {
        let url = format!(
            "{}/users/email/{}",
            self.base_url,
            urlencoding::encode(email)
        );
        debug!("admin GET {url}");
        send_classified(
            self.http.get(&url),
            classify_existence,
            |_| VerificationOutcome::CheckError { status: 0 },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(code: u16) -> StatusCode {
        StatusCode::from_u16(code).expect("valid status")
    }

    #[test]
    fn provider_delete_classification_table() {
        let cases = [
            (200, DeletionOutcome::Deleted),
            (204, DeletionOutcome::Deleted),
            (404, DeletionOutcome::NotFound),
            (401, DeletionOutcome::Unauthorized),
            (403, DeletionOutcome::Forbidden),
        ];
        for (code, expected) in cases {
            assert_eq!(
                classify_provider_delete(status(code), String::new()),
                expected,
                "status {code}"
            );
        }
        assert_eq!(
            classify_provider_delete(status(500), "server exploded".into()),
            DeletionOutcome::Error {
                status: 500,
                detail: "server exploded".into()
            }
        );
    }

    #[test]
    fn admin_delete_does_not_know_auth_statuses() {
        assert_eq!(
            classify_admin_delete(status(200), String::new()),
            DeletionOutcome::Deleted
        );
        assert_eq!(
            classify_admin_delete(status(404), String::new()),
            DeletionOutcome::NotFound
        );
        // 401 from the admin service is just a failure, not a distinguished
        // auth outcome.
        assert_eq!(
            classify_admin_delete(status(401), "nope".into()),
            DeletionOutcome::Error {
                status: 401,
                detail: "nope".into()
            }
        );
        assert_eq!(
            classify_admin_delete(status(204), String::new()),
            DeletionOutcome::Error {
                status: 204,
                detail: String::new()
            }
        );
    }

    #[test]
    fn existence_trichotomy() {
        assert_eq!(
            classify_existence(status(200), "{\"email\":\"a@x.com\"}".into()),
            VerificationOutcome::StillExists {
                detail: "{\"email\":\"a@x.com\"}".into()
            }
        );
        assert_eq!(classify_existence(status(404), String::new()), VerificationOutcome::Gone);
        assert_eq!(
            classify_existence(status(503), String::new()),
            VerificationOutcome::CheckError { status: 503 }
        );
    }

    #[test]
    fn error_details_are_truncated_for_logs() {
        let body = "x".repeat(500);
        match classify_provider_delete(status(500), body) {
            DeletionOutcome::Error { status: 500, detail } => {
                assert_eq!(detail.len(), offboard_core::MAX_DETAIL_LEN);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn base_urls_lose_trailing_slashes() {
        let http = Client::new();
        let provider = ProviderClient::new("https://idp.example.com/api/v2/", "t", http.clone());
        assert_eq!(provider.base_url, "https://idp.example.com/api/v2");
        let admin = AdminClient::new("https://admin.example.com/", http);
        assert_eq!(admin.base_url, "https://admin.example.com");
    }
}
