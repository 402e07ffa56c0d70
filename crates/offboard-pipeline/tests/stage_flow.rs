//! Stage-level tests driving the real drivers against mock services.

use std::fs;
use std::path::Path;
use std::time::Duration;

use offboard_pipeline::{run_delete, run_resolve, run_verify, Region, RunConfig, ServiceClients};
use offboard_storage::read_artifact;
use serde_json::json;
use tempfile::tempdir;
use wiremock::matchers::{method, path, path_regex, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn test_config(dir: &Path, admin_url: String, provider_url: String) -> RunConfig {
    RunConfig {
        region: Region::Eu,
        admin_base_url: admin_url,
        provider_base_url: provider_url,
        provider_token: "test-token".into(),
        roster_path: dir.join("users.csv"),
        artifact_path: dir.join("resolved_users.csv"),
        log_dir: dir.join("logs"),
        report_dir: dir.join("reports"),
        lookup_delay: Duration::ZERO,
        http_timeout: Duration::from_secs(5),
    }
}

fn clients_for(config: &RunConfig) -> ServiceClients {
    ServiceClients::from_config(config).expect("clients")
}

#[tokio::test]
async fn resolve_emits_one_row_per_input_in_input_order() {
    let provider = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/users-by-email"))
        .and(query_param("email", "a@x.com"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!([{"user_id": "auth0|123"}])),
        )
        .mount(&provider)
        .await;
    Mock::given(method("GET"))
        .and(path("/users-by-email"))
        .and(query_param("email", "b@x.com"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&provider)
        .await;
    Mock::given(method("GET"))
        .and(path("/users-by-email"))
        .and(query_param("email", "c@x.com"))
        .respond_with(ResponseTemplate::new(500).set_body_string("internal error"))
        .mount(&provider)
        .await;

    let dir = tempdir().expect("tempdir");
    let config = test_config(dir.path(), "http://unused.invalid".into(), provider.uri());
    fs::write(
        &config.roster_path,
        "Email,Port Name\na@x.com,Alice A\nb@x.com,\nc@x.com,\n",
    )
    .expect("roster");

    let summary = run_resolve(&config, &clients_for(&config)).await.expect("resolve");

    assert_eq!(summary.counts.found, 1);
    assert_eq!(summary.counts.not_found, 1);
    assert_eq!(summary.counts.errors, 1);

    // One row per input, in input order, lookup failure included.
    let records = read_artifact(&config.artifact_path).expect("artifact");
    let emails: Vec<_> = records.iter().map(|r| r.email.as_str()).collect();
    assert_eq!(emails, ["a@x.com", "b@x.com", "c@x.com"]);
    assert_eq!(records[0].provider_id.as_deref(), Some("auth0|123"));
    assert_eq!(records[0].display_name, "Alice A");
    assert_eq!(records[1].provider_id, None);
    assert_eq!(records[2].provider_id, None);

    let errors = fs::read_to_string(config.log_dir.join("lookup_errors.log")).expect("log");
    assert!(errors.contains("c@x.com"));
    assert!(errors.contains("HTTP 500: internal error"));
    assert!(config.report_dir.join("resolve_report.json").exists());
}

#[tokio::test]
async fn resolved_user_is_deleted_everywhere_then_verified_gone() {
    let admin = MockServer::start().await;
    let provider = MockServer::start().await;

    Mock::given(method("DELETE"))
        .and(path("/users/email/a%40x.com"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&admin)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/users/auth0%7C123"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&provider)
        .await;

    let dir = tempdir().expect("tempdir");
    let config = test_config(dir.path(), admin.uri(), provider.uri());
    fs::write(
        &config.artifact_path,
        "Email,Port Name,Auth0 ID\na@x.com,Alice A,auth0|123\n",
    )
    .expect("artifact");

    let summary = run_delete(&config, &clients_for(&config)).await.expect("delete");
    assert_eq!(summary.admin.deleted, 1);
    assert_eq!(summary.provider.deleted, 1);
    assert_eq!(summary.admin.failed + summary.provider.failed, 0);
    assert_eq!(summary.provider_auth_failures, 0);

    let admin_log = fs::read_to_string(config.log_dir.join("admin_deleted.log")).expect("log");
    assert!(admin_log.contains("DELETED a@x.com (Alice A)"));
    let provider_log =
        fs::read_to_string(config.log_dir.join("provider_deleted.log")).expect("log");
    assert!(provider_log.contains("DELETED a@x.com"));

    // Both services now report the user absent.
    admin.reset().await;
    provider.reset().await;
    Mock::given(method("GET"))
        .and(path("/users/email/a%40x.com"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&admin)
        .await;
    Mock::given(method("GET"))
        .and(path("/users/auth0%7C123"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&provider)
        .await;

    let verify = run_verify(&config, &clients_for(&config)).await.expect("verify");
    assert!(verify.passed());
    assert_eq!(verify.admin.gone, 1);
    assert_eq!(verify.provider.gone, 1);
    assert!(config.report_dir.join("verify_report.json").exists());
}

#[tokio::test]
async fn second_delete_run_is_idempotent() {
    let admin = MockServer::start().await;
    let provider = MockServer::start().await;
    Mock::given(method("DELETE"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&admin)
        .await;
    Mock::given(method("DELETE"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&provider)
        .await;

    let dir = tempdir().expect("tempdir");
    let config = test_config(dir.path(), admin.uri(), provider.uri());
    fs::write(
        &config.artifact_path,
        "Email,Port Name,Auth0 ID\na@x.com,Alice A,auth0|123\nb@x.com,Bob B,auth0|456\n",
    )
    .expect("artifact");

    let summary = run_delete(&config, &clients_for(&config)).await.expect("delete");

    // Already-absent users are successes, not errors.
    assert_eq!(summary.admin.not_found, 2);
    assert_eq!(summary.provider.not_found, 2);
    assert_eq!(summary.admin.failed, 0);
    assert_eq!(summary.provider.failed, 0);

    let errors = fs::read_to_string(config.log_dir.join("admin_errors.log")).expect("log");
    assert!(errors.is_empty());
}

#[tokio::test]
async fn missing_provider_id_never_touches_the_provider() {
    let admin = MockServer::start().await;
    let provider = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/users/email/b%40x.com"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&admin)
        .await;
    Mock::given(method("GET"))
        .and(path("/users/email/b%40x.com"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&admin)
        .await;
    // Any provider traffic at all is a failure.
    Mock::given(path_regex(".*"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&provider)
        .await;

    let dir = tempdir().expect("tempdir");
    let config = test_config(dir.path(), admin.uri(), provider.uri());
    fs::write(&config.artifact_path, "Email,Port Name,Auth0 ID\nb@x.com,Bob B,\n")
        .expect("artifact");

    let clients = clients_for(&config);
    let delete = run_delete(&config, &clients).await.expect("delete");
    assert_eq!(delete.admin.deleted, 1);
    assert_eq!(delete.provider.skipped, 1);

    let verify = run_verify(&config, &clients).await.expect("verify");
    assert!(verify.passed());
    assert_eq!(verify.admin.gone, 1);
    assert_eq!(verify.provider.skipped, 1);
}

#[tokio::test]
async fn one_bad_record_does_not_abort_the_batch() {
    let admin = MockServer::start().await;
    let provider = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/users/email/a%40x.com"))
        .respond_with(ResponseTemplate::new(500).set_body_string("db lock"))
        .mount(&admin)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/users/email/b%40x.com"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&admin)
        .await;
    Mock::given(method("DELETE"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&provider)
        .await;

    let dir = tempdir().expect("tempdir");
    let config = test_config(dir.path(), admin.uri(), provider.uri());
    fs::write(
        &config.artifact_path,
        "Email,Port Name,Auth0 ID\na@x.com,Alice A,auth0|123\nb@x.com,Bob B,auth0|456\n",
    )
    .expect("artifact");

    let summary = run_delete(&config, &clients_for(&config)).await.expect("delete");

    assert_eq!(summary.records, 2);
    assert_eq!(summary.admin.failed, 1);
    assert_eq!(summary.admin.deleted, 1);
    // The admin failure on the first record did not skip its provider call.
    assert_eq!(summary.provider.deleted, 2);

    let errors = fs::read_to_string(config.log_dir.join("admin_errors.log")).expect("log");
    assert!(errors.contains("ERROR a@x.com HTTP 500: db lock"));
}

#[tokio::test]
async fn provider_auth_failures_are_highlighted() {
    let admin = MockServer::start().await;
    let provider = MockServer::start().await;
    Mock::given(method("DELETE"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&admin)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/users/auth0%7C123"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&provider)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/users/auth0%7C456"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&provider)
        .await;

    let dir = tempdir().expect("tempdir");
    let config = test_config(dir.path(), admin.uri(), provider.uri());
    fs::write(
        &config.artifact_path,
        "Email,Port Name,Auth0 ID\na@x.com,Alice A,auth0|123\nb@x.com,Bob B,auth0|456\n",
    )
    .expect("artifact");

    let summary = run_delete(&config, &clients_for(&config)).await.expect("delete");

    assert_eq!(summary.provider_auth_failures, 2);
    assert_eq!(summary.provider.failed, 2);
    let errors = fs::read_to_string(config.log_dir.join("provider_errors.log")).expect("log");
    assert!(errors.contains("UNAUTHORIZED a@x.com"));
    assert!(errors.contains("FORBIDDEN b@x.com"));
}

#[tokio::test]
async fn leftover_user_fails_the_verdict() {
    let admin = MockServer::start().await;
    let provider = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/users/email/a%40x.com"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{\"email\":\"a@x.com\"}"))
        .mount(&admin)
        .await;
    Mock::given(method("GET"))
        .and(path("/users/auth0%7C123"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&provider)
        .await;

    let dir = tempdir().expect("tempdir");
    let config = test_config(dir.path(), admin.uri(), provider.uri());
    fs::write(
        &config.artifact_path,
        "Email,Port Name,Auth0 ID\na@x.com,Alice A,auth0|123\n",
    )
    .expect("artifact");

    let summary = run_verify(&config, &clients_for(&config)).await.expect("verify");

    assert!(!summary.passed());
    assert_eq!(summary.admin.still_exists, 1);
    // The ambiguous provider check is reported but does not add to failure.
    assert_eq!(summary.provider.check_errors, 1);
    assert_eq!(summary.provider.still_exists, 0);

    let discrepancies =
        fs::read_to_string(config.log_dir.join("verify_discrepancies.log")).expect("log");
    assert!(discrepancies.contains("admin STILL_EXISTS a@x.com"));
    let check_errors =
        fs::read_to_string(config.log_dir.join("verify_check_errors.log")).expect("log");
    assert!(check_errors.contains("provider CHECK_ERROR a@x.com HTTP 502"));
}

#[tokio::test]
async fn delete_requires_the_resolve_artifact() {
    let dir = tempdir().expect("tempdir");
    let config = test_config(
        dir.path(),
        "http://unused.invalid".into(),
        "http://unused.invalid".into(),
    );
    let err = run_delete(&config, &clients_for(&config))
        .await
        .expect_err("missing artifact must be fatal");
    assert!(err.to_string().contains("does not exist"));
}
