//! Token refresh scheduler integration tests against a mock OAuth server.

use std::sync::Arc;

use base64::Engine as _;
use chrono::{Duration, Utc};
use sea_orm::{ActiveModelTrait, ActiveValue::Set};
use serde_json::json;
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use soulsig_sync::inflight::InFlightGuards;
use soulsig_sync::models::connection;
use soulsig_sync::providers::{GrantStyle, Provider, Registry};
use soulsig_sync::repositories::ConnectionRepository;
use soulsig_sync::token_refresh::{RefreshOutcome, TokenRefreshService};

mod test_utils;
use test_utils::{
    insert_connection, refresh_registry, set_connection_status, setup_test_db_arc, test_config,
    test_crypto_key,
};

async fn refresh_harness(registry: Registry) -> (TokenRefreshService, Arc<ConnectionRepository>) {
    refresh_harness_with_guards(registry, InFlightGuards::new()).await
}

async fn refresh_harness_with_guards(
    registry: Registry,
    in_flight: InFlightGuards,
) -> (TokenRefreshService, Arc<ConnectionRepository>) {
    let db = setup_test_db_arc().await.unwrap();
    let repo = Arc::new(ConnectionRepository::new(db, test_crypto_key()));
    let service = TokenRefreshService::new(
        Arc::new(test_config()),
        Arc::clone(&repo),
        Arc::new(registry),
        in_flight,
    );
    (service, repo)
}

#[tokio::test]
async fn refresh_rotates_the_access_token_and_reschedules() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "new-access-token",
            "token_type": "Bearer",
            "expires_in": 3600
        })))
        .mount(&mock_server)
        .await;

    let registry = refresh_registry(
        Provider::Spotify,
        GrantStyle::BasicAuthHeader,
        &format!("{}/api/token", mock_server.uri()),
        &[],
    );
    let (service, repo) = refresh_harness(registry).await;

    let connection = insert_connection(
        &repo,
        Provider::Spotify,
        Some("old-access-token"),
        Some("old-refresh-token"),
        Some(Utc::now() + Duration::minutes(5)),
    )
    .await
    .unwrap();

    let summary = service.try_run_cycle().await.expect("gate was free");
    assert_eq!(summary.connections_due, 1);
    assert_eq!(summary.attempted, 1);
    assert_eq!(summary.succeeded, 1);

    let updated = repo.find_by_id(&connection.id).await.unwrap().unwrap();
    assert_eq!(updated.status, "connected");
    assert_eq!(updated.last_sync_status.as_deref(), Some("token_refreshed"));
    assert_eq!(updated.error_message, None);
    assert_ne!(
        updated.access_token_ciphertext,
        connection.access_token_ciphertext
    );
    // No refresh_token in the response leaves the stored one alone.
    assert_eq!(
        updated.refresh_token_ciphertext,
        connection.refresh_token_ciphertext
    );
    assert_eq!(
        repo.decrypt_access_token(&updated).await.as_deref(),
        Some("new-access-token")
    );

    let expected_expiry = Utc::now() + Duration::seconds(3600);
    let drift = updated
        .token_expires_at
        .unwrap()
        .signed_duration_since(expected_expiry)
        .num_seconds()
        .abs();
    assert!(drift <= 60, "expiry drifted {drift}s from now+3600s");

    // The renewed token now sits outside the lookahead window.
    let second = service.try_run_cycle().await.expect("gate was free");
    assert_eq!(second.connections_due, 0);
}

#[tokio::test]
async fn rejected_refresh_parks_the_connection() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/token"))
        .respond_with(
            ResponseTemplate::new(400).set_body_json(json!({ "error": "invalid_grant" })),
        )
        .mount(&mock_server)
        .await;

    let registry = refresh_registry(
        Provider::Spotify,
        GrantStyle::BasicAuthHeader,
        &format!("{}/api/token", mock_server.uri()),
        &[],
    );
    let (service, repo) = refresh_harness(registry).await;

    let connection = insert_connection(
        &repo,
        Provider::Spotify,
        Some("old-access-token"),
        Some("revoked-refresh-token"),
        Some(Utc::now() + Duration::minutes(5)),
    )
    .await
    .unwrap();

    let summary = service.try_run_cycle().await.expect("gate was free");
    assert_eq!(summary.failed_terminal, 1);
    assert_eq!(summary.succeeded, 0);

    let updated = repo.find_by_id(&connection.id).await.unwrap().unwrap();
    assert_eq!(updated.status, "needs_reauth");
    let reason = updated.error_message.expect("failure reason recorded");
    assert!(reason.contains("400"), "reason should cite the status: {reason}");

    // Parked connections drop out of the due scan.
    let second = service.try_run_cycle().await.expect("gate was free");
    assert_eq!(second.connections_due, 0);
}

#[tokio::test]
async fn basic_grant_keeps_credentials_out_of_the_body() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "new-access-token",
            "expires_in": 3600
        })))
        .mount(&mock_server)
        .await;

    let registry = refresh_registry(
        Provider::Reddit,
        GrantStyle::BasicAuthHeader,
        &format!("{}/api/token", mock_server.uri()),
        &[],
    );
    let (service, repo) = refresh_harness(registry).await;

    insert_connection(
        &repo,
        Provider::Reddit,
        Some("old-access-token"),
        Some("the-refresh-token"),
        Some(Utc::now() + Duration::minutes(5)),
    )
    .await
    .unwrap();

    service.try_run_cycle().await.expect("gate was free");

    let requests = mock_server
        .received_requests()
        .await
        .expect("request recording enabled");
    assert_eq!(requests.len(), 1);
    let request = &requests[0];

    let credentials =
        base64::engine::general_purpose::STANDARD.encode("test-client-id:test-client-secret");
    let expected_header = format!("Basic {credentials}");
    assert_eq!(
        request
            .headers
            .get("authorization")
            .and_then(|value| value.to_str().ok()),
        Some(expected_header.as_str())
    );

    let pairs: Vec<(String, String)> = url::form_urlencoded::parse(&request.body)
        .into_owned()
        .collect();
    assert!(pairs.contains(&("grant_type".to_string(), "refresh_token".to_string())));
    assert!(pairs.contains(&("refresh_token".to_string(), "the-refresh-token".to_string())));
    assert!(
        pairs
            .iter()
            .all(|(key, _)| key != "client_id" && key != "client_secret"),
        "credentials must not appear as form fields: {pairs:?}"
    );
}

#[tokio::test]
async fn body_grant_carries_credentials_and_extra_params_once() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "new-access-token",
            "expires_in": 3600
        })))
        .mount(&mock_server)
        .await;

    let registry = refresh_registry(
        Provider::Pinterest,
        GrantStyle::ClientSecretInBody,
        &format!("{}/api/token", mock_server.uri()),
        &[("scope", "pins:read,boards:read")],
    );
    let (service, repo) = refresh_harness(registry).await;

    insert_connection(
        &repo,
        Provider::Pinterest,
        Some("old-access-token"),
        Some("the-refresh-token"),
        Some(Utc::now() + Duration::minutes(5)),
    )
    .await
    .unwrap();

    service.try_run_cycle().await.expect("gate was free");

    let requests = mock_server
        .received_requests()
        .await
        .expect("request recording enabled");
    assert_eq!(requests.len(), 1);
    let request = &requests[0];

    assert!(request.headers.get("authorization").is_none());

    let pairs: Vec<(String, String)> = url::form_urlencoded::parse(&request.body)
        .into_owned()
        .collect();
    let occurrences = |key: &str| pairs.iter().filter(|(k, _)| k == key).count();
    assert_eq!(occurrences("grant_type"), 1);
    assert_eq!(occurrences("refresh_token"), 1);
    assert_eq!(occurrences("client_id"), 1);
    assert_eq!(occurrences("client_secret"), 1);
    assert_eq!(occurrences("scope"), 1);
    assert!(pairs.contains(&("scope".to_string(), "pins:read,boards:read".to_string())));
}

#[tokio::test]
async fn provider_outage_leaves_the_connection_untouched() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/token"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&mock_server)
        .await;

    let registry = refresh_registry(
        Provider::Spotify,
        GrantStyle::BasicAuthHeader,
        &format!("{}/api/token", mock_server.uri()),
        &[],
    );
    let (service, repo) = refresh_harness(registry).await;

    let connection = insert_connection(
        &repo,
        Provider::Spotify,
        Some("old-access-token"),
        Some("old-refresh-token"),
        Some(Utc::now() + Duration::minutes(5)),
    )
    .await
    .unwrap();

    let summary = service.try_run_cycle().await.expect("gate was free");
    assert_eq!(summary.failed_transient, 1);

    let updated = repo.find_by_id(&connection.id).await.unwrap().unwrap();
    assert_eq!(updated.status, "connected");
    assert_eq!(
        updated.access_token_ciphertext,
        connection.access_token_ciphertext
    );
    assert_eq!(updated.token_expires_at, connection.token_expires_at);
    assert_eq!(updated.error_message, None);
}

#[tokio::test]
async fn provider_rate_limit_defers_without_state_change() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/token"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&mock_server)
        .await;

    let registry = refresh_registry(
        Provider::Spotify,
        GrantStyle::BasicAuthHeader,
        &format!("{}/api/token", mock_server.uri()),
        &[],
    );
    let (service, repo) = refresh_harness(registry).await;

    let connection = insert_connection(
        &repo,
        Provider::Spotify,
        Some("old-access-token"),
        Some("old-refresh-token"),
        Some(Utc::now() + Duration::minutes(5)),
    )
    .await
    .unwrap();

    let summary = service.try_run_cycle().await.expect("gate was free");
    assert_eq!(summary.rate_limited, 1);
    assert_eq!(summary.failed_terminal, 0);

    let updated = repo.find_by_id(&connection.id).await.unwrap().unwrap();
    assert_eq!(updated.status, "connected");
    assert_eq!(
        updated.access_token_ciphertext,
        connection.access_token_ciphertext
    );
}

#[tokio::test]
async fn due_scan_boundaries() {
    let db = setup_test_db_arc().await.unwrap();
    let repo = ConnectionRepository::new(db, test_crypto_key());

    // Expiring soon with a refresh token: due.
    let due_soon = insert_connection(
        &repo,
        Provider::Spotify,
        Some("a"),
        Some("r"),
        Some(Utc::now() + Duration::minutes(5)),
    )
    .await
    .unwrap();

    // No refresh token: nothing to present, never due.
    insert_connection(
        &repo,
        Provider::Github,
        Some("a"),
        None,
        Some(Utc::now() + Duration::minutes(5)),
    )
    .await
    .unwrap();

    // Far-future expiry: not yet due.
    insert_connection(
        &repo,
        Provider::Discord,
        Some("a"),
        Some("r"),
        Some(Utc::now() + Duration::hours(12)),
    )
    .await
    .unwrap();

    // Non-expiring token: never due.
    insert_connection(&repo, Provider::Steam, Some("a"), Some("r"), None)
        .await
        .unwrap();

    // Parked: excluded even though it expires soon.
    let parked = insert_connection(
        &repo,
        Provider::Twitch,
        Some("a"),
        Some("r"),
        Some(Utc::now() + Duration::minutes(5)),
    )
    .await
    .unwrap();
    set_connection_status(repo.db.as_ref(), &parked, "needs_reauth")
        .await
        .unwrap();

    // Rows written by earlier revisions carry `expired`: still due.
    let legacy = insert_connection(
        &repo,
        Provider::Fitbit,
        Some("a"),
        Some("r"),
        Some(Utc::now() + Duration::minutes(3)),
    )
    .await
    .unwrap();
    set_connection_status(repo.db.as_ref(), &legacy, "expired")
        .await
        .unwrap();

    let due = repo
        .list_due_for_refresh(Duration::minutes(10))
        .await
        .unwrap();
    let ids: Vec<Uuid> = due.iter().map(|connection| connection.id).collect();

    // Ordered by expiry; the legacy row expires first.
    assert_eq!(ids, vec![legacy.id, due_soon.id]);
}

#[tokio::test]
async fn one_bad_row_does_not_block_the_batch() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "fresh",
            "expires_in": 3600
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let registry = refresh_registry(
        Provider::Spotify,
        GrantStyle::BasicAuthHeader,
        &format!("{}/api/token", mock_server.uri()),
        &[],
    );
    let (service, repo) = refresh_harness(registry).await;

    let healthy = insert_connection(
        &repo,
        Provider::Spotify,
        Some("a"),
        Some("good-refresh"),
        Some(Utc::now() + Duration::minutes(5)),
    )
    .await
    .unwrap();

    // Another user's row whose refresh ciphertext fails authentication.
    let corrupt = insert_connection(
        &repo,
        Provider::Spotify,
        Some("a"),
        Some("doomed-refresh"),
        Some(Utc::now() + Duration::minutes(5)),
    )
    .await
    .unwrap();
    let mut active: connection::ActiveModel = corrupt.clone().into();
    active.refresh_token_ciphertext = Set(Some(vec![0x01; 32]));
    active.update(repo.db.as_ref()).await.unwrap();

    let summary = service.try_run_cycle().await.expect("gate was free");
    assert_eq!(summary.connections_due, 2);
    assert_eq!(summary.attempted, 1);
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.skipped_decrypt, 1);

    let refreshed = repo.find_by_id(&healthy.id).await.unwrap().unwrap();
    assert_eq!(
        repo.decrypt_access_token(&refreshed).await.as_deref(),
        Some("fresh")
    );

    // The bad row keeps its status; nothing forces it into re-auth.
    let skipped = repo.find_by_id(&corrupt.id).await.unwrap().unwrap();
    assert_eq!(skipped.status, "connected");
}

#[tokio::test]
async fn in_flight_connection_is_skipped() {
    let mock_server = MockServer::start().await;

    // The token endpoint must not be hit at all.
    Mock::given(method("POST"))
        .and(path("/api/token"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "access_token": "should-not-happen" })),
        )
        .expect(0)
        .mount(&mock_server)
        .await;

    let in_flight = InFlightGuards::new();
    let registry = refresh_registry(
        Provider::Spotify,
        GrantStyle::BasicAuthHeader,
        &format!("{}/api/token", mock_server.uri()),
        &[],
    );
    let (service, repo) = refresh_harness_with_guards(registry, in_flight.clone()).await;

    let connection = insert_connection(
        &repo,
        Provider::Spotify,
        Some("a"),
        Some("r"),
        Some(Utc::now() + Duration::minutes(5)),
    )
    .await
    .unwrap();

    let _guard = in_flight
        .try_begin(connection.user_id, Provider::Spotify)
        .expect("pair was free");

    let summary = service.try_run_cycle().await.expect("gate was free");
    assert_eq!(summary.skipped_in_flight, 1);
    assert_eq!(summary.succeeded, 0);
}

#[tokio::test]
async fn missing_access_token_is_terminal() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "token_type": "Bearer",
            "expires_in": 3600
        })))
        .mount(&mock_server)
        .await;

    let registry = refresh_registry(
        Provider::Spotify,
        GrantStyle::BasicAuthHeader,
        &format!("{}/api/token", mock_server.uri()),
        &[],
    );
    let (service, repo) = refresh_harness(registry).await;

    let connection = insert_connection(
        &repo,
        Provider::Spotify,
        Some("a"),
        Some("r"),
        Some(Utc::now() + Duration::minutes(5)),
    )
    .await
    .unwrap();

    let summary = service.try_run_cycle().await.expect("gate was free");
    assert_eq!(summary.failed_terminal, 1);

    let updated = repo.find_by_id(&connection.id).await.unwrap().unwrap();
    assert_eq!(updated.status, "needs_reauth");
    let reason = updated.error_message.expect("failure reason recorded");
    assert!(reason.contains("access_token"), "got: {reason}");
}

#[tokio::test]
async fn malformed_success_body_is_terminal() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/token"))
        .respond_with(ResponseTemplate::new(200).set_body_string("surprise! not json"))
        .mount(&mock_server)
        .await;

    let registry = refresh_registry(
        Provider::Spotify,
        GrantStyle::BasicAuthHeader,
        &format!("{}/api/token", mock_server.uri()),
        &[],
    );
    let (service, repo) = refresh_harness(registry).await;

    let connection = insert_connection(
        &repo,
        Provider::Spotify,
        Some("a"),
        Some("r"),
        Some(Utc::now() + Duration::minutes(5)),
    )
    .await
    .unwrap();

    let summary = service.try_run_cycle().await.expect("gate was free");
    assert_eq!(summary.failed_terminal, 1);

    let updated = repo.find_by_id(&connection.id).await.unwrap().unwrap();
    assert_eq!(updated.status, "needs_reauth");
    let reason = updated.error_message.expect("failure reason recorded");
    assert!(reason.contains("malformed"), "got: {reason}");
}

#[tokio::test]
async fn missing_expires_in_defaults_to_one_hour() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/token"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "access_token": "fresh" })),
        )
        .mount(&mock_server)
        .await;

    let registry = refresh_registry(
        Provider::Spotify,
        GrantStyle::BasicAuthHeader,
        &format!("{}/api/token", mock_server.uri()),
        &[],
    );
    let (service, repo) = refresh_harness(registry).await;

    let connection = insert_connection(
        &repo,
        Provider::Spotify,
        Some("a"),
        Some("r"),
        Some(Utc::now() + Duration::minutes(5)),
    )
    .await
    .unwrap();

    service.try_run_cycle().await.expect("gate was free");

    let updated = repo.find_by_id(&connection.id).await.unwrap().unwrap();
    let expected_expiry = Utc::now() + Duration::seconds(3600);
    let drift = updated
        .token_expires_at
        .unwrap()
        .signed_duration_since(expected_expiry)
        .num_seconds()
        .abs();
    assert!(drift <= 60, "expiry drifted {drift}s from now+3600s");
}

#[tokio::test]
async fn rotated_refresh_token_replaces_the_stored_one() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "fresh",
            "refresh_token": "rotated",
            "expires_in": 600
        })))
        .mount(&mock_server)
        .await;

    let registry = refresh_registry(
        Provider::Spotify,
        GrantStyle::BasicAuthHeader,
        &format!("{}/api/token", mock_server.uri()),
        &[],
    );
    let (service, repo) = refresh_harness(registry).await;

    let connection = insert_connection(
        &repo,
        Provider::Spotify,
        Some("a"),
        Some("old-refresh"),
        Some(Utc::now() + Duration::minutes(5)),
    )
    .await
    .unwrap();

    service.try_run_cycle().await.expect("gate was free");

    let updated = repo.find_by_id(&connection.id).await.unwrap().unwrap();
    assert_ne!(
        updated.refresh_token_ciphertext,
        connection.refresh_token_ciphertext
    );
    assert_eq!(
        repo.decrypt_refresh_token(&updated).await.as_deref(),
        Some("rotated")
    );
}

#[tokio::test]
async fn on_demand_refresh_reports_the_outcome() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "fresh",
            "expires_in": 3600
        })))
        .mount(&mock_server)
        .await;

    let registry = refresh_registry(
        Provider::Spotify,
        GrantStyle::BasicAuthHeader,
        &format!("{}/api/token", mock_server.uri()),
        &[],
    );
    let (service, repo) = refresh_harness(registry).await;

    let connection = insert_connection(
        &repo,
        Provider::Spotify,
        Some("a"),
        Some("r"),
        Some(Utc::now() + Duration::minutes(5)),
    )
    .await
    .unwrap();

    let outcome = service
        .refresh_connection_by_id(&connection.id)
        .await
        .unwrap();
    assert!(matches!(outcome, Some(RefreshOutcome::Refreshed)));

    let unknown = service
        .refresh_connection_by_id(&Uuid::new_v4())
        .await
        .unwrap();
    assert!(unknown.is_none());
}
