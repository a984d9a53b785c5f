//! # Token Refresh Service
//!
//! Background task that periodically scans connections and refreshes OAuth
//! access tokens nearing expiry. Also provides on-demand refresh for the
//! manual operator endpoint.
//!
//! Failures are classified per attempt: terminal rejections park the
//! connection as `needs_reauth`, rate limits and transient faults leave the
//! row untouched so the next cycle picks it up again.

use chrono::{Duration, Utc};
use metrics::{counter, histogram};
use rand::Rng;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::time::{Duration as TokioDuration, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::inflight::{CycleGate, InFlightGuards};
use crate::models::connection;
use crate::providers::{GrantStyle, Provider, RefreshEndpoint, Registry};
use crate::repositories::ConnectionRepository;

/// Fallback token lifetime when the provider omits `expires_in`.
const DEFAULT_EXPIRES_IN_SECONDS: u64 = 3_600;

/// Background token refresh service
#[derive(Clone)]
pub struct TokenRefreshService {
    config: Arc<AppConfig>,
    repo: Arc<ConnectionRepository>,
    registry: Arc<Registry>,
    http: Client,
    in_flight: InFlightGuards,
    cycle_gate: CycleGate,
}

/// Outcome of one refresh attempt over one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// New tokens persisted
    Refreshed,
    /// Provider rejected the grant; connection parked as `needs_reauth`
    FailedTerminal,
    /// Endpoint errored or was unreachable; retried next cycle
    FailedTransient,
    /// Provider answered 429; retried next cycle
    RateLimited,
    /// Unknown provider or no refresh endpoint configured
    SkippedNoConfig,
    /// Another worker holds the `(user, provider)` pair
    SkippedInFlight,
    /// Refresh token missing or failed authentication on decrypt
    SkippedDecrypt,
}

impl RefreshOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefreshOutcome::Refreshed => "refreshed",
            RefreshOutcome::FailedTerminal => "failed_terminal",
            RefreshOutcome::FailedTransient => "failed_transient",
            RefreshOutcome::RateLimited => "rate_limited",
            RefreshOutcome::SkippedNoConfig => "skipped_no_config",
            RefreshOutcome::SkippedInFlight => "skipped_in_flight",
            RefreshOutcome::SkippedDecrypt => "skipped_decrypt",
        }
    }
}

/// Tally of one refresh cycle
#[derive(Debug, Clone, Default, Serialize, ToSchema)]
pub struct RefreshCycleSummary {
    pub connections_due: u64,
    pub attempted: u64,
    pub succeeded: u64,
    pub failed_terminal: u64,
    pub failed_transient: u64,
    pub rate_limited: u64,
    pub skipped_in_flight: u64,
    pub skipped_no_config: u64,
    pub skipped_decrypt: u64,
}

impl RefreshCycleSummary {
    fn record(&mut self, outcome: RefreshOutcome) {
        match outcome {
            RefreshOutcome::Refreshed => {
                self.attempted += 1;
                self.succeeded += 1;
            }
            RefreshOutcome::FailedTerminal => {
                self.attempted += 1;
                self.failed_terminal += 1;
            }
            RefreshOutcome::FailedTransient => {
                self.attempted += 1;
                self.failed_transient += 1;
            }
            RefreshOutcome::RateLimited => {
                self.attempted += 1;
                self.rate_limited += 1;
            }
            RefreshOutcome::SkippedInFlight => self.skipped_in_flight += 1,
            RefreshOutcome::SkippedNoConfig => self.skipped_no_config += 1,
            RefreshOutcome::SkippedDecrypt => self.skipped_decrypt += 1,
        }
    }
}

/// Provider token endpoint response. Extra fields (scope, token_type) are
/// ignored.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<u64>,
}

impl TokenRefreshService {
    /// Create a new token refresh service instance
    pub fn new(
        config: Arc<AppConfig>,
        repo: Arc<ConnectionRepository>,
        registry: Arc<Registry>,
        in_flight: InFlightGuards,
    ) -> Self {
        let http = Self::build_http_client(config.token_refresh.http_timeout_seconds);
        Self {
            config,
            repo,
            registry,
            http,
            in_flight,
            cycle_gate: CycleGate::new(),
        }
    }

    fn build_http_client(timeout_seconds: u64) -> Client {
        Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_seconds))
            .build()
            .expect("Failed to create HTTP client")
    }

    /// Handle on the cycle gate, shared with the manual trigger endpoint.
    pub fn cycle_gate(&self) -> &CycleGate {
        &self.cycle_gate
    }

    /// Run the token refresh loop until the provided shutdown token fires
    #[instrument(skip_all)]
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            tick_seconds = self.config.token_refresh.tick_seconds,
            "Starting token refresh service"
        );
        let tick_interval = TokioDuration::from_secs(self.config.token_refresh.tick_seconds);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Token refresh service shutdown requested");
                    break;
                }
                _ = sleep(tick_interval) => {
                    if self.try_run_cycle().await.is_none() {
                        warn!("Previous refresh cycle still running, skipping this firing");
                    }
                }
            }
        }

        info!("Token refresh service stopped");
    }

    /// Execute one refresh cycle, unless one is already in flight.
    ///
    /// Returns `None` when the gate is held; the skipped firing is counted,
    /// never queued behind the running cycle.
    pub async fn try_run_cycle(&self) -> Option<RefreshCycleSummary> {
        let Some(_pass) = self.cycle_gate.try_acquire() else {
            counter!("token_refresh_cycles_skipped_total").increment(1);
            return None;
        };

        Some(self.run_cycle().await)
    }

    /// One pass over every connection due for refresh. Never errors: query
    /// failures produce an empty summary, per-connection failures are
    /// isolated and tallied.
    #[instrument(skip_all)]
    async fn run_cycle(&self) -> RefreshCycleSummary {
        let cycle_started = Instant::now();
        let mut summary = RefreshCycleSummary::default();

        let within = Duration::seconds(self.config.token_refresh.lead_time_seconds as i64);
        let due = match self.repo.list_due_for_refresh(within).await {
            Ok(due) => due,
            Err(err) => {
                error!(error = ?err, "Failed to query connections due for refresh");
                return summary;
            }
        };
        summary.connections_due = due.len() as u64;

        info!(
            connections_due = due.len(),
            lead_time_seconds = self.config.token_refresh.lead_time_seconds,
            "Found connections due for token refresh"
        );

        let semaphore = Arc::new(Semaphore::new(self.config.token_refresh.concurrency));
        let mut handles = Vec::new();

        for connection in due {
            let semaphore = Arc::clone(&semaphore);
            let service = self.clone();

            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.unwrap();
                service.refresh_with_jitter(&connection).await
            }));
        }

        for handle in handles {
            match handle.await {
                Ok(outcome) => summary.record(outcome),
                Err(err) => {
                    error!(error = ?err, "Refresh task panicked or was cancelled");
                    summary.record(RefreshOutcome::FailedTransient);
                }
            }
        }

        histogram!("token_refresh_cycle_duration_ms")
            .record(cycle_started.elapsed().as_secs_f64() * 1_000.0);

        debug!(
            connections_due = summary.connections_due,
            attempted = summary.attempted,
            succeeded = summary.succeeded,
            failed_terminal = summary.failed_terminal,
            failed_transient = summary.failed_transient,
            rate_limited = summary.rate_limited,
            skipped_in_flight = summary.skipped_in_flight,
            skipped_no_config = summary.skipped_no_config,
            skipped_decrypt = summary.skipped_decrypt,
            "Token refresh cycle completed"
        );

        summary
    }

    /// Refresh a single connection with jitter applied
    async fn refresh_with_jitter(&self, connection: &connection::Model) -> RefreshOutcome {
        let jitter_seconds = self.compute_jitter();
        if jitter_seconds > 0 {
            debug!(
                connection_id = %connection.id,
                jitter_seconds = jitter_seconds,
                "Applying jitter before token refresh"
            );
            sleep(TokioDuration::from_secs(jitter_seconds)).await;
        }

        self.refresh_connection(connection).await
    }

    /// Refresh a single connection's tokens
    #[instrument(skip_all, fields(connection_id = %connection.id, provider = %connection.provider))]
    pub async fn refresh_connection(&self, connection: &connection::Model) -> RefreshOutcome {
        let outcome = self.refresh_connection_inner(connection).await;

        let metric_labels = vec![
            ("provider", connection.provider.clone()),
            ("outcome", outcome.as_str().to_string()),
        ];
        counter!("token_refresh_outcome_total", &metric_labels).increment(1);

        outcome
    }

    async fn refresh_connection_inner(&self, connection: &connection::Model) -> RefreshOutcome {
        let Some(provider) = Provider::parse(&connection.provider) else {
            warn!("Unknown provider on connection, cannot refresh");
            return RefreshOutcome::SkippedNoConfig;
        };

        let Some(endpoint) = self.registry.refresh_config(provider) else {
            debug!("No refresh endpoint configured for provider");
            return RefreshOutcome::SkippedNoConfig;
        };

        let Some(_guard) = self.in_flight.try_begin(connection.user_id, provider) else {
            debug!("Connection already being worked on, skipping");
            return RefreshOutcome::SkippedInFlight;
        };

        let Some(refresh_token) = self.repo.decrypt_refresh_token(connection).await else {
            return RefreshOutcome::SkippedDecrypt;
        };

        let attempt_started = Instant::now();
        let response = self.post_refresh_request(endpoint, &refresh_token).await;
        histogram!("token_refresh_latency_ms")
            .record(attempt_started.elapsed().as_secs_f64() * 1_000.0);

        match response {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    self.apply_token_response(connection, response).await
                } else if status == StatusCode::TOO_MANY_REQUESTS {
                    warn!(
                        status = %status,
                        "Provider rate limited the refresh, will retry next cycle"
                    );
                    RefreshOutcome::RateLimited
                } else if status.is_client_error() {
                    let body = response.text().await.unwrap_or_default();
                    error!(
                        status = %status,
                        "Provider rejected the refresh token, marking connection for re-auth"
                    );
                    let reason = format!(
                        "token refresh rejected ({}): {}",
                        status.as_u16(),
                        snippet(&body)
                    );
                    self.park_connection(connection, &reason).await;
                    RefreshOutcome::FailedTerminal
                } else {
                    warn!(
                        status = %status,
                        "Provider token endpoint errored, will retry next cycle"
                    );
                    RefreshOutcome::FailedTransient
                }
            }
            Err(err) => {
                warn!(error = %err, "Token endpoint unreachable, will retry next cycle");
                RefreshOutcome::FailedTransient
            }
        }
    }

    /// Build and send the grant request for the endpoint's style.
    async fn post_refresh_request(
        &self,
        endpoint: &RefreshEndpoint,
        refresh_token: &str,
    ) -> Result<reqwest::Response, reqwest::Error> {
        let request = self
            .http
            .post(&endpoint.token_url)
            .header(reqwest::header::ACCEPT, "application/json");

        let request = match endpoint.grant_style {
            // Credentials in the Authorization header; the body carries
            // nothing but the grant itself
            GrantStyle::BasicAuthHeader => request
                .basic_auth(&endpoint.client_id, Some(&endpoint.client_secret))
                .form(&[
                    ("grant_type", "refresh_token"),
                    ("refresh_token", refresh_token),
                ]),
            GrantStyle::ClientSecretInBody => {
                let mut form: Vec<(&str, &str)> = vec![
                    ("grant_type", "refresh_token"),
                    ("refresh_token", refresh_token),
                    ("client_id", &endpoint.client_id),
                    ("client_secret", &endpoint.client_secret),
                ];
                for (key, value) in &endpoint.extra_params {
                    form.push((key, value));
                }
                request.form(&form)
            }
        };

        request.send().await
    }

    /// Parse a 2xx token response and persist the new pair.
    async fn apply_token_response(
        &self,
        connection: &connection::Model,
        response: reqwest::Response,
    ) -> RefreshOutcome {
        let body: TokenResponse = match response.json().await {
            Ok(body) => body,
            Err(err) => {
                error!(error = %err, "Provider returned an unparseable token response");
                self.park_connection(connection, "malformed token response")
                    .await;
                return RefreshOutcome::FailedTerminal;
            }
        };

        let Some(access_token) = body.access_token else {
            error!("Provider token response is missing access_token");
            self.park_connection(connection, "token response missing access_token")
                .await;
            return RefreshOutcome::FailedTerminal;
        };

        let expires_in = body.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECONDS);
        let expires_at = Utc::now() + Duration::seconds(expires_in as i64);

        match self
            .repo
            .update_tokens(
                connection,
                &access_token,
                body.refresh_token.as_deref(),
                expires_at,
            )
            .await
        {
            Ok(_) => {
                info!(
                    expires_in = expires_in,
                    rotated_refresh_token = body.refresh_token.is_some(),
                    "Refreshed connection tokens"
                );
                RefreshOutcome::Refreshed
            }
            Err(err) => {
                error!(error = ?err, "Failed to persist refreshed tokens");
                RefreshOutcome::FailedTransient
            }
        }
    }

    async fn park_connection(&self, connection: &connection::Model, reason: &str) {
        if let Err(err) = self
            .repo
            .mark_needs_reauth(&connection.user_id, &connection.provider, reason)
            .await
        {
            error!(error = ?err, "Failed to mark connection as needs_reauth");
        }
    }

    /// Compute jitter delay based on configuration
    fn compute_jitter(&self) -> u64 {
        let mut rng = rand::thread_rng();
        compute_jitter_seconds(
            self.config.token_refresh.tick_seconds,
            self.config.token_refresh.jitter_factor,
            &mut rng,
        )
    }

    /// On-demand refresh used by the manual operator endpoint. Same pipeline
    /// and guards as the background cycle.
    ///
    /// `Ok(None)` when no connection with this id exists.
    #[instrument(skip_all, fields(connection_id = %id))]
    pub async fn refresh_connection_by_id(
        &self,
        id: &Uuid,
    ) -> anyhow::Result<Option<RefreshOutcome>> {
        let Some(connection) = self.repo.find_by_id(id).await? else {
            return Ok(None);
        };

        info!(provider = %connection.provider, "Performing on-demand token refresh");
        counter!("token_refresh_on_demand_total").increment(1);

        Ok(Some(self.refresh_connection(&connection).await))
    }
}

/// UTF-8 safe prefix of a provider response body, for error messages.
fn snippet(body: &str) -> &str {
    match body.char_indices().nth(200) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}

/// Jitter delay drawn uniformly from `0..=tick_seconds * factor`. Spreads
/// refresh attempts within a cycle so a fleet restart does not hit every
/// provider token endpoint at once.
fn compute_jitter_seconds<R: Rng + ?Sized>(tick_seconds: u64, factor: f64, rng: &mut R) -> u64 {
    if factor <= 0.0 {
        return 0;
    }

    let max_delay_seconds = (tick_seconds as f64 * factor) as u64;
    if max_delay_seconds == 0 {
        return 0;
    }

    rng.gen_range(0..=max_delay_seconds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_tallies_by_outcome() {
        let mut summary = RefreshCycleSummary::default();
        for outcome in [
            RefreshOutcome::Refreshed,
            RefreshOutcome::Refreshed,
            RefreshOutcome::FailedTerminal,
            RefreshOutcome::RateLimited,
            RefreshOutcome::SkippedDecrypt,
        ] {
            summary.record(outcome);
        }

        assert_eq!(summary.attempted, 4);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.failed_terminal, 1);
        assert_eq!(summary.rate_limited, 1);
        assert_eq!(summary.skipped_decrypt, 1);
        assert_eq!(summary.skipped_in_flight, 0);
    }

    #[test]
    fn snippet_truncates_on_char_boundaries() {
        let body = "é".repeat(300);
        let cut = snippet(&body);
        assert_eq!(cut.chars().count(), 200);

        let short = "tiny";
        assert_eq!(snippet(short), "tiny");
    }

    #[test]
    fn outcome_labels_are_stable() {
        assert_eq!(RefreshOutcome::Refreshed.as_str(), "refreshed");
        assert_eq!(RefreshOutcome::SkippedInFlight.as_str(), "skipped_in_flight");
    }

    #[test]
    fn jitter_respects_bounds() {
        use rand::SeedableRng;

        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        for _ in 0..100 {
            let jitter = compute_jitter_seconds(300, 0.1, &mut rng);
            assert!(jitter <= 30);
        }

        assert_eq!(compute_jitter_seconds(300, 0.0, &mut rng), 0);
        assert_eq!(compute_jitter_seconds(0, 0.5, &mut rng), 0);
    }
}
