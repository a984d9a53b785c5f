//! # Platform Poll Scheduler
//!
//! Background task that walks connected accounts on a per-provider cadence,
//! fetches each provider's sub-resources with the stored access token, and
//! appends the raw response bodies to `raw_platform_data`.
//!
//! Connections are processed one at a time with pacing sleeps between
//! providers and users. The pacing is an unconditional outbound throttle to
//! stay friendly with third-party APIs; the inbound rate limiter is a
//! separate concern.

use chrono::{DateTime, Duration, Utc};
use metrics::{counter, histogram};
use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::time::{Duration as TokioDuration, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::inflight::{CycleGate, InFlightGuards};
use crate::models::ConnectionStatus;
use crate::models::connection;
use crate::providers::{PollEndpoint, Provider, Registry};
use crate::repositories::{ConnectionRepository, RawDatumRepository};

/// Background platform poll service
pub struct PollScheduler {
    config: Arc<AppConfig>,
    repo: Arc<ConnectionRepository>,
    raw_data: Arc<RawDatumRepository>,
    registry: Arc<Registry>,
    http: Client,
    in_flight: InFlightGuards,
    cycle_gate: CycleGate,
    /// When each provider was last polled. In-memory: a restart simply makes
    /// every provider due again.
    last_runs: Mutex<HashMap<Provider, DateTime<Utc>>>,
}

/// Tally of one poll cycle
#[derive(Debug, Clone, Default, Serialize, ToSchema)]
pub struct PollCycleSummary {
    pub providers_due: u64,
    pub users_processed: u64,
    pub connections_polled: u64,
    pub polls_attempted: u64,
    pub polls_succeeded: u64,
    pub polls_failed: u64,
    pub reauth_marked: u64,
    pub skipped_in_flight: u64,
    pub skipped_decrypt: u64,
}

/// Outcome of one sub-resource fetch
enum FetchOutcome {
    Stored { item_count: usize },
    Unauthorized,
    Failed,
}

impl PollScheduler {
    /// Create a new poll scheduler instance
    pub fn new(
        config: Arc<AppConfig>,
        repo: Arc<ConnectionRepository>,
        raw_data: Arc<RawDatumRepository>,
        registry: Arc<Registry>,
        in_flight: InFlightGuards,
    ) -> Self {
        let http = Self::build_http_client(config.poll.http_timeout_seconds);
        Self {
            config,
            repo,
            raw_data,
            registry,
            http,
            in_flight,
            cycle_gate: CycleGate::new(),
            last_runs: Mutex::new(HashMap::new()),
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

    /// Run the poll loop until the provided shutdown token fires
    #[instrument(skip_all)]
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            tick_seconds = self.config.poll.tick_seconds,
            "Starting platform poll service"
        );
        let tick_interval = TokioDuration::from_secs(self.config.poll.tick_seconds);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Platform poll service shutdown requested");
                    break;
                }
                _ = sleep(tick_interval) => {
                    if self.try_run_cycle(None).await.is_none() {
                        warn!("Previous poll cycle still running, skipping this firing");
                    }
                }
            }
        }

        info!("Platform poll service stopped");
    }

    /// Execute one poll cycle, unless one is already in flight.
    ///
    /// `force` narrows the cycle to a single provider and ignores its
    /// cadence; `None` polls whatever is due.
    pub async fn try_run_cycle(&self, force: Option<Provider>) -> Option<PollCycleSummary> {
        let Some(_pass) = self.cycle_gate.try_acquire() else {
            counter!("poll_cycles_skipped_total").increment(1);
            return None;
        };

        Some(self.run_cycle(force).await)
    }

    /// One pass over every connected account of every due provider. Never
    /// errors: failures are tallied per sub-resource, never propagated.
    #[instrument(skip_all)]
    async fn run_cycle(&self, force: Option<Provider>) -> PollCycleSummary {
        let cycle_started = Instant::now();
        let mut summary = PollCycleSummary::default();
        let now = Utc::now();

        let due = self.due_providers(now, force);
        summary.providers_due = due.len() as u64;
        if due.is_empty() {
            debug!("No providers due for polling");
            return summary;
        }

        info!(
            providers = ?due.iter().map(Provider::as_str).collect::<Vec<_>>(),
            "Polling due providers"
        );

        let connections = match self.repo.list_by_status(&[ConnectionStatus::Connected]).await {
            Ok(connections) => connections,
            Err(err) => {
                error!(error = ?err, "Failed to load connected accounts for polling");
                return summary;
            }
        };

        self.advance_last_runs(&due, now);

        // BTreeMap keeps user iteration order deterministic
        let mut by_user: BTreeMap<Uuid, Vec<(Provider, connection::Model)>> = BTreeMap::new();
        for connection in connections {
            let Some(provider) = Provider::parse(&connection.provider) else {
                continue;
            };
            if due.contains(&provider) {
                by_user
                    .entry(connection.user_id)
                    .or_default()
                    .push((provider, connection));
            }
        }

        let total_users = by_user.len();
        for (user_index, (_user_id, user_connections)) in by_user.into_iter().enumerate() {
            summary.users_processed += 1;

            let total_connections = user_connections.len();
            for (connection_index, (provider, connection)) in
                user_connections.into_iter().enumerate()
            {
                self.poll_connection(provider, &connection, &mut summary)
                    .await;

                if connection_index + 1 < total_connections {
                    sleep(TokioDuration::from_millis(self.config.poll.provider_pause_ms)).await;
                }
            }

            if user_index + 1 < total_users {
                sleep(TokioDuration::from_millis(self.config.poll.user_pause_ms)).await;
            }
        }

        histogram!("poll_cycle_duration_ms")
            .record(cycle_started.elapsed().as_secs_f64() * 1_000.0);
        counter!("poll_subresources_attempted_total").increment(summary.polls_attempted);
        counter!("poll_subresources_succeeded_total").increment(summary.polls_succeeded);
        counter!("poll_subresources_failed_total").increment(summary.polls_failed);

        debug!(
            providers_due = summary.providers_due,
            users_processed = summary.users_processed,
            connections_polled = summary.connections_polled,
            polls_attempted = summary.polls_attempted,
            polls_succeeded = summary.polls_succeeded,
            polls_failed = summary.polls_failed,
            reauth_marked = summary.reauth_marked,
            skipped_in_flight = summary.skipped_in_flight,
            skipped_decrypt = summary.skipped_decrypt,
            "Poll cycle completed"
        );

        summary
    }

    /// Providers to poll this cycle.
    fn due_providers(&self, now: DateTime<Utc>, force: Option<Provider>) -> Vec<Provider> {
        if let Some(provider) = force {
            return if self.registry.poll_plan(provider).is_some() {
                vec![provider]
            } else {
                vec![]
            };
        }

        let last_runs = self.last_runs.lock().unwrap_or_else(PoisonError::into_inner);
        self.registry
            .pollable_providers()
            .into_iter()
            .filter(|provider| match self.registry.poll_plan(*provider) {
                Some(plan) => is_due(last_runs.get(provider), plan.interval_seconds, now),
                None => false,
            })
            .collect()
    }

    fn advance_last_runs(&self, providers: &[Provider], now: DateTime<Utc>) {
        let mut last_runs = self.last_runs.lock().unwrap_or_else(PoisonError::into_inner);
        for provider in providers {
            last_runs.insert(*provider, now);
        }
    }

    /// Poll every sub-resource of one connection, then record the overall
    /// sync outcome on the row.
    #[instrument(skip_all, fields(connection_id = %connection.id, provider = %connection.provider))]
    async fn poll_connection(
        &self,
        provider: Provider,
        connection: &connection::Model,
        summary: &mut PollCycleSummary,
    ) {
        let Some(plan) = self.registry.poll_plan(provider) else {
            return;
        };

        let Some(_guard) = self.in_flight.try_begin(connection.user_id, provider) else {
            debug!("Connection already being worked on, skipping poll");
            summary.skipped_in_flight += 1;
            return;
        };

        let Some(access_token) = self.repo.decrypt_access_token(connection).await else {
            summary.skipped_decrypt += 1;
            return;
        };

        summary.connections_polled += 1;

        let username = connection_username(connection);
        let total = plan.endpoints.len();
        let mut succeeded = 0usize;

        for endpoint in &plan.endpoints {
            summary.polls_attempted += 1;

            let Some(url) = endpoint.render_url(username.as_deref()) else {
                warn!(
                    data_type = %endpoint.data_type,
                    "No platform username on connection; set platform_user_id or metadata.username"
                );
                summary.polls_failed += 1;
                continue;
            };

            match self.fetch_endpoint(connection, endpoint, &url, &access_token).await {
                FetchOutcome::Stored { item_count } => {
                    debug!(
                        data_type = %endpoint.data_type,
                        item_count = item_count,
                        "Stored raw payload"
                    );
                    succeeded += 1;
                    summary.polls_succeeded += 1;
                }
                FetchOutcome::Unauthorized => {
                    summary.polls_failed += 1;
                    summary.reauth_marked += 1;
                    warn!(
                        data_type = %endpoint.data_type,
                        "Provider rejected the access token, marking connection for re-auth"
                    );
                    if let Err(err) = self
                        .repo
                        .mark_needs_reauth(
                            &connection.user_id,
                            &connection.provider,
                            "poll unauthorized (401)",
                        )
                        .await
                    {
                        error!(error = ?err, "Failed to mark connection as needs_reauth");
                    }
                    // A dead token fails every remaining sub-resource too
                    break;
                }
                FetchOutcome::Failed => {
                    summary.polls_failed += 1;
                }
            }
        }

        let detail = format!("{}/{} sub-resources ok", succeeded, total);
        if let Err(err) = self
            .repo
            .mark_sync_result(
                &connection.user_id,
                &connection.provider,
                succeeded > 0,
                &detail,
            )
            .await
        {
            error!(error = ?err, "Failed to record sync result");
        }
    }

    /// Fetch one sub-resource and append the body to raw storage.
    async fn fetch_endpoint(
        &self,
        connection: &connection::Model,
        endpoint: &PollEndpoint,
        url: &str,
        access_token: &str,
    ) -> FetchOutcome {
        let response = self
            .http
            .get(url)
            .bearer_auth(access_token)
            .header(reqwest::header::ACCEPT, "application/json")
            .query(&endpoint.query)
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(err) => {
                warn!(
                    data_type = %endpoint.data_type,
                    error = %err,
                    "Poll request failed"
                );
                return FetchOutcome::Failed;
            }
        };

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return FetchOutcome::Unauthorized;
        }
        if !status.is_success() {
            warn!(
                data_type = %endpoint.data_type,
                status = %status,
                "Provider returned an error for sub-resource"
            );
            return FetchOutcome::Failed;
        }

        let payload: JsonValue = match response.json().await {
            Ok(payload) => payload,
            Err(err) => {
                warn!(
                    data_type = %endpoint.data_type,
                    error = %err,
                    "Provider returned a non-JSON body"
                );
                return FetchOutcome::Failed;
            }
        };

        let item_count = endpoint.result_shape.count_items(&payload);

        match self
            .raw_data
            .insert(
                &connection.user_id,
                &connection.provider,
                &endpoint.data_type,
                payload,
            )
            .await
        {
            Ok(_) => FetchOutcome::Stored { item_count },
            Err(err) => {
                error!(
                    data_type = %endpoint.data_type,
                    error = ?err,
                    "Failed to persist raw payload"
                );
                FetchOutcome::Failed
            }
        }
    }
}

/// Whether a provider's cadence has elapsed. Never-run providers are due.
fn is_due(last_run: Option<&DateTime<Utc>>, interval_seconds: u64, now: DateTime<Utc>) -> bool {
    match last_run {
        Some(last) => *last + Duration::seconds(interval_seconds as i64) <= now,
        None => true,
    }
}

/// Platform-side username for URL templating: `platform_user_id` first,
/// falling back to `metadata.username`.
fn connection_username(connection: &connection::Model) -> Option<String> {
    if let Some(platform_user_id) = &connection.platform_user_id
        && !platform_user_id.is_empty()
    {
        return Some(platform_user_id.clone());
    }

    connection
        .metadata
        .as_ref()
        .and_then(|metadata| metadata.get("username"))
        .and_then(JsonValue::as_str)
        .map(str::to_string)
}
