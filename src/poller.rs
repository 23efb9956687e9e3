//! The fallback that asks the provider about payments whose callback never
//! arrived.

use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use rusqlite::Connection;
use time::OffsetDateTime;
use tokio::{sync::watch, task::JoinSet, time::interval};

use crate::{
    Error, RateLimiter,
    aggregate::audit_aggregates,
    mpesa::{PaymentProvider, ProviderOutcome},
    payment::{
        PaymentRequest, get_overdue_requests, mark_timed_out, purge_resolved_requests,
        record_poll_attempt,
    },
    reconciliation::{NewReconciliationItem, ReconciliationKind, enqueue},
    settlement::{Settled, Settlement},
};

/// Controls when and how hard the poller chases unanswered requests.
#[derive(Debug, Clone, PartialEq)]
pub struct PollerConfig {
    /// How long to wait for a callback before polling a request.
    pub callback_timeout: Duration,
    /// The time between polling cycles.
    pub poll_interval: Duration,
    /// The number of status queries after which a request times out.
    pub max_attempts: u32,
    /// The age after which a request times out.
    pub max_elapsed: Duration,
    /// The most requests polled, and items replayed, per cycle.
    pub batch_size: u32,
    /// How long resolved requests are kept.
    pub retention: Duration,
    /// Audit every aggregate once per this many cycles.
    pub audit_every: u32,
    /// The number of times a reconciliation item is replayed before it is
    /// left for an operator.
    pub replay_max_attempts: u32,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            callback_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(30),
            max_attempts: 10,
            max_elapsed: Duration::from_secs(15 * 60),
            batch_size: 50,
            retention: Duration::from_secs(30 * 24 * 60 * 60),
            audit_every: 20,
            replay_max_attempts: 5,
        }
    }
}

/// What a polling pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    /// Requests the provider was asked about.
    pub polled: usize,
    /// Requests that succeeded or failed.
    pub resolved: usize,
    /// Requests still waiting on the customer or a reachable provider.
    pub pending: usize,
    /// Requests that ran out of attempts or time.
    pub timed_out: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PollResult {
    Resolved,
    Pending,
    TimedOut,
}

/// Polls the provider for requests that have gone without a callback.
#[derive(Clone)]
pub struct StatusPoller {
    db_connection: Arc<Mutex<Connection>>,
    provider: Arc<dyn PaymentProvider>,
    settlement: Arc<Settlement>,
    rate_limiter: Option<Arc<RateLimiter>>,
    config: PollerConfig,
}

impl StatusPoller {
    /// Create a poller.
    pub fn new(
        db_connection: Arc<Mutex<Connection>>,
        provider: Arc<dyn PaymentProvider>,
        settlement: Arc<Settlement>,
        config: PollerConfig,
    ) -> Self {
        Self {
            db_connection,
            provider,
            settlement,
            rate_limiter: None,
            config,
        }
    }

    /// Evict quiet keys from `rate_limiter` on every cycle.
    pub fn with_rate_limiter(mut self, rate_limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = Some(rate_limiter);
        self
    }

    /// Run polling cycles until `shutdown` changes or its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            poll_interval = ?self.config.poll_interval,
            callback_timeout = ?self.config.callback_timeout,
            "Status poller started"
        );

        let mut ticker = interval(self.config.poll_interval);
        let mut cycle: u32 = 0;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    tracing::info!("Shutdown signal received, stopping status poller");
                    break;
                }
                _ = ticker.tick() => {
                    cycle = cycle.wrapping_add(1);
                    self.run_cycle(cycle).await;
                }
            }
        }

        tracing::info!("Status poller stopped");
    }

    async fn run_cycle(&self, cycle: u32) {
        let now = OffsetDateTime::now_utc();

        match self.poll_once(now).await {
            Ok(summary) if summary.polled + summary.timed_out > 0 => {
                tracing::info!(
                    polled = summary.polled,
                    resolved = summary.resolved,
                    pending = summary.pending,
                    timed_out = summary.timed_out,
                    "Finished polling cycle"
                );
            }
            Ok(_) => {}
            Err(error) => tracing::error!("Polling cycle failed: {error}"),
        }

        if let Err(error) = self
            .settlement
            .replay_pending(self.config.replay_max_attempts, self.config.batch_size)
        {
            tracing::error!("Could not replay reconciliation items: {error}");
        }

        if let Err(error) = self.housekeeping(now, cycle) {
            tracing::error!("Housekeeping failed: {error}");
        }
    }

    /// Poll every overdue request once.
    ///
    /// Requests that have used up their attempts or time are marked timed out
    /// and queued for review instead of being polled.
    ///
    /// # Errors
    /// Returns an error if the overdue requests cannot be read.
    pub async fn poll_once(&self, now: OffsetDateTime) -> Result<PollSummary, Error> {
        let requests = {
            let connection = self
                .db_connection
                .lock()
                .map_err(|_| Error::DatabaseLockError)?;
            get_overdue_requests(
                now - self.config.callback_timeout,
                self.config.batch_size,
                &connection,
            )?
        };

        let mut tasks = JoinSet::new();
        for request in requests {
            let poller = self.clone();
            tasks.spawn(async move { poller.poll_request(request, now).await });
        }

        let mut summary = PollSummary::default();
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(Ok(PollResult::Resolved)) => {
                    summary.polled += 1;
                    summary.resolved += 1;
                }
                Ok(Ok(PollResult::Pending)) => {
                    summary.polled += 1;
                    summary.pending += 1;
                }
                Ok(Ok(PollResult::TimedOut)) => summary.timed_out += 1,
                Ok(Err(error)) => {
                    tracing::error!("Could not poll payment request: {error}");
                    summary.pending += 1;
                }
                Err(error) => tracing::error!("Polling task panicked: {error}"),
            }
        }

        Ok(summary)
    }

    async fn poll_request(
        &self,
        request: PaymentRequest,
        now: OffsetDateTime,
    ) -> Result<PollResult, Error> {
        let checkout_request_id = request.checkout_request_id.as_str();
        let elapsed = now - request.created_at;

        if request.poll_attempts >= self.config.max_attempts || elapsed >= self.config.max_elapsed
        {
            return self.time_out(&request);
        }

        {
            let connection = self
                .db_connection
                .lock()
                .map_err(|_| Error::DatabaseLockError)?;
            record_poll_attempt(checkout_request_id, &connection)?;
        }

        let outcome = match self.provider.query_status(&request).await {
            Ok(ProviderOutcome::Pending) => return Ok(PollResult::Pending),
            Ok(outcome) => outcome,
            Err(error) if error.is_still_processing() => return Ok(PollResult::Pending),
            Err(error) if error.is_transient() => {
                tracing::warn!(checkout_request_id, "Status query failed, will retry: {error}");
                return Ok(PollResult::Pending);
            }
            Err(error) => {
                tracing::error!(checkout_request_id, "Status query was rejected: {error}");
                return Ok(PollResult::Pending);
            }
        };

        match self.settlement.apply(checkout_request_id, outcome, now)? {
            Settled::Pending => Ok(PollResult::Pending),
            _ => Ok(PollResult::Resolved),
        }
    }

    fn time_out(&self, request: &PaymentRequest) -> Result<PollResult, Error> {
        let connection = self
            .db_connection
            .lock()
            .map_err(|_| Error::DatabaseLockError)?;

        if mark_timed_out(&request.checkout_request_id, &connection)? {
            tracing::warn!(
                checkout_request_id = %request.checkout_request_id,
                poll_attempts = request.poll_attempts,
                "Gave up waiting for payment result"
            );
            enqueue(
                ReconciliationKind::TimedOut,
                NewReconciliationItem {
                    checkout_request_id: Some(&request.checkout_request_id),
                    reason: &format!(
                        "no result after {} status queries",
                        request.poll_attempts
                    ),
                    ..Default::default()
                },
                &connection,
            )?;
        }

        Ok(PollResult::TimedOut)
    }

    fn housekeeping(&self, now: OffsetDateTime, cycle: u32) -> Result<(), Error> {
        let mut connection = self
            .db_connection
            .lock()
            .map_err(|_| Error::DatabaseLockError)?;

        let purged = purge_resolved_requests(now - self.config.retention, &connection)?;
        if purged > 0 {
            tracing::info!(purged, "Purged resolved payment requests");
        }

        if self.config.audit_every > 0 && cycle % self.config.audit_every == 0 {
            let drifts = audit_aggregates(&mut connection)?;
            tracing::info!(drifted = drifts.len(), "Audited category totals");
        }
        drop(connection);

        if let Some(rate_limiter) = &self.rate_limiter {
            rate_limiter.evict_expired(Instant::now());
        }

        Ok(())
    }
}
