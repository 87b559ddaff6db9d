//! Name resolver: refreshes placeholder and stale display names of the
//! active run through an external identity service.

use async_trait::async_trait;
use chrono::Utc;
use mcstats_core::PlayerId;
use mcstats_storage::{CandidateQuery, NameCandidate, StatsStore, StoreError};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};

pub mod client;
pub mod config;

pub use client::MojangClient;
pub use config::ResolverConfig;

pub const CRATE_NAME: &str = "mcstats-resolver";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LookupError {
    #[error("identity not found")]
    NotFound,
    #[error("transient lookup failure: {0}")]
    Transient(String),
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("no active run; import at least once before resolving names")]
    NoActiveRun,
    #[error("run {0} does not exist")]
    UnknownRun(i64),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("building http client: {0}")]
    Client(#[source] reqwest::Error),
}

impl ResolveError {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) | Self::NoActiveRun | Self::UnknownRun(_) => 2,
            Self::Store(_) | Self::Client(_) => 1,
        }
    }
}

/// Remote source of truth for player display names.
#[async_trait]
pub trait IdentityService: Send + Sync {
    async fn resolve_current_name(&self, player: PlayerId) -> Result<String, LookupError>;
    /// Every known name, oldest first.
    async fn fetch_name_history(&self, player: PlayerId) -> Result<Vec<String>, LookupError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupOutcome {
    Found(String),
    NotFound,
    Transient(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolveSummary {
    pub run_id: i64,
    pub candidates: usize,
    /// External calls made; never more than `max_requests`.
    pub requests: usize,
    pub resolved: usize,
    pub not_found: usize,
    pub transient: usize,
    pub write_failures: usize,
    pub pauses: usize,
}

pub struct NameResolver<S, I> {
    store: S,
    service: I,
    config: ResolverConfig,
}

impl<S: StatsStore, I: IdentityService> NameResolver<S, I> {
    pub fn new(store: S, service: I, config: ResolverConfig) -> Self {
        Self {
            store,
            service,
            config,
        }
    }

    pub fn service(&self) -> &I {
        &self.service
    }

    pub async fn run(&self) -> Result<ResolveSummary, ResolveError> {
        let run_id = self.target_run().await?;
        let now = Utc::now();
        let stale_before = now - chrono::Duration::days(i64::from(self.config.refresh_days));
        let candidates = self
            .store
            .name_candidates(
                run_id,
                CandidateQuery {
                    limit: self.config.max_requests,
                    stale_before,
                },
            )
            .await?;
        info!(
            run_id,
            candidates = candidates.len(),
            max_requests = self.config.max_requests,
            refresh_days = self.config.refresh_days,
            dry_run = self.config.dry_run,
            "resolving player names"
        );

        let mut summary = ResolveSummary {
            run_id,
            candidates: candidates.len(),
            ..ResolveSummary::default()
        };
        let mut budget = self.config.max_requests;
        for (index, candidate) in candidates.iter().enumerate() {
            if budget == 0 {
                debug!(remaining = candidates.len() - index, "request cap reached");
                break;
            }
            if index > 0 && !self.config.sleep.is_zero() {
                tokio::time::sleep(self.config.sleep).await;
                summary.pauses += 1;
            }
            let span = info_span!("lookup", player = %candidate.player, source = candidate.name_source.as_str());
            self.resolve_one(run_id, candidate, &mut budget, &mut summary)
                .instrument(span)
                .await;
        }
        summary.requests = self.config.max_requests - budget;

        info!(
            run_id,
            candidates = summary.candidates,
            requests = summary.requests,
            resolved = summary.resolved,
            not_found = summary.not_found,
            transient = summary.transient,
            write_failures = summary.write_failures,
            "name resolution finished"
        );
        Ok(summary)
    }

    async fn target_run(&self) -> Result<i64, ResolveError> {
        match self.config.run_id {
            Some(run_id) => self
                .store
                .run(run_id)
                .await?
                .map(|run| run.id)
                .ok_or(ResolveError::UnknownRun(run_id)),
            None => self
                .store
                .active_run()
                .await?
                .map(|run| run.id)
                .ok_or(ResolveError::NoActiveRun),
        }
    }

    /// Current name first. The history is only asked when the service
    /// definitively has no current name and `budget` still allows a call.
    /// Each call made is taken from `budget`.
    pub async fn lookup(&self, player: PlayerId, budget: &mut usize) -> LookupOutcome {
        if *budget == 0 {
            return LookupOutcome::Transient("request cap reached".to_string());
        }
        *budget -= 1;
        match self.service.resolve_current_name(player).await {
            Ok(name) if !name.is_empty() => return LookupOutcome::Found(name),
            Ok(_) | Err(LookupError::NotFound) => {}
            Err(LookupError::Transient(reason)) => return LookupOutcome::Transient(reason),
        }
        if *budget == 0 {
            return LookupOutcome::Transient("request cap reached before the name history".to_string());
        }
        *budget -= 1;
        match self.service.fetch_name_history(player).await {
            Ok(names) => match names.into_iter().rev().find(|name| !name.is_empty()) {
                Some(name) => LookupOutcome::Found(name),
                None => LookupOutcome::NotFound,
            },
            Err(LookupError::NotFound) => LookupOutcome::NotFound,
            Err(LookupError::Transient(reason)) => LookupOutcome::Transient(reason),
        }
    }

    async fn resolve_one(
        &self,
        run_id: i64,
        candidate: &NameCandidate,
        budget: &mut usize,
        summary: &mut ResolveSummary,
    ) {
        match self.lookup(candidate.player, budget).await {
            LookupOutcome::Found(name) => {
                if self.config.dry_run {
                    info!(old = %candidate.name, new = %name, "would update name");
                    summary.resolved += 1;
                    return;
                }
                match self
                    .store
                    .record_resolved_name(run_id, candidate.player, &name, Utc::now())
                    .await
                {
                    Ok(true) => {
                        summary.resolved += 1;
                        if name != candidate.name {
                            info!(old = %candidate.name, new = %name, "updated name");
                        } else {
                            debug!(name = %name, "name confirmed");
                        }
                    }
                    Ok(false) => debug!("profile disappeared before the update"),
                    Err(err) => {
                        summary.write_failures += 1;
                        warn!(error = %err, "storing resolved name failed");
                    }
                }
            }
            LookupOutcome::NotFound => {
                summary.not_found += 1;
                info!("identity service has no name for player");
            }
            LookupOutcome::Transient(reason) => {
                summary.transient += 1;
                warn!(%reason, "name lookup failed; will retry on a later run");
            }
        }
    }
}
