//! Per-client access counting over the store's append-only log.
//!
//! Each processed request appends `timestamp:client_ip` to a single log file.
//! Counting scans the whole log, so cost grows with the log until it is purged
//! through [`CacheStore::release`].

use std::time::Duration;

use time::OffsetDateTime;
use tracing::debug;

use super::{context::RequestContext, store::CacheStore};

/// Store key of the access log.
pub const ACCESS_LOG_KEY: &str = "access_log";

/// Result of a rate-limit check for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessDecision {
    pub recent: u64,
    pub allowed: bool,
}

#[derive(Debug, Clone)]
pub struct AccessRateLimiter {
    store: CacheStore,
}

impl AccessRateLimiter {
    pub fn new(store: CacheStore) -> Self {
        Self { store }
    }

    /// Records one access by the requester.
    pub async fn log_access(&self, ctx: &RequestContext) {
        self.log_access_at(ctx, now_unix()).await;
    }

    pub async fn log_access_at(&self, ctx: &RequestContext, timestamp: i64) {
        let line = format!("{timestamp}:{}", ctx.client_ip());
        self.store.append(ACCESS_LOG_KEY, &line).await;
    }

    /// Counts the requester's accesses within the last `window_seconds`.
    pub async fn count_recent_accesses(&self, ctx: &RequestContext, window_seconds: u64) -> u64 {
        self.count_recent_accesses_at(&ctx.client_ip(), window_seconds, now_unix())
            .await
    }

    /// Counts accesses by a raw client address, as recorded in the log.
    pub async fn count_recent_accesses_by_ip(&self, ip: &str, window_seconds: u64) -> u64 {
        self.count_recent_accesses_at(ip, window_seconds, now_unix())
            .await
    }

    /// Counts accesses by `ip` with `now - window <= timestamp <= now`.
    pub async fn count_recent_accesses_at(&self, ip: &str, window_seconds: u64, now: i64) -> u64 {
        let Some(raw) = self.store.get(ACCESS_LOG_KEY, Duration::MAX).await else {
            return 0;
        };
        let window = i64::try_from(window_seconds).unwrap_or(i64::MAX);
        let since = now.saturating_sub(window);

        let text = String::from_utf8_lossy(&raw);
        let mut count = 0;
        for line in text.lines() {
            let Some((timestamp, client)) = parse_line(line) else {
                continue;
            };
            if client == ip && (since..=now).contains(&timestamp) {
                count += 1;
            }
        }
        count
    }

    /// Logs the access, then reports whether the requester stays within
    /// `max_requests` over `window_seconds`.
    pub async fn check(
        &self,
        ctx: &RequestContext,
        window_seconds: u64,
        max_requests: u64,
    ) -> AccessDecision {
        let now = now_unix();
        self.log_access_at(ctx, now).await;
        let recent = self
            .count_recent_accesses_at(&ctx.client_ip(), window_seconds, now)
            .await;
        let allowed = recent <= max_requests;
        if !allowed {
            debug!(
                client_ip = %ctx.client_ip(),
                recent,
                max_requests,
                "access ceiling exceeded"
            );
        }
        AccessDecision { recent, allowed }
    }
}

fn parse_line(line: &str) -> Option<(i64, &str)> {
    let (timestamp, client) = line.trim().split_once(':')?;
    let timestamp = timestamp.parse().ok()?;
    (!client.is_empty()).then_some((timestamp, client))
}

fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}
