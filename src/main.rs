use std::{process, sync::Arc};

use pagecache::{
    cache::{AccessRateLimiter, CacheState, CacheStore, PageCache},
    config::{self, AccessCountArgs, Settings},
    infra::{error::InfraError, http, telemetry, upstream::UpstreamOrigin},
};
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &InfraError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), InfraError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Purge(_) => run_purge(settings).await,
        config::Command::AccessCount(args) => run_access_count(settings, args).await,
    }
}

async fn run_serve(settings: Settings) -> Result<(), InfraError> {
    let origin = Arc::new(UpstreamOrigin::new(&settings.origin)?);

    let cache = PageCache::new(settings.cache.clone());
    let root = cache.store().ensure_root().await?;
    info!(
        root = %root.display(),
        upstream = %origin.base(),
        max_age_seconds = settings.cache.max_age_seconds,
        rate_limit = settings.rate_limit.enabled,
        "page cache ready"
    );

    let state = CacheState::new(cache, settings.rate_limit.clone());
    let router = http::build_router(state, origin);
    http::serve(&settings.server, router).await
}

async fn run_purge(settings: Settings) -> Result<(), InfraError> {
    let store = CacheStore::new(settings.cache.root.clone());
    let removed = store.release().await?;
    info!(root = %store.root().display(), removed, "cache purged");
    println!("removed {removed} entries from {}", store.root().display());
    Ok(())
}

async fn run_access_count(settings: Settings, args: AccessCountArgs) -> Result<(), InfraError> {
    let limiter = AccessRateLimiter::new(CacheStore::new(settings.cache.root.clone()));
    let count = limiter
        .count_recent_accesses_by_ip(args.ip.trim(), args.window)
        .await;
    println!("{count}");
    Ok(())
}
