use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cardwise_core::catalog::source::HttpCatalogSource;
use cardwise_core::engine::{CardEngine, EngineOptions};
use cardwise_core::storage::memory::MemoryKeyValueStore;
use cardwise_core::storage::pg::PgKeyValueStore;
use cardwise_core::storage::KeyValueStore;

const REFRESH_LOCK_SCOPE: &str = "card_catalog";

#[derive(Debug, Parser)]
#[command(name = "cardwise_worker")]
struct Args {
    /// Refresh into an in-memory store instead of the database.
    #[arg(long)]
    dry_run: bool,

    /// Print search hits for this query after the refresh.
    #[arg(long)]
    query: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = cardwise_core::config::Settings::from_env()?;
    let _sentry_guard = init_sentry(&settings);

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_tracing::layer())
        .init();

    let args = Args::parse();

    let source = Arc::new(HttpCatalogSource::from_settings(&settings)?);
    let opts = EngineOptions::from_env();

    if args.dry_run {
        let engine = CardEngine::new(source, Arc::new(MemoryKeyValueStore::new()), opts);
        return refresh(&engine, args.query.as_deref(), true).await;
    }

    let db_url = settings.require_database_url()?;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(db_url)
        .await
        .context("connect DATABASE_URL failed")?;

    cardwise_core::storage::migrate(&pool).await?;

    let acquired = cardwise_core::storage::lock::try_acquire_refresh_lock(&pool, REFRESH_LOCK_SCOPE).await?;
    if !acquired {
        tracing::warn!(scope = REFRESH_LOCK_SCOPE, "refresh lock not acquired; another run in progress");
        return Ok(());
    }

    let store: Arc<dyn KeyValueStore> = Arc::new(PgKeyValueStore::from_settings(pool.clone(), &settings));
    let engine = CardEngine::new(source, store, opts);
    let res = refresh(&engine, args.query.as_deref(), false).await;

    if let Err(e) = cardwise_core::storage::lock::release_refresh_lock(&pool, REFRESH_LOCK_SCOPE).await {
        tracing::warn!(error = %e, "refresh lock release failed");
    }
    res
}

async fn refresh(engine: &CardEngine, query: Option<&str>, dry_run: bool) -> anyhow::Result<()> {
    let snapshot = match engine.cache().refresh().await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            let err = anyhow::Error::new(e).context("catalog refresh failed");
            sentry_anyhow::capture_anyhow(&err);
            tracing::error!(error = %format!("{err:#}"), "catalog refresh failed");
            return Err(err);
        }
    };

    let indexed = engine.search_index().rebuild(snapshot.clone());
    engine.search_index().persist().await;
    tracing::info!(cards = snapshot.len(), indexed, dry_run, "catalog refreshed");

    if let Some(q) = query {
        let hits = engine.search_index().search(q);
        tracing::info!(query = q, hits = hits.len(), "search results");
        for hit in hits {
            println!("{}\t{}\t{}", hit.key, hit.name, hit.issuer);
        }
    }

    Ok(())
}

fn init_sentry(settings: &cardwise_core::config::Settings) -> Option<sentry::ClientInitGuard> {
    let dsn = settings.sentry_dsn.as_deref()?;
    Some(sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            ..Default::default()
        },
    )))
}
