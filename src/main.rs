mod api;
mod auth;
mod cache;
mod chat;
mod cli;
mod config;
mod engine;
mod error;
mod fs_layout;
mod job;
mod models;
mod stream;
mod tag;
mod upload;

use std::sync::Arc;

use env_logger::Env;
use http_cache_reqwest::{CACacheManager, Cache, CacheMode, HttpCache, HttpCacheOptions};
use log::{error, info};
use reqwest_middleware::ClientBuilder;
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::auth::{AuthManager, Credentials};
use crate::cache::Caches;
use crate::chat::LoggingChatAdapter;
use crate::config::CONFIG;
use crate::engine::{DownloadEngine, EngineLimits};
use crate::fs_layout::DownloadDir;
use crate::job::JobController;
use crate::upload::UploadBatcher;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let matches = cli::cli().get_matches();
    match matches.subcommand() {
        Some(("run", run_matches)) => {
            if let Err(e) = run(cli::config_path(run_matches)).await {
                error!("fatal error: {e}");
                std::process::exit(1);
            }
        }
        _ => unreachable!("all subcommands are defined above"),
    }
}

async fn run(config_path: Option<&str>) -> anyhow::Result<()> {
    config::init_config(config_path).await?;
    let settings = CONFIG.read().await.clone().expect("config initialized above");

    let credentials_dir = std::path::PathBuf::from(&settings.credentials_dir);
    fs_layout::ensure_private_dir(&credentials_dir)?;

    let credentials = AuthManager::load(&credentials_dir).unwrap_or(Credentials {
        access_token: settings.login_key.access_token.clone().unwrap_or_default(),
        refresh_token: settings.login_key.refresh_token.clone().unwrap_or_default(),
        expires_at: settings.login_key.expires_at.unwrap_or(0),
    });

    let http = build_http_client();

    let auth = Arc::new(AuthManager::new(
        settings.api_key.client_id.clone(),
        settings.api_key.client_secret.clone(),
        credentials_dir.clone(),
        credentials,
        http.clone(),
    ));

    let catalog = Arc::new(api::CatalogClient::new(auth.clone(), http.clone()));
    let caches = Arc::new(Caches::new());
    let dir = DownloadDir::new(settings.download_root.clone());
    dir.ensure_root().await.map_err(|e| anyhow::anyhow!("{e}"))?;

    let limits = EngineLimits {
        album_download_concurrency: settings.album_download_concurrency as usize,
        playlist_download_concurrency: settings.playlist_download_concurrency as usize,
        mix_download_concurrency: settings.mix_download_concurrency as usize,
        vnd_concurrency: settings.vnd_concurrency as usize,
    };
    let engine = Arc::new(DownloadEngine::new(
        catalog.clone(),
        http.clone(),
        caches.clone(),
        dir.clone(),
        limits,
    ));

    let chat_adapter: Arc<dyn chat::ChatAdapter> = Arc::new(LoggingChatAdapter);
    let upload = Arc::new(UploadBatcher::new(
        chat_adapter.clone(),
        caches.clone(),
        dir.clone(),
        settings.album_upload_concurrency as usize,
        settings.signature.clone(),
    ));

    let controller = Arc::new(JobController::new(
        chat_adapter,
        auth,
        engine,
        upload,
        settings.from_ids.clone(),
        settings.api_key.client_id.clone(),
        settings.api_key.client_secret.clone(),
        credentials_dir,
        http,
    ));

    info!("tidal-relay is ready - no chat transport is wired in, reading commands from stdin");
    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();
    while let Some(line) = lines.next_line().await? {
        controller.process(0, 0, &line).await;
    }
    Ok(())
}

fn build_http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .build()
        .expect("failed to build http client")
}

/// A caching, transient-error-retrying client for the small fraction of
/// calls (cover art, segment/range fetches) that benefit from it. Kept
/// separate from the bearer-token catalog calls, which always need a fresh
/// Authorization header.
#[allow(dead_code)]
fn build_cached_http_client() -> reqwest_middleware::ClientWithMiddleware {
    ClientBuilder::new(reqwest::Client::new())
        .with(Cache(HttpCache {
            mode: CacheMode::Default,
            manager: CACacheManager::default(),
            options: HttpCacheOptions::default(),
        }))
        .with(RetryTransientMiddleware::new_with_policy(
            ExponentialBackoff::builder().build_with_max_retries(3),
        ))
        .build()
}
