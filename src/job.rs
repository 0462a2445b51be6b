use std::sync::Arc;
use std::time::Duration;

use log::{error, info};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::auth::AuthManager;
use crate::chat::ChatAdapter;
use crate::engine::DownloadEngine;
use crate::error::Flaw;
use crate::models::{Kind, Link};
use crate::upload::UploadBatcher;

const MAX_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF_UNIT: Duration = Duration::from_secs(3);

struct RunningJob {
    id: String,
    cancel: CancellationToken,
}

/// Owns the single-job invariant: at most one Download Engine call is ever
/// in flight. `TryLock` failing is itself the "a job is running" signal,
/// rather than a separately tracked boolean.
pub struct JobController {
    slot: Mutex<Option<RunningJob>>,
    chat: Arc<dyn ChatAdapter>,
    auth: Arc<AuthManager>,
    engine: Arc<DownloadEngine>,
    upload: Arc<UploadBatcher>,
    from_ids: Vec<i64>,
    client_id: String,
    client_secret: String,
    credentials_dir: std::path::PathBuf,
    http: reqwest::Client,
}

impl JobController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chat: Arc<dyn ChatAdapter>,
        auth: Arc<AuthManager>,
        engine: Arc<DownloadEngine>,
        upload: Arc<UploadBatcher>,
        from_ids: Vec<i64>,
        client_id: String,
        client_secret: String,
        credentials_dir: std::path::PathBuf,
        http: reqwest::Client,
    ) -> Self {
        JobController {
            slot: Mutex::new(None),
            chat,
            auth,
            engine,
            upload,
            from_ids,
            client_id,
            client_secret,
            credentials_dir,
            http,
        }
    }

    pub async fn process(&self, chat_id: i64, sender_id: i64, text: &str) {
        if !self.from_ids.is_empty() && !self.from_ids.contains(&sender_id) {
            return;
        }

        let text = text.trim();
        if text == "/start" {
            let _ = self.chat.send_text(chat_id, "Hello!").await;
            return;
        }
        if text == "/authorize" {
            self.authorize(chat_id).await;
            return;
        }
        if text == "/cancel" {
            self.cancel(chat_id).await;
            return;
        }
        if Link::looks_like_link(text) {
            match Link::parse(text) {
                Ok(link) => self.run(chat_id, link).await,
                Err(e) => {
                    let _ = self.chat.send_text(chat_id, &format!("{e}")).await;
                }
            }
        }
    }

    async fn authorize(&self, chat_id: i64) {
        let cancel = CancellationToken::new();
        let result = AuthManager::new_authorizer(
            self.client_id.clone(),
            self.client_secret.clone(),
            self.credentials_dir.clone(),
            self.http.clone(),
            cancel,
        )
        .await;

        let (link, mut rx) = match result {
            Ok(pair) => pair,
            Err(e) => {
                let _ = self.chat.send_text(chat_id, &format!("{e}")).await;
                return;
            }
        };

        let _ = self
            .chat
            .send_link(chat_id, "Waiting for authentication…", &link)
            .await;

        match rx.recv().await {
            Some(Ok(_auth)) => {
                let _ = self.chat.send_text(chat_id, "Authorized successfully.").await;
            }
            Some(Err(e)) => {
                let _ = self.chat.send_text(chat_id, &format!("Authorization failed: {e}")).await;
            }
            None => {
                let _ = self
                    .chat
                    .send_text(chat_id, "Authorization flow ended unexpectedly.")
                    .await;
            }
        }
    }

    async fn cancel(&self, chat_id: i64) {
        let mut guard = match self.slot.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                // Someone else holds the slot mutex momentarily; treat as
                // "a job is running" from the caller's perspective.
                let _ = self.chat.send_text(chat_id, "No job was running.").await;
                return;
            }
        };
        match guard.take() {
            Some(job) => {
                job.cancel.cancel();
                let _ = self.chat.send_text(chat_id, "Job was canceled.").await;
            }
            None => {
                let _ = self.chat.send_text(chat_id, "No job was running.").await;
            }
        }
    }

    async fn run(&self, chat_id: i64, link: Link) {
        let cancel = CancellationToken::new();
        {
            let mut guard = match self.slot.try_lock() {
                Ok(guard) => guard,
                Err(_) => {
                    let _ = self.chat.send_text(chat_id, &format!("{}", Flaw::JobAlreadyRunning)).await;
                    return;
                }
            };
            if guard.is_some() {
                let _ = self.chat.send_text(chat_id, &format!("{}", Flaw::JobAlreadyRunning)).await;
                return;
            }
            *guard = Some(RunningJob {
                id: link.id.clone(),
                cancel: cancel.clone(),
            });
        }

        let result = self.run_pipeline(chat_id, &link, &cancel).await;

        *self.slot.lock().await = None;

        if let Err(e) = result {
            self.report_failure(chat_id, &e).await;
        }
    }

    async fn run_pipeline(&self, chat_id: i64, link: &Link, cancel: &CancellationToken) -> Result<(), Flaw> {
        let kind_label = link.kind.to_string();
        let _ = self
            .chat
            .send_text(chat_id, &format!("<i>Downloading {kind_label}…</i>"))
            .await;

        self.with_retry(cancel, || self.download(link, cancel)).await?;

        let _ = self
            .chat
            .send_text(
                chat_id,
                &format!("Download finished. Starting {kind_label} upload…"),
            )
            .await;

        self.upload
            .publish(chat_id, link.kind, &link.id)
            .await?;

        let _ = self
            .chat
            .send_text(chat_id, &format!("{kind_label} uploaded successfully."))
            .await;

        Ok(())
    }

    async fn download(&self, link: &Link, cancel: &CancellationToken) -> Result<(), Flaw> {
        match link.kind {
            Kind::Track => {
                let id: i64 = link
                    .id
                    .parse()
                    .map_err(|_| Flaw::InvalidLink(format!("non-numeric track id: {}", link.id)))?;
                self.engine.single(id, cancel).await
            }
            Kind::Album => {
                let id: i64 = link
                    .id
                    .parse()
                    .map_err(|_| Flaw::InvalidLink(format!("non-numeric album id: {}", link.id)))?;
                self.engine.album(id, cancel).await
            }
            Kind::Playlist => self.engine.playlist(&link.id, cancel).await,
            Kind::Mix => self.engine.mix(&link.id, cancel).await,
        }
    }

    /// Retries a kind-call up to `MAX_ATTEMPTS` times with linear backoff,
    /// only for the recoverable flaw kinds; `Unauthorized` forces a token
    /// refresh before the next attempt.
    async fn with_retry<F, Fut>(&self, cancel: &CancellationToken, mut call: F) -> Result<(), Flaw>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<(), Flaw>>,
    {
        let mut attempt = 1;
        loop {
            if cancel.is_cancelled() {
                return Err(Flaw::Canceled);
            }
            let result = call().await;
            match result {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= MAX_ATTEMPTS || !e.is_retryable() => return Err(e),
                Err(Flaw::Unauthorized) => {
                    info!("attempt {attempt} unauthorized, refreshing token");
                    self.auth.refresh_token().await?;
                }
                Err(e) => {
                    error!("attempt {attempt} failed: {e}, retrying");
                }
            }
            let backoff = RETRY_BACKOFF_UNIT * (attempt - 1);
            tokio::select! {
                _ = cancel.cancelled() => return Err(Flaw::Canceled),
                _ = tokio::time::sleep(backoff) => {}
            }
            attempt += 1;
        }
    }

    async fn report_failure(&self, chat_id: i64, flaw: &Flaw) {
        match flaw {
            Flaw::Canceled => {
                let _ = self.chat.send_text(chat_id, "Job canceled.").await;
            }
            Flaw::JobAlreadyRunning | Flaw::InvalidLink(_) => {
                let _ = self.chat.send_text(chat_id, &format!("{flaw}")).await;
            }
            _ => {
                let _ = self.chat.send_text(chat_id, &format!("Job failed: {flaw}")).await;
                let yaml = flaw.to_yaml();
                let tmp = std::env::temp_dir().join(format!("flaw-{}.yaml", now_unix()));
                if tokio::fs::write(&tmp, yaml).await.is_ok() {
                    let _ = self
                        .chat
                        .send_document(chat_id, &tmp, &format!("flaw-{}.yaml", now_unix()))
                        .await;
                }
            }
        }
    }
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_linearly_with_attempt() {
        assert_eq!(RETRY_BACKOFF_UNIT * 0, Duration::from_secs(0));
        assert_eq!(RETRY_BACKOFF_UNIT * 2, Duration::from_secs(6));
    }
}
