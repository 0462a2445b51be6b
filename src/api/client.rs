use std::sync::Arc;

use anyhow::anyhow;
use log::{debug, trace};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;

use crate::api::models::*;
use crate::auth::AuthManager;
use crate::error::Flaw;

const API_BASE: &str = "https://api.tidal.com/v1";
const COUNTRY_CODE: &str = "US";
const PAGE_SIZE: u64 = 100;

/// Thin wrapper around the TIDAL catalog HTTP API. Every call attaches the
/// bearer token and `countryCode`, and maps the response through the shared
/// status-code taxonomy before deserializing the body.
pub struct CatalogClient {
    auth: Arc<AuthManager>,
    http: reqwest::Client,
}

impl CatalogClient {
    pub fn new(auth: Arc<AuthManager>, http: reqwest::Client) -> Self {
        CatalogClient { auth, http }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, Flaw> {
        let token = self.auth.access_token().await?;
        let url = format!("{API_BASE}{path}");
        trace!("{method} {url} {query:?}");
        let mut request = self
            .http
            .request(method, &url)
            .bearer_auth(&token)
            .query(&[("countryCode", COUNTRY_CODE)])
            .query(query);
        request = request.timeout(std::time::Duration::from_secs(20));

        let response = request
            .send()
            .await
            .map_err(|e| classify_transport_error(&e))?;
        let status = response.status();
        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| Flaw::structured("failed to decode catalog response", e.into()));
        }

        let body_text = response.text().await.unwrap_or_default();
        Err(classify_status(status, &body_text))
    }

    pub async fn track_info(&self, id: i64) -> Result<SingleTrackMeta, Flaw> {
        self.call(Method::GET, &format!("/tracks/{id}"), &[]).await
    }

    pub async fn album_info(&self, id: i64) -> Result<AlbumMeta, Flaw> {
        self.call(Method::GET, &format!("/albums/{id}"), &[]).await
    }

    pub async fn playlist_info(&self, uuid: &str) -> Result<ListContainerMeta, Flaw> {
        self.call(Method::GET, &format!("/playlists/{uuid}"), &[])
            .await
    }

    pub async fn mix_info(&self, id: &str) -> Result<ListContainerMeta, Flaw> {
        self.call(Method::GET, &format!("/mixes/{id}"), &[("mixId", id)])
            .await
    }

    pub async fn track_credits(&self, id: i64) -> Result<TrackCredits, Flaw> {
        let raw: Vec<RawCreditGroup> = self
            .call(Method::GET, &format!("/tracks/{id}/credits"), &[])
            .await?;
        Ok(TrackCredits::from_raw(raw))
    }

    /// 404 means "no lyrics for this track", which is a valid outcome, not
    /// an error - callers get an empty string rather than a propagated flaw.
    pub async fn track_lyrics(&self, id: i64) -> Result<String, Flaw> {
        #[derive(serde::Deserialize)]
        struct LyricsResponse {
            #[serde(default)]
            subtitles: Option<String>,
            #[serde(default)]
            lyrics: Option<String>,
        }
        let token = self.auth.access_token().await?;
        let url = format!("{API_BASE}/tracks/{id}/lyrics");
        let response = self
            .http
            .get(&url)
            .bearer_auth(&token)
            .query(&[("countryCode", COUNTRY_CODE)])
            .send()
            .await
            .map_err(|e| classify_transport_error(&e))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(String::new());
        }
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(response.status(), &body));
        }
        let parsed: LyricsResponse = response
            .json()
            .await
            .map_err(|e| Flaw::structured("failed to decode lyrics response", e.into()))?;
        Ok(parsed.subtitles.or(parsed.lyrics).unwrap_or_default())
    }

    pub async fn playback_info(&self, id: i64) -> Result<PlaybackInfoResponse, Flaw> {
        self.call(
            Method::GET,
            &format!("/tracks/{id}/playbackinfopostpaywall"),
            &[
                ("audioquality", "HI_RES_LOSSLESS"),
                ("playbackmode", "STREAM"),
                ("assetpresentation", "FULL"),
                ("immersiveaudio", "false"),
                ("locale", "en"),
            ],
        )
        .await
    }

    pub async fn album_items(&self, album_id: i64) -> Result<Vec<AlbumTrackMeta>, Flaw> {
        self.paged_items(&format!("/albums/{album_id}/items")).await
    }

    pub async fn list_items(&self, path: &str) -> Result<Vec<ListTrackMeta>, Flaw> {
        self.paged_items(path).await
    }

    /// Walks a paginated listing endpoint to exhaustion. Termination is
    /// either an empty page or `total - (offset + page_count) == 0`.
    async fn paged_items<T: DeserializeOwned>(&self, path: &str) -> Result<Vec<T>, Flaw> {
        let mut offset: u64 = 0;
        let mut items = Vec::new();
        loop {
            let limit_str = PAGE_SIZE.to_string();
            let offset_str = offset.to_string();
            let page: Page<ItemEnvelope<T>> = self
                .call(
                    Method::GET,
                    path,
                    &[("limit", &limit_str), ("offset", &offset_str)],
                )
                .await?;
            let page_count = page.items.len() as u64;
            debug!("{path}: fetched {page_count} items at offset {offset}, total={}", page.total);
            if page_count == 0 {
                break;
            }
            items.extend(page.items.into_iter().map(|e| e.item));
            let remaining = page.total.saturating_sub(offset + page_count);
            offset += page_count;
            if remaining == 0 {
                break;
            }
        }
        Ok(items)
    }
}

/// The information shared by playlist and mix containers: a caption and
/// their track ids, enough to drive the Upload Batcher's sidecar.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ListContainerMeta {
    #[serde(alias = "uuid")]
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
}

fn classify_transport_error(e: &reqwest::Error) -> Flaw {
    if e.is_timeout() {
        Flaw::DeadlineExceeded
    } else {
        Flaw::structured("catalog request failed", anyhow!("{e}"))
    }
}

/// The status-code taxonomy shared by every catalog endpoint.
fn classify_status(status: StatusCode, body: &str) -> Flaw {
    let parsed: Option<ApiErrorBody> = serde_json::from_str(body).ok();
    match status {
        StatusCode::UNAUTHORIZED => Flaw::Unauthorized,
        StatusCode::TOO_MANY_REQUESTS => Flaw::TooManyRequests,
        StatusCode::FORBIDDEN => {
            let too_many = parsed
                .as_ref()
                .and_then(|b| b.user_message.as_deref())
                .map(|m| m.to_lowercase().contains("too many requests"))
                .unwrap_or(false);
            if too_many {
                Flaw::TooManyRequests
            } else {
                Flaw::structured(
                    "catalog request forbidden",
                    anyhow!("status={status} body={body}"),
                )
            }
        }
        other => Flaw::structured(
            "catalog request returned an unexpected status",
            anyhow!("status={other} body={body}"),
        )
        .with_context("status", other.as_u16()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_401_as_unauthorized() {
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, "{}"),
            Flaw::Unauthorized
        ));
    }

    #[test]
    fn classifies_429_as_too_many_requests() {
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, "{}"),
            Flaw::TooManyRequests
        ));
    }

    #[test]
    fn classifies_403_with_rate_limit_body_as_too_many_requests() {
        let body = r#"{"userMessage":"Too many requests, please slow down"}"#;
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, body),
            Flaw::TooManyRequests
        ));
    }

    #[test]
    fn classifies_plain_403_as_structured() {
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, "{}"),
            Flaw::Structured { .. }
        ));
    }
}
