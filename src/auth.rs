use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use base64::Engine;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::error::Flaw;

const DEVICE_AUTH_URL: &str = "https://auth.tidal.com/v1/oauth2/device_authorization";
const TOKEN_URL: &str = "https://auth.tidal.com/v1/oauth2/token";
const SESSION_URL: &str = "https://api.tidal.com/v1/sessions";

/// Persisted, on-disk shape of the token file described in the external
/// interfaces section: `<credentials_dir>/token.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: i64,
}

/// Owns the current token and serializes refreshes so that N concurrent
/// callers hitting an expired token only trigger one refresh request.
///
/// The single-flight shape mirrors a semaphore-guarded refresh: the first
/// caller to notice expiry acquires the permit and refreshes; everyone else
/// blocks on the same permit and simply re-reads the (now fresh) token once
/// it's released.
pub struct AuthManager {
    client_id: String,
    client_secret: String,
    credentials_dir: PathBuf,
    http: reqwest::Client,
    state: RwLock<Credentials>,
    refresh_gate: Semaphore,
}

impl AuthManager {
    pub fn new(
        client_id: String,
        client_secret: String,
        credentials_dir: PathBuf,
        credentials: Credentials,
        http: reqwest::Client,
    ) -> Self {
        AuthManager {
            client_id,
            client_secret,
            credentials_dir,
            http,
            state: RwLock::new(credentials),
            refresh_gate: Semaphore::new(1),
        }
    }

    /// Loads a persisted token file, if present.
    pub fn load(credentials_dir: &Path) -> Option<Credentials> {
        let path = credentials_dir.join("token.json");
        let bytes = std::fs::read(path).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    fn token_path(&self) -> PathBuf {
        self.credentials_dir.join("token.json")
    }

    fn persist(&self, creds: &Credentials) -> Result<(), Flaw> {
        std::fs::create_dir_all(&self.credentials_dir)
            .map_err(|e| Flaw::structured("failed to create credentials dir", e.into()))?;
        let bytes = serde_json::to_vec_pretty(creds)
            .map_err(|e| Flaw::structured("failed to serialize credentials", e.into()))?;
        let path = self.token_path();
        std::fs::write(&path, &bytes)
            .map_err(|e| Flaw::structured("failed to write token file", e.into()))?;
        let file = std::fs::File::open(&path)
            .map_err(|e| Flaw::structured("failed to reopen token file for fsync", e.into()))?;
        file.sync_all()
            .map_err(|e| Flaw::structured("failed to fsync token file", e.into()))?;
        Ok(())
    }

    /// Returns a currently-valid access token, refreshing first if expired.
    pub async fn access_token(&self) -> Result<String, Flaw> {
        let now = now_unix();
        {
            let creds = self.state.read().await;
            if creds.expires_at > now {
                return Ok(creds.access_token.clone());
            }
        }
        self.refresh_token().await?;
        Ok(self.state.read().await.access_token.clone())
    }

    /// Refreshes the access token using the stored refresh token. Safe to
    /// call concurrently: only the first caller performs the HTTP exchange,
    /// the rest observe its result.
    pub async fn refresh_token(&self) -> Result<(), Flaw> {
        let permit = self
            .refresh_gate
            .acquire()
            .await
            .expect("refresh gate semaphore is never closed");
        // Someone may have refreshed while we waited for the gate.
        if self.state.read().await.expires_at > now_unix() {
            drop(permit);
            return Ok(());
        }

        let refresh_token = self.state.read().await.refresh_token.clone();
        let form = [
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.as_str()),
        ];

        let response = self
            .http
            .post(TOKEN_URL)
            .form(&form)
            .send()
            .await
            .map_err(|e| Flaw::structured("refresh token request failed", e.into()))?;

        let status = response.status();
        if status.as_u16() == 400 {
            let body: serde_json::Value = response.json().await.unwrap_or_default();
            warn!("refresh token rejected: {body}");
            return Err(Flaw::Unauthorized);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Flaw::structured(
                "refresh token request returned an error",
                anyhow!("status={status} body={body}"),
            ));
        }

        #[derive(Deserialize)]
        struct TokenResponse {
            access_token: String,
            #[serde(default)]
            refresh_token: Option<String>,
        }
        let parsed: TokenResponse = response
            .json()
            .await
            .map_err(|e| Flaw::structured("failed to decode refresh response", e.into()))?;

        let expires_at = decode_expiry(&parsed.access_token)?;
        let new_refresh_token = parsed.refresh_token.unwrap_or(refresh_token);

        let creds = Credentials {
            access_token: parsed.access_token,
            refresh_token: new_refresh_token,
            expires_at,
        };
        self.persist(&creds)?;
        *self.state.write().await = creds;
        drop(permit);
        Ok(())
    }

    /// Calls the session endpoint purely to validate the access token;
    /// distinguishes the two TIDAL sub-codes for expired vs invalid tokens
    /// but maps both to `Unauthorized`.
    pub async fn verify_access_token(&self) -> Result<(), Flaw> {
        let token = self.access_token().await?;
        let response = self
            .http
            .get(SESSION_URL)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| Flaw::structured("session verification request failed", e.into()))?;
        match response.status().as_u16() {
            200 => Ok(()),
            401 => Err(Flaw::Unauthorized),
            other => {
                let body = response.text().await.unwrap_or_default();
                Err(Flaw::structured(
                    "session verification failed",
                    anyhow!("status={other} body={body}"),
                ))
            }
        }
    }

    /// Starts a device-authorization login flow. Returns a link to show the
    /// user and a channel that yields exactly one `Result` once the flow
    /// concludes (success, timeout, or hard failure).
    pub async fn new_authorizer(
        client_id: String,
        client_secret: String,
        credentials_dir: PathBuf,
        http: reqwest::Client,
        cancel: CancellationToken,
    ) -> Result<(String, mpsc::Receiver<Result<Arc<AuthManager>, Flaw>>), Flaw> {
        let (tx, rx) = mpsc::channel(1);
        let (link_tx, link_rx) = tokio::sync::oneshot::channel();

        tokio::spawn(async move {
            let result = run_device_flow(&client_id, &client_secret, &http, link_tx, &cancel).await;
            let result = result.map(|creds| {
                Arc::new(AuthManager::new(
                    client_id,
                    client_secret,
                    credentials_dir,
                    creds,
                    http,
                ))
            });
            let _ = tx.send(result).await;
        });

        let link = link_rx
            .await
            .map_err(|_| Flaw::structured("device flow exited before producing a link", anyhow!("")))?;
        Ok((link, rx))
    }
}

async fn run_device_flow(
    client_id: &str,
    client_secret: &str,
    http: &reqwest::Client,
    link_tx: tokio::sync::oneshot::Sender<String>,
    cancel: &CancellationToken,
) -> Result<Credentials, Flaw> {
    #[derive(Deserialize)]
    struct DeviceAuthResponse {
        #[serde(rename = "deviceCode")]
        device_code: String,
        #[serde(rename = "userCode")]
        user_code: String,
        #[serde(rename = "verificationUri")]
        verification_uri: String,
        #[serde(rename = "expiresIn")]
        expires_in: u64,
        interval: u64,
    }

    let form = [
        ("client_id", client_id),
        ("scope", "r_usr w_usr w_sub"),
    ];
    let response = http
        .post(DEVICE_AUTH_URL)
        .form(&form)
        .send()
        .await
        .map_err(|e| Flaw::structured("device authorization request failed", e.into()))?;
    if !response.status().is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(Flaw::structured(
            "device authorization request failed",
            anyhow!("body={body}"),
        ));
    }
    let auth: DeviceAuthResponse = response
        .json()
        .await
        .map_err(|e| Flaw::structured("failed to decode device authorization response", e.into()))?;

    let link = format!("https://{}/{}", auth.verification_uri, auth.user_code);
    let _ = link_tx.send(link);

    let poll_interval = Duration::from_secs(auth.interval.max(1) * 5);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(auth.expires_in);

    loop {
        if cancel.is_cancelled() {
            return Err(Flaw::Canceled);
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(Flaw::AuthWaitTimeout);
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(Flaw::Canceled),
            _ = tokio::time::sleep(poll_interval) => {}
        }

        let form = [
            ("client_id", client_id),
            ("client_secret", client_secret),
            ("grant_type", "urn:ietf:params:oauth:grant-type:device_code"),
            ("device_code", auth.device_code.as_str()),
            ("scope", "r_usr w_usr w_sub"),
        ];
        let response = http
            .post(TOKEN_URL)
            .form(&form)
            .send()
            .await
            .map_err(|e| Flaw::structured("device token poll failed", e.into()))?;

        if response.status().as_u16() == 400 {
            let body: serde_json::Value = response.json().await.unwrap_or_default();
            let sub_status = body.get("sub_status").and_then(|v| v.as_i64());
            let error = body.get("error").and_then(|v| v.as_str());
            if sub_status == Some(1002) && error == Some("authorization_pending") {
                debug!("device token poll pending: sub_status={sub_status:?}");
                continue;
            }
            return Err(Flaw::structured(
                "device token poll rejected",
                anyhow!("sub_status={sub_status:?} body={body}"),
            ));
        }
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Flaw::structured(
                "device token poll returned an error",
                anyhow!("body={body}"),
            ));
        }

        #[derive(Deserialize)]
        struct TokenResponse {
            access_token: String,
            refresh_token: String,
        }
        let parsed: TokenResponse = response
            .json()
            .await
            .map_err(|e| Flaw::structured("failed to decode device token response", e.into()))?;
        let expires_at = decode_expiry(&parsed.access_token)?;
        return Ok(Credentials {
            access_token: parsed.access_token,
            refresh_token: parsed.refresh_token,
            expires_at,
        });
    }
}

/// Decodes the `exp` claim out of a JWT's middle segment. We never trust a
/// server-provided `expires_in` - only the token's own claim.
pub fn decode_expiry(access_token: &str) -> Result<i64, Flaw> {
    let middle = access_token
        .split('.')
        .nth(1)
        .ok_or_else(|| Flaw::structured("malformed access token", anyhow!("no middle segment")))?;
    let decoded = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(middle.trim_end_matches('='))
        .or_else(|_| base64::engine::general_purpose::STANDARD.decode(middle))
        .map_err(|e| Flaw::structured("failed to base64-decode access token", e.into()))?;
    let claims: serde_json::Value = serde_json::from_slice(&decoded)
        .map_err(|e| Flaw::structured("failed to parse access token claims", e.into()))?;
    claims
        .get("exp")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| Flaw::structured("access token missing exp claim", anyhow!("{claims}")))
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

    fn fake_jwt(exp: i64) -> String {
        let header =
            base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(r#"{"alg":"none"}"#);
        let claims = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .encode(format!(r#"{{"exp":{exp}}}"#));
        format!("{header}.{claims}.sig")
    }

    #[test]
    fn decodes_exp_claim_from_jwt_middle_segment() {
        let token = fake_jwt(1_700_000_000);
        assert_eq!(decode_expiry(&token).unwrap(), 1_700_000_000);
    }

    #[test]
    fn rejects_token_without_dots() {
        assert!(decode_expiry("not-a-jwt").is_err());
    }
}
