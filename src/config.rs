use anyhow::{anyhow, Context, Error};
use config::{Config, File, FileFormat};
use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use serde_with::NoneAsEmptyString;
use std::env::{var, VarError};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Settings {
    pub app_id: i64,
    pub app_hash: String,
    pub bot_token: String,

    pub download_root: String,
    pub credentials_dir: String,

    pub from_ids: Vec<i64>,
    pub signature: String,

    pub album_download_concurrency: u8,
    pub playlist_download_concurrency: u8,
    pub mix_download_concurrency: u8,
    pub vnd_concurrency: u8,
    pub album_upload_concurrency: u8,

    pub login_key: LoginKey,
    pub api_key: ApiKey,
}

impl Settings {
    pub fn save(&self) -> Result<(), Error> {
        let config_dir = get_config_dir()?;
        std::fs::create_dir_all(&config_dir)?;
        std::fs::create_dir_all(&self.credentials_dir)?;
        std::fs::create_dir_all(&self.download_root)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.credentials_dir, std::fs::Permissions::from_mode(0o700))?;
        }

        let config_file = get_config_file()?;
        let mut file = std::fs::File::create(config_file)?;
        use std::io::Write;
        let config_str = toml::to_string_pretty(&self)?;
        file.write_all(config_str.as_bytes())?;
        Ok(())
    }
}

#[serde_as]
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct LoginKey {
    #[serde_as(as = "NoneAsEmptyString")]
    pub access_token: Option<String>,
    #[serde_as(as = "NoneAsEmptyString")]
    pub refresh_token: Option<String>,
    pub expires_at: Option<i64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ApiKey {
    pub client_id: String,
    pub client_secret: String,
}

/// Loads configuration from, in increasing precedence: built-in defaults,
/// the TOML file pointed at by `CONFIG`/`--config`, and the mandatory
/// `APP_ID`/`APP_HASH`/`BOT_TOKEN` environment variables.
///
/// Exactly one of the `CONFIG` environment variable or an explicit
/// `config_path` override must be provided; supplying both or neither is a
/// startup error.
pub fn get_config(config_path: Option<&str>) -> Result<Settings, Error> {
    let env_config = var("CONFIG").ok();
    let source = match (env_config.as_deref(), config_path) {
        (Some(_), Some(_)) => {
            return Err(anyhow!(
                "both the CONFIG environment variable and --config were given; provide exactly one"
            ))
        }
        (None, None) => {
            return Err(anyhow!(
                "no configuration source given; set CONFIG or pass --config <path>"
            ))
        }
        (Some(inline), None) => File::from_str(inline, FileFormat::Toml),
        (None, Some(path)) => File::new(path, FileFormat::Toml),
    };

    let app_id: i64 = var("APP_ID")
        .context("APP_ID environment variable is required")?
        .parse()
        .context("APP_ID must be an integer")?;
    let app_hash = var("APP_HASH").context("APP_HASH environment variable is required")?;
    let bot_token = var("BOT_TOKEN").context("BOT_TOKEN environment variable is required")?;

    let config = Config::builder()
        .set_default("download_root", default_download_root()?)?
        .set_default("credentials_dir", default_credentials_dir()?)?
        .set_default("from_ids", Vec::<i64>::new())?
        .set_default("signature", "")?
        .set_default("album_download_concurrency", 5)?
        .set_default("playlist_download_concurrency", 5)?
        .set_default("mix_download_concurrency", 5)?
        .set_default("vnd_concurrency", 4)?
        .set_default("album_upload_concurrency", 5)?
        .set_default("login_key.access_token", "")?
        .set_default("login_key.refresh_token", "")?
        .set_default("login_key.expires_at", 0)?
        .set_default("api_key.client_id", "")?
        .set_default("api_key.client_secret", "")?
        .add_source(source.required(true))
        .build()?;

    let mut settings: Settings = config.try_deserialize()?;
    settings.app_id = app_id;
    settings.app_hash = app_hash;
    settings.bot_token = bot_token;

    if settings.api_key.client_id.is_empty() || settings.api_key.client_secret.is_empty() {
        return Err(anyhow!(
            "api_key.client_id and api_key.client_secret must be set in the config file"
        ));
    }

    settings.save()?;
    Ok(settings)
}

fn get_config_dir() -> Result<String, Error> {
    let mut config_dir = match var("XDG_CONFIG_HOME") {
        Ok(path) => PathBuf::from(path),
        Err(VarError::NotPresent) => {
            let home_dir = var("HOME")?;
            Path::new(&home_dir).join(".config")
        }
        Err(e) => return Err(e.into()),
    };
    config_dir.push("tidal-relay");
    config_dir
        .to_str()
        .map(|s| s.to_string())
        .ok_or_else(|| anyhow!("failed to convert config dir path to string"))
}

fn default_credentials_dir() -> Result<String, Error> {
    let config_dir = get_config_dir()?;
    PathBuf::from(config_dir)
        .join("credentials")
        .to_str()
        .map(|s| s.to_string())
        .ok_or_else(|| anyhow!("failed to convert credentials dir path to string"))
}

fn default_download_root() -> Result<String, Error> {
    let home_dir = var("HOME")?;
    Path::new(&home_dir)
        .join("tidal-relay-downloads")
        .to_str()
        .map(|s| s.to_string())
        .ok_or_else(|| anyhow!("failed to convert download root path to string"))
}

fn get_config_file() -> Result<String, Error> {
    let config_dir = get_config_dir()?;
    PathBuf::from(config_dir)
        .join("config.toml")
        .to_str()
        .map(|s| s.to_string())
        .ok_or_else(|| anyhow!("failed to convert config file path to string"))
}

lazy_static::lazy_static! {
    pub static ref CONFIG_HOME: String = get_config_dir().expect("Failed to get config dir");
    pub static ref CONFIG: RwLock<Option<Settings>> = RwLock::new(None);
}

/// Installs the settings loaded at startup into the global slot. Called once
/// from `main` after CLI argument parsing has resolved `--config`.
pub async fn init_config(config_path: Option<&str>) -> Result<(), Error> {
    let settings = get_config(config_path)?;
    *CONFIG.write().await = Some(settings);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_dir_is_under_xdg_config_home_when_set() {
        std::env::set_var("XDG_CONFIG_HOME", "/tmp/xdgtest");
        assert_eq!(get_config_dir().unwrap(), "/tmp/xdgtest/tidal-relay");
        std::env::remove_var("XDG_CONFIG_HOME");
    }
}
