/// Configuration management for the family portal
use crate::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

/// Main server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub service: ServiceConfig,
    pub storage: StorageConfig,
    pub media: MediaConfig,
    pub chat: ChatConfig,
    pub push: PushConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub hostname: String,
    pub port: u16,
    /// Deployed site URL, the source of the Origin allow-list
    pub site_url: String,
    pub session_cookie_name: String,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_directory: PathBuf,
    pub kv_path: PathBuf,
    /// Root served under `/static`; photos live in `<static>/photos`
    pub static_directory: PathBuf,
}

/// Media pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    pub upload_limit: usize,
    pub queue_capacity: usize,
    /// Archive the uploaded bytes as `<base>_original<ext>`
    pub keep_originals: bool,
}

/// Live chat configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Origins accepted at WebSocket upgrade
    pub allowed_origins: Vec<String>,
}

/// Push provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushConfig {
    /// Present only when every provider credential is configured
    pub apns: Option<ApnsConfig>,
    pub queue_capacity: usize,
    /// Base URL override for the provider
    pub endpoint: Option<String>,
    pub allow_token_transfer: bool,
}

/// Apple Push Notification credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApnsConfig {
    pub team_id: String,
    pub key_id: String,
    pub bundle_id: String,
    pub key_path: PathBuf,
}

impl ServerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> AppResult<Self> {
        dotenv::dotenv().ok();

        let hostname = env::var("PORTAL_HOSTNAME").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port: u16 = env::var("PORTAL_PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .map_err(|_| AppError::Validation("Invalid port number".to_string()))?;

        let site_url =
            env::var("SITE_URL").unwrap_or_else(|_| format!("http://localhost:{}", port));
        let session_cookie_name =
            env::var("SESSION_COOKIE_NAME").unwrap_or_else(|_| "session".to_string());

        let data_directory: PathBuf = env::var("PORTAL_DATA_DIRECTORY")
            .unwrap_or_else(|_| "./data".to_string())
            .into();
        let kv_path = env::var("PORTAL_KV_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_directory.join("portal.redb"));
        let static_directory: PathBuf = env::var("PORTAL_STATIC_DIRECTORY")
            .unwrap_or_else(|_| "./static".to_string())
            .into();

        let upload_limit = env::var("PORTAL_UPLOAD_LIMIT")
            .unwrap_or_else(|_| "20971520".to_string())
            .parse()
            .unwrap_or(20_971_520);
        let media_queue_capacity = env::var("MEDIA_QUEUE_CAPACITY")
            .unwrap_or_else(|_| "128".to_string())
            .parse()
            .unwrap_or(128);
        let keep_originals = env::var("MEDIA_KEEP_ORIGINALS")
            .unwrap_or_else(|_| "false".to_string())
            .parse()
            .unwrap_or(false);

        let allowed_origins = allowed_origins(&site_url)?;

        let apns = match (
            env::var("APNS_TEAM_ID"),
            env::var("APNS_KEY_ID"),
            env::var("APNS_BUNDLE_ID"),
            env::var("APNS_KEY_PATH"),
        ) {
            (Ok(team_id), Ok(key_id), Ok(bundle_id), Ok(key_path)) => Some(ApnsConfig {
                team_id,
                key_id,
                bundle_id,
                key_path: key_path.into(),
            }),
            _ => None,
        };
        let push_queue_capacity = env::var("PUSH_QUEUE_CAPACITY")
            .unwrap_or_else(|_| "256".to_string())
            .parse()
            .unwrap_or(256);
        let endpoint = env::var("APNS_ENDPOINT").ok();
        let allow_token_transfer = env::var("PUSH_ALLOW_TOKEN_TRANSFER")
            .unwrap_or_else(|_| "true".to_string())
            .parse()
            .unwrap_or(true);

        Ok(ServerConfig {
            service: ServiceConfig {
                hostname,
                port,
                site_url,
                session_cookie_name,
            },
            storage: StorageConfig {
                data_directory,
                kv_path,
                static_directory,
            },
            media: MediaConfig {
                upload_limit,
                queue_capacity: media_queue_capacity,
                keep_originals,
            },
            chat: ChatConfig { allowed_origins },
            push: PushConfig {
                apns,
                queue_capacity: push_queue_capacity,
                endpoint,
                allow_token_transfer,
            },
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> AppResult<()> {
        if self.service.hostname.is_empty() {
            return Err(AppError::Validation("Hostname cannot be empty".to_string()));
        }

        if self.media.queue_capacity == 0 || self.push.queue_capacity == 0 {
            return Err(AppError::Validation(
                "Queue capacities must be at least 1".to_string(),
            ));
        }

        if self.media.upload_limit == 0 {
            return Err(AppError::Validation(
                "Upload limit must be positive".to_string(),
            ));
        }

        Ok(())
    }

    /// Directory holding published photo variants
    pub fn photos_directory(&self) -> PathBuf {
        self.storage.static_directory.join("photos")
    }
}

/// Origin allow-list: the site origin, plus the loopback variants when the
/// site itself runs on localhost
pub fn allowed_origins(site_url: &str) -> AppResult<Vec<String>> {
    let url = url::Url::parse(site_url)
        .map_err(|e| AppError::Validation(format!("Invalid SITE_URL {}: {}", site_url, e)))?;

    let origin = url.origin().ascii_serialization();
    let mut origins = vec![origin];

    let host = url.host_str().unwrap_or_default();
    if matches!(host, "localhost" | "127.0.0.1" | "[::1]") {
        let port = url
            .port()
            .map(|p| format!(":{}", p))
            .unwrap_or_default();
        for scheme in ["http", "https"] {
            for host in ["localhost", "127.0.0.1", "[::1]"] {
                let candidate = format!("{}://{}{}", scheme, host, port);
                if !origins.contains(&candidate) {
                    origins.push(candidate);
                }
            }
        }
    }

    Ok(origins)
}
