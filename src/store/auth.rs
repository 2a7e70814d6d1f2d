use hyper::client::HttpConnector;
use hyper::header::CONTENT_TYPE;
use hyper::{Body, Client, Method, Request};
use hyper_rustls::HttpsConnector;
use log::{debug, info, warn};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::StoreError;

const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";
const OAUTH_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Refresh this long before the token actually expires.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// How long to remember that no credential source is available.
const ANONYMOUS_TTL: Duration = Duration::from_secs(300);

const METADATA_TIMEOUT: Duration = Duration::from_secs(2);

type HttpClient = Client<HttpsConnector<HttpConnector>>;

/// Where to obtain OAuth tokens for the object store.
#[derive(Clone, Debug)]
pub enum Credentials {
    /// Application-default credentials: the GOOGLE_APPLICATION_CREDENTIALS
    /// file if set, then the GCE metadata server, then anonymous access.
    Default,
    /// An explicit JSON credentials file (the `json-credentials` option).
    JsonFile(PathBuf),
}

/// Produces and caches bearer tokens for a fixed credential source.
pub struct TokenProvider {
    credentials: Credentials,
    cached: Mutex<Option<CachedToken>>,
}

struct CachedToken {
    /// `None` means "run unauthenticated" (no source available).
    value: Option<String>,
    expires: Instant,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Deserialize)]
struct CredentialsFile {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    client_id: Option<String>,
    #[serde(default)]
    client_secret: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
}

impl TokenProvider {
    pub fn new(credentials: Credentials) -> TokenProvider {
        TokenProvider {
            credentials,
            cached: Mutex::new(None),
        }
    }

    /// A bearer token to attach to the next request, or `None` to run
    /// unauthenticated (emulators, public buckets).
    pub async fn token(&self, http: &HttpClient) -> Result<Option<String>, StoreError> {
        {
            let cached = self.cached.lock().unwrap();
            if let Some(token) = cached.as_ref() {
                if token.expires > Instant::now() + EXPIRY_MARGIN {
                    return Ok(token.value.clone());
                }
            }
        }

        let token = self.fetch(http).await?;
        let value = token.value.clone();
        *self.cached.lock().unwrap() = Some(token);
        Ok(value)
    }

    async fn fetch(&self, http: &HttpClient) -> Result<CachedToken, StoreError> {
        let file = match &self.credentials {
            Credentials::JsonFile(path) => Some(path.clone()),
            Credentials::Default => std::env::var_os("GOOGLE_APPLICATION_CREDENTIALS")
                .map(PathBuf::from),
        };

        if let Some(path) = file {
            debug!("refreshing token from credentials file {:?}", path);
            return self.from_credentials_file(http, &path).await;
        }

        match self.from_metadata_server(http).await {
            Ok(token) => Ok(token),
            Err(e) => {
                info!(
                    "metadata server unavailable ({}), running unauthenticated",
                    e,
                );
                Ok(CachedToken {
                    value: None,
                    expires: Instant::now() + ANONYMOUS_TTL,
                })
            }
        }
    }

    async fn from_credentials_file(
        &self,
        http: &HttpClient,
        path: &std::path::Path,
    ) -> Result<CachedToken, StoreError> {
        let raw = std::fs::read(path)?;
        let creds: CredentialsFile = serde_json::from_slice(&raw)
            .map_err(|e| StoreError::Transport(format!("invalid credentials file: {}", e)))?;

        match creds.kind.as_str() {
            "authorized_user" => {
                let missing =
                    || StoreError::Transport("credentials file missing OAuth fields".to_owned());
                let client_id = creds.client_id.ok_or_else(missing)?;
                let client_secret = creds.client_secret.ok_or_else(missing)?;
                let refresh_token = creds.refresh_token.ok_or_else(missing)?;
                self.refresh_grant(http, &client_id, &client_secret, &refresh_token)
                    .await
            }
            "service_account" => Err(StoreError::Transport(
                "service_account key files are not supported; use workload identity \
                 or gcloud application-default credentials"
                    .to_owned(),
            )),
            other => Err(StoreError::Transport(format!(
                "unsupported credentials type {:?}",
                other,
            ))),
        }
    }

    async fn refresh_grant(
        &self,
        http: &HttpClient,
        client_id: &str,
        client_secret: &str,
        refresh_token: &str,
    ) -> Result<CachedToken, StoreError> {
        let body = format!(
            "grant_type=refresh_token&client_id={}&client_secret={}&refresh_token={}",
            urlencoding::encode(client_id),
            urlencoding::encode(client_secret),
            urlencoding::encode(refresh_token),
        );
        let request = Request::builder()
            .method(Method::POST)
            .uri(OAUTH_TOKEN_URL)
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(body))
            .map_err(|e| StoreError::Transport(e.to_string()))?;

        let response = http
            .request(request)
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        let status = response.status();
        let raw = hyper::body::to_bytes(response.into_body())
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        if !status.is_success() {
            warn!("token refresh failed with status {}", status);
            return Err(StoreError::Transport(format!(
                "token refresh returned {}",
                status,
            )));
        }

        let token: TokenResponse = serde_json::from_slice(&raw)
            .map_err(|e| StoreError::Transport(format!("invalid token response: {}", e)))?;
        Ok(CachedToken {
            value: Some(token.access_token),
            expires: Instant::now() + Duration::from_secs(token.expires_in),
        })
    }

    async fn from_metadata_server(&self, http: &HttpClient) -> Result<CachedToken, StoreError> {
        let request = Request::builder()
            .method(Method::GET)
            .uri(METADATA_TOKEN_URL)
            .header("Metadata-Flavor", "Google")
            .body(Body::empty())
            .map_err(|e| StoreError::Transport(e.to_string()))?;

        let response = tokio::time::timeout(METADATA_TIMEOUT, http.request(request))
            .await
            .map_err(|_| StoreError::Timeout)?
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        let status = response.status();
        let raw = hyper::body::to_bytes(response.into_body())
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        if !status.is_success() {
            return Err(StoreError::Transport(format!(
                "metadata server returned {}",
                status,
            )));
        }

        let token: TokenResponse = serde_json::from_slice(&raw)
            .map_err(|e| StoreError::Transport(format!("invalid token response: {}", e)))?;
        Ok(CachedToken {
            value: Some(token.access_token),
            expires: Instant::now() + Duration::from_secs(token.expires_in),
        })
    }
}
