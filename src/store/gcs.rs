use futures::stream::StreamExt;
use hyper::client::HttpConnector;
use hyper::header::{AUTHORIZATION, CONTENT_TYPE, RANGE};
use hyper::{Body, Client, Method, Request, StatusCode};
use hyper_rustls::HttpsConnector;
use lazy_static::lazy_static;
use log::{debug, info};
use serde::Deserialize;
use std::time::Duration;
use tokio::runtime::Runtime;

use crate::error::StoreError;
use super::auth::{Credentials, TokenProvider};
use super::ObjectStore;

const STORAGE_HOST: &str = "https://storage.googleapis.com";

/// Upper bound on any single request, response body included. There is no
/// retry; on expiry the NBD operation fails with a timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// How many DELETE requests of one batch may be in flight at once.
const DELETE_PARALLEL: usize = 8;

#[derive(Clone)]
struct Metrics {
    reads: prometheus::IntCounter,
    writes: prometheus::IntCounter,
    deletes: prometheus::IntCounter,
    lists: prometheus::IntCounter,
    in_flight: prometheus::IntGauge,
}

lazy_static! {
    static ref METRICS: Metrics = {
        let m = Metrics {
            reads: prometheus::register_int_counter!("reads", "Total object reads").unwrap(),
            writes: prometheus::register_int_counter!("writes", "Total object writes").unwrap(),
            deletes: prometheus::register_int_counter!("deletes", "Total object deletions").unwrap(),
            lists: prometheus::register_int_counter!("lists", "Total listing requests").unwrap(),
            in_flight: prometheus::register_int_gauge!("in_flight", "Requests currently in flight").unwrap(),
        };
        let metrics = m.clone();
        std::thread::spawn(move || {
            let mut last_reads = 0;
            let mut last_writes = 0;
            let mut last_deletes = 0;
            loop {
                let reads = metrics.reads.get();
                let writes = metrics.writes.get();
                let deletes = metrics.deletes.get();
                if reads != last_reads || writes != last_writes || deletes != last_deletes {
                    info!(
                        "last 10s: {} reads, {} writes, {} deletes",
                        reads - last_reads,
                        writes - last_writes,
                        deletes - last_deletes
                    );
                    last_reads = reads;
                    last_writes = writes;
                    last_deletes = deletes;
                }
                std::thread::sleep(std::time::Duration::from_millis(10000));
            }
        });
        m
    };
}

/// Object store backed by the Google Cloud Storage JSON API.
///
/// Owns its own single-threaded runtime; the `ObjectStore` methods block the
/// calling thread until the remote operation completes.
pub struct GcsStore {
    runtime: Runtime,
    http: Client<HttpsConnector<HttpConnector>>,
    auth: TokenProvider,
    bucket: String,
    endpoint: String,
}

impl GcsStore {
    pub fn connect(bucket: String, credentials: Credentials) -> Result<GcsStore, StoreError> {
        let mut runtime = tokio::runtime::Builder::new_current_thread();
        runtime.enable_all();
        let runtime = runtime.build()?;

        let connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_native_roots()
            .https_or_http()
            .enable_http1()
            .build();
        let http = Client::builder().build(connector);

        // The standard SDKs honor this variable; so do we, which makes the
        // plugin testable against local emulators.
        let endpoint = match std::env::var("STORAGE_EMULATOR_HOST") {
            Ok(host) => host,
            Err(_) => STORAGE_HOST.to_owned(),
        };
        info!("using object store at {}, bucket {}", endpoint, bucket);

        Ok(GcsStore {
            runtime,
            http,
            auth: TokenProvider::new(credentials),
            bucket,
            endpoint,
        })
    }

    fn object_url(&self, key: &str) -> String {
        format!(
            "{}/storage/v1/b/{}/o/{}",
            self.endpoint,
            urlencoding::encode(&self.bucket),
            urlencoding::encode(key),
        )
    }

    /// Sends one request and reads the whole response, under the timeout.
    async fn fetch(
        &self,
        mut request: Request<Body>,
    ) -> Result<(StatusCode, hyper::body::Bytes), StoreError> {
        if let Some(token) = self.auth.token(&self.http).await? {
            let value = format!("Bearer {}", token)
                .parse()
                .map_err(|_| StoreError::Transport("malformed access token".to_owned()))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        METRICS.in_flight.inc();
        let result = tokio::time::timeout(REQUEST_TIMEOUT, async {
            let response = self.http.request(request).await?;
            let status = response.status();
            let body = hyper::body::to_bytes(response.into_body()).await?;
            Ok::<_, hyper::Error>((status, body))
        })
        .await;
        METRICS.in_flight.dec();

        match result {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(e)) if e.is_timeout() => Err(StoreError::Timeout),
            Ok(Err(e)) => Err(StoreError::Transport(e.to_string())),
            Err(_) => Err(StoreError::Timeout),
        }
    }

    async fn delete_object(&self, key: &str) -> Result<(), StoreError> {
        let request = Request::builder()
            .method(Method::DELETE)
            .uri(self.object_url(key))
            .body(Body::empty())
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        let (status, _) = self.fetch(request).await?;
        check_status(status, "delete")
    }
}

/// Classify a response status: 404 is the distinguished NotFound, gateway
/// timeouts fold into Timeout, anything else non-2xx is a transport error.
fn check_status(status: StatusCode, context: &str) -> Result<(), StoreError> {
    match status {
        s if s.is_success() => Ok(()),
        StatusCode::NOT_FOUND => Err(StoreError::NotFound),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => Err(StoreError::Timeout),
        s => Err(StoreError::Transport(format!("{} returned {}", context, s))),
    }
}

#[derive(Deserialize)]
struct ObjectMetadata {
    // GCS serialises int64 fields as JSON strings.
    size: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListPage {
    #[serde(default)]
    items: Vec<ListEntry>,
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
struct ListEntry {
    name: String,
}

impl ObjectStore for GcsStore {
    fn read_object(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        METRICS.reads.inc();
        self.runtime.block_on(async {
            let request = Request::builder()
                .method(Method::GET)
                .uri(format!("{}?alt=media", self.object_url(key)))
                .body(Body::empty())
                .map_err(|e| StoreError::Transport(e.to_string()))?;
            let (status, body) = self.fetch(request).await?;
            match check_status(status, "read") {
                Ok(()) => Ok(Some(body.to_vec())),
                Err(StoreError::NotFound) => Ok(None),
                Err(e) => Err(e),
            }
        })
    }

    fn read_part(&self, key: &str, offset: u64, len: usize) -> Result<Option<Vec<u8>>, StoreError> {
        if len == 0 {
            return Ok(Some(Vec::new()));
        }
        METRICS.reads.inc();
        self.runtime.block_on(async {
            let request = Request::builder()
                .method(Method::GET)
                .uri(format!("{}?alt=media", self.object_url(key)))
                .header(
                    RANGE,
                    format!("bytes={}-{}", offset, offset + len as u64 - 1),
                )
                .body(Body::empty())
                .map_err(|e| StoreError::Transport(e.to_string()))?;
            let (status, body) = self.fetch(request).await?;
            match check_status(status, "read") {
                Ok(()) => Ok(Some(body.to_vec())),
                Err(StoreError::NotFound) => Ok(None),
                Err(e) => Err(e),
            }
        })
    }

    fn object_len(&self, key: &str) -> Result<Option<u64>, StoreError> {
        self.runtime.block_on(async {
            let request = Request::builder()
                .method(Method::GET)
                .uri(format!("{}?fields=size", self.object_url(key)))
                .body(Body::empty())
                .map_err(|e| StoreError::Transport(e.to_string()))?;
            let (status, body) = self.fetch(request).await?;
            match check_status(status, "stat") {
                Ok(()) => {
                    let metadata: ObjectMetadata = serde_json::from_slice(&body)
                        .map_err(|e| StoreError::Transport(format!("invalid metadata: {}", e)))?;
                    let size = metadata.size.parse().map_err(|_| {
                        StoreError::Transport(format!("invalid object size {:?}", metadata.size))
                    })?;
                    Ok(Some(size))
                }
                Err(StoreError::NotFound) => Ok(None),
                Err(e) => Err(e),
            }
        })
    }

    fn write_object(&self, key: &str, data: &[u8]) -> Result<(), StoreError> {
        METRICS.writes.inc();
        self.runtime.block_on(async {
            let uri = format!(
                "{}/upload/storage/v1/b/{}/o?uploadType=media&name={}",
                self.endpoint,
                urlencoding::encode(&self.bucket),
                urlencoding::encode(key),
            );
            // hyper needs an owned body; this is the only copy on the write
            // path.
            let request = Request::builder()
                .method(Method::POST)
                .uri(uri)
                .header(CONTENT_TYPE, "application/octet-stream")
                .body(Body::from(data.to_vec()))
                .map_err(|e| StoreError::Transport(e.to_string()))?;
            let (status, _) = self.fetch(request).await?;
            check_status(status, "write")
        })
    }

    fn list_keys(
        &self,
        prefix: &str,
        start_offset: Option<&str>,
        end_offset: Option<&str>,
    ) -> Result<Vec<String>, StoreError> {
        METRICS.lists.inc();
        self.runtime.block_on(async {
            let mut keys = Vec::new();
            let mut page_token: Option<String> = None;
            loop {
                let mut uri = format!(
                    "{}/storage/v1/b/{}/o?prefix={}&fields=items(name),nextPageToken",
                    self.endpoint,
                    urlencoding::encode(&self.bucket),
                    urlencoding::encode(prefix),
                );
                if let Some(start) = start_offset {
                    uri.push_str("&startOffset=");
                    uri.push_str(&urlencoding::encode(start));
                }
                if let Some(end) = end_offset {
                    uri.push_str("&endOffset=");
                    uri.push_str(&urlencoding::encode(end));
                }
                if let Some(token) = &page_token {
                    uri.push_str("&pageToken=");
                    uri.push_str(&urlencoding::encode(token));
                }

                let request = Request::builder()
                    .method(Method::GET)
                    .uri(uri)
                    .body(Body::empty())
                    .map_err(|e| StoreError::Transport(e.to_string()))?;
                let (status, body) = self.fetch(request).await?;
                check_status(status, "list")?;

                let page: ListPage = serde_json::from_slice(&body)
                    .map_err(|e| StoreError::Transport(format!("invalid listing: {}", e)))?;
                keys.extend(page.items.into_iter().map(|entry| entry.name));
                match page.next_page_token {
                    Some(token) => page_token = Some(token),
                    None => break,
                }
            }
            Ok(keys)
        })
    }

    fn delete_batch(
        &self,
        keys: &[String],
        on_error: &mut dyn FnMut(&str, &StoreError),
    ) -> Result<(), StoreError> {
        METRICS.deletes.inc_by(keys.len() as u64);
        let results: Vec<(usize, Result<(), StoreError>)> = self.runtime.block_on(async {
            futures::stream::iter(keys.iter().enumerate())
                .map(|(index, key)| async move {
                    debug!("deleting object {}", key);
                    (index, self.delete_object(key).await)
                })
                .buffer_unordered(DELETE_PARALLEL)
                .collect()
                .await
        });

        for (index, result) in results {
            match result {
                Ok(()) => {}
                // A timeout aborts the whole NBD operation; anything else is
                // a per-key failure for the caller to look at.
                Err(StoreError::Timeout) => return Err(StoreError::Timeout),
                Err(e) => on_error(&keys[index], &e),
            }
        }
        Ok(())
    }
}
