//! S3-compatible object-store client (spec.md §4.C).
//!
//! Talks to an R2/S3-compatible endpoint over `reqwest`, signing every
//! request with AWS SigV4 (`aws-sigv4`/`aws-credential-types`, the
//! idiomatic low-level signing crates — the workspace has no full AWS SDK
//! dependency of its own). Also owns the CDN purge HTTP call.

pub mod cache;
pub mod work_store;

use std::collections::HashMap;
use std::time::SystemTime;

use aws_credential_types::Credentials;
use aws_sigv4::http_request::{sign, SignableBody, SignableRequest, SigningSettings};
use aws_sigv4::sign::v4;
use bytes::Bytes;
use tokio::sync::Mutex;
use tracing::{instrument, warn};

use crate::config::Settings;
use crate::error::PipelineError;
use cache::{CachedOutcome, LruCache};

/// Outcome of a `get`/`head`: a body (empty for `head`) plus user metadata.
#[derive(Debug, Clone, Default)]
pub struct GetOutcome {
    pub body: Bytes,
    pub metadata: HashMap<String, String>,
}

/// A single `get`/`head` request, used for batched fan-out.
pub struct GetParams {
    pub bucket: String,
    pub key: String,
    pub head_only: bool,
    pub use_cache: bool,
}

/// A single `put` request, used for batched fan-out.
pub struct PutParams {
    pub bucket: String,
    pub key: String,
    pub content_type: String,
    pub body: Bytes,
    pub use_cache: bool,
}

pub struct ObjectStore {
    http: reqwest::Client,
    endpoint: String,
    access_key: String,
    secret_key: String,
    cf_api_token: String,
    cf_zone_id: String,
    cf_origin: String,
    cache: Mutex<LruCache>,
}

impl ObjectStore {
    pub fn new(settings: &Settings) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: settings.r2_endpoint.trim_end_matches('/').to_owned(),
            access_key: settings.r2_access_key.clone(),
            secret_key: settings.r2_secret_key.clone(),
            cf_api_token: settings.cf_api_token.clone(),
            cf_zone_id: settings.cf_zone_id.clone(),
            cf_origin: settings.cf_origin.clone(),
            cache: Mutex::new(LruCache::new(settings.cache_capacity_bytes)),
        }
    }

    fn object_url(&self, bucket: &str, key: &str) -> String {
        format!("{}/{bucket}/{key}", self.endpoint)
    }

    fn sign(
        &self,
        method: &str,
        url: &str,
        headers: &[(&str, String)],
        body: &[u8],
    ) -> Result<Vec<(String, String)>, PipelineError> {
        let identity = Credentials::new(&self.access_key, &self.secret_key, None, None, "static")
            .into();
        let signing_settings = SigningSettings::default();
        let signing_params = v4::SigningParams::builder()
            .identity(&identity)
            .region("auto")
            .name("s3")
            .time(SystemTime::now())
            .settings(signing_settings)
            .build()
            .map_err(|e| PipelineError::StoreError(format!("signing params: {e}")))?
            .into();

        let signable_request = SignableRequest::new(
            method,
            url,
            headers.iter().map(|(k, v)| (*k, v.as_str())),
            SignableBody::Bytes(body),
        )
        .map_err(|e| PipelineError::StoreError(format!("signable request: {e}")))?;

        let (instructions, _signature) = sign(signable_request, &signing_params)
            .map_err(|e| PipelineError::StoreError(format!("sigv4 sign: {e}")))?
            .into_parts();

        Ok(instructions
            .headers()
            .map(|(k, v)| (k.to_owned(), v.to_owned()))
            .collect())
    }

    /// `get(bucket, key, useCache)`.
    #[instrument(skip(self))]
    pub async fn get(
        &self,
        bucket: &str,
        key: &str,
        use_cache: bool,
    ) -> Result<GetOutcome, PipelineError> {
        if use_cache {
            let mut cache = self.cache.lock().await;
            if let Some(cached) = cache.get(bucket, key) {
                return Ok(GetOutcome {
                    body: cached.body,
                    metadata: cached.metadata,
                });
            }
        }

        let url = self.object_url(bucket, key);
        let signed_headers = self.sign("GET", &url, &[], &[])?;

        let mut req = self.http.get(&url);
        for (k, v) in &signed_headers {
            req = req.header(k, v);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| PipelineError::StoreError(e.to_string()))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(PipelineError::StoreNotFound {
                bucket: bucket.to_owned(),
                key: key.to_owned(),
            });
        }
        if !resp.status().is_success() {
            return Err(PipelineError::StoreError(format!(
                "GET {bucket}/{key}: HTTP {}",
                resp.status()
            )));
        }

        let metadata = extract_user_metadata(resp.headers());
        let body = resp
            .bytes()
            .await
            .map_err(|e| PipelineError::StoreError(e.to_string()))?;

        if use_cache {
            let mut cache = self.cache.lock().await;
            cache.put(
                bucket,
                key,
                CachedOutcome {
                    body: body.clone(),
                    metadata: metadata.clone(),
                },
            );
        }

        Ok(GetOutcome { body, metadata })
    }

    /// `head(bucket, key)`. Never consults or populates the cache.
    #[instrument(skip(self))]
    pub async fn head(&self, bucket: &str, key: &str) -> Result<GetOutcome, PipelineError> {
        let url = self.object_url(bucket, key);
        let signed_headers = self.sign("HEAD", &url, &[], &[])?;

        let mut req = self.http.head(&url);
        for (k, v) in &signed_headers {
            req = req.header(k, v);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| PipelineError::StoreError(e.to_string()))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(PipelineError::StoreNotFound {
                bucket: bucket.to_owned(),
                key: key.to_owned(),
            });
        }
        if !resp.status().is_success() {
            return Err(PipelineError::StoreError(format!(
                "HEAD {bucket}/{key}: HTTP {}",
                resp.status()
            )));
        }

        Ok(GetOutcome {
            body: Bytes::new(),
            metadata: extract_user_metadata(resp.headers()),
        })
    }

    /// `put(bucket, key, content_type, bytes, useCache)`.
    #[instrument(skip(self, body))]
    pub async fn put(
        &self,
        bucket: &str,
        key: &str,
        content_type: &str,
        body: Bytes,
        use_cache: bool,
    ) -> Result<(), PipelineError> {
        let url = self.object_url(bucket, key);
        let headers = [("content-type", content_type.to_owned())];
        let signed_headers = self.sign("PUT", &url, &headers, &body)?;

        let mut req = self.http.put(&url).body(body.clone());
        for (k, v) in &signed_headers {
            req = req.header(k, v);
        }
        req = req.header("content-type", content_type);

        let resp = req
            .send()
            .await
            .map_err(|e| PipelineError::StoreError(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(PipelineError::StoreError(format!(
                "PUT {bucket}/{key}: HTTP {}",
                resp.status()
            )));
        }

        if use_cache {
            let mut cache = self.cache.lock().await;
            cache.put(
                bucket,
                key,
                CachedOutcome {
                    body,
                    metadata: HashMap::new(),
                },
            );
        }

        Ok(())
    }

    /// Fans out `requests` concurrently, returning results in request
    /// order. Per-element failures never surface as a batch failure.
    pub async fn get_many(&self, requests: Vec<GetParams>) -> Vec<Result<GetOutcome, PipelineError>> {
        let futures = requests.into_iter().map(|p| async move {
            if p.head_only {
                self.head(&p.bucket, &p.key).await
            } else {
                self.get(&p.bucket, &p.key, p.use_cache).await
            }
        });
        futures::future::join_all(futures).await
    }

    /// Fans out `requests` concurrently, returning results in request
    /// order.
    pub async fn put_many(&self, requests: Vec<PutParams>) -> Vec<Result<(), PipelineError>> {
        let futures = requests.into_iter().map(|p| async move {
            self.put(&p.bucket, &p.key, &p.content_type, p.body, p.use_cache)
                .await
        });
        futures::future::join_all(futures).await
    }

    /// POSTs a single purge request listing `urls` to the CDN API.
    /// Non-2xx responses or `success:false` payloads are logged, never
    /// returned as an error to the caller.
    #[instrument(skip(self))]
    pub async fn purge_cache(&self, urls: &[String]) {
        if urls.is_empty() || self.cf_zone_id.is_empty() {
            return;
        }

        let files: Vec<_> = urls
            .iter()
            .map(|url| {
                serde_json::json!({
                    "url": url,
                    "headers": {"Origin": self.cf_origin},
                })
            })
            .collect();
        let body = serde_json::json!({ "files": files });

        let url = format!(
            "https://api.cloudflare.com/client/v4/zones/{}/purge_cache",
            self.cf_zone_id
        );

        let result = self
            .http
            .post(&url)
            .bearer_auth(&self.cf_api_token)
            .json(&body)
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => match resp.json::<serde_json::Value>().await {
                Ok(payload) if payload.get("success").and_then(|v| v.as_bool()) == Some(true) => {}
                Ok(payload) => warn!(?payload, "cdn purge reported success:false"),
                Err(e) => warn!(error = %e, "cdn purge response body unreadable"),
            },
            Ok(resp) => warn!(status = %resp.status(), "cdn purge failed"),
            Err(e) => warn!(error = %e, "cdn purge request failed"),
        }
    }
}

fn extract_user_metadata(headers: &reqwest::header::HeaderMap) -> HashMap<String, String> {
    const PREFIX: &str = "x-amz-meta-";
    headers
        .iter()
        .filter_map(|(name, value)| {
            let name = name.as_str();
            let stripped = name.strip_prefix(PREFIX)?;
            Some((stripped.to_owned(), value.to_str().ok()?.to_owned()))
        })
        .collect()
}
