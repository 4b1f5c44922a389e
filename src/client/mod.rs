//! Unified API Client with Multi-Key Rotation (C3, `spec.md` §4.3).
//!
//! Grounded on the teacher's `reqwest` dependency and retry/backoff idiom,
//! and on `original_source/app/core/api_client_extension.py`'s raw-response
//! capture hook wired into the storage subsystem.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::cache::Cache;
use crate::error::{OrchestratorError, Result};
use crate::keypool::{KeyOutcome, KeyPool};
use crate::providers::Provider;
use crate::storage::policy::RawResponseEvent;

/// Per-call options (`spec.md` §4.3 `opts`).
#[derive(Debug, Clone)]
pub struct CallOptions {
    pub store_raw: bool,
    pub cache_ttl: Option<Duration>,
    pub timeout: Duration,
    pub max_retries: u32,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            store_raw: true,
            cache_ttl: Some(Duration::from_secs(3600)),
            timeout: Duration::from_secs(10),
            max_retries: 3,
        }
    }
}

/// Result of a successful `call`, including caching/storage side-channel info.
pub struct ApiResponse {
    pub body: Value,
    pub raw_response_id: Option<uuid::Uuid>,
    pub cache_hit: bool,
}

/// A sink that receives every completed HTTP exchange for possible
/// persistence, decoupled from the concrete storage queue so the client can
/// be unit tested without a database (`spec.md` §4.3 Raw capture).
#[async_trait::async_trait]
pub trait RawResponseSink: Send + Sync {
    async fn record(&self, event: RawResponseEvent) -> Option<uuid::Uuid>;
}

pub struct UnifiedApiClient {
    http: reqwest::Client,
    key_pool: Arc<KeyPool>,
    cache: Arc<Cache>,
    raw_sink: Arc<dyn RawResponseSink>,
    base_urls: BTreeMap<Provider, String>,
}

impl UnifiedApiClient {
    pub fn new(
        key_pool: Arc<KeyPool>,
        cache: Arc<Cache>,
        raw_sink: Arc<dyn RawResponseSink>,
        base_urls: BTreeMap<Provider, String>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .build()
            .expect("reqwest client builds");
        Self {
            http,
            key_pool,
            cache,
            raw_sink,
            base_urls,
        }
    }

    /// `call(provider, endpoint, params, opts) -> Response` (`spec.md` §4.3).
    pub async fn call(
        &self,
        provider: Provider,
        endpoint: &str,
        params: &BTreeMap<String, String>,
        opts: CallOptions,
    ) -> Result<ApiResponse> {
        let fingerprint = Self::fingerprint(provider, endpoint, params);

        if let Some(ttl) = opts.cache_ttl {
            let refresh_provider = provider;
            let refresh_endpoint = endpoint.to_string();
            let refresh_params = params.clone();
            let client_for_refresh = self.clone_for_refresh();
            let cached = self
                .cache
                .get(&fingerprint, ttl, move || async move {
                    let response = client_for_refresh
                        .execute_network(
                            refresh_provider,
                            &refresh_endpoint,
                            &refresh_params,
                            CallOptions {
                                cache_ttl: None,
                                ..Default::default()
                            },
                        )
                        .await?;
                    serde_json::to_string(&response.body)
                        .map_err(|e| OrchestratorError::ParseError {
                            provider: refresh_provider.to_string(),
                            endpoint: refresh_endpoint.clone(),
                            message: e.to_string(),
                        })
                })
                .await?;

            if let Some(raw) = cached {
                let body: Value = serde_json::from_str(&raw).unwrap_or(Value::Null);
                return Ok(ApiResponse {
                    body,
                    raw_response_id: None,
                    cache_hit: true,
                });
            }
        }

        let response = self.execute_network(provider, endpoint, params, opts.clone()).await?;

        if let Some(ttl) = opts.cache_ttl {
            if let Ok(raw) = serde_json::to_string(&response.body) {
                let _ = self.cache.set(&fingerprint, &raw, ttl).await;
            }
        }

        Ok(response)
    }

    /// Typed convenience wrapper over [`UnifiedApiClient::call`].
    pub async fn call_typed<T: DeserializeOwned>(
        &self,
        provider: Provider,
        endpoint: &str,
        params: &BTreeMap<String, String>,
        opts: CallOptions,
    ) -> Result<T> {
        let response = self.call(provider, endpoint, params, opts).await?;
        serde_json::from_value(response.body).map_err(|e| OrchestratorError::ParseError {
            provider: provider.to_string(),
            endpoint: endpoint.to_string(),
            message: e.to_string(),
        })
    }

    async fn execute_network(
        &self,
        provider: Provider,
        endpoint: &str,
        params: &BTreeMap<String, String>,
        opts: CallOptions,
    ) -> Result<ApiResponse> {
        let mut attempt = 0u32;
        loop {
            let key = self.key_pool.acquire(provider).await?;
            let url = self.build_url(provider, endpoint);
            let started = Instant::now();

            let request = self
                .http
                .get(&url)
                .query(params)
                .bearer_auth(key.secret())
                .timeout(opts.timeout);

            let outcome = tokio::time::timeout(opts.timeout, request.send()).await;
            let elapsed_ms = started.elapsed().as_millis() as f64;

            match outcome {
                Err(_) => {
                    self.key_pool
                        .report(provider, key.id, KeyOutcome::TransientError { attempt })
                        .await;
                    if opts.store_raw {
                        self.emit_raw(provider, endpoint, params, None, elapsed_ms).await;
                    }
                    if attempt >= opts.max_retries {
                        return Err(OrchestratorError::Timeout {
                            provider: provider.to_string(),
                            endpoint: endpoint.to_string(),
                            elapsed_ms: elapsed_ms as u64,
                        });
                    }
                    self.backoff(attempt).await;
                    attempt += 1;
                    continue;
                }
                Ok(Err(source)) => {
                    self.key_pool
                        .report(provider, key.id, KeyOutcome::TransientError { attempt })
                        .await;
                    if opts.store_raw {
                        self.emit_raw(provider, endpoint, params, None, elapsed_ms).await;
                    }
                    if attempt >= opts.max_retries {
                        return Err(OrchestratorError::Transport {
                            provider: provider.to_string(),
                            endpoint: endpoint.to_string(),
                            source,
                        });
                    }
                    self.backoff(attempt).await;
                    attempt += 1;
                    continue;
                }
                Ok(Ok(resp)) => {
                    let status = resp.status();
                    let status_code = status.as_u16();

                    if status.as_u16() == 401 || status.as_u16() == 403 {
                        self.key_pool
                            .report(provider, key.id, KeyOutcome::AuthFailed)
                            .await;
                        if opts.store_raw {
                            self.emit_raw(provider, endpoint, params, Some(status_code), elapsed_ms)
                                .await;
                        }
                        if attempt >= opts.max_retries {
                            return Err(OrchestratorError::AuthFailed {
                                provider: provider.to_string(),
                            });
                        }
                        attempt += 1;
                        continue;
                    }

                    if status.as_u16() == 429 {
                        self.key_pool
                            .report(provider, key.id, KeyOutcome::RateLimited)
                            .await;
                        if opts.store_raw {
                            self.emit_raw(provider, endpoint, params, Some(status_code), elapsed_ms)
                                .await;
                        }
                        if attempt >= opts.max_retries {
                            return Err(OrchestratorError::RateLimited {
                                provider: provider.to_string(),
                            });
                        }
                        self.backoff(attempt).await;
                        attempt += 1;
                        continue;
                    }

                    if status.is_server_error() {
                        self.key_pool
                            .report(provider, key.id, KeyOutcome::TransientError { attempt })
                            .await;
                        if opts.store_raw {
                            self.emit_raw(provider, endpoint, params, Some(status_code), elapsed_ms)
                                .await;
                        }
                        if attempt >= opts.max_retries {
                            return Err(OrchestratorError::Transport {
                                provider: provider.to_string(),
                                endpoint: endpoint.to_string(),
                                source: resp
                                    .error_for_status()
                                    .unwrap_err_or_else_reqwest_error(),
                            });
                        }
                        self.backoff(attempt).await;
                        attempt += 1;
                        continue;
                    }

                    self.key_pool.report(provider, key.id, KeyOutcome::Ok).await;

                    let body_text = resp.text().await.map_err(|source| OrchestratorError::Transport {
                        provider: provider.to_string(),
                        endpoint: endpoint.to_string(),
                        source,
                    })?;

                    let raw_response_id = if opts.store_raw {
                        self.emit_raw_with_body(
                            provider,
                            endpoint,
                            params,
                            Some(status_code),
                            elapsed_ms,
                            &body_text,
                        )
                        .await
                    } else {
                        None
                    };

                    let body: Value = serde_json::from_str(&body_text).map_err(|e| {
                        OrchestratorError::ParseError {
                            provider: provider.to_string(),
                            endpoint: endpoint.to_string(),
                            message: e.to_string(),
                        }
                    })?;

                    return Ok(ApiResponse {
                        body,
                        raw_response_id,
                        cache_hit: false,
                    });
                }
            }
        }
    }

    async fn backoff(&self, attempt: u32) {
        let base = Duration::from_millis(200);
        let capped = base * 2u32.pow(attempt.min(6));
        tokio::time::sleep(capped.min(Duration::from_secs(10))).await;
    }

    async fn emit_raw(
        &self,
        provider: Provider,
        endpoint: &str,
        params: &BTreeMap<String, String>,
        status_code: Option<u16>,
        elapsed_ms: f64,
    ) -> Option<uuid::Uuid> {
        self.emit_raw_with_body(provider, endpoint, params, status_code, elapsed_ms, "")
            .await
    }

    async fn emit_raw_with_body(
        &self,
        provider: Provider,
        endpoint: &str,
        params: &BTreeMap<String, String>,
        status_code: Option<u16>,
        elapsed_ms: f64,
        body_text: &str,
    ) -> Option<uuid::Uuid> {
        let response_value: Value =
            serde_json::from_str(body_text).unwrap_or_else(|_| Value::String(body_text.to_string()));
        let event = RawResponseEvent {
            provider,
            endpoint: endpoint.to_string(),
            request_url: self.build_url(provider, endpoint),
            params: params.clone(),
            response: response_value,
            response_size_bytes: body_text.len() as u64,
            status_code: status_code.unwrap_or(0),
            execution_time_ms: elapsed_ms,
        };
        // Fire-and-forget w.r.t. the caller, but awaited here: on a single
        // logical task this still satisfies the happens-before ordering
        // required before the caller observes the response (`spec.md` §4.3).
        self.raw_sink.record(event).await
    }

    fn build_url(&self, provider: Provider, endpoint: &str) -> String {
        let base = self
            .base_urls
            .get(&provider)
            .cloned()
            .unwrap_or_else(|| format!("https://api.example.invalid/{provider}"));
        format!("{base}/{endpoint}")
    }

    /// `fp = hash(provider || "\x00" || endpoint || "\x00" || canonical_json(params))`
    /// (`spec.md` §4.3 Fingerprint). `BTreeMap` iteration is already
    /// lexicographically ordered, giving a stable canonicalization without a
    /// separate sort pass.
    fn fingerprint(provider: Provider, endpoint: &str, params: &BTreeMap<String, String>) -> String {
        let mut hasher = Sha256::new();
        hasher.update(provider.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(endpoint.as_bytes());
        hasher.update([0u8]);
        for (k, v) in params {
            hasher.update(k.as_bytes());
            hasher.update([b'=']);
            hasher.update(v.as_bytes());
            hasher.update([b'&']);
        }
        hex::encode(hasher.finalize())
    }

    fn clone_for_refresh(&self) -> Self {
        Self {
            http: self.http.clone(),
            key_pool: self.key_pool.clone(),
            cache: self.cache.clone(),
            raw_sink: self.raw_sink.clone(),
            base_urls: self.base_urls.clone(),
        }
    }
}

/// Small helper: turns `Result<Response, reqwest::Error>`'s `Err` side back
/// into a plain `reqwest::Error` after we've already consumed `resp` once
/// via `error_for_status`, matching the borrow-checker constraints of the
/// retry loop above.
trait UnwrapErrReqwest {
    fn unwrap_err_or_else_reqwest_error(self) -> reqwest::Error;
}

impl UnwrapErrReqwest for std::result::Result<reqwest::Response, reqwest::Error> {
    fn unwrap_err_or_else_reqwest_error(self) -> reqwest::Error {
        match self {
            Err(e) => e,
            Ok(_) => unreachable!("error_for_status on a server-error status always errs"),
        }
    }
}
