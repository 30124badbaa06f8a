//! Request coordination: cache lookup, upstream fetch, store, respond.
//!
//! The [`Gateway`] owns the full miss path. A request's path names the
//! upstream URL to fetch, the cache decides whether a stored payload is still
//! fresh, and concurrent misses for the same entry are collapsed into a
//! single upstream fetch. Replayed payloads and fresh fetches alike go out
//! as `200 OK`; upstream status codes are not preserved across the cache.

use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::cache::{CacheKey, CacheStore, Lookup, StoreError};
use crate::coalesce::FlightGroup;
use crate::config::CacheConfig;
use crate::http::{Method, Request, Response, StatusCode};
use crate::params::{self, ParamMap};
use crate::upstream::{RetryPolicy, UpstreamClient, UpstreamError};

/// Errors raised while building a [`Gateway`].
#[derive(Debug, Error)]
pub enum InitError {
    #[error("failed to prepare cache directory: {0}")]
    Store(#[from] StoreError),

    #[error("failed to build upstream HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Reasons a request path cannot be turned into an upstream URL.
#[derive(Debug, Error)]
pub enum TargetError {
    #[error("no upstream URL in request path")]
    Empty,

    #[error("unparsable upstream URL: {0}")]
    Parse(#[from] url::ParseError),

    #[error("unsupported scheme '{0}', only http and https are forwarded")]
    UnsupportedScheme(String),

    #[error("upstream URL has no usable host")]
    MissingHost,
}

/// Failure inside a coalesced fetch, shared with every waiting request.
#[derive(Debug, Error)]
enum FetchError {
    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Ties the cache store, upstream client and in-flight fetch table together.
///
/// Cloning is cheap; every connection task gets its own handle onto the same
/// shared state.
///
/// # Examples
///
/// ```rust,no_run
/// use packrat::config::CacheConfig;
/// use packrat::gateway::Gateway;
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let config = CacheConfig::default();
/// let gateway = Gateway::new(&config).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Gateway {
    store: CacheStore,
    upstream: UpstreamClient,
    flights: FlightGroup<Result<Bytes, Arc<FetchError>>>,
}

impl Gateway {
    /// Builds a gateway with the default retry policy.
    ///
    /// Creates the cache namespace directory if it does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns [`InitError`] if the cache directory cannot be created or the
    /// HTTP client fails to build.
    pub async fn new(config: &CacheConfig) -> Result<Self, InitError> {
        Self::with_retry_policy(config, RetryPolicy::default()).await
    }

    /// Builds a gateway with an explicit [`RetryPolicy`] for upstream fetches.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`Gateway::new`].
    pub async fn with_retry_policy(
        config: &CacheConfig,
        policy: RetryPolicy,
    ) -> Result<Self, InitError> {
        let store = CacheStore::open(config).await?;
        let upstream = UpstreamClient::new(policy)?;
        Ok(Self {
            store,
            upstream,
            flights: FlightGroup::new(),
        })
    }

    /// Serves one request end to end.
    ///
    /// GET and POST are forwarded; other methods get a 405. The request path
    /// (minus its leading slashes) is the upstream URL, with `http://`
    /// assumed when no scheme is present. A fresh cache entry is replayed
    /// directly; a miss or expired entry triggers an upstream fetch whose
    /// payload is stored before anyone sees the response.
    pub async fn handle(&self, request: Request) -> Response {
        let method = request.method().clone();
        if !matches!(method, Method::Get | Method::Post) {
            debug!(method = %method, "method not supported");
            return Response::new(StatusCode::MethodNotAllowed)
                .body("Only GET and POST are supported");
        }

        let target = match parse_target(request.path(), request.query_string()) {
            Ok(url) => url,
            Err(e) => {
                warn!(path = %request.path(), error = %e, "rejecting unusable target");
                return Response::new(StatusCode::BadRequest).body(format!("Bad target URL: {e}"));
            }
        };

        // A body we cannot parse downgrades to "no fields" rather than
        // failing the request; the upstream may still accept it as a
        // plain fetch.
        let params = match params::from_request(&request) {
            Ok(map) => map,
            Err(e) => {
                warn!(url = %target, error = %e, "request body not understood, ignoring fields");
                ParamMap::new()
            }
        };

        let key = CacheKey::derive(&method, &target, &params);

        match self.store.get(&key).await {
            Ok(Lookup::Fresh(payload)) => {
                info!(key = %key, bytes = payload.len(), "cache hit");
                return Response::new(StatusCode::Ok).body_bytes(payload.to_vec());
            }
            Ok(Lookup::Stale(_)) => {
                debug!(key = %key, "cache entry expired, refetching");
            }
            Ok(Lookup::Miss) => {
                debug!(key = %key, "cache miss");
            }
            Err(e) => {
                error!(key = %key, error = %e, "cache read failed");
                return Response::new(StatusCode::InternalServerError).body("Cache read failed");
            }
        }

        match self.fetch_and_store(&key, &method, &target, &params).await {
            Ok(payload) => Response::new(StatusCode::Ok).body_bytes(payload.to_vec()),
            Err(e) => match e.as_ref() {
                FetchError::Upstream(err) => {
                    error!(key = %key, error = %err, "upstream fetch failed");
                    Response::new(StatusCode::BadGateway).body("Upstream unavailable")
                }
                FetchError::Store(err) => {
                    error!(key = %key, error = %err, "failed to store fetched payload");
                    Response::new(StatusCode::InternalServerError).body("Cache write failed")
                }
            },
        }
    }

    /// Fetches the target and stores the payload, coalescing concurrent
    /// misses for the same key into one upstream request.
    ///
    /// The store write completes before any caller sees the payload, so a
    /// response always implies a durable cache entry.
    async fn fetch_and_store(
        &self,
        key: &CacheKey,
        method: &Method,
        target: &Url,
        params: &ParamMap,
    ) -> Result<Bytes, Arc<FetchError>> {
        let flight_key = key.to_string();
        let store = self.store.clone();
        let upstream = self.upstream.clone();
        let key = key.clone();
        let method = method.clone();
        let target = target.clone();
        let params = params.clone();

        self.flights
            .run(&flight_key, move || async move {
                let payload = upstream
                    .fetch(&method, &target, &params)
                    .await
                    .map_err(|e| Arc::new(FetchError::from(e)))?;
                store
                    .put(&key, &payload)
                    .await
                    .map_err(|e| Arc::new(FetchError::from(e)))?;
                info!(key = %key, bytes = payload.len(), "fetched from upstream and cached");
                Ok(payload)
            })
            .await
    }
}

/// Extracts the upstream URL from a request path and query string.
///
/// Leading slashes are stripped, `http://` is assumed when the target has no
/// scheme separator, and only http/https targets with a real host survive.
fn parse_target(path: &str, query: Option<&str>) -> Result<Url, TargetError> {
    let stripped = path.trim_start_matches('/');
    if stripped.is_empty() {
        return Err(TargetError::Empty);
    }

    let mut target = stripped.to_owned();
    if let Some(query) = query {
        target.push('?');
        target.push_str(query);
    }
    if !target.contains("://") {
        target = format!("http://{target}");
    }

    let url = Url::parse(&target)?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(TargetError::UnsupportedScheme(url.scheme().to_owned()));
    }
    match url.host_str() {
        None | Some("") | Some(".") | Some("..") => Err(TargetError::MissingHost),
        Some(_) => Ok(url),
    }
}
