//! API Handlers
//!
//! HTTP request handlers for each cache server endpoint.

use std::time::Duration;

use axum::{
    extract::{Path, State},
    Json,
};

use crate::cache::Cache;
use crate::config::Config;
use crate::error::{CacheError, Result};
use crate::models::requests::validate_key;
use crate::models::{
    DeleteResponse, GetResponse, HealthResponse, IncrRequest, IncrResponse, SetRequest,
    SetResponse, StatsResponse, TtlResponse,
};

/// Application state shared across all handlers.
///
/// The cache does its own locking, so the state is just a cheap clone of it.
#[derive(Clone)]
pub struct AppState {
    pub cache: Cache<String, String>,
}

impl AppState {
    pub fn new(cache: Cache<String, String>) -> Self {
        Self { cache }
    }

    /// Creates a new AppState from configuration.
    ///
    /// Must be called from within a tokio runtime.
    pub fn from_config(config: &Config) -> Self {
        Self::new(Cache::from_config(config))
    }
}

/// Handler for PUT /set
///
/// Stores a key-value pair; `ttl` is in seconds, 0 never expires.
pub async fn set_handler(
    State(state): State<AppState>,
    Json(req): Json<SetRequest>,
) -> Result<Json<SetResponse>> {
    if let Some(error_msg) = req.validate() {
        return Err(CacheError::InvalidRequest(error_msg));
    }

    let ttl = req.ttl.map(Duration::from_secs);
    state.cache.put(req.key.clone(), req.value, ttl).await?;

    Ok(Json(SetResponse::new(req.key)))
}

/// Handler for GET /get/:key
pub async fn get_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<GetResponse>> {
    match state.cache.get(&key).await? {
        Some(value) => Ok(Json(GetResponse::new(key, value))),
        None => Err(CacheError::NotFound(key)),
    }
}

/// Handler for DELETE /del/:key
pub async fn delete_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<DeleteResponse>> {
    if !state.cache.delete(&key).await? {
        return Err(CacheError::NotFound(key));
    }
    Ok(Json(DeleteResponse::new(key)))
}

/// Handler for GET /ttl/:key
pub async fn ttl_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<TtlResponse>> {
    if !state.cache.exists(&key).await {
        return Err(CacheError::NotFound(key));
    }
    let ttl = state.cache.ttl(&key).await?;
    Ok(Json(TtlResponse::new(key, ttl)))
}

/// Handler for POST /incr/:key
///
/// Adds `by` (default 1) to the integer stored under the key, treating a
/// missing key as zero. Fails without writing if the value is not an integer.
pub async fn incr_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
    req: Option<Json<IncrRequest>>,
) -> Result<Json<IncrResponse>> {
    if let Some(error_msg) = validate_key(&key) {
        return Err(CacheError::InvalidRequest(error_msg));
    }
    let by = req.map(|Json(req)| req.amount()).unwrap_or(1);

    let value = state
        .cache
        .update(key.clone(), |current| {
            let current = match current {
                Some(raw) => raw.parse::<i64>().map_err(|_| {
                    CacheError::InvalidRequest(format!("value of '{}' is not an integer", raw))
                })?,
                None => 0,
            };
            current
                .checked_add(by)
                .map(|next| next.to_string())
                .ok_or_else(|| CacheError::InvalidRequest("integer overflow".to_string()))
        })
        .await??;

    let value = value
        .parse()
        .map_err(|_| CacheError::Internal("stored counter is not an integer".to_string()))?;
    Ok(Json(IncrResponse::new(key, value)))
}

/// Handler for GET /stats
pub async fn stats_handler(State(state): State<AppState>) -> Result<Json<StatsResponse>> {
    let stats = state.cache.stats().await;
    let locks = state.cache.lock_stats().await?;

    Ok(Json(StatsResponse::new(&stats, locks.resources)))
}

/// Handler for GET /health
pub async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse::healthy())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_state() -> AppState {
        AppState::from_config(&Config {
            tick_interval_ms: 0,
            ..Config::default()
        })
    }

    fn set_request(key: &str, value: &str) -> SetRequest {
        SetRequest {
            key: key.to_string(),
            value: value.to_string(),
            ttl: None,
        }
    }

    #[tokio::test]
    async fn test_set_and_get_handler() {
        let state = test_state();

        let request = set_request("test_key", "test_value");
        let result = set_handler(State(state.clone()), Json(request)).await;
        assert!(result.is_ok());

        let response = get_handler(State(state.clone()), Path("test_key".to_string()))
            .await
            .unwrap();
        assert_eq!(response.value, "test_value");
    }

    #[tokio::test]
    async fn test_get_nonexistent_key() {
        let state = test_state();

        let result = get_handler(State(state), Path("nonexistent".to_string())).await;
        assert!(matches!(result, Err(CacheError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_delete_handler() {
        let state = test_state();
        set_handler(State(state.clone()), Json(set_request("to_delete", "value")))
            .await
            .unwrap();

        let result = delete_handler(State(state.clone()), Path("to_delete".to_string())).await;
        assert!(result.is_ok());

        let result = delete_handler(State(state), Path("to_delete".to_string())).await;
        assert!(matches!(result, Err(CacheError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_incr_handler() {
        let state = test_state();

        let first = incr_handler(State(state.clone()), Path("n".to_string()), None)
            .await
            .unwrap();
        assert_eq!(first.value, 1);

        let second = incr_handler(
            State(state.clone()),
            Path("n".to_string()),
            Some(Json(IncrRequest { by: Some(41) })),
        )
        .await
        .unwrap();
        assert_eq!(second.value, 42);
    }

    #[tokio::test]
    async fn test_incr_non_integer_leaves_value() {
        let state = test_state();
        set_handler(State(state.clone()), Json(set_request("word", "hello")))
            .await
            .unwrap();

        let result = incr_handler(State(state.clone()), Path("word".to_string()), None).await;
        assert!(matches!(result, Err(CacheError::InvalidRequest(_))));

        let response = get_handler(State(state), Path("word".to_string())).await.unwrap();
        assert_eq!(response.value, "hello");
    }

    #[tokio::test]
    async fn test_stats_handler() {
        let state = test_state();

        let response = stats_handler(State(state)).await.unwrap();
        assert_eq!(response.hits, 0);
        assert_eq!(response.misses, 0);
        assert_eq!(response.locked_keys, 0);
    }

    #[tokio::test]
    async fn test_health_handler() {
        let response = health_handler().await;
        assert_eq!(response.status, "healthy");
    }

    #[tokio::test]
    async fn test_set_invalid_request() {
        let state = test_state();

        let result = set_handler(State(state), Json(set_request("", "value"))).await;
        assert!(matches!(result, Err(CacheError::InvalidRequest(_))));
    }
}
