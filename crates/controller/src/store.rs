//! Remote state store: a path-addressed JSON key-value store reached over
//! HTTP. Production talks to the Firebase Realtime Database REST API
//! (`GET`/`PUT {base_url}/{path}.json`).

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("request to '{path}' failed: {source}")]
    Transport {
        path: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("'{path}' answered with HTTP {status}")]
    Status { path: String, status: u16 },

    /// Used by the in-memory store to simulate an unreachable backend.
    #[cfg(test)]
    #[error("injected failure on '{0}'")]
    Injected(String),
}

// ---------------------------------------------------------------------------
// Store seam
// ---------------------------------------------------------------------------

#[async_trait]
pub trait StateStore: Send + Sync {
    /// Current value at `path`. A missing node reads as `Value::Null`.
    async fn get(&self, path: &str) -> Result<Value, StoreError>;

    /// Overwrite the value at `path`.
    async fn put(&self, path: &str, value: &Value) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// Firebase Realtime Database (REST)
// ---------------------------------------------------------------------------

pub struct FirebaseStore {
    client: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
}

impl FirebaseStore {
    pub fn new(
        base_url: &str,
        auth_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_token,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}.json", self.base_url, path.trim_matches('/'))
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth_token {
            Some(token) => req.query(&[("auth", token)]),
            None => req,
        }
    }
}

#[async_trait]
impl StateStore for FirebaseStore {
    async fn get(&self, path: &str) -> Result<Value, StoreError> {
        let transport = |source| StoreError::Transport {
            path: path.to_string(),
            source,
        };

        let resp = self
            .authorize(self.client.get(self.url(path)))
            .send()
            .await
            .map_err(transport)?;

        let status = resp.status();
        if !status.is_success() {
            return Err(StoreError::Status {
                path: path.to_string(),
                status: status.as_u16(),
            });
        }

        resp.json::<Value>().await.map_err(transport)
    }

    async fn put(&self, path: &str, value: &Value) -> Result<(), StoreError> {
        let resp = self
            .authorize(self.client.put(self.url(path)))
            .json(value)
            .send()
            .await
            .map_err(|source| StoreError::Transport {
                path: path.to_string(),
                source,
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(StoreError::Status {
                path: path.to_string(),
                status: status.as_u16(),
            });
        }

        tracing::debug!(path, %value, "store write confirmed");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory store (tests)
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod memory {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// Shared store double. Records every successful `put` and can be told
    /// to fail reads or writes.
    #[derive(Default)]
    pub(crate) struct MemoryStore {
        values: Mutex<HashMap<String, Value>>,
        writes: Mutex<Vec<(String, Value)>>,
        fail_gets: AtomicBool,
        fail_puts: AtomicBool,
        failing_prefix: Mutex<Option<String>>,
        get_delay: Mutex<Duration>,
    }

    impl MemoryStore {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        /// Change a value the way another actor (the field device) would:
        /// no entry in the write log.
        pub(crate) fn set_external(&self, path: &str, value: Value) {
            self.values.lock().unwrap().insert(path.to_string(), value);
        }

        pub(crate) fn value(&self, path: &str) -> Value {
            self.values
                .lock()
                .unwrap()
                .get(path)
                .cloned()
                .unwrap_or(Value::Null)
        }

        pub(crate) fn writes(&self) -> Vec<(String, Value)> {
            self.writes.lock().unwrap().clone()
        }

        pub(crate) fn writes_to(&self, path: &str) -> Vec<Value> {
            self.writes()
                .into_iter()
                .filter(|(p, _)| p == path)
                .map(|(_, v)| v)
                .collect()
        }

        pub(crate) fn fail_gets(&self, fail: bool) {
            self.fail_gets.store(fail, Ordering::SeqCst);
        }

        pub(crate) fn fail_puts(&self, fail: bool) {
            self.fail_puts.store(fail, Ordering::SeqCst);
        }

        /// Fail reads of every path under `prefix`, leaving the rest readable.
        pub(crate) fn fail_gets_under(&self, prefix: &str) {
            *self.failing_prefix.lock().unwrap() = Some(prefix.to_string());
        }

        /// Make every read take `delay` (tokio time) before answering.
        pub(crate) fn slow_gets(&self, delay: Duration) {
            *self.get_delay.lock().unwrap() = delay;
        }
    }

    #[async_trait]
    impl StateStore for MemoryStore {
        async fn get(&self, path: &str) -> Result<Value, StoreError> {
            let delay = *self.get_delay.lock().unwrap();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let prefix_fails = self
                .failing_prefix
                .lock()
                .unwrap()
                .as_deref()
                .is_some_and(|prefix| path.starts_with(prefix));
            if prefix_fails || self.fail_gets.load(Ordering::SeqCst) {
                return Err(StoreError::Injected(path.to_string()));
            }
            Ok(self.value(path))
        }

        async fn put(&self, path: &str, value: &Value) -> Result<(), StoreError> {
            if self.fail_puts.load(Ordering::SeqCst) {
                return Err(StoreError::Injected(path.to_string()));
            }
            self.values
                .lock()
                .unwrap()
                .insert(path.to_string(), value.clone());
            self.writes
                .lock()
                .unwrap()
                .push((path.to_string(), value.clone()));
            Ok(())
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
