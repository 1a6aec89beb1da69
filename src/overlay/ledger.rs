//! Shared key/value ledger exposed by the overlay API
//!
//! Nodes coordinate exclusively through the ledger: liveness announcements,
//! role assignments and the join data published by the initializing master.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use reqwest::{StatusCode, Url};
use tracing::debug;

use crate::{Error, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Bucket and key names used by a formation network
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Buckets {
    network_id: String,
}

impl Buckets {
    /// Key under which the cluster join token is published
    pub const TOKEN: &'static str = "token";
    /// Key under which the control plane address is published
    pub const ADDRESS: &'static str = "address";

    /// Buckets of the given network
    pub fn new(network_id: impl Into<String>) -> Self {
        Self {
            network_id: network_id.into(),
        }
    }

    /// Liveness announcements: node uuid -> unix timestamp
    pub fn nodes(&self) -> String {
        format!("{}-nodes", self.network_id)
    }

    /// Role assignments: node uuid -> role name
    pub fn roles(&self) -> String {
        format!("{}-roles", self.network_id)
    }

    /// Cluster join data published by the initializing master
    pub fn cluster(&self) -> String {
        format!("{}-cluster", self.network_id)
    }
}

/// Access to the overlay ledger
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Read a single value
    async fn get(&self, bucket: &str, key: &str) -> Result<Option<String>>;

    /// Write a single value
    async fn put(&self, bucket: &str, key: &str, value: &str) -> Result<()>;

    /// Read every entry of a bucket
    async fn entries(&self, bucket: &str) -> Result<BTreeMap<String, String>>;
}

/// Ledger client for the overlay daemon HTTP API
#[derive(Clone, Debug)]
pub struct HttpLedger {
    base: Url,
    client: reqwest::Client,
}

impl HttpLedger {
    /// Create a client for the API listening on `api_address`
    ///
    /// Accepts both `host:port` and full `http://host:port` forms.
    pub fn new(api_address: &str) -> Result<Self> {
        let base = if api_address.contains("://") {
            api_address.to_string()
        } else {
            format!("http://{}", api_address)
        };
        let base = Url::parse(&base)
            .map_err(|e| Error::overlay(format!("invalid API address {}: {}", api_address, e)))?;

        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::overlay(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self { base, client })
    }

    /// Build `/api/ledger/<segments...>` with every segment percent-encoded
    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| Error::overlay(format!("API address {} cannot be a base", self.base)))?
            .pop_if_empty()
            .extend(["api", "ledger"])
            .extend(segments);
        Ok(url)
    }
}

/// Ledger values are JSON encoded; plain strings are unwrapped
fn decode_value(value: serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}

#[async_trait]
impl Ledger for HttpLedger {
    async fn get(&self, bucket: &str, key: &str) -> Result<Option<String>> {
        let url = self.endpoint(&[bucket, key])?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::overlay(format!("ledger read {}/{} failed: {}", bucket, key, e)))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = response
            .error_for_status()
            .map_err(|e| Error::overlay(format!("ledger read {}/{} failed: {}", bucket, key, e)))?;

        let body = response
            .text()
            .await
            .map_err(|e| Error::overlay(format!("ledger read {}/{} failed: {}", bucket, key, e)))?;
        if body.trim().is_empty() {
            return Ok(None);
        }

        match serde_json::from_str::<serde_json::Value>(&body) {
            Ok(value) => Ok(decode_value(value)),
            Err(_) => Ok(Some(body.trim().to_string())),
        }
    }

    async fn put(&self, bucket: &str, key: &str, value: &str) -> Result<()> {
        let url = self.endpoint(&[bucket, key, value])?;
        debug!(bucket, key, value, "Writing ledger entry");
        self.client
            .put(url)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| Error::overlay(format!("ledger write {}/{} failed: {}", bucket, key, e)))?;
        Ok(())
    }

    async fn entries(&self, bucket: &str) -> Result<BTreeMap<String, String>> {
        let url = self.endpoint(&[bucket])?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| Error::overlay(format!("ledger read {} failed: {}", bucket, e)))?;

        let raw: Option<BTreeMap<String, serde_json::Value>> = response
            .json()
            .await
            .map_err(|e| Error::serialization(format!("invalid ledger bucket {}: {}", bucket, e)))?;

        Ok(raw
            .unwrap_or_default()
            .into_iter()
            .filter_map(|(key, value)| decode_value(value).map(|v| (key, v)))
            .collect())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory ledger shared by the role and node tests

    use std::sync::Mutex;

    use super::*;

    /// Ledger backed by a map, standing in for a whole formation network
    #[derive(Default)]
    pub(crate) struct MemoryLedger {
        data: Mutex<BTreeMap<String, BTreeMap<String, String>>>,
    }

    impl MemoryLedger {
        pub(crate) fn value(&self, bucket: &str, key: &str) -> Option<String> {
            self.data
                .lock()
                .unwrap()
                .get(bucket)
                .and_then(|entries| entries.get(key).cloned())
        }

        pub(crate) fn insert(&self, bucket: &str, key: &str, value: &str) {
            self.data
                .lock()
                .unwrap()
                .entry(bucket.to_string())
                .or_default()
                .insert(key.to_string(), value.to_string());
        }
    }

    #[async_trait]
    impl Ledger for MemoryLedger {
        async fn get(&self, bucket: &str, key: &str) -> Result<Option<String>> {
            Ok(self.value(bucket, key))
        }

        async fn put(&self, bucket: &str, key: &str, value: &str) -> Result<()> {
            self.insert(bucket, key, value);
            Ok(())
        }

        async fn entries(&self, bucket: &str) -> Result<BTreeMap<String, String>> {
            Ok(self
                .data
                .lock()
                .unwrap()
                .get(bucket)
                .cloned()
                .unwrap_or_default())
        }
    }
}
