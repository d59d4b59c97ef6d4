//! HTTP storage tier: `POST {base}/api/storage`.
//!
//! The user id is fixed per provider. The language namespace travels with every
//! request as an explicit argument.

use std::collections::HashMap;

use futures::future::join_all;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::retry::RetryPolicy;
use super::tiered::is_envelope;
use super::{Priority, StorageError};
use crate::config::RemoteConfig;

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "lowercase")]
enum RemoteAction {
    Get,
    Set,
    Delete,
    List,
}

impl RemoteAction {
    fn as_str(self) -> &'static str {
        match self {
            RemoteAction::Get => "get",
            RemoteAction::Set => "set",
            RemoteAction::Delete => "delete",
            RemoteAction::List => "list",
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StorageRequest<'a> {
    action: RemoteAction,
    user_id: &'a str,
    language_code: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    key: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

pub struct RemoteProvider {
    client: Client,
    base_url: String,
    user_id: String,
    retry: RetryPolicy,
}

impl RemoteProvider {
    pub fn new(config: &RemoteConfig, user_id: impl Into<String>) -> Result<Self, StorageError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| StorageError::Network(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            user_id: user_id.into(),
            retry: RetryPolicy::new(config.max_retries, config.base_retry_delay),
        })
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Raw stored text, or `None` when the key does not exist.
    pub async fn get(&self, language: Option<&str>, key: &str) -> Result<Option<String>, StorageError> {
        let data: Option<Value> = self
            .call(RemoteAction::Get, language, Some(key), None, None)
            .await?;
        Ok(data.filter(|v| !v.is_null()).map(stored_text))
    }

    pub async fn set(
        &self,
        language: Option<&str>,
        key: &str,
        value: &str,
        priority: Priority,
    ) -> Result<(), StorageError> {
        let data: Value = serde_json::from_str(value)?;
        let options = serde_json::json!({ "priority": priority });
        let _: Option<Value> = self
            .call(RemoteAction::Set, language, Some(key), Some(&data), Some(options))
            .await?;
        Ok(())
    }

    pub async fn delete(&self, language: Option<&str>, key: &str) -> Result<bool, StorageError> {
        let data: Option<Value> = self
            .call(RemoteAction::Delete, language, Some(key), None, None)
            .await?;
        Ok(data.and_then(|v| v.as_bool()).unwrap_or(true))
    }

    pub async fn exists(&self, language: Option<&str>, key: &str) -> Result<bool, StorageError> {
        Ok(self.get(language, key).await?.is_some())
    }

    pub async fn get_batch(
        &self,
        language: Option<&str>,
        keys: &[String],
    ) -> Result<HashMap<String, String>, StorageError> {
        let lookups = keys.iter().map(|key| async move {
            self.get(language, key).await.map(|value| (key.clone(), value))
        });
        let mut out = HashMap::with_capacity(keys.len());
        for result in join_all(lookups).await {
            let (key, value) = result?;
            if let Some(value) = value {
                out.insert(key, value);
            }
        }
        Ok(out)
    }

    /// `priorities[i]` goes with `rows[i]`; rows without one are sent as medium.
    pub async fn set_batch(
        &self,
        rows: &[(String, Option<String>, String)],
        priorities: &[Priority],
    ) -> Result<usize, StorageError> {
        for (index, (key, language, value)) in rows.iter().enumerate() {
            let priority = priorities.get(index).copied().unwrap_or(Priority::Medium);
            self.set(language.as_deref(), key, value, priority).await?;
        }
        Ok(rows.len())
    }

    pub async fn keys(&self, language: Option<&str>) -> Result<Vec<String>, StorageError> {
        let data: Option<Vec<String>> = self
            .call(RemoteAction::List, language, None, None, None)
            .await?;
        let mut keys = data.unwrap_or_default();
        keys.sort();
        Ok(keys)
    }

    pub async fn clear(&self, language: Option<&str>) -> Result<usize, StorageError> {
        let keys = self.keys(language).await?;
        for key in &keys {
            self.delete(language, key).await?;
        }
        Ok(keys.len())
    }

    /// One listing round trip without retries.
    pub async fn ping(&self) -> Result<(), StorageError> {
        let _: Option<Vec<String>> = self
            .send_once(RemoteAction::List, None, None, None, None)
            .await?;
        Ok(())
    }

    async fn call<T: DeserializeOwned>(
        &self,
        action: RemoteAction,
        language: Option<&str>,
        key: Option<&str>,
        data: Option<&Value>,
        options: Option<Value>,
    ) -> Result<Option<T>, StorageError> {
        self.retry
            .run(action.as_str(), || {
                self.send_once(action, language, key, data, options.clone())
            })
            .await
    }

    async fn send_once<T: DeserializeOwned>(
        &self,
        action: RemoteAction,
        language: Option<&str>,
        key: Option<&str>,
        data: Option<&Value>,
        options: Option<Value>,
    ) -> Result<Option<T>, StorageError> {
        let url = format!("{}/api/storage", self.base_url);
        let request = StorageRequest {
            action,
            user_id: &self.user_id,
            language_code: language,
            key,
            data,
            options,
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| StorageError::Network(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(StorageError::NotAuthenticated);
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(StorageError::Http {
                status: status.as_u16(),
                message,
            });
        }

        let body: ApiResponse<T> = response
            .json()
            .await
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        if !body.success {
            return Err(StorageError::Remote(
                body.error.unwrap_or_else(|| "unknown error".to_string()),
            ));
        }

        debug!(action = action.as_str(), key = ?key, language = ?language, "remote storage call ok");
        Ok(body.data)
    }
}

/// Servers that keep our envelope as text hand it back as a JSON string. Any other
/// value, bare strings included, is re-encoded so it parses as the same JSON.
fn stored_text(value: Value) -> String {
    match value {
        Value::String(text) if is_envelope(&text) => text,
        other => other.to_string(),
    }
}
