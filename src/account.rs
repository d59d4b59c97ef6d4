//! Cross-device account linking through `POST {base}/api/users`.
//!
//! One device asks for a short link code, another device redeems it and from then on
//! shares the first device's user id. Codes are generated locally and registered
//! with the server together with their expiry.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::config::{AccountConfig, RemoteConfig};
use crate::storage::remote::ApiResponse;

pub const LINK_CODE_LEN: usize = 8;
const LINK_CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

#[derive(Debug, Error)]
pub enum AccountError {
    #[error("Remote account service is not configured")]
    NotConfigured,

    #[error("Invalid link code: {0:?}")]
    InvalidCode(String),

    #[error("Link code expired at {0}")]
    Expired(DateTime<Utc>),

    #[error("Network error: {0}")]
    Network(String),

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Account service rejected request: {0}")]
    Rejected(String),

    #[error("Malformed response: {0}")]
    Serialization(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkCode {
    pub code: String,
    pub expires_at: DateTime<Utc>,
}

impl LinkCode {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserAccount {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

pub fn generate_link_code<R: Rng + ?Sized>(rng: &mut R) -> String {
    (0..LINK_CODE_LEN)
        .map(|_| LINK_CODE_ALPHABET[rng.random_range(0..LINK_CODE_ALPHABET.len())] as char)
        .collect()
}

pub fn is_valid_link_code(code: &str) -> bool {
    code.len() == LINK_CODE_LEN && code.bytes().all(|b| b.is_ascii_uppercase() || b.is_ascii_digit())
}

/// Accepts what people type: lowercase, spaces, dashes.
pub fn normalize_link_code(input: &str) -> Option<String> {
    let code: String = input
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .map(|c| c.to_ascii_uppercase())
        .collect();
    is_valid_link_code(&code).then_some(code)
}

#[derive(Debug, Serialize)]
#[serde(tag = "action", rename_all = "camelCase", rename_all_fields = "camelCase")]
enum UsersRequest<'a> {
    Create {
        device_id: &'a str,
    },
    Authenticate {
        user_id: &'a str,
        device_id: &'a str,
    },
    GenerateCode {
        user_id: &'a str,
        code: &'a str,
        expires_at: DateTime<Utc>,
    },
    LinkDevice {
        code: &'a str,
        device_id: &'a str,
    },
}

impl UsersRequest<'_> {
    fn name(&self) -> &'static str {
        match self {
            UsersRequest::Create { .. } => "create",
            UsersRequest::Authenticate { .. } => "authenticate",
            UsersRequest::GenerateCode { .. } => "generateCode",
            UsersRequest::LinkDevice { .. } => "linkDevice",
        }
    }
}

pub struct AccountClient {
    client: Client,
    base_url: String,
    link_code_ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl AccountClient {
    pub fn new(remote: &RemoteConfig, account: &AccountConfig, clock: Arc<dyn Clock>) -> Result<Self, AccountError> {
        if remote.base_url.trim().is_empty() {
            return Err(AccountError::NotConfigured);
        }
        let client = Client::builder()
            .timeout(remote.timeout)
            .build()
            .map_err(|e| AccountError::Network(e.to_string()))?;
        Ok(Self {
            client,
            base_url: remote.base_url.trim_end_matches('/').to_string(),
            link_code_ttl: account.link_code_ttl,
            clock,
        })
    }

    pub async fn create_user(&self, device_id: &str) -> Result<UserAccount, AccountError> {
        self.send(&UsersRequest::Create { device_id }).await
    }

    pub async fn authenticate(&self, user_id: &str, device_id: &str) -> Result<UserAccount, AccountError> {
        self.send(&UsersRequest::Authenticate { user_id, device_id }).await
    }

    /// Creates a fresh code for `user_id` and registers it with the server.
    pub async fn generate_code(&self, user_id: &str) -> Result<LinkCode, AccountError> {
        let code = generate_link_code(&mut rand::rng());
        let ttl = chrono::Duration::from_std(self.link_code_ttl).unwrap_or(chrono::Duration::hours(1));
        let link = LinkCode {
            code,
            expires_at: self.clock.now() + ttl,
        };

        let _: serde_json::Value = self
            .send(&UsersRequest::GenerateCode {
                user_id,
                code: &link.code,
                expires_at: link.expires_at,
            })
            .await?;
        info!(expires_at = %link.expires_at, "link code registered");
        Ok(link)
    }

    /// Redeems a code typed on another device.
    pub async fn link_device(&self, input: &str, device_id: &str) -> Result<UserAccount, AccountError> {
        let code = normalize_link_code(input).ok_or_else(|| AccountError::InvalidCode(input.to_string()))?;
        let account: UserAccount = self.send(&UsersRequest::LinkDevice { code: &code, device_id }).await?;
        info!(user_id = %account.user_id, "device linked");
        Ok(account)
    }

    /// Redeems a code this client already holds, refusing locally once it expired.
    pub async fn redeem(&self, link: &LinkCode, device_id: &str) -> Result<UserAccount, AccountError> {
        if link.is_expired(self.clock.now()) {
            debug!(expires_at = %link.expires_at, "link code expired before redeeming");
            return Err(AccountError::Expired(link.expires_at));
        }
        self.link_device(&link.code, device_id).await
    }

    async fn send<T: DeserializeOwned>(&self, request: &UsersRequest<'_>) -> Result<T, AccountError> {
        let url = format!("{}/api/users", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| AccountError::Network(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::GONE {
            return Err(AccountError::Rejected("link code expired or already used".to_string()));
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(AccountError::Http {
                status: status.as_u16(),
                message,
            });
        }

        let body: ApiResponse<T> = response
            .json()
            .await
            .map_err(|e| AccountError::Serialization(e.to_string()))?;
        if !body.success {
            return Err(AccountError::Rejected(
                body.error.unwrap_or_else(|| "unknown error".to_string()),
            ));
        }
        debug!(action = request.name(), "account call ok");
        body.data
            .ok_or_else(|| AccountError::Serialization(format!("{} returned no data", request.name())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use serde_json::json;

    #[test]
    fn normalizes_typed_codes() {
        assert_eq!(normalize_link_code("ab12-cd34"), Some("AB12CD34".to_string()));
        assert_eq!(normalize_link_code(" AB12 CD34 "), Some("AB12CD34".to_string()));
        assert_eq!(normalize_link_code("AB12CD3"), None);
        assert_eq!(normalize_link_code("AB12CD3!"), None);
    }

    #[test]
    fn expiry_is_inclusive() {
        let expires_at = DateTime::from_timestamp_millis(1_000).unwrap();
        let link = LinkCode {
            code: "AB12CD34".into(),
            expires_at,
        };
        assert!(!link.is_expired(expires_at - chrono::Duration::milliseconds(1)));
        assert!(link.is_expired(expires_at));
    }

    #[test]
    fn requests_are_tagged_by_action() {
        let expires_at = DateTime::from_timestamp_millis(0).unwrap();
        let body = serde_json::to_value(UsersRequest::GenerateCode {
            user_id: "user-1",
            code: "AB12CD34",
            expires_at,
        })
        .unwrap();
        assert_eq!(body["action"], json!("generateCode"));
        assert_eq!(body["userId"], json!("user-1"));
        assert!(body.get("expiresAt").is_some());

        let body = serde_json::to_value(UsersRequest::LinkDevice {
            code: "AB12CD34",
            device_id: "tablet",
        })
        .unwrap();
        assert_eq!(body, json!({"action": "linkDevice", "code": "AB12CD34", "deviceId": "tablet"}));
    }

    #[test]
    fn client_requires_base_url() {
        let clock = Arc::new(ManualClock::new(0));
        assert!(matches!(
            AccountClient::new(&RemoteConfig::default(), &AccountConfig::default(), clock),
            Err(AccountError::NotConfigured)
        ));
    }

    #[tokio::test]
    async fn bad_code_fails_before_any_request() {
        let remote = RemoteConfig {
            base_url: "http://127.0.0.1:9".into(),
            timeout: Duration::from_millis(200),
            ..RemoteConfig::default()
        };
        let client = AccountClient::new(&remote, &AccountConfig::default(), Arc::new(ManualClock::new(0))).unwrap();
        assert!(matches!(
            client.link_device("nope", "phone").await,
            Err(AccountError::InvalidCode(_))
        ));
        assert!(matches!(
            client.create_user("phone").await,
            Err(AccountError::Network(_))
        ));
    }

    #[tokio::test]
    async fn expired_code_is_refused_without_a_request() {
        let remote = RemoteConfig {
            base_url: "http://127.0.0.1:9".into(),
            timeout: Duration::from_millis(200),
            ..RemoteConfig::default()
        };
        let clock = Arc::new(ManualClock::new(10_000));
        let client = AccountClient::new(&remote, &AccountConfig::default(), clock.clone()).unwrap();
        let link = LinkCode {
            code: "AB12CD34".into(),
            expires_at: DateTime::from_timestamp_millis(5_000).unwrap(),
        };
        assert!(matches!(
            client.redeem(&link, "tablet").await,
            Err(AccountError::Expired(at)) if at == link.expires_at
        ));

        clock.set_ms(4_000);
        assert!(matches!(
            client.redeem(&link, "tablet").await,
            Err(AccountError::Network(_))
        ));
    }

    proptest! {
        #[test]
        fn generated_codes_are_valid(seed in any::<u64>()) {
            let mut rng = StdRng::seed_from_u64(seed);
            let code = generate_link_code(&mut rng);
            prop_assert!(is_valid_link_code(&code));
            prop_assert_eq!(normalize_link_code(&code.to_lowercase()), Some(code));
        }
    }
}
