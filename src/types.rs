use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type UserId = i64;

/// Token pair as returned by the provider's token endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default)]
    pub token_type: String,
    pub expires_in: u64,
    #[serde(default)]
    pub scope: String,
}

#[derive(Debug, Deserialize)]
pub struct OAuthCallback {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactRequest {
    pub email: String,
    pub first_name: String,
    pub last_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactCreationEvent {
    pub event_id: Option<i64>,
    pub subscription_id: Option<i64>,
    pub portal_id: Option<i64>,
    pub app_id: Option<i64>,
    /// Epoch milliseconds.
    pub occurred_at: Option<i64>,
    pub subscription_type: Option<String>,
    pub attempt_number: Option<i32>,
    pub object_id: Option<i64>,
    pub change_flag: Option<String>,
    pub change_source: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredEvent {
    pub id: u64,
    pub event_id: Option<i64>,
    pub subscription_id: Option<i64>,
    pub portal_id: Option<i64>,
    pub app_id: Option<i64>,
    pub occurred_at: Option<DateTime<Utc>>,
    pub subscription_type: Option<String>,
    pub attempt_number: Option<i32>,
    pub object_id: Option<i64>,
    pub change_flag: Option<String>,
    pub change_source: Option<String>,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub content: Vec<T>,
    pub page_number: usize,
    pub size: usize,
    pub total_elements: usize,
    pub total_pages: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageQuery {
    #[serde(default)]
    pub page_number: usize,
    #[serde(default = "default_page_size")]
    pub size: usize,
}

fn default_page_size() -> usize {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterRequest {
    pub name: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserView {
    pub id: UserId,
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionData {
    pub user_id: UserId,
    pub created_at: DateTime<Utc>,
}
