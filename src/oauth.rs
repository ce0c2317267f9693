//! HubSpot OAuth token lifecycle: authorization URL, code exchange,
//! caching, refresh-on-miss and lookup by user.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    cache::{access_key, refresh_key, TokenCache},
    error::{AppError, Result},
    hubspot::HubspotClient,
    types::{TokenPair, UserId},
};

pub const REQUESTED_SCOPES: &str = "crm.objects.contacts.read crm.objects.contacts.write";

/// The provider does not report a refresh-token lifetime, so it is capped here.
pub const REFRESH_TOKEN_TTL: Duration = Duration::from_secs(5 * 24 * 60 * 60);

/// Builds the raw `{user_id}:{nonce}` state value.
pub fn encode_state(user_id: UserId) -> String {
    format!("{}:{}", user_id, Uuid::new_v4())
}

/// Extracts the user id from a state value round-tripped through the provider.
///
/// Accepts both the decoded form and a still percent-encoded one.
pub fn decode_user_id_from_state(state: Option<&str>) -> Result<UserId> {
    let state = state
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AppError::InvalidState("state parameter is missing or empty".into()))?;

    let decoded = urlencoding::decode(state)
        .map_err(|e| AppError::InvalidState(format!("undecodable state: {}", e)))?;

    let (prefix, nonce) = decoded
        .split_once(':')
        .ok_or_else(|| AppError::InvalidState("state has no nonce component".into()))?;

    if nonce.is_empty() {
        return Err(AppError::InvalidState("state nonce is empty".into()));
    }

    match prefix.parse::<UserId>() {
        Ok(user_id) if user_id > 0 => Ok(user_id),
        _ => Err(AppError::InvalidState(format!(
            "state prefix is not a user id: {:?}",
            prefix
        ))),
    }
}

#[derive(Clone)]
pub struct TokenManager {
    client: HubspotClient,
    cache: Arc<dyn TokenCache>,
}

impl TokenManager {
    pub fn new(client: HubspotClient, cache: Arc<dyn TokenCache>) -> Self {
        Self { client, cache }
    }

    pub fn generate_authorization_url(&self, user_id: UserId) -> Result<String> {
        let state = encode_state(user_id);
        let url = self.client.authorization_url(REQUESTED_SCOPES, &state)?;
        debug!("Generated authorization URL for user {}", user_id);
        Ok(url)
    }

    pub async fn process_token_exchange(&self, code: &str, state: Option<&str>) -> Result<()> {
        let user_id = decode_user_id_from_state(state)?;

        if code.is_empty() {
            return Err(AppError::TokenExchangeError(
                "missing authorization code".into(),
            ));
        }

        let mut params = self.client.build_call_parameters("authorization_code");
        params.push(("code", code.to_string()));

        let token_pair = self
            .client
            .execute_token_call(&params)
            .await
            .inspect_err(|e| {
                error!("Error exchanging code for token for user {}: {}", user_id, e)
            })?;

        info!("Token received for user {}", user_id);
        self.persist_tokens(&token_pair, user_id).await;
        Ok(())
    }

    /// Exchanges `refresh_token` for a new pair.
    ///
    /// The cached refresh token is deleted before the provider is called; a
    /// failed refresh therefore leaves the user without one.
    pub async fn refresh_token_sync(
        &self,
        refresh_token: &str,
        user_id: UserId,
    ) -> Result<TokenPair> {
        if let Err(e) = self.cache.delete(&refresh_key(user_id)).await {
            warn!(
                "Could not invalidate refresh token for user {}: {}",
                user_id, e
            );
        }

        let mut params = self.client.build_call_parameters("refresh_token");
        params.push(("refresh_token", refresh_token.to_string()));

        let token_pair = self
            .client
            .execute_token_call(&params)
            .await
            .map_err(|e| {
                error!("Error refreshing token for user {}: {}", user_id, e);
                AppError::TokenRefreshError(e.to_string())
            })?;

        info!("New token received for user {}", user_id);
        self.persist_tokens(&token_pair, user_id).await;
        Ok(token_pair)
    }

    /// Cached access token for `user_id`, refreshing through the cached refresh
    /// token on a miss. `None` when neither token is available.
    pub async fn get_access_token_by_user_id(&self, user_id: UserId) -> Result<Option<String>> {
        if let Some(token) = self.read(&access_key(user_id), user_id).await {
            return Ok(Some(token));
        }

        info!(
            "Access token not found for user {}. Attempting to refresh token.",
            user_id
        );

        match self.read(&refresh_key(user_id), user_id).await {
            Some(refresh_token) => {
                let refreshed = self.refresh_token_sync(&refresh_token, user_id).await?;
                Ok(Some(refreshed.access_token))
            }
            None => {
                warn!("No refresh token found for user {}", user_id);
                Ok(None)
            }
        }
    }

    pub async fn require_access_token(&self, user_id: UserId) -> Result<String> {
        self.get_access_token_by_user_id(user_id)
            .await?
            .ok_or(AppError::MissingAccessToken(user_id))
    }

    /// Writes both tokens. Cache failures are logged and swallowed: the pair
    /// was already issued and stays usable for the current request.
    pub async fn persist_tokens(&self, token_pair: &TokenPair, user_id: UserId) {
        info!("Persisting HubSpot tokens for user {}", user_id);

        let access_ttl = Duration::from_secs(token_pair.expires_in);
        if let Err(e) = self
            .cache
            .set(&access_key(user_id), &token_pair.access_token, access_ttl)
            .await
        {
            error!("Error persisting access token for user {}: {}", user_id, e);
        }

        if let Err(e) = self
            .cache
            .set(
                &refresh_key(user_id),
                &token_pair.refresh_token,
                REFRESH_TOKEN_TTL,
            )
            .await
        {
            error!("Error persisting refresh token for user {}: {}", user_id, e);
        }
    }

    // Unreadable and empty entries both count as a miss.
    async fn read(&self, key: &str, user_id: UserId) -> Option<String> {
        match self.cache.get(key).await {
            Ok(value) => value.filter(|v| !v.is_empty()),
            Err(e) => {
                warn!("Cache read failed for user {} ({}): {}", user_id, key, e);
                None
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::Config;
    use crate::hubspot::TOKEN_PATH;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Debug, Clone, PartialEq)]
    pub enum CacheOp {
        Set(String, String, Duration),
        Get(String),
        Delete(String),
    }

    /// Cache double that records every call in order.
    #[derive(Default)]
    pub struct RecordingCache {
        store: Mutex<HashMap<String, String>>,
        ops: Mutex<Vec<CacheOp>>,
        fail_writes: bool,
    }

    impl RecordingCache {
        pub fn failing_writes() -> Self {
            Self {
                fail_writes: true,
                ..Self::default()
            }
        }

        pub fn seed(&self, key: &str, value: &str) {
            self.store
                .lock()
                .unwrap()
                .insert(key.to_string(), value.to_string());
        }

        pub fn ops(&self) -> Vec<CacheOp> {
            self.ops.lock().unwrap().clone()
        }

        pub fn value(&self, key: &str) -> Option<String> {
            self.store.lock().unwrap().get(key).cloned()
        }
    }

    #[async_trait]
    impl TokenCache for RecordingCache {
        async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
            self.ops.lock().unwrap().push(CacheOp::Set(
                key.to_string(),
                value.to_string(),
                ttl,
            ));
            if self.fail_writes {
                return Err(AppError::Cache("connection refused".into()));
            }
            self.seed(key, value);
            Ok(())
        }

        async fn get(&self, key: &str) -> Result<Option<String>> {
            self.ops.lock().unwrap().push(CacheOp::Get(key.to_string()));
            Ok(self.value(key))
        }

        async fn delete(&self, key: &str) -> Result<()> {
            self.ops
                .lock()
                .unwrap()
                .push(CacheOp::Delete(key.to_string()));
            self.store.lock().unwrap().remove(key);
            Ok(())
        }
    }

    fn manager(base: &str, cache: Arc<RecordingCache>) -> TokenManager {
        let client = HubspotClient::new(reqwest::Client::new(), Arc::new(Config::for_tests(base)));
        TokenManager::new(client, cache)
    }

    async fn mount_token_response(server: &MockServer, grant: &str, access: &str, refresh: &str) {
        Mock::given(method("POST"))
            .and(path(TOKEN_PATH))
            .and(body_string_contains(format!("grant_type={}", grant)))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": access,
                "refresh_token": refresh,
                "token_type": "bearer",
                "expires_in": 3600,
                "scope": REQUESTED_SCOPES
            })))
            .expect(1)
            .mount(server)
            .await;
    }

    #[test]
    fn state_round_trips_user_id() {
        let state = encode_state(42);
        assert!(state.starts_with("42:"));
        assert_eq!(decode_user_id_from_state(Some(&state)).unwrap(), 42);
    }

    #[test]
    fn percent_encoded_state_is_accepted() {
        assert_eq!(
            decode_user_id_from_state(Some("7%3Aabc-123")).unwrap(),
            7
        );
    }

    #[test]
    fn malformed_states_are_rejected() {
        for state in [None, Some(""), Some("invalid"), Some("abc:xyz"), Some("7:"), Some("0:n"), Some("-3:n")] {
            let err = decode_user_id_from_state(state).unwrap_err();
            assert!(
                matches!(err, AppError::InvalidState(_)),
                "state {:?} should be rejected",
                state
            );
        }
    }

    #[test]
    fn authorization_url_carries_user_state_and_scopes() {
        let manager = manager("http://localhost", Arc::new(RecordingCache::default()));
        let url = url::Url::parse(&manager.generate_authorization_url(7).unwrap()).unwrap();

        let params: HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(params["scope"], REQUESTED_SCOPES);
        assert_eq!(params["client_id"], "test-client");
        assert_eq!(
            decode_user_id_from_state(Some(params["state"].as_str())).unwrap(),
            7
        );
    }

    #[tokio::test]
    async fn token_exchange_caches_both_tokens() {
        let server = MockServer::start().await;
        mount_token_response(&server, "authorization_code", "AT1", "RT1").await;

        let cache = Arc::new(RecordingCache::default());
        manager(&server.uri(), cache.clone())
            .process_token_exchange("code", Some("7:abc-123"))
            .await
            .unwrap();

        assert_eq!(
            cache.ops(),
            vec![
                CacheOp::Set(
                    "oauth:access_token:7".into(),
                    "AT1".into(),
                    Duration::from_secs(3600)
                ),
                CacheOp::Set(
                    "oauth:refresh_token:7".into(),
                    "RT1".into(),
                    Duration::from_secs(5 * 24 * 3600)
                ),
            ]
        );
    }

    #[tokio::test]
    async fn invalid_state_fails_before_provider_call() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let cache = Arc::new(RecordingCache::default());
        let err = manager(&server.uri(), cache.clone())
            .process_token_exchange("code", Some("abc:xyz"))
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::InvalidState(_)));
        assert!(cache.ops().is_empty());
    }

    #[tokio::test]
    async fn provider_failure_writes_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(TOKEN_PATH))
            .respond_with(ResponseTemplate::new(400).set_body_string("BAD_AUTH_CODE"))
            .mount(&server)
            .await;

        let cache = Arc::new(RecordingCache::default());
        let err = manager(&server.uri(), cache.clone())
            .process_token_exchange("code", Some("7:abc"))
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::TokenExchangeError(_)));
        assert!(cache.ops().is_empty());
    }

    #[tokio::test]
    async fn cache_write_failure_is_not_fatal() {
        let server = MockServer::start().await;
        mount_token_response(&server, "authorization_code", "AT1", "RT1").await;

        let cache = Arc::new(RecordingCache::failing_writes());
        manager(&server.uri(), cache.clone())
            .process_token_exchange("code", Some("7:abc"))
            .await
            .unwrap();

        assert_eq!(cache.ops().len(), 2);
        assert_eq!(cache.value("oauth:access_token:7"), None);
    }

    #[tokio::test]
    async fn refresh_invalidates_then_persists() {
        let server = MockServer::start().await;
        mount_token_response(&server, "refresh_token", "AT2", "RT2").await;

        let cache = Arc::new(RecordingCache::default());
        cache.seed("oauth:refresh_token:7", "RT1");

        let pair = manager(&server.uri(), cache.clone())
            .refresh_token_sync("RT1", 7)
            .await
            .unwrap();

        assert_eq!(pair.access_token, "AT2");
        let ops = cache.ops();
        assert_eq!(ops[0], CacheOp::Delete("oauth:refresh_token:7".into()));
        assert_eq!(
            ops[2],
            CacheOp::Set(
                "oauth:refresh_token:7".into(),
                "RT2".into(),
                REFRESH_TOKEN_TTL
            )
        );
        assert_eq!(cache.value("oauth:refresh_token:7").as_deref(), Some("RT2"));
    }

    #[tokio::test]
    async fn failed_refresh_still_drops_refresh_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(TOKEN_PATH))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid_grant"))
            .mount(&server)
            .await;

        let cache = Arc::new(RecordingCache::default());
        cache.seed("oauth:refresh_token:7", "RT1");

        let err = manager(&server.uri(), cache.clone())
            .refresh_token_sync("RT1", 7)
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::TokenRefreshError(_)));
        assert_eq!(
            cache.ops(),
            vec![CacheOp::Delete("oauth:refresh_token:7".into())]
        );
        assert_eq!(cache.value("oauth:refresh_token:7"), None);
    }

    #[tokio::test]
    async fn cached_access_token_is_returned_without_provider_call() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let cache = Arc::new(RecordingCache::default());
        cache.seed("oauth:access_token:7", "cached");

        let token = manager(&server.uri(), cache.clone())
            .get_access_token_by_user_id(7)
            .await
            .unwrap();

        assert_eq!(token.as_deref(), Some("cached"));
        assert_eq!(cache.ops(), vec![CacheOp::Get("oauth:access_token:7".into())]);
    }

    #[tokio::test]
    async fn missing_access_token_refreshes_once() {
        let server = MockServer::start().await;
        mount_token_response(&server, "refresh_token", "AT2", "RT2").await;

        let cache = Arc::new(RecordingCache::default());
        cache.seed("oauth:refresh_token:7", "RT1");

        let token = manager(&server.uri(), cache.clone())
            .get_access_token_by_user_id(7)
            .await
            .unwrap();

        assert_eq!(token.as_deref(), Some("AT2"));
        assert_eq!(cache.value("oauth:access_token:7").as_deref(), Some("AT2"));
        assert_eq!(cache.value("oauth:refresh_token:7").as_deref(), Some("RT2"));
    }

    #[tokio::test]
    async fn empty_cache_yields_none_without_provider_call() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let cache = Arc::new(RecordingCache::default());
        let manager = manager(&server.uri(), cache.clone());

        assert_eq!(manager.get_access_token_by_user_id(7).await.unwrap(), None);
        assert!(matches!(
            manager.require_access_token(7).await.unwrap_err(),
            AppError::MissingAccessToken(7)
        ));
    }
}
