use reqwest::header;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::{
    config::Config,
    error::{AppError, Result},
    types::TokenPair,
};

pub const TOKEN_PATH: &str = "/oauth/v1/token";
pub const CONTACTS_PATH: &str = "/crm/v3/objects/contacts";

/// Thin wrapper over the provider's OAuth and CRM object endpoints.
#[derive(Clone)]
pub struct HubspotClient {
    http: reqwest::Client,
    config: Arc<Config>,
}

impl HubspotClient {
    pub fn new(http: reqwest::Client, config: Arc<Config>) -> Self {
        Self { http, config }
    }

    pub fn build_call_parameters(&self, grant_type: &str) -> Vec<(&'static str, String)> {
        vec![
            ("grant_type", grant_type.to_string()),
            ("client_id", self.config.client_id.clone()),
            ("client_secret", self.config.client_secret.clone()),
            ("redirect_uri", self.config.redirect_uri.clone()),
        ]
    }

    pub fn authorization_url(&self, scopes: &str, state: &str) -> Result<String> {
        let params = vec![
            ("client_id", self.config.client_id.as_str()),
            ("scope", scopes),
            ("redirect_uri", self.config.redirect_uri.as_str()),
            ("state", state),
        ];
        let query = serde_urlencoded::to_string(params)
            .map_err(|e| AppError::InternalError(e.into()))?;

        Ok(format!("{}?{}", self.config.authorization_url, query))
    }

    pub async fn execute_token_call(&self, params: &[(&'static str, String)]) -> Result<TokenPair> {
        let token_url = format!("{}{}", self.config.api_base_url, TOKEN_PATH);
        debug!("Calling token endpoint: {}", token_url);

        let response = self
            .http
            .post(&token_url)
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .form(params)
            .send()
            .await
            .map_err(|e| AppError::TokenExchangeError(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            error!("Token endpoint returned {}: {}", status, error_text);
            return Err(AppError::TokenExchangeError(format!(
                "{}: {}",
                status, error_text
            )));
        }

        let response_text = response
            .text()
            .await
            .map_err(|e| AppError::TokenExchangeError(e.to_string()))?;

        serde_json::from_str(&response_text).map_err(|e| {
            AppError::TokenExchangeError(format!("Failed to parse token response: {}", e))
        })
    }

    pub async fn post_json<B, R>(&self, path: &str, body: &B, access_token: &str) -> Result<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let url = format!("{}{}", self.config.api_base_url, path);
        info!("Executing JSON call to endpoint: {}", path);

        let response = self
            .http
            .post(&url)
            .bearer_auth(access_token)
            .json(body)
            .send()
            .await?;

        Self::read_json(response, path).await
    }

    pub async fn get_json<R>(&self, path: &str, access_token: &str) -> Result<R>
    where
        R: DeserializeOwned,
    {
        let url = format!("{}{}", self.config.api_base_url, path);
        info!("Executing GET JSON call to endpoint: {}", path);

        let response = self
            .http
            .get(&url)
            .header(header::ACCEPT, "application/json")
            .bearer_auth(access_token)
            .send()
            .await?;

        Self::read_json(response, path).await
    }

    async fn read_json<R: DeserializeOwned>(response: reqwest::Response, path: &str) -> Result<R> {
        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            error!("Call to {} failed with {}: {}", path, status, error_text);
            return Err(AppError::ProviderError(format!("{} returned {}", path, status)));
        }

        let value = response.json::<R>().await?;
        debug!("Call to {} executed successfully", path);
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, header as header_matcher, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(base: &str) -> HubspotClient {
        HubspotClient::new(reqwest::Client::new(), Arc::new(Config::for_tests(base)))
    }

    #[test]
    fn call_parameters_carry_client_credentials() {
        let params = client("http://localhost").build_call_parameters("refresh_token");
        let keys: Vec<_> = params.iter().map(|(k, _)| *k).collect();
        assert_eq!(
            keys,
            vec!["grant_type", "client_id", "client_secret", "redirect_uri"]
        );
        assert_eq!(params[0].1, "refresh_token");
        assert_eq!(params[2].1, "test-secret");
    }

    #[test]
    fn authorization_url_encodes_scope_and_state() {
        let url = client("http://localhost")
            .authorization_url("crm.objects.contacts.read crm.objects.contacts.write", "7:abc")
            .unwrap();

        assert!(url.starts_with("http://localhost/oauth/authorize?client_id=test-client"));
        assert!(url.contains("scope=crm.objects.contacts.read+crm.objects.contacts.write"));
        assert!(url.contains("state=7%3Aabc"));
    }

    #[tokio::test]
    async fn token_call_posts_form_and_parses_pair() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(TOKEN_PATH))
            .and(header_matcher(
                "content-type",
                "application/x-www-form-urlencoded",
            ))
            .and(body_string_contains("grant_type=authorization_code"))
            .and(body_string_contains("code=the-code"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "AT1",
                "refresh_token": "RT1",
                "token_type": "bearer",
                "expires_in": 1800
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = client(&server.uri());
        let mut params = client.build_call_parameters("authorization_code");
        params.push(("code", "the-code".to_string()));

        let pair = client.execute_token_call(&params).await.unwrap();
        assert_eq!(pair.access_token, "AT1");
        assert_eq!(pair.refresh_token, "RT1");
        assert_eq!(pair.expires_in, 1800);
        assert_eq!(pair.scope, "");
    }

    #[tokio::test]
    async fn token_call_surfaces_provider_rejection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(TOKEN_PATH))
            .respond_with(ResponseTemplate::new(400).set_body_string("BAD_AUTH_CODE"))
            .mount(&server)
            .await;

        let client = client(&server.uri());
        let err = client
            .execute_token_call(&client.build_call_parameters("authorization_code"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::TokenExchangeError(msg) if msg.contains("BAD_AUTH_CODE")));
    }

    #[tokio::test]
    async fn post_json_sends_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(CONTACTS_PATH))
            .and(header_matcher("authorization", "Bearer AT1"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({"id": "1"})))
            .expect(1)
            .mount(&server)
            .await;

        let value: serde_json::Value = client(&server.uri())
            .post_json(CONTACTS_PATH, &serde_json::json!({"properties": {}}), "AT1")
            .await
            .unwrap();
        assert_eq!(value["id"], "1");
    }
}
