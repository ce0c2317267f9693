use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::{
    auth::CurrentUser,
    error::{AppError, Result},
    hubspot::{HubspotClient, CONTACTS_PATH},
    oauth::TokenManager,
    resilience::{CircuitState, Resilience},
    types::{ContactRequest, UserId},
    AppState,
};

/// Creates and lists CRM contacts on behalf of a local user.
#[derive(Clone)]
pub struct ContactService {
    client: HubspotClient,
    tokens: Arc<TokenManager>,
    resilience: Resilience,
}

impl ContactService {
    pub fn new(client: HubspotClient, tokens: Arc<TokenManager>, resilience: Resilience) -> Self {
        Self {
            client,
            tokens,
            resilience,
        }
    }

    pub async fn circuit_state(&self) -> CircuitState {
        self.resilience.circuit_state().await
    }

    pub fn build_request_body(request: &ContactRequest) -> Value {
        json!({
            "properties": {
                "email": request.email,
                "firstname": request.first_name,
                "lastname": request.last_name,
            }
        })
    }

    pub async fn create(&self, user_id: UserId, request: &ContactRequest) -> Result<Value> {
        if !request.email.contains('@') {
            return Err(AppError::Validation("a valid email is required".into()));
        }

        let access_token = self.tokens.require_access_token(user_id).await?;
        let body = Self::build_request_body(request);

        let created: Value = self
            .resilience
            .call(
                || self.client.post_json(CONTACTS_PATH, &body, &access_token),
                provider_fallback,
            )
            .await?;

        info!("Contact created successfully for user {}", user_id);
        Ok(created)
    }

    pub async fn list(&self, user_id: UserId) -> Result<Value> {
        let access_token = self.tokens.require_access_token(user_id).await?;

        let result = self
            .resilience
            .call(
                || self.client.get_json::<Value>(CONTACTS_PATH, &access_token),
                provider_fallback,
            )
            .await;

        match &result {
            Ok(_) => info!("Contacts listed successfully for user {}", user_id),
            Err(e) => error!("Error listing contacts for user {}: {}", user_id, e),
        }
        result
    }
}

fn provider_fallback<T>(err: AppError) -> Result<T> {
    warn!("Provider call unavailable, try again later: {}", err);
    Err(err)
}

pub async fn create_contact(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(request): Json<ContactRequest>,
) -> Result<(StatusCode, Json<Value>)> {
    let created = state.contact_service.create(user.user_id, &request).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn list_contacts(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> Result<Json<Value>> {
    Ok(Json(state.contact_service.list(user.user_id).await?))
}
