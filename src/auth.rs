use crate::{
    error::{AppError, Result},
    types::{LoginRequest, OAuthCallback, RegisterRequest, SessionData, UserView},
    AppState,
};
use axum::{
    async_trait,
    extract::{FromRequestParts, Query, State},
    http::{request::Parts, StatusCode},
    response::{Html, IntoResponse},
    Json,
};
use axum_extra::extract::{
    cookie::{Cookie, SameSite},
    CookieJar,
};
use serde_json::json;
use tracing::{debug, error, info};

pub const SESSION_COOKIE_NAME: &str = "hubspot_bridge_session";

const CALLBACK_SUCCESS_MESSAGE: &str = "Authentication successful. You can close this window.";
const CALLBACK_ERROR_MESSAGE: &str = "Authentication error. Please try again.";

/// The logged-in local user, resolved from the session cookie.
#[derive(Debug, Clone)]
pub struct CurrentUser(pub SessionData);

#[async_trait]
impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self> {
        let jar = CookieJar::from_headers(&parts.headers);
        let session_id = jar
            .get(SESSION_COOKIE_NAME)
            .map(|cookie| cookie.value().to_string())
            .ok_or(AppError::Unauthorized)?;

        state
            .session_store
            .get_session(&session_id)
            .await
            .map(CurrentUser)
            .ok_or(AppError::Unauthorized)
    }
}

pub async fn register(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<UserView>)> {
    let user = state.user_store.register(request).await?;
    Ok((StatusCode::CREATED, Json(user)))
}

pub async fn login(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(request): Json<LoginRequest>,
) -> Result<impl IntoResponse> {
    let user = state
        .user_store
        .authenticate(&request.email, &request.password)
        .await?;

    let session_id = state.session_store.create_session(user.id).await;
    info!("User {} logged in", user.id);

    let cookie = Cookie::build((SESSION_COOKIE_NAME, session_id))
        .http_only(true)
        .secure(false) // Set to true in production with HTTPS
        .same_site(SameSite::Lax)
        .path("/")
        .build();

    Ok((jar.add(cookie), Json(json!({ "user": user }))))
}

pub async fn logout(State(state): State<AppState>, jar: CookieJar) -> Result<impl IntoResponse> {
    if let Some(cookie) = jar.get(SESSION_COOKIE_NAME) {
        state.session_store.delete_session(cookie.value()).await;
    }

    let jar = jar.remove(Cookie::from(SESSION_COOKIE_NAME));
    Ok((jar, Json(json!({ "message": "Successfully logged out" }))))
}

// Reports the local session and whether HubSpot tokens are cached for it
pub async fn status(State(state): State<AppState>, jar: CookieJar) -> Result<impl IntoResponse> {
    let session = match jar.get(SESSION_COOKIE_NAME) {
        Some(cookie) => state.session_store.get_session(cookie.value()).await,
        None => None,
    };

    let Some(session) = session else {
        return Ok(Json(json!({ "authenticated": false })));
    };

    let user = state.user_store.find(session.user_id).await;
    let hubspot_connected = state
        .token_manager
        .get_access_token_by_user_id(session.user_id)
        .await
        .map(|token| token.is_some())
        .unwrap_or(false);

    Ok(Json(json!({
        "authenticated": true,
        "user": user,
        "hubspotConnected": hubspot_connected
    })))
}

// GET /auth/url: plain-text authorization URL for the current user
pub async fn authorization_url(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> Result<String> {
    state.token_manager.generate_authorization_url(user.user_id)
}

// GET /auth/callback: provider redirect target
pub async fn callback(
    State(state): State<AppState>,
    Query(params): Query<OAuthCallback>,
) -> Html<String> {
    debug!(
        "OAuth callback received (code present: {}, state present: {})",
        params.code.is_some(),
        params.state.is_some()
    );

    if let Some(error) = params.error {
        error!("OAuth error: {} - {:?}", error, params.error_description);
        return callback_page(false);
    }

    let code = params.code.unwrap_or_default();
    match state
        .token_manager
        .process_token_exchange(&code, params.state.as_deref())
        .await
    {
        Ok(()) => callback_page(true),
        Err(e) => {
            error!("OAuth callback failed: {}", e);
            callback_page(false)
        }
    }
}

fn callback_page(success: bool) -> Html<String> {
    let (title, message, class) = if success {
        ("Authentication Successful", CALLBACK_SUCCESS_MESSAGE, "success")
    } else {
        ("Authentication Failed", CALLBACK_ERROR_MESSAGE, "failure")
    };

    Html(format!(
        r#"
<!DOCTYPE html>
<html>
<head>
    <title>{title}</title>
    <style>
        body {{
            font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif;
            display: flex;
            justify-content: center;
            align-items: center;
            height: 100vh;
            margin: 0;
            background-color: #f5f5f5;
        }}
        .container {{
            text-align: center;
            background: white;
            padding: 2rem;
            border-radius: 8px;
            box-shadow: 0 2px 4px rgba(0,0,0,0.1);
            max-width: 400px;
        }}
        h1 {{
            color: #2d3748;
            margin-bottom: 1rem;
        }}
        .success {{
            color: #48bb78;
            font-weight: bold;
        }}
        .failure {{
            color: #e53e3e;
            font-weight: bold;
        }}
    </style>
</head>
<body>
    <div class="container">
        <h1>{title}</h1>
        <p class="{class}">{message}</p>
    </div>
</body>
</html>
    "#
    ))
}
