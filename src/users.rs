use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::{
    error::{AppError, Result},
    types::{RegisterRequest, UserId, UserView},
};

const MIN_PASSWORD_LEN: usize = 8;

#[derive(Debug, Clone)]
struct UserRecord {
    id: UserId,
    name: String,
    email: String,
    password_hash: String,
}

impl UserRecord {
    fn view(&self) -> UserView {
        UserView {
            id: self.id,
            name: self.name.clone(),
            email: self.email.clone(),
        }
    }
}

#[derive(Debug, Default)]
pub struct UserStore {
    users: RwLock<Vec<UserRecord>>,
}

impl UserStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, request: RegisterRequest) -> Result<UserView> {
        let email = request.email.trim().to_lowercase();
        let name = request.name.trim().to_string();

        if name.is_empty() {
            return Err(AppError::Validation("name is required".into()));
        }
        if !email.contains('@') {
            return Err(AppError::Validation("a valid email is required".into()));
        }
        if request.password.len() < MIN_PASSWORD_LEN {
            return Err(AppError::Validation(format!(
                "password must be at least {} characters",
                MIN_PASSWORD_LEN
            )));
        }

        let password_hash = hash_password(&request.password)?;

        let mut users = self.users.write().await;
        if users.iter().any(|u| u.email == email) {
            return Err(AppError::Conflict("email already registered".into()));
        }

        let record = UserRecord {
            id: users.len() as UserId + 1,
            name,
            email,
            password_hash,
        };
        info!("Registered user {}", record.id);
        let view = record.view();
        users.push(record);
        Ok(view)
    }

    pub async fn authenticate(&self, email: &str, password: &str) -> Result<UserView> {
        let email = email.trim().to_lowercase();
        let users = self.users.read().await;
        let user = users
            .iter()
            .find(|u| u.email == email)
            .ok_or(AppError::InvalidCredentials)?;

        let parsed = PasswordHash::new(&user.password_hash)
            .map_err(|e| AppError::InternalError(anyhow::anyhow!("Stored hash unreadable: {e}")))?;

        Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .map_err(|_| {
                debug!("Password mismatch for user {}", user.id);
                AppError::InvalidCredentials
            })?;

        Ok(user.view())
    }

    pub async fn find(&self, user_id: UserId) -> Option<UserView> {
        self.users
            .read()
            .await
            .iter()
            .find(|u| u.id == user_id)
            .map(UserRecord::view)
    }
}

fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| AppError::InternalError(anyhow::anyhow!("Failed to hash password: {e}")))
}
