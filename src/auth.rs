//! # Authentication Service
//!
//! Local HMAC-signed JWT authentication: registration, login, token refresh
//! and profile management. Tokens are HS256 with issuer `nexus-protocol`;
//! passwords are bcrypt-hashed. User records live behind the in-memory
//! store; the external identity provider named in the deployment docs is a
//! drop-in replacement at this seam.

use std::collections::HashMap;

use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::AuthConfig;
use crate::error::ServiceError;
use crate::types::User;

const TOKEN_TYPE_ACCESS: &str = "access";
const TOKEN_TYPE_REFRESH: &str = "refresh";

/// JWT claims carried by every token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub iss: String,
    pub exp: i64,
    pub iat: i64,
    pub jti: String,
    pub typ: String,
    pub user_id: String,
    pub email: String,
    pub roles: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
}

/// Authenticated identity attached to request extensions
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: String,
    pub email: String,
    pub roles: Vec<String>,
    pub tenant_id: Option<String>,
}

impl AuthContext {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub tenant_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expires_in: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateProfileRequest {
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

struct StoredUser {
    user: User,
    password_hash: String,
}

pub struct AuthService {
    config: AuthConfig,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    users: RwLock<HashMap<String, StoredUser>>,
    users_by_email: RwLock<HashMap<String, String>>,
}

impl AuthService {
    pub fn new(config: AuthConfig) -> Self {
        let encoding_key = EncodingKey::from_secret(config.jwt_secret.as_bytes());
        let decoding_key = DecodingKey::from_secret(config.jwt_secret.as_bytes());
        Self {
            config,
            encoding_key,
            decoding_key,
            users: RwLock::new(HashMap::new()),
            users_by_email: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a new user; duplicate email is a conflict
    pub async fn register(&self, req: RegisterRequest) -> Result<User, ServiceError> {
        if req.email.is_empty() || !req.email.contains('@') {
            return Err(ServiceError::validation_field("email", "a valid email is required"));
        }
        if req.password.len() < 8 {
            return Err(ServiceError::validation_field(
                "password",
                "password must be at least 8 characters",
            ));
        }

        {
            let by_email = self.users_by_email.read().await;
            if by_email.contains_key(&req.email) {
                return Err(ServiceError::conflict("a user with this email already exists"));
            }
        }

        let password_hash = bcrypt::hash(&req.password, bcrypt::DEFAULT_COST)
            .map_err(|e| ServiceError::internal(format!("password hashing failed: {}", e)))?;

        let user = User {
            id: Uuid::new_v4().to_string(),
            email: req.email.clone(),
            username: None,
            first_name: req.first_name,
            last_name: req.last_name,
            status: "active".to_string(),
            roles: vec!["user".to_string()],
            tenant_id: req.tenant_id,
            created_at: Utc::now().timestamp(),
            last_login: None,
        };

        info!(user_id = %user.id, email = %user.email, "User registered");

        self.users_by_email
            .write()
            .await
            .insert(req.email, user.id.clone());
        self.users
            .write()
            .await
            .insert(user.id.clone(), StoredUser { user: user.clone(), password_hash });

        Ok(user)
    }

    /// Verifies credentials and mints an access/refresh token pair
    pub async fn login(&self, req: LoginRequest) -> Result<(User, TokenPair), ServiceError> {
        let user_id = {
            let by_email = self.users_by_email.read().await;
            by_email
                .get(&req.email)
                .cloned()
                .ok_or_else(|| ServiceError::authentication("invalid credentials"))?
        };

        let user = {
            let users = self.users.read().await;
            let stored = users
                .get(&user_id)
                .ok_or_else(|| ServiceError::authentication("invalid credentials"))?;

            let valid = bcrypt::verify(&req.password, &stored.password_hash)
                .map_err(|e| ServiceError::internal(format!("password verification failed: {}", e)))?;
            if !valid {
                warn!(email = %req.email, "Login failed: bad password");
                return Err(ServiceError::authentication("invalid credentials"));
            }
            stored.user.clone()
        };

        {
            let mut users = self.users.write().await;
            if let Some(stored) = users.get_mut(&user_id) {
                stored.user.last_login = Some(Utc::now().timestamp());
            }
        }

        let tokens = self.generate_tokens(&user)?;
        info!(user_id = %user.id, "User logged in");
        Ok((user, tokens))
    }

    /// Mints a fresh token pair from a valid refresh token
    pub async fn refresh(&self, req: RefreshRequest) -> Result<TokenPair, ServiceError> {
        let claims = self.validate_token(&req.refresh_token)?;
        if claims.typ != TOKEN_TYPE_REFRESH {
            return Err(ServiceError::authentication("not a refresh token"));
        }

        let users = self.users.read().await;
        let stored = users
            .get(&claims.user_id)
            .ok_or_else(|| ServiceError::authentication("unknown user"))?;

        self.generate_tokens(&stored.user)
    }

    /// Decodes and validates a token, checking signature, expiry and issuer
    pub fn validate_token(&self, token: &str) -> Result<Claims, ServiceError> {
        let mut validation = Validation::default();
        validation.set_issuer(&[&self.config.issuer]);

        let data = decode::<Claims>(token, &self.decoding_key, &validation)
            .map_err(|e| ServiceError::authentication(format!("invalid token: {}", e)))?;
        Ok(data.claims)
    }

    /// Context for a validated access token
    pub fn auth_context(&self, token: &str) -> Result<AuthContext, ServiceError> {
        let claims = self.validate_token(token)?;
        if claims.typ != TOKEN_TYPE_ACCESS {
            return Err(ServiceError::authentication("not an access token"));
        }
        Ok(AuthContext {
            user_id: claims.user_id,
            email: claims.email,
            roles: claims.roles,
            tenant_id: claims.tenant_id,
        })
    }

    pub async fn get_profile(&self, user_id: &str) -> Result<User, ServiceError> {
        let users = self.users.read().await;
        users
            .get(user_id)
            .map(|stored| stored.user.clone())
            .ok_or_else(|| ServiceError::not_found("user not found"))
    }

    pub async fn update_profile(
        &self,
        user_id: &str,
        req: UpdateProfileRequest,
    ) -> Result<User, ServiceError> {
        let mut users = self.users.write().await;
        let stored = users
            .get_mut(user_id)
            .ok_or_else(|| ServiceError::not_found("user not found"))?;

        if let Some(first_name) = req.first_name {
            stored.user.first_name = first_name;
        }
        if let Some(last_name) = req.last_name {
            stored.user.last_name = last_name;
        }
        if let Some(username) = req.username {
            stored.user.username = Some(username);
        }

        info!(user_id = %user_id, "User profile updated");
        Ok(stored.user.clone())
    }

    fn generate_tokens(&self, user: &User) -> Result<TokenPair, ServiceError> {
        let now = Utc::now().timestamp();

        let access_claims = Claims {
            sub: user.id.clone(),
            iss: self.config.issuer.clone(),
            exp: now + self.config.jwt_expiry_secs,
            iat: now,
            jti: Uuid::new_v4().to_string(),
            typ: TOKEN_TYPE_ACCESS.to_string(),
            user_id: user.id.clone(),
            email: user.email.clone(),
            roles: user.roles.clone(),
            tenant_id: user.tenant_id.clone(),
        };

        let refresh_claims = Claims {
            exp: now + self.config.refresh_expiry_secs,
            jti: Uuid::new_v4().to_string(),
            typ: TOKEN_TYPE_REFRESH.to_string(),
            ..access_claims.clone()
        };

        let access_token = encode(&Header::default(), &access_claims, &self.encoding_key)
            .map_err(|e| ServiceError::internal(format!("failed to sign access token: {}", e)))?;
        let refresh_token = encode(&Header::default(), &refresh_claims, &self.encoding_key)
            .map_err(|e| ServiceError::internal(format!("failed to sign refresh token: {}", e)))?;

        Ok(TokenPair {
            access_token,
            refresh_token,
            token_type: "Bearer".to_string(),
            expires_in: self.config.jwt_expiry_secs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn service() -> AuthService {
        AuthService::new(Config::default().auth)
    }

    fn register_request(email: &str) -> RegisterRequest {
        RegisterRequest {
            email: email.to_string(),
            password: "password123".to_string(),
            first_name: "Test".to_string(),
            last_name: "User".to_string(),
            tenant_id: None,
        }
    }

    #[tokio::test]
    async fn test_register_and_login() {
        let service = service();
        let user = service.register(register_request("test@example.com")).await.unwrap();
        assert_eq!(user.roles, vec!["user"]);
        assert_eq!(user.status, "active");

        let (logged_in, tokens) = service
            .login(LoginRequest {
                email: "test@example.com".to_string(),
                password: "password123".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(logged_in.id, user.id);
        assert_eq!(tokens.token_type, "Bearer");
        assert!(!tokens.access_token.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_email_conflicts() {
        let service = service();
        service.register(register_request("dup@example.com")).await.unwrap();
        let err = service.register(register_request("dup@example.com")).await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn test_bad_password_rejected() {
        let service = service();
        service.register(register_request("login@example.com")).await.unwrap();

        let err = service
            .login(LoginRequest {
                email: "login@example.com".to_string(),
                password: "wrong-password".to_string(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Authentication);
    }

    #[tokio::test]
    async fn test_access_token_round_trip() {
        let service = service();
        service.register(register_request("claims@example.com")).await.unwrap();
        let (user, tokens) = service
            .login(LoginRequest {
                email: "claims@example.com".to_string(),
                password: "password123".to_string(),
            })
            .await
            .unwrap();

        let context = service.auth_context(&tokens.access_token).unwrap();
        assert_eq!(context.user_id, user.id);
        assert_eq!(context.email, "claims@example.com");
        assert!(context.has_role("user"));
        assert!(!context.has_role("admin"));
    }

    #[tokio::test]
    async fn test_refresh_token_not_usable_as_access() {
        let service = service();
        service.register(register_request("refresh@example.com")).await.unwrap();
        let (_, tokens) = service
            .login(LoginRequest {
                email: "refresh@example.com".to_string(),
                password: "password123".to_string(),
            })
            .await
            .unwrap();

        let err = service.auth_context(&tokens.refresh_token).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Authentication);

        let refreshed = service
            .refresh(RefreshRequest { refresh_token: tokens.refresh_token })
            .await
            .unwrap();
        assert!(service.auth_context(&refreshed.access_token).is_ok());
    }

    #[tokio::test]
    async fn test_garbage_token_rejected() {
        let service = service();
        assert!(service.auth_context("garbage.token.here").is_err());
    }

    #[tokio::test]
    async fn test_profile_update() {
        let service = service();
        let user = service.register(register_request("profile@example.com")).await.unwrap();

        let updated = service
            .update_profile(
                &user.id,
                UpdateProfileRequest {
                    first_name: Some("Updated".to_string()),
                    last_name: None,
                    username: Some("updated_user".to_string()),
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.first_name, "Updated");
        assert_eq!(updated.last_name, "User");
        assert_eq!(updated.username.as_deref(), Some("updated_user"));
    }
}
