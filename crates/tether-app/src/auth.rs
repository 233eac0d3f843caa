//! Authentication collaborator.
//!
//! The gateway validates a token once per connection and carries the
//! resulting identity for the rest of it.

use async_trait::async_trait;
use std::collections::HashMap;

use tether_types::AuthenticatedUser;

use crate::config::UserConfig;

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn validate_token(&self, token: &str) -> Option<AuthenticatedUser>;
}

/// Static token table built from configuration
#[derive(Debug, Default, Clone)]
pub struct TokenAuthenticator {
    tokens: HashMap<String, AuthenticatedUser>,
}

impl TokenAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_users(users: &[UserConfig]) -> Self {
        let mut auth = Self::new();
        for user in users {
            let username = user.username.clone().unwrap_or_else(|| user.user_id.clone());
            auth.insert(&user.token, &user.user_id, &username);
        }
        auth
    }

    pub fn insert(&mut self, token: &str, user_id: &str, username: &str) {
        self.tokens.insert(
            token.to_string(),
            AuthenticatedUser {
                user_id: user_id.to_string(),
                username: username.to_string(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl Authenticator for TokenAuthenticator {
    async fn validate_token(&self, token: &str) -> Option<AuthenticatedUser> {
        let token = token.trim();
        if token.is_empty() {
            return None;
        }
        self.tokens.get(token).cloned()
    }
}

/// Extract the token from an `Authorization: Bearer <token>` header value.
pub fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    scheme.eq_ignore_ascii_case("bearer").then_some(token.trim())
}
