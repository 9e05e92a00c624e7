use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};

use parley_types::api::Claims;
use parley_types::models::{Identity, Role, UserId};

use crate::error::GatewayError;

/// Resolves bearer credentials to an identity. Tokens are minted by the
/// identity provider; this side only checks them.
#[derive(Clone)]
pub struct TokenVerifier {
    decoding: DecodingKey,
    encoding: EncodingKey,
}

impl TokenVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            encoding: EncodingKey::from_secret(secret.as_bytes()),
        }
    }

    pub fn current_identity(&self, token: &str) -> Result<Identity, GatewayError> {
        let data = decode::<Claims>(token, &self.decoding, &Validation::default())
            .map_err(|e| GatewayError::Unauthenticated(e.to_string()))?;
        Ok(Identity::new(data.claims.sub, data.claims.role))
    }

    /// Mint a token with the same secret. Used by local tooling and tests.
    pub fn issue(
        &self,
        user_id: &UserId,
        role: Role,
        ttl: chrono::Duration,
    ) -> Result<String, jsonwebtoken::errors::Error> {
        let claims = Claims {
            sub: user_id.clone(),
            role,
            exp: (chrono::Utc::now() + ttl).timestamp() as usize,
        };
        encode(&Header::default(), &claims, &self.encoding)
    }
}
