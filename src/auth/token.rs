//! Caller token service: issue and verify HS256 tokens, authorize routes.
//!
//! Verification is cache-first by raw token string. A cached token only saves
//! the signature and expiry work: the customer's `active` status is read from
//! the directory on every verification, so deactivating a customer takes
//! effect immediately even for tokens that are still cached.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{routes, AuthError};
use crate::config::JwtConfig;
use crate::metrics::MetricsRecorder;
use crate::models::Customer;
use crate::store::{Directory, TypedCache};

const CUSTOMER_CACHE_TTL: Duration = Duration::from_secs(5 * 60);
const ROUTE_PERMISSION_TTL: Duration = Duration::from_secs(60 * 60);
const ACCESS_TOKEN: &str = "access";

/// Claims carried by a caller token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    pub customer_id: String,
    pub allowed_routes: Vec<String>,
    pub token_type: String,
    pub iss: String,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
}

/// Result of a successful [`TokenService::issue_token`].
#[derive(Debug, Clone, Serialize)]
pub struct IssuedToken {
    pub token: String,
    /// Lifetime in seconds.
    pub expires_in: u64,
}

pub struct TokenService {
    directory: Arc<dyn Directory>,
    cache: TypedCache,
    metrics: Arc<MetricsRecorder>,
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    issuer: String,
    lifetime: Duration,
}

impl TokenService {
    pub fn new(
        config: &JwtConfig,
        directory: Arc<dyn Directory>,
        cache: TypedCache,
        metrics: Arc<MetricsRecorder>,
    ) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[config.issuer.as_str()]);
        validation.validate_nbf = true;
        validation.leeway = 0;

        Self {
            directory,
            cache,
            metrics,
            encoding: EncodingKey::from_secret(config.secret.as_bytes()),
            decoding: DecodingKey::from_secret(config.secret.as_bytes()),
            validation,
            issuer: config.issuer.clone(),
            lifetime: Duration::from_secs(config.expiration_hours * 3600),
        }
    }

    /// Exchange an API key for a signed token.
    pub async fn issue_token(&self, api_key: &str) -> Result<IssuedToken, AuthError> {
        let started = Instant::now();
        let result = self.issue_inner(api_key).await;
        self.account(&result.as_ref().map(|(id, _)| id.as_str()), started);
        result.map(|(_, token)| token)
    }

    async fn issue_inner(&self, api_key: &str) -> Result<(String, IssuedToken), AuthError> {
        let customer = self
            .customer_by_api_key(api_key)
            .await?
            .ok_or(AuthError::InvalidApiKey)?;
        if !customer.is_active() {
            return Err(AuthError::CustomerInactive);
        }

        let now = Utc::now().timestamp();
        #[allow(clippy::cast_possible_wrap)]
        let exp = now + self.lifetime.as_secs() as i64;
        let claims = Claims {
            customer_id: customer.id.clone(),
            allowed_routes: customer.allowed_routes.clone(),
            token_type: ACCESS_TOKEN.to_string(),
            iss: self.issuer.clone(),
            iat: now,
            nbf: now,
            exp,
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(AuthError::Signing)?;

        info!(customer_id = %customer.id, "Issued caller token");
        Ok((
            customer.id,
            IssuedToken {
                token,
                expires_in: self.lifetime.as_secs(),
            },
        ))
    }

    /// Validate a token and re-check that its customer is still active.
    pub async fn verify_token(&self, token: &str) -> Result<Claims, AuthError> {
        let started = Instant::now();
        let result = self.verify_inner(token).await;
        self.account(&result.as_ref().map(|c| c.customer_id.as_str()), started);
        result
    }

    async fn verify_inner(&self, token: &str) -> Result<Claims, AuthError> {
        let (claims, cached) = match self.cache.token_claims(token).await {
            Some(claims) if claims.exp > Utc::now().timestamp() => (claims, true),
            _ => (self.decode(token)?, false),
        };

        let customer = self
            .directory
            .customer(&claims.customer_id)
            .await?
            .ok_or(AuthError::CustomerNotFound)?;
        if !customer.is_active() {
            if cached {
                self.cache.invalidate(&crate::store::cache::keys::token(token)).await;
            }
            return Err(AuthError::CustomerInactive);
        }

        if !cached {
            let remaining = claims.exp - Utc::now().timestamp();
            if let Ok(secs) = u64::try_from(remaining) {
                if secs > 0 {
                    self.cache
                        .set_token_claims(token, &claims, Duration::from_secs(secs))
                        .await;
                }
            }
        }
        Ok(claims)
    }

    fn decode(&self, token: &str) -> Result<Claims, AuthError> {
        let data = decode::<Claims>(token, &self.decoding, &self.validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                _ => AuthError::InvalidToken(e.to_string()),
            }
        })?;
        if data.claims.token_type != ACCESS_TOKEN {
            return Err(AuthError::InvalidToken(format!(
                "unexpected token type {:?}",
                data.claims.token_type
            )));
        }
        Ok(data.claims)
    }

    /// Whether `customer_id` may access `path`. Decisions are cached for an
    /// hour; an unknown customer or store error denies without caching.
    pub async fn is_route_allowed(&self, customer_id: &str, path: &str) -> bool {
        let route = routes::clean_path(path);
        if let Some(allowed) = self.cache.route_permission(customer_id, &route).await {
            return allowed;
        }

        let customer = match self.customer(customer_id).await {
            Ok(Some(c)) => c,
            Ok(None) => return false,
            Err(e) => {
                warn!(customer_id, error = %e, "Route check could not load customer");
                return false;
            }
        };

        let allowed = routes::any_matches(&customer.allowed_routes, &route);
        debug!(customer_id, route = %route, allowed, "Route permission evaluated");
        self.cache
            .set_route_permission(customer_id, &route, allowed, ROUTE_PERMISSION_TTL)
            .await;
        allowed
    }

    /// Authorize `path` for the holder of `claims`.
    pub async fn authorize(&self, claims: &Claims, path: &str) -> Result<(), AuthError> {
        if self.is_route_allowed(&claims.customer_id, path).await {
            Ok(())
        } else {
            Err(AuthError::RouteNotAllowed(routes::clean_path(path)))
        }
    }

    async fn customer(&self, id: &str) -> Result<Option<Customer>, AuthError> {
        if let Some(c) = self.cache.customer(id).await {
            return Ok(Some(c));
        }
        let customer = self.directory.customer(id).await?;
        if let Some(ref c) = customer {
            self.cache.set_customer(c, CUSTOMER_CACHE_TTL).await;
        }
        Ok(customer)
    }

    async fn customer_by_api_key(&self, api_key: &str) -> Result<Option<Customer>, AuthError> {
        if let Some(c) = self.cache.customer_by_api_key(api_key).await {
            return Ok(Some(c));
        }
        let customer = self.directory.customer_by_api_key(api_key).await?;
        if let Some(ref c) = customer {
            self.cache.set_customer_by_api_key(c, CUSTOMER_CACHE_TTL).await;
        }
        Ok(customer)
    }

    fn account(&self, outcome: &Result<&str, &AuthError>, started: Instant) {
        let elapsed = started.elapsed().as_secs_f64();
        match outcome {
            Ok(customer_id) => self.metrics.auth_success(customer_id, elapsed),
            Err(e) => {
                debug!(reason = e.reason(), error = %e, "Authentication failed");
                self.metrics.auth_failure(e.reason(), elapsed);
            }
        }
    }
}
