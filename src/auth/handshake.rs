//! Agent upgrade credential.
//!
//! An agent presents `X-Agent-Token: <unix_ts>.<hex hmac>` where the HMAC is
//! HMAC-SHA256 keyed with the customer's API key over
//! `"{agent_id}:{customer_id}:{unix_ts}"`. The expected signature is recomputed
//! from the timestamp carried in the credential, never from the current time.
//!
//! Customer and agent status are checked on every upgrade. Only the signature
//! work is skipped when the same credential was verified within the cache TTL.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;
use tracing::debug;

use super::constant_time_eq;
use crate::config::AgentSettings;
use crate::models::{AgentRecord, Customer};
use crate::store::{Directory, StoreError, TypedCache};

type HmacSha256 = Hmac<Sha256>;

/// Clock skew tolerated for credentials stamped slightly in the future.
const MAX_FUTURE_SKEW_SECS: i64 = 300;

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("missing required credentials")]
    MissingCredentials,
    #[error("malformed credential")]
    Malformed,
    #[error("credential expired")]
    Expired,
    #[error("credential timestamp is in the future")]
    NotYetValid,
    #[error("invalid credential signature")]
    InvalidSignature,
    #[error("unknown customer")]
    UnknownCustomer,
    #[error("customer account is not active")]
    CustomerInactive,
    #[error("unknown agent")]
    UnknownAgent,
    #[error("agent does not belong to customer")]
    AgentCustomerMismatch,
    #[error("agent is not active")]
    AgentInactive,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Build a credential for `agent_id` at `timestamp` (unix seconds).
pub fn sign_agent_credential(
    agent_id: &str,
    customer_id: &str,
    api_key: &str,
    timestamp: i64,
) -> String {
    format!(
        "{timestamp}.{}",
        signature(agent_id, customer_id, api_key, timestamp)
    )
}

fn signature(agent_id: &str, customer_id: &str, api_key: &str, timestamp: i64) -> String {
    // HMAC accepts keys of any length; an empty signature never verifies.
    let Ok(mut mac) = <HmacSha256 as Mac>::new_from_slice(api_key.as_bytes()) else {
        return String::new();
    };
    mac.update(format!("{agent_id}:{customer_id}:{timestamp}").as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// The parties a credential was verified for.
#[derive(Debug, Clone)]
pub struct VerifiedAgent {
    pub customer: Customer,
    pub agent: AgentRecord,
}

pub struct HandshakeVerifier {
    directory: Arc<dyn Directory>,
    cache: TypedCache,
    validity: Duration,
    cache_ttl: Duration,
}

impl HandshakeVerifier {
    pub fn new(settings: &AgentSettings, directory: Arc<dyn Directory>, cache: TypedCache) -> Self {
        Self {
            directory,
            cache,
            validity: Duration::from_secs(settings.handshake_validity_secs),
            cache_ttl: Duration::from_secs(settings.handshake_cache_secs),
        }
    }

    pub async fn verify(
        &self,
        agent_id: &str,
        customer_id: &str,
        credential: &str,
    ) -> Result<VerifiedAgent, HandshakeError> {
        self.verify_at(agent_id, customer_id, credential, Utc::now().timestamp())
            .await
    }

    async fn verify_at(
        &self,
        agent_id: &str,
        customer_id: &str,
        credential: &str,
        now: i64,
    ) -> Result<VerifiedAgent, HandshakeError> {
        if agent_id.is_empty() || customer_id.is_empty() || credential.is_empty() {
            return Err(HandshakeError::MissingCredentials);
        }

        let customer = self
            .directory
            .customer(customer_id)
            .await?
            .ok_or(HandshakeError::UnknownCustomer)?;
        if !customer.is_active() {
            return Err(HandshakeError::CustomerInactive);
        }
        let agent = self
            .directory
            .agent(agent_id)
            .await?
            .ok_or(HandshakeError::UnknownAgent)?;
        if agent.customer_id != customer_id {
            return Err(HandshakeError::AgentCustomerMismatch);
        }
        if !agent.is_active() {
            return Err(HandshakeError::AgentInactive);
        }

        let recently_verified = self
            .cache
            .agent_credential(customer_id, agent_id)
            .await
            .is_some_and(|cached| constant_time_eq(cached.as_bytes(), credential.as_bytes()));

        if recently_verified {
            debug!(agent_id, customer_id, "Handshake credential served from cache");
        } else {
            self.check_signature(&agent, &customer, credential, now)?;
            self.cache
                .set_agent_credential(customer_id, agent_id, credential, self.cache_ttl)
                .await;
        }

        Ok(VerifiedAgent { customer, agent })
    }

    fn check_signature(
        &self,
        agent: &AgentRecord,
        customer: &Customer,
        credential: &str,
        now: i64,
    ) -> Result<(), HandshakeError> {
        let (ts, presented) = credential
            .split_once('.')
            .ok_or(HandshakeError::Malformed)?;
        if presented.is_empty() || presented.contains('.') {
            return Err(HandshakeError::Malformed);
        }
        let ts: i64 = ts.parse().map_err(|_| HandshakeError::Malformed)?;

        #[allow(clippy::cast_possible_wrap)]
        let validity = self.validity.as_secs() as i64;
        if ts < now.saturating_sub(validity) {
            return Err(HandshakeError::Expired);
        }
        if ts > now.saturating_add(MAX_FUTURE_SKEW_SECS) {
            return Err(HandshakeError::NotYetValid);
        }

        let expected = signature(&agent.id, &customer.id, &customer.api_key, ts);
        if constant_time_eq(expected.as_bytes(), presented.as_bytes()) {
            Ok(())
        } else {
            Err(HandshakeError::InvalidSignature)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AgentStatus, CustomerStatus};
    use crate::store::{Cache, InMemoryDirectory, MemoryCache};

    async fn fixture() -> (HandshakeVerifier, Arc<InMemoryDirectory>, Arc<MemoryCache>) {
        let dir = Arc::new(InMemoryDirectory::new());
        dir.put_customer(Customer {
            id: "c1".into(),
            name: "Acme".into(),
            api_key: "secret-key".into(),
            status: CustomerStatus::Active,
            allowed_routes: vec![],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        })
        .await
        .unwrap();
        for (id, customer, status) in [
            ("a1", "c1", AgentStatus::Active),
            ("a2", "c2", AgentStatus::Active),
            ("a3", "c1", AgentStatus::Inactive),
        ] {
            dir.put_agent(AgentRecord {
                id: id.into(),
                customer_id: customer.into(),
                name: String::new(),
                status,
                version: None,
                last_seen: None,
            })
            .await
            .unwrap();
        }
        let raw = Arc::new(MemoryCache::new());
        let verifier = HandshakeVerifier::new(
            &AgentSettings::default(),
            dir.clone(),
            TypedCache::new(raw.clone()),
        );
        (verifier, dir, raw)
    }

    #[test]
    fn test_credential_format() {
        let cred = sign_agent_credential("a1", "c1", "k", 1_700_000_000);
        let (ts, sig) = cred.split_once('.').unwrap();
        assert_eq!(ts, "1700000000");
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(cred, sign_agent_credential("a1", "c1", "other", 1_700_000_000));
    }

    #[tokio::test]
    async fn test_accepts_credential_signed_earlier() {
        let (v, _, _) = fixture().await;
        let now = 1_700_000_000;
        let cred = sign_agent_credential("a1", "c1", "secret-key", now - 3600);
        let verified = v.verify_at("a1", "c1", &cred, now).await.unwrap();
        assert_eq!(verified.agent.id, "a1");
    }

    #[tokio::test]
    async fn test_rejects_window_and_signature() {
        let (v, _, _) = fixture().await;
        let now = 1_700_000_000;

        let old = sign_agent_credential("a1", "c1", "secret-key", now - 86_401);
        assert!(matches!(v.verify_at("a1", "c1", &old, now).await, Err(HandshakeError::Expired)));

        let future = sign_agent_credential("a1", "c1", "secret-key", now + 3600);
        assert!(matches!(
            v.verify_at("a1", "c1", &future, now).await,
            Err(HandshakeError::NotYetValid)
        ));

        let wrong_key = sign_agent_credential("a1", "c1", "guess", now);
        assert!(matches!(
            v.verify_at("a1", "c1", &wrong_key, now).await,
            Err(HandshakeError::InvalidSignature)
        ));

        for bad in ["nodot", "abc.def", "1.2.3", "123."] {
            assert!(matches!(
                v.verify_at("a1", "c1", bad, now).await,
                Err(HandshakeError::Malformed)
            ));
        }
    }

    #[tokio::test]
    async fn test_rejects_directory_mismatches() {
        let (v, _, _) = fixture().await;
        let now = 1_700_000_000;
        let cred = |agent: &str| sign_agent_credential(agent, "c1", "secret-key", now);

        assert!(matches!(
            v.verify_at("", "c1", "x", now).await,
            Err(HandshakeError::MissingCredentials)
        ));
        assert!(matches!(
            v.verify_at("a1", "c9", &cred("a1"), now).await,
            Err(HandshakeError::UnknownCustomer)
        ));
        assert!(matches!(
            v.verify_at("zz", "c1", &cred("zz"), now).await,
            Err(HandshakeError::UnknownAgent)
        ));
        assert!(matches!(
            v.verify_at("a2", "c1", &cred("a2"), now).await,
            Err(HandshakeError::AgentCustomerMismatch)
        ));
        assert!(matches!(
            v.verify_at("a3", "c1", &cred("a3"), now).await,
            Err(HandshakeError::AgentInactive)
        ));
    }

    #[tokio::test]
    async fn test_caches_verified_credential_but_rechecks_status() {
        let (v, dir, raw) = fixture().await;
        let now = 1_700_000_000;
        let cred = sign_agent_credential("a1", "c1", "secret-key", now);
        v.verify_at("a1", "c1", &cred, now).await.unwrap();
        assert!(raw
            .get(&crate::store::cache::keys::agent_credential("c1", "a1"))
            .await
            .unwrap()
            .is_some());

        // Long after expiry the cached credential still skips signature work.
        assert!(v.verify_at("a1", "c1", &cred, now + 200_000).await.is_ok());

        let mut c = dir.customer("c1").await.unwrap().unwrap();
        c.status = CustomerStatus::Suspended;
        dir.put_customer(c).await.unwrap();
        assert!(matches!(
            v.verify_at("a1", "c1", &cred, now).await,
            Err(HandshakeError::CustomerInactive)
        ));
    }
}
