//! Remote JWKS fetch and cache.
//!
//! Keys are cached per issuer with a short TTL; a verification miss on an
//! unknown `kid` forces exactly one refresh before the token is rejected.
//! When a refresh fails, previously fetched keys keep serving (grace) so an
//! IdP blip does not take `/validate` down with it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use jsonwebtoken::DecodingKey;
use jsonwebtoken::jwk::JwkSet;
use parking_lot::Mutex;
use tracing::{debug, warn};

use shared::error::{CommonError, reason};

pub const JWKS_FETCH_TIMEOUT: Duration = Duration::from_secs(3);
pub const JWKS_CACHE_TTL: Duration = Duration::from_secs(300);

pub struct RemoteJwks {
    url: String,
    http: reqwest::Client,
    keys: DashMap<String, DecodingKey>,
    last_refresh: Mutex<Option<Instant>>,
    ttl: Duration,
}

impl RemoteJwks {
    pub fn new(url: impl Into<String>, http: reqwest::Client) -> Self {
        Self {
            url: url.into(),
            http,
            keys: DashMap::new(),
            last_refresh: Mutex::new(None),
            ttl: JWKS_CACHE_TTL,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn is_fresh(&self) -> bool {
        let last_refresh = *self.last_refresh.lock();
        last_refresh.is_some_and(|t| t.elapsed() < self.ttl)
    }

    /// Key for `kid`, refreshing when the cache is cold, stale, or missing
    /// the id. `force` skips the freshness check (used for the one retry
    /// after a signature miss).
    pub async fn decoding_key(&self, kid: &str, force: bool) -> Result<DecodingKey, CommonError> {
        if !force && self.is_fresh() {
            if let Some(key) = self.keys.get(kid) {
                return Ok(key.clone());
            }
        }

        if let Err(e) = self.refresh().await {
            if let Some(key) = self.keys.get(kid) {
                warn!(url = %self.url, "JWKS refresh failed, serving cached key: {e}");
                return Ok(key.clone());
            }
            return Err(e);
        }

        self.keys.get(kid).map(|k| k.clone()).ok_or_else(|| {
            CommonError::unauthenticated(
                reason::INVALID_TOKEN,
                format!("token key id '{kid}' is not in the issuer's key set"),
            )
        })
    }

    async fn refresh(&self) -> Result<(), CommonError> {
        let response = self
            .http
            .get(&self.url)
            .timeout(JWKS_FETCH_TIMEOUT)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| CommonError::Upstream {
                msg: format!("JWKS endpoint {} answered with an error", self.url),
                source: Some(e.into()),
            })?;

        let jwks: JwkSet = response.json().await.map_err(|e| CommonError::Upstream {
            msg: format!("JWKS endpoint {} returned an unparseable key set", self.url),
            source: Some(e.into()),
        })?;

        let mut loaded = 0;
        for jwk in &jwks.keys {
            let Some(kid) = jwk.common.key_id.clone() else {
                continue;
            };
            match DecodingKey::from_jwk(jwk) {
                Ok(key) => {
                    self.keys.insert(kid, key);
                    loaded += 1;
                }
                Err(e) => warn!(kid, "skipping unusable JWK: {e}"),
            }
        }

        *self.last_refresh.lock() = Some(Instant::now());
        debug!(url = %self.url, loaded, "JWKS refreshed");
        Ok(())
    }
}

/// One cache per issuer. Programmatic callers may point the gateway at a
/// different pool or realm via discriminator headers, so issuers are an open
/// set.
#[derive(Clone)]
pub struct JwksRegistry {
    caches: Arc<DashMap<String, Arc<RemoteJwks>>>,
    http: reqwest::Client,
}

impl JwksRegistry {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            caches: Arc::new(DashMap::new()),
            http,
        }
    }

    pub fn for_url(&self, jwks_url: &str) -> Arc<RemoteJwks> {
        self.caches
            .entry(jwks_url.to_string())
            .or_insert_with(|| Arc::new(RemoteJwks::new(jwks_url, self.http.clone())))
            .clone()
    }
}
