use anyhow::{Context, Result};
use argon2::password_hash::{
    rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString,
};
use argon2::Argon2;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rand::RngCore;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{
    collections::{HashMap, VecDeque},
    path::Path,
    sync::Arc,
    time::{Duration as StdDuration, Instant},
};
use time::{Duration, OffsetDateTime};

use crate::error::ApiError;

static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("static regex"));

pub const MIN_PASSWORD_LEN: usize = 6;

/// Check the shape of an email address.
pub fn validate_email(email: &str) -> Result<(), ApiError> {
    if EMAIL_RE.is_match(email) {
        Ok(())
    } else {
        Err(ApiError::validation("Please enter a valid email address"))
    }
}

pub fn validate_password(password: &str) -> Result<(), ApiError> {
    if password.chars().count() >= MIN_PASSWORD_LEN {
        Ok(())
    } else {
        Err(ApiError::validation(format!(
            "Password must be at least {MIN_PASSWORD_LEN} characters long"
        )))
    }
}

/// Argon2id PHC string for `password`, with a fresh random salt.
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| anyhow::anyhow!("hash password: {e}"))
}

/// A malformed stored hash never matches.
pub fn verify_password(password: &str, stored: &str) -> bool {
    PasswordHash::new(stored).map_or(false, |parsed| {
        Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok()
    })
}

/// Claims stored within issued JWTs.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub struct Claims {
    /// User id.
    pub sub: String,
    pub email: String,
    pub exp: usize,
}

/// Identity attached to a request once its bearer token checked out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub id: String,
    pub email: String,
}

impl From<Claims> for AuthUser {
    fn from(c: Claims) -> Self {
        Self {
            id: c.sub,
            email: c.email,
        }
    }
}

/// Sign an HS256 session token for `user_id`, expiring after `ttl`.
pub fn issue_jwt(secret: &[u8], user_id: &str, email: &str, ttl: Duration) -> Result<String> {
    let expires = (OffsetDateTime::now_utc() + ttl).unix_timestamp().max(0);
    let claims = Claims {
        sub: user_id.into(),
        email: email.into(),
        exp: expires as usize,
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret),
    )
    .context("sign session token")
}

/// Claims of a session token, checked for signature and expiry with no leeway.
pub fn verify_jwt(secret: &[u8], token: &str) -> Result<Claims> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.leeway = 0;
    let data = decode::<Claims>(token, &DecodingKey::from_secret(secret), &validation)
        .context("invalid session token")?;
    Ok(data.claims)
}

/// Resolve the token signing secret: the configured one, or a random secret
/// generated on first start and kept in `<data_dir>/jwt_secret`.
pub fn load_or_create_secret(data_dir: &Path, configured: Option<&str>) -> Result<Vec<u8>> {
    if let Some(secret) = configured {
        return Ok(secret.as_bytes().to_vec());
    }
    let path = data_dir.join("jwt_secret");
    if let Ok(stored) = std::fs::read_to_string(&path) {
        return STANDARD
            .decode(stored.trim())
            .context("corrupt jwt_secret file");
    }
    let mut secret = vec![0u8; 32];
    rand::thread_rng().fill_bytes(&mut secret);
    std::fs::create_dir_all(data_dir)?;
    std::fs::write(&path, STANDARD.encode(&secret)).context("persist jwt secret")?;
    Ok(secret)
}

/// Sliding-window limit on login attempts, keyed by lower-cased email.
///
/// The key comes from an unauthenticated request, so keys whose window has
/// fully expired are dropped: on their own next attempt, and in a full pass
/// at most once per window.
#[derive(Clone)]
pub struct LoginRateLimiter {
    state: Arc<Mutex<Attempts>>,
    max: usize,
    window: StdDuration,
}

struct Attempts {
    by_key: HashMap<String, VecDeque<Instant>>,
    last_pruned: Instant,
}

impl LoginRateLimiter {
    pub fn new(max: usize, window: StdDuration) -> Self {
        Self {
            state: Arc::new(Mutex::new(Attempts {
                by_key: HashMap::new(),
                last_pruned: Instant::now(),
            })),
            max,
            window,
        }
    }

    /// Record an attempt for `key`. Returns false when the key is over its limit.
    pub fn check(&self, key: &str) -> bool {
        let now = Instant::now();
        let window = self.window;
        let expired = |t: &Instant| now.duration_since(*t) >= window;
        let mut state = self.state.lock();

        if now.duration_since(state.last_pruned) >= window {
            state
                .by_key
                .retain(|_, hits| hits.back().map_or(false, |t| !expired(t)));
            state.last_pruned = now;
        }

        let hits = state.by_key.entry(key.to_lowercase()).or_default();
        while hits.front().map_or(false, |t| expired(t)) {
            hits.pop_front();
        }
        if hits.len() >= self.max {
            return false;
        }
        hits.push_back(now);
        true
    }

    /// Number of keys currently holding attempts.
    pub fn tracked_keys(&self) -> usize {
        self.state.lock().by_key.len()
    }
}
