//! Local administrator override.
//!
//! Attendants can end a session and lift the lockdown at the machine by
//! entering the admin password. The password is stored as an Argon2id PHC
//! string in the agent config; attempts are rate limited.

use anyhow::Result;
use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::warn;

pub const MAX_ATTEMPTS: usize = 5;
pub const ATTEMPT_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("no admin password is configured")]
    NotConfigured,

    #[error("too many attempts, retry in {} seconds", .retry_after.as_secs().max(1))]
    RateLimited { retry_after: Duration },

    #[error("incorrect admin password")]
    InvalidPassword,

    #[error("stored admin password hash is unreadable: {0}")]
    BadHash(String),
}

/// Hash a password into an Argon2id PHC string
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| anyhow::anyhow!("Failed to hash password: {}", e))
}

fn verify_password(password: &str, hash: &str) -> Result<bool, AuthError> {
    let parsed = PasswordHash::new(hash).map_err(|e| AuthError::BadHash(e.to_string()))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

/// Sliding-window attempt counter
#[derive(Debug)]
pub struct RateLimiter {
    attempts: VecDeque<Instant>,
    max_attempts: usize,
    window: Duration,
}

impl RateLimiter {
    pub fn new(max_attempts: usize, window: Duration) -> Self {
        Self {
            attempts: VecDeque::with_capacity(max_attempts),
            max_attempts,
            window,
        }
    }

    /// Record an attempt at `now`, or return how long until one is allowed
    pub fn try_acquire(&mut self, now: Instant) -> Result<(), Duration> {
        while self
            .attempts
            .front()
            .is_some_and(|&at| now.duration_since(at) >= self.window)
        {
            self.attempts.pop_front();
        }

        if self.attempts.len() < self.max_attempts {
            self.attempts.push_back(now);
            return Ok(());
        }

        let oldest = self.attempts.front().copied().unwrap_or(now);
        Err(self.window.saturating_sub(now.duration_since(oldest)))
    }

    pub fn reset(&mut self) {
        self.attempts.clear();
    }
}

/// Verifies admin override attempts
pub struct AdminGate {
    password_hash: Option<String>,
    limiter: Mutex<RateLimiter>,
}

impl AdminGate {
    pub fn new(password_hash: Option<String>) -> Self {
        Self {
            password_hash: password_hash.filter(|h| !h.trim().is_empty()),
            limiter: Mutex::new(RateLimiter::new(MAX_ATTEMPTS, ATTEMPT_WINDOW)),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.password_hash.is_some()
    }

    /// Check a password. Blocks for the duration of the Argon2 verification.
    pub fn verify(&self, password: &str) -> Result<(), AuthError> {
        let hash = self.password_hash.as_deref().ok_or(AuthError::NotConfigured)?;

        self.limiter
            .lock()
            .try_acquire(Instant::now())
            .map_err(|retry_after| AuthError::RateLimited { retry_after })?;

        if verify_password(password, hash)? {
            self.limiter.lock().reset();
            Ok(())
        } else {
            warn!("Rejected admin override attempt");
            Err(AuthError::InvalidPassword)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_and_verify() {
        let hash = hash_password("attendant-pin").unwrap();

        assert!(hash.starts_with("$argon2"));
        assert!(verify_password("attendant-pin", &hash).unwrap());
        assert!(!verify_password("guess", &hash).unwrap());
    }

    #[test]
    fn test_unreadable_hash() {
        assert!(matches!(
            verify_password("x", "not-a-phc-string"),
            Err(AuthError::BadHash(_))
        ));
    }

    #[test]
    fn test_rate_limiter_window() {
        let mut limiter = RateLimiter::new(2, Duration::from_secs(60));
        let start = Instant::now();

        assert!(limiter.try_acquire(start).is_ok());
        assert!(limiter.try_acquire(start + Duration::from_secs(1)).is_ok());

        let retry = limiter.try_acquire(start + Duration::from_secs(10)).unwrap_err();
        assert_eq!(retry, Duration::from_secs(50));

        assert!(limiter.try_acquire(start + Duration::from_secs(60)).is_ok());
    }

    #[test]
    fn test_gate_without_password() {
        let gate = AdminGate::new(Some("  ".to_string()));
        assert!(!gate.is_configured());
        assert_eq!(gate.verify("anything"), Err(AuthError::NotConfigured));
    }

    #[test]
    fn test_gate_locks_out_after_repeated_failures() {
        let gate = AdminGate::new(Some(hash_password("right").unwrap()));

        for _ in 0..MAX_ATTEMPTS {
            assert_eq!(gate.verify("wrong"), Err(AuthError::InvalidPassword));
        }
        assert!(matches!(
            gate.verify("right"),
            Err(AuthError::RateLimited { .. })
        ));
    }

    #[test]
    fn test_gate_success_resets_attempts() {
        let gate = AdminGate::new(Some(hash_password("right").unwrap()));

        for _ in 0..MAX_ATTEMPTS - 1 {
            let _ = gate.verify("wrong");
        }
        gate.verify("right").unwrap();
        for _ in 0..MAX_ATTEMPTS - 1 {
            let _ = gate.verify("wrong");
        }
        assert!(gate.verify("right").is_ok());
    }
}
