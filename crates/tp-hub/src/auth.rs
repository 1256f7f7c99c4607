use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

/// Capability object guarding the admin-facing routes. Constructed once in
/// `main` and handed to the router state; tokens expire after a fixed TTL.
pub struct AdminKeyring {
    ttl: Duration,
    tokens: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl AdminKeyring {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            tokens: Mutex::new(HashMap::new()),
        }
    }

    /// Mints a fresh token valid for the keyring's TTL.
    pub fn issue(&self, now: DateTime<Utc>) -> String {
        let token = Uuid::new_v4().simple().to_string();
        self.insert(token.clone(), now);
        token
    }

    /// Registers an externally supplied token (e.g. from config), stamped
    /// with the same TTL as minted ones.
    pub fn insert(&self, token: String, now: DateTime<Utc>) {
        let mut tokens = self.lock();
        tokens.insert(token, now + self.ttl);
    }

    pub fn accept(&self, token: &str, now: DateTime<Utc>) -> bool {
        let tokens = self.lock();
        match tokens.get(token) {
            Some(expires_at) => *expires_at > now,
            None => false,
        }
    }

    /// Drops expired entries; returns how many were removed.
    pub fn evict_expired(&self, now: DateTime<Utc>) -> usize {
        let mut tokens = self.lock();
        let before = tokens.len();
        tokens.retain(|_, expires_at| *expires_at > now);
        before - tokens.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, DateTime<Utc>>> {
        self.tokens
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Extracts the token from an `Authorization: Bearer <token>` header value.
pub fn bearer_token(header_value: &str) -> Option<&str> {
    let rest = header_value.strip_prefix("Bearer ")?;
    let rest = rest.trim();
    if rest.is_empty() {
        None
    } else {
        Some(rest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(offset_secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_756_000_000 + offset_secs, 0)
            .single()
            .expect("valid timestamp")
    }

    #[test]
    fn issued_tokens_are_accepted_until_the_ttl_elapses() {
        let keyring = AdminKeyring::new(Duration::hours(24));
        let token = keyring.issue(ts(0));
        assert!(keyring.accept(&token, ts(0)));
        assert!(keyring.accept(&token, ts(23 * 3_600)));
        assert!(!keyring.accept(&token, ts(25 * 3_600)));
    }

    #[test]
    fn unknown_tokens_are_rejected() {
        let keyring = AdminKeyring::new(Duration::hours(24));
        keyring.issue(ts(0));
        assert!(!keyring.accept("not-a-token", ts(0)));
    }

    #[test]
    fn eviction_removes_only_expired_entries() {
        let keyring = AdminKeyring::new(Duration::hours(1));
        let old = keyring.issue(ts(0));
        keyring.insert("fresh".to_string(), ts(3_000));
        assert_eq!(keyring.evict_expired(ts(3_700)), 1);
        assert!(!keyring.accept(&old, ts(3_700)));
        assert!(keyring.accept("fresh", ts(3_700)));
    }

    #[test]
    fn bearer_parsing_requires_the_scheme_and_a_token() {
        assert_eq!(bearer_token("Bearer abc123"), Some("abc123"));
        assert_eq!(bearer_token("Bearer   abc123  "), Some("abc123"));
        assert_eq!(bearer_token("Bearer "), None);
        assert_eq!(bearer_token("Basic abc123"), None);
        assert_eq!(bearer_token("abc123"), None);
    }
}
