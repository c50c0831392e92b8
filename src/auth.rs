//! Pluggable authentication plane: a registry of [`Authenticator`]s plus a
//! per-source-IP login-failure tracker.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use fnv::FnvHasher;
use parking_lot::RwLock;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use std::hash::Hasher;
use thiserror::Error;

use crate::accounting::{AccountingRegistry, AccountingSession};
use std::sync::Arc;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid user name or password")]
    InvalidCredentials,
    #[error("duplicate authenticator registration: {0}")]
    DuplicateAuthenticator(String),
    #[error("unknown authenticator: {0}")]
    UnknownAuthenticator(String),
}

/// Credentials presented by a connecting client.
pub struct AuthenticationInfo {
    pub ip: IpAddr,
    pub user: String,
    pub password: String,
}

/// Outcome of a successful admin login.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminLevel {
    Full,
    ReadOnly,
}

/// A pluggable credential source. Implementations own their own storage
/// (a config file, an LDAP bind, ...); the dummy implementation generates
/// random credentials at startup, grounded on the reference implementation's
/// single stub authenticator used for local testing.
pub trait Authenticator: Send + Sync {
    fn authenticate_user(&self, info: &AuthenticationInfo) -> Result<(), AuthError>;
    fn authenticate_admin(&self, info: &AuthenticationInfo) -> Result<AdminLevel, AuthError>;
    fn kind(&self) -> &'static str;
}

/// Generates random user/admin passwords at startup and prints them once,
/// for environments with no external identity provider configured.
pub struct DummyAuthenticator {
    user_password: String,
    admin_password: String,
}

impl DummyAuthenticator {
    pub fn new() -> Self {
        let user_password = random_string(12);
        let admin_password = random_string(12);
        tracing::info!(
            user = "dummy",
            user_password = %user_password,
            admin_user = "admin",
            admin_password = %admin_password,
            "dummy authenticator generated credentials"
        );
        Self {
            user_password,
            admin_password,
        }
    }
}

impl Default for DummyAuthenticator {
    fn default() -> Self {
        Self::new()
    }
}

fn random_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

impl Authenticator for DummyAuthenticator {
    fn authenticate_user(&self, info: &AuthenticationInfo) -> Result<(), AuthError> {
        if info.user == "dummy" && info.password == self.user_password {
            Ok(())
        } else {
            Err(AuthError::InvalidCredentials)
        }
    }

    fn authenticate_admin(&self, info: &AuthenticationInfo) -> Result<AdminLevel, AuthError> {
        if info.user == "admin" && info.password == self.admin_password {
            Ok(AdminLevel::Full)
        } else {
            Err(AuthError::InvalidCredentials)
        }
    }

    fn kind(&self) -> &'static str {
        "dummy"
    }
}

#[derive(Default, Serialize)]
pub struct AuthStat {
    pub login_count: u64,
    pub login_fail_count: u64,
    pub admin_login_count: u64,
    pub admin_login_fail_count: u64,
}

#[derive(Default)]
struct AuthStatCounters {
    login_count: AtomicU64,
    login_fail_count: AtomicU64,
    admin_login_count: AtomicU64,
    admin_login_fail_count: AtomicU64,
}

/// Owns every registered [`Authenticator`] plus the accounting session
/// registry shared across all of them.
pub struct AuthenticationManager {
    authenticators: RwLock<Vec<Arc<dyn Authenticator>>>,
    pub accounting: Arc<AccountingRegistry>,
    stats: AuthStatCounters,
}

impl AuthenticationManager {
    pub fn new() -> Self {
        Self {
            authenticators: RwLock::new(Vec::new()),
            accounting: Arc::new(AccountingRegistry::new()),
            stats: AuthStatCounters::default(),
        }
    }

    pub fn register(&self, authenticator: Arc<dyn Authenticator>) -> Result<(), AuthError> {
        let mut list = self.authenticators.write();
        if list.iter().any(|a| a.kind() == authenticator.kind()) {
            return Err(AuthError::DuplicateAuthenticator(authenticator.kind().to_string()));
        }
        list.push(authenticator);
        Ok(())
    }

    pub fn authenticator(&self, kind: &str) -> Option<Arc<dyn Authenticator>> {
        self.authenticators.read().iter().find(|a| a.kind() == kind).cloned()
    }

    /// Try every registered authenticator in order; the first to accept
    /// the credentials wins.
    pub fn authenticate_user(&self, info: &AuthenticationInfo) -> Result<Arc<dyn Authenticator>, AuthError> {
        self.stats.login_count.fetch_add(1, Ordering::Relaxed);
        for auth in self.authenticators.read().iter() {
            if auth.authenticate_user(info).is_ok() {
                return Ok(auth.clone());
            }
        }
        self.stats.login_fail_count.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(user = %info.user, ip = %info.ip, "user authentication failed");
        Err(AuthError::InvalidCredentials)
    }

    pub fn authenticate_admin(&self, info: &AuthenticationInfo) -> Result<(Arc<dyn Authenticator>, AdminLevel), AuthError> {
        self.stats.admin_login_count.fetch_add(1, Ordering::Relaxed);
        for auth in self.authenticators.read().iter() {
            if let Ok(level) = auth.authenticate_admin(info) {
                return Ok((auth.clone(), level));
            }
        }
        self.stats.admin_login_fail_count.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(user = %info.user, ip = %info.ip, "admin authentication failed");
        Err(AuthError::InvalidCredentials)
    }

    pub fn create_session(
        &self,
        authenticator_kind: &str,
        session_id: String,
        user: String,
        ip: IpAddr,
        virtual_ip: IpAddr,
    ) -> Arc<AccountingSession> {
        self.accounting.create(session_id, user, ip, virtual_ip, authenticator_kind.to_string())
    }

    pub fn stat(&self) -> AuthStat {
        AuthStat {
            login_count: self.stats.login_count.load(Ordering::Relaxed),
            login_fail_count: self.stats.login_fail_count.load(Ordering::Relaxed),
            admin_login_count: self.stats.admin_login_count.load(Ordering::Relaxed),
            admin_login_fail_count: self.stats.admin_login_fail_count.load(Ordering::Relaxed),
        }
    }
}

impl Default for AuthenticationManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks repeated failed login attempts per source identity (normally an
/// IP address, hashed with FNV-64 to a 64-bit key), locking an identity out
/// once it crosses `max_fail_count` within `max_track_time` seconds of
/// inactivity.
pub struct LoginFailTracker {
    table: crate::hashlist::HashList<u32>,
    max_fail_count: u32,
    max_track_time: i64,
}

fn fnv_key(id: &str) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(id.as_bytes());
    hasher.finish()
}

impl LoginFailTracker {
    /// `max_track_time` is the inactivity window in seconds; entries sweep
    /// back to zero past that, matching the reference implementation's
    /// 60-second/3-failure default.
    pub fn new(max_track_time: i64, max_fail_count: u32) -> Self {
        Self {
            table: crate::hashlist::HashList::new(4096),
            max_fail_count,
            max_track_time,
        }
    }

    pub fn can_login(&self, id: &str) -> bool {
        let key = fnv_key(id);
        match self.table.find::<fn(&u32) -> bool>(key, None) {
            Some(count) => count < self.max_fail_count,
            None => true,
        }
    }

    /// Record a failed attempt; returns `false` once the identity has just
    /// crossed the failure threshold.
    pub fn register_fail(&self, id: &str) -> bool {
        let key = fnv_key(id);
        if let Some(count) = self.table.with_mut(key, |count: &mut u32| {
            *count += 1;
            *count
        }) {
            return count < self.max_fail_count;
        }
        self.table.add(key, 1);
        1 < self.max_fail_count
    }

    /// Sweep one segment for stale entries; call periodically (the
    /// reference implementation runs this every 30 seconds).
    pub fn sweep(&self) {
        self.table.check_for_timeout(None::<fn(&u32, i64) -> bool>, self.max_track_time);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dummy_authenticator_rejects_wrong_credentials() {
        let auth = DummyAuthenticator::new();
        let bad = AuthenticationInfo {
            ip: "127.0.0.1".parse().unwrap(),
            user: "dummy".into(),
            password: "wrong".into(),
        };
        assert!(auth.authenticate_user(&bad).is_err());
    }

    #[test]
    fn manager_rejects_duplicate_authenticator_kind() {
        let manager = AuthenticationManager::new();
        manager.register(Arc::new(DummyAuthenticator::new())).unwrap();
        assert!(manager.register(Arc::new(DummyAuthenticator::new())).is_err());
    }

    #[test]
    fn login_fail_tracker_locks_out_after_threshold() {
        let tracker = LoginFailTracker::new(60, 3);
        assert!(tracker.can_login("10.0.0.1"));
        assert!(tracker.register_fail("10.0.0.1"));
        assert!(tracker.register_fail("10.0.0.1"));
        assert!(!tracker.register_fail("10.0.0.1"));
        assert!(!tracker.can_login("10.0.0.1"));
    }
}
