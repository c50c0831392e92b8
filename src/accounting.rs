//! Accounting session: per-connected-user counters, tied to the lifetime
//! of the tunnel NIC that created it.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use serde::Serialize;

/// A callback invoked exactly once when a session is stopped.
pub type DisconnectCallback = Box<dyn Fn() + Send + Sync>;

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

const BASE62_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// A fresh 32-character base-62 id for a new accounting session, independent
/// of whatever numeric id the tunnel plane uses for the same connection.
pub fn random_session_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    (0..32).map(|_| BASE62_ALPHABET[rng.gen_range(0..BASE62_ALPHABET.len())] as char).collect()
}

/// Per-session counters and metadata, created when a tunnel reaches
/// ESTABLISHED and destroyed on disconnect, teardown, or admin stop.
pub struct AccountingSession {
    pub session_id: String,
    pub user: String,
    pub ip: IpAddr,
    pub virtual_ip: IpAddr,
    pub start_time: i64,
    pub auth_type: String,
    update_time: AtomicU64,
    total_send: AtomicU64,
    total_receive: AtomicU64,
    step_send: AtomicU64,
    step_receive: AtomicU64,
    pub location_lat: f64,
    pub location_long: f64,
    dc_callback: Mutex<Option<DisconnectCallback>>,
    stopped: std::sync::atomic::AtomicBool,
}

impl AccountingSession {
    fn new(session_id: String, user: String, ip: IpAddr, virtual_ip: IpAddr, auth_type: String) -> Self {
        let now = now_secs();
        Self {
            session_id,
            user,
            ip,
            virtual_ip,
            start_time: now,
            auth_type,
            update_time: AtomicU64::new(now as u64),
            total_send: AtomicU64::new(0),
            total_receive: AtomicU64::new(0),
            step_send: AtomicU64::new(0),
            step_receive: AtomicU64::new(0),
            location_lat: 0.0,
            location_long: 0.0,
            dc_callback: Mutex::new(None),
            stopped: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Register the callback invoked exactly once by [`stop`](Self::stop).
    pub fn set_disconnect_callback(&self, cb: DisconnectCallback) {
        *self.dc_callback.lock().unwrap() = Some(cb);
    }

    /// Record a send/receive of `bytes` against this session's counters.
    pub fn add_transfer(&self, bytes: u64, is_send: bool) {
        if is_send {
            self.total_send.fetch_add(bytes, Ordering::Relaxed);
            self.step_send.fetch_add(bytes, Ordering::Relaxed);
        } else {
            self.total_receive.fetch_add(bytes, Ordering::Relaxed);
            self.step_receive.fetch_add(bytes, Ordering::Relaxed);
        }
        self.update_time.store(now_secs() as u64, Ordering::Relaxed);
    }

    /// Periodic refresh: reset the step counters and stamp `update_time`.
    pub fn update(&self) {
        self.step_send.store(0, Ordering::Relaxed);
        self.step_receive.store(0, Ordering::Relaxed);
        self.update_time.store(now_secs() as u64, Ordering::Relaxed);
    }

    /// Invoke the disconnect callback exactly once.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(cb) = self.dc_callback.lock().unwrap().take() {
            cb();
        }
    }

    fn snapshot(&self) -> AccountingSnapshot {
        AccountingSnapshot {
            session_id: self.session_id.clone(),
            user: self.user.clone(),
            ip: self.ip.to_string(),
            virtual_ip: self.virtual_ip.to_string(),
            start_time: self.start_time,
            update_time: self.update_time.load(Ordering::Relaxed) as i64,
            total_send: self.total_send.load(Ordering::Relaxed),
            total_receive: self.total_receive.load(Ordering::Relaxed),
            step_send: self.step_send.load(Ordering::Relaxed),
            step_receive: self.step_receive.load(Ordering::Relaxed),
        }
    }
}

#[derive(Serialize)]
pub struct AccountingSnapshot {
    pub session_id: String,
    pub user: String,
    pub ip: String,
    pub virtual_ip: String,
    pub start_time: i64,
    pub update_time: i64,
    pub total_send: u64,
    pub total_receive: u64,
    pub step_send: u64,
    pub step_receive: u64,
}

/// `sessionId -> session` plus `user -> open session count`, both updated
/// atomically on register/remove.
#[derive(Default)]
pub struct AccountingRegistry {
    sessions: RwLock<HashMap<String, Arc<AccountingSession>>>,
    open_by_user: RwLock<HashMap<String, u32>>,
}

impl AccountingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(
        &self,
        session_id: String,
        user: String,
        ip: IpAddr,
        virtual_ip: IpAddr,
        auth_type: String,
    ) -> Arc<AccountingSession> {
        let session = Arc::new(AccountingSession::new(session_id.clone(), user.clone(), ip, virtual_ip, auth_type));
        self.sessions.write().insert(session_id, session.clone());
        *self.open_by_user.write().entry(user).or_insert(0) += 1;
        session
    }

    /// Stop (invokes the dcCallback) and remove the session.
    pub fn remove(&self, session_id: &str) {
        let session = self.sessions.write().remove(session_id);
        if let Some(session) = session {
            session.stop();
            let mut by_user = self.open_by_user.write();
            if let Some(count) = by_user.get_mut(&session.user) {
                *count -= 1;
                if *count == 0 {
                    by_user.remove(&session.user);
                }
            }
        }
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<AccountingSession>> {
        self.sessions.read().get(session_id).cloned()
    }

    /// `acc_sessions_list`, filtered by user/ip, capped like `flows_list`.
    pub fn list(&self, user: Option<&str>, ip: Option<IpAddr>) -> Vec<AccountingSnapshot> {
        self.sessions
            .read()
            .values()
            .filter(|s| user.map_or(true, |u| s.user == u))
            .filter(|s| ip.map_or(true, |ip| s.ip == ip))
            .take(crate::flow::MAX_COMMAND_RESPONSE_ITEMS)
            .map(|s| s.snapshot())
            .collect()
    }

    /// `acc_users_list`.
    pub fn users(&self) -> Vec<(String, u32)> {
        self.open_by_user
            .read()
            .iter()
            .map(|(u, c)| (u.clone(), *c))
            .collect()
    }

    /// `acc_sessions_dc`.
    pub fn disconnect(&self, user: Option<&str>) -> usize {
        let ids: Vec<String> = self
            .sessions
            .read()
            .values()
            .filter(|s| user.map_or(true, |u| s.user == u))
            .map(|s| s.session_id.clone())
            .collect();
        let count = ids.len();
        for id in ids {
            self.remove(&id);
        }
        count
    }

    /// `acc_sessions_status`.
    pub fn status(&self) -> (usize, u64, u64) {
        let sessions = self.sessions.read();
        let total_send: u64 = sessions.values().map(|s| s.total_send.load(Ordering::Relaxed)).sum();
        let total_receive: u64 = sessions.values().map(|s| s.total_receive.load(Ordering::Relaxed)).sum();
        (sessions.len(), total_send, total_receive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn stop_invokes_callback_exactly_once() {
        let registry = AccountingRegistry::new();
        let session = registry.create(
            "sess1".into(),
            "alice".into(),
            "10.0.0.1".parse().unwrap(),
            "10.8.0.2".parse().unwrap(),
            "dummy".into(),
        );
        let called = Arc::new(AtomicBool::new(false));
        let called2 = called.clone();
        session.set_disconnect_callback(Box::new(move || {
            called2.store(true, Ordering::SeqCst);
        }));
        session.stop();
        session.stop();
        assert!(called.load(Ordering::SeqCst));
    }

    #[test]
    fn remove_updates_per_user_open_count() {
        let registry = AccountingRegistry::new();
        registry.create(
            "s1".into(),
            "bob".into(),
            "10.0.0.2".parse().unwrap(),
            "10.8.0.3".parse().unwrap(),
            "dummy".into(),
        );
        assert_eq!(registry.users(), vec![("bob".to_string(), 1)]);
        registry.remove("s1");
        assert!(registry.users().is_empty());
    }
}
