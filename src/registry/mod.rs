use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::cipher::Method;
use crate::error::{Error, Result};

/// Wire shape of a user record, as pulled from the local JSON file or the
/// remote control plane (`{"user_id", "port", "method", "password",
/// "enable"}`).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UserRecord {
    pub user_id: i64,
    pub port: u16,
    pub method: String,
    pub password: String,
    #[serde(default = "default_enable")]
    pub enable: bool,
}

fn default_enable() -> bool {
    true
}

/// The subset of a user's accounting state pushed to the sync driver by
/// `drain_need_sync`.
#[derive(Debug, Clone, Serialize)]
pub struct SyncRecord {
    pub user_id: i64,
    pub ip_list: Vec<String>,
    pub tcp_conn_num: i64,
    pub upload_traffic: u64,
    pub download_traffic: u64,
}

struct UserInner {
    port: u16,
    method: Method,
    password: String,
    enable: bool,
    ip_list: HashSet<IpAddr>,
}

/// Process-lifetime user record. Accounting fields are atomics so readers
/// never observe a torn update; the rest lives behind one `RwLock` since
/// `port`/`method`/`password`/`enable` change only on `upsert`.
pub struct User {
    pub user_id: i64,
    inner: RwLock<UserInner>,
    pub upload_bytes: AtomicU64,
    pub download_bytes: AtomicU64,
    pub tcp_conn_num: AtomicI64,
    pub access_order: AtomicU64,
    pub need_sync: AtomicBool,
}

impl User {
    pub fn port(&self) -> u16 {
        self.inner.read().unwrap().port
    }

    pub fn method(&self) -> Method {
        self.inner.read().unwrap().method
    }

    pub fn password(&self) -> String {
        self.inner.read().unwrap().password.clone()
    }

    pub fn enabled(&self) -> bool {
        self.inner.read().unwrap().enable
    }

    pub fn used_traffic(&self) -> u64 {
        self.upload_bytes.load(Ordering::Relaxed) + self.download_bytes.load(Ordering::Relaxed)
    }

    fn ip_list_snapshot(&self) -> Vec<String> {
        self.inner
            .read()
            .unwrap()
            .ip_list
            .iter()
            .map(|ip| ip.to_string())
            .collect()
    }
}

#[derive(Default)]
pub struct UserRegistry {
    users: RwLock<HashMap<i64, Arc<User>>>,
    by_port: RwLock<HashMap<u16, Vec<i64>>>,
}

impl UserRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, user_id: i64) -> Option<Arc<User>> {
        self.users.read().unwrap().get(&user_id).cloned()
    }

    pub fn list(&self) -> Vec<Arc<User>> {
        self.users.read().unwrap().values().cloned().collect()
    }

    /// Every enabled port currently referenced by at least one user.
    pub fn enabled_ports(&self) -> Vec<u16> {
        let users = self.users.read().unwrap();
        let by_port = self.by_port.read().unwrap();
        by_port
            .iter()
            .filter(|(_, ids)| {
                ids.iter()
                    .any(|id| users.get(id).map(|u| u.enabled()).unwrap_or(false))
            })
            .map(|(port, _)| *port)
            .collect()
    }

    /// Insert-or-update by `user_id`. The updatable subset is `{port,
    /// method, password, enable}`; accounting fields are never touched.
    pub fn upsert(&self, record: UserRecord) -> Result<()> {
        let method = Method::parse(&record.method)?;
        let mut users = self.users.write().unwrap();
        let mut by_port = self.by_port.write().unwrap();

        match users.get(&record.user_id) {
            Some(existing) => {
                let mut inner = existing.inner.write().unwrap();
                if inner.port != record.port {
                    remove_from_port_index(&mut by_port, inner.port, record.user_id);
                    add_to_port_index(&mut by_port, record.port, record.user_id);
                }
                inner.port = record.port;
                inner.method = method;
                inner.password = record.password;
                inner.enable = record.enable;
            }
            None => {
                let user = Arc::new(User {
                    user_id: record.user_id,
                    inner: RwLock::new(UserInner {
                        port: record.port,
                        method,
                        password: record.password,
                        enable: record.enable,
                        ip_list: HashSet::new(),
                    }),
                    upload_bytes: AtomicU64::new(0),
                    download_bytes: AtomicU64::new(0),
                    tcp_conn_num: AtomicI64::new(0),
                    access_order: AtomicU64::new(0),
                    need_sync: AtomicBool::new(false),
                });
                add_to_port_index(&mut by_port, record.port, record.user_id);
                users.insert(record.user_id, user);
            }
        }
        Ok(())
    }

    /// Upserts every entry in `desired`, then deletes any user absent from
    /// it. Returns the set of ports whose listener set may have changed.
    pub fn bulk_reconcile(&self, desired: Vec<UserRecord>) -> Result<Vec<u16>> {
        let desired_ids: HashSet<i64> = desired.iter().map(|r| r.user_id).collect();
        let mut changed_ports = HashSet::new();

        for record in desired {
            changed_ports.insert(record.port);
            self.upsert(record)?;
        }

        let mut users = self.users.write().unwrap();
        let mut by_port = self.by_port.write().unwrap();
        let to_remove: Vec<i64> = users
            .keys()
            .filter(|id| !desired_ids.contains(id))
            .copied()
            .collect();
        for id in to_remove {
            if let Some(user) = users.remove(&id) {
                changed_ports.insert(user.port());
                remove_from_port_index(&mut by_port, user.port(), id);
            }
        }

        Ok(changed_ports.into_iter().collect())
    }

    /// Candidates for a shared port, ordered by `access_order` descending
    /// (most recently identified first) — the order the find-access-user
    /// scan relies on.
    pub fn list_by_port(&self, port: u16) -> Vec<Arc<User>> {
        let users = self.users.read().unwrap();
        let by_port = self.by_port.read().unwrap();
        let mut candidates: Vec<Arc<User>> = by_port
            .get(&port)
            .into_iter()
            .flatten()
            .filter_map(|id| users.get(id).cloned())
            .collect();
        candidates.sort_by(|a, b| {
            b.access_order
                .load(Ordering::Relaxed)
                .cmp(&a.access_order.load(Ordering::Relaxed))
        });
        candidates
    }

    pub fn record_ip(&self, user_id: i64, ip: IpAddr) {
        if let Some(user) = self.get(user_id) {
            user.inner.write().unwrap().ip_list.insert(ip);
            user.need_sync.store(true, Ordering::Relaxed);
        }
    }

    pub fn record_traffic(&self, user_id: i64, up: u64, down: u64) {
        if let Some(user) = self.get(user_id) {
            user.upload_bytes.fetch_add(up, Ordering::Relaxed);
            user.download_bytes.fetch_add(down, Ordering::Relaxed);
            user.need_sync.store(true, Ordering::Relaxed);
        }
    }

    /// Adjusts the live TCP connection count; saturates at zero rather
    /// than going negative on a double-decrement race.
    pub fn incr_tcp(&self, user_id: i64, delta: i64) {
        if let Some(user) = self.get(user_id) {
            let mut cur = user.tcp_conn_num.load(Ordering::Relaxed);
            loop {
                let next = (cur + delta).max(0);
                match user.tcp_conn_num.compare_exchange_weak(
                    cur,
                    next,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(actual) => cur = actual,
                }
            }
        }
    }

    pub fn promote_access_order(&self, port: u16, user_id: i64) {
        let current_max = self
            .list_by_port(port)
            .iter()
            .map(|u| u.access_order.load(Ordering::Relaxed))
            .max()
            .unwrap_or(0);
        if let Some(user) = self.get(user_id) {
            user.access_order
                .store(current_max.saturating_add(1), Ordering::Relaxed);
        }
    }

    /// Atomically returns every user with `need_sync = true`, resetting
    /// `ip_list`/`upload_bytes`/`download_bytes` and clearing the flag.
    /// `tcp_conn_num` is left untouched.
    pub fn drain_need_sync(&self) -> Vec<SyncRecord> {
        let users = self.users.read().unwrap();
        let mut out = Vec::new();
        for user in users.values() {
            if user.need_sync.swap(false, Ordering::Relaxed) {
                let ip_list = user.ip_list_snapshot();
                let upload_traffic = user.upload_bytes.swap(0, Ordering::Relaxed);
                let download_traffic = user.download_bytes.swap(0, Ordering::Relaxed);
                user.inner.write().unwrap().ip_list.clear();
                out.push(SyncRecord {
                    user_id: user.user_id,
                    ip_list,
                    tcp_conn_num: user.tcp_conn_num.load(Ordering::Relaxed),
                    upload_traffic,
                    download_traffic,
                });
            }
        }
        out
    }

    pub fn create_user(&self, record: UserRecord) -> Result<()> {
        if self.users.read().unwrap().contains_key(&record.user_id) {
            return Err(Error::Configuration(format!(
                "user {} already exists",
                record.user_id
            )));
        }
        self.upsert(record)
    }

    pub fn delete_user(&self, user_id: i64) -> Option<Arc<User>> {
        let mut users = self.users.write().unwrap();
        let mut by_port = self.by_port.write().unwrap();
        let user = users.remove(&user_id)?;
        remove_from_port_index(&mut by_port, user.port(), user_id);
        Some(user)
    }
}

fn add_to_port_index(by_port: &mut HashMap<u16, Vec<i64>>, port: u16, user_id: i64) {
    by_port.entry(port).or_default().push(user_id);
}

fn remove_from_port_index(by_port: &mut HashMap<u16, Vec<i64>>, port: u16, user_id: i64) {
    if let Some(ids) = by_port.get_mut(&port) {
        ids.retain(|id| *id != user_id);
        if ids.is_empty() {
            by_port.remove(&port);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: i64, port: u16, password: &str) -> UserRecord {
        UserRecord {
            user_id: id,
            port,
            method: "aes-256-gcm".to_string(),
            password: password.to_string(),
            enable: true,
        }
    }

    #[test]
    fn upsert_then_get() {
        let reg = UserRegistry::new();
        reg.upsert(record(1, 8388, "pw")).unwrap();
        let user = reg.get(1).unwrap();
        assert_eq!(user.port(), 8388);
        assert_eq!(user.password(), "pw");
    }

    #[test]
    fn upsert_does_not_reset_accounting() {
        let reg = UserRegistry::new();
        reg.upsert(record(1, 8388, "pw")).unwrap();
        reg.record_traffic(1, 100, 200);
        reg.upsert(record(1, 8388, "pw2")).unwrap();
        let user = reg.get(1).unwrap();
        assert_eq!(user.upload_bytes.load(Ordering::Relaxed), 100);
        assert_eq!(user.download_bytes.load(Ordering::Relaxed), 200);
        assert_eq!(user.password(), "pw2");
    }

    #[test]
    fn bulk_reconcile_removes_absent_users() {
        let reg = UserRegistry::new();
        reg.bulk_reconcile(vec![record(1, 8000, "a"), record(2, 8001, "b")])
            .unwrap();
        assert!(reg.get(1).is_some());
        assert!(reg.get(2).is_some());

        reg.bulk_reconcile(vec![record(1, 8000, "a")]).unwrap();
        assert!(reg.get(1).is_some());
        assert!(reg.get(2).is_none());
        assert!(reg.list_by_port(8001).is_empty());
    }

    #[test]
    fn bulk_reconcile_idempotent() {
        let reg = UserRegistry::new();
        let desired = vec![record(1, 8000, "a"), record(2, 8001, "b")];
        reg.bulk_reconcile(desired.clone()).unwrap();
        reg.record_traffic(1, 10, 20);
        reg.bulk_reconcile(desired).unwrap();
        let user = reg.get(1).unwrap();
        // accounting from before the second reconcile must survive since
        // upsert never overwrites it.
        assert_eq!(user.upload_bytes.load(Ordering::Relaxed), 10);
    }

    #[test]
    fn list_by_port_orders_by_access_order_desc() {
        let reg = UserRegistry::new();
        reg.bulk_reconcile(vec![
            record(1, 9000, "a"),
            record(2, 9000, "b"),
            record(3, 9000, "c"),
        ])
        .unwrap();
        reg.promote_access_order(9000, 2);
        let ordered = reg.list_by_port(9000);
        assert_eq!(ordered[0].user_id, 2);
    }

    #[test]
    fn incr_tcp_saturates_at_zero() {
        let reg = UserRegistry::new();
        reg.upsert(record(1, 8000, "a")).unwrap();
        reg.incr_tcp(1, -5);
        assert_eq!(reg.get(1).unwrap().tcp_conn_num.load(Ordering::Relaxed), 0);
        reg.incr_tcp(1, 3);
        reg.incr_tcp(1, -1);
        assert_eq!(reg.get(1).unwrap().tcp_conn_num.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn drain_need_sync_resets_counters_but_not_tcp_conn_num() {
        let reg = UserRegistry::new();
        reg.upsert(record(1, 8000, "a")).unwrap();
        reg.incr_tcp(1, 2);
        reg.record_traffic(1, 100, 50);
        reg.record_ip(1, "203.0.113.5".parse().unwrap());

        let drained = reg.drain_need_sync();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].upload_traffic, 100);
        assert_eq!(drained[0].download_traffic, 50);
        assert_eq!(drained[0].tcp_conn_num, 2);
        assert_eq!(drained[0].ip_list, vec!["203.0.113.5".to_string()]);

        let user = reg.get(1).unwrap();
        assert_eq!(user.upload_bytes.load(Ordering::Relaxed), 0);
        assert_eq!(user.download_bytes.load(Ordering::Relaxed), 0);
        assert_eq!(user.tcp_conn_num.load(Ordering::Relaxed), 2);

        assert!(reg.drain_need_sync().is_empty());
    }
}
