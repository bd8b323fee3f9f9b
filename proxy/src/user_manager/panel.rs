use super::manager::UserManager;
use super::user::{IdleNotifier, User};
use super::user_info::UserInfo;
use crate::error::{ProxyError, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, info, instrument};

/// Directory of active users.
///
/// A user is made active on its first authenticated request and evicted as
/// soon as its last session goes away. Live credit of active and evicted
/// users is written back to the [`UserManager`] by [`Userpanel::sync_status`].
///
/// Lock order: `status_gate`, then `pending_status`, then a map shard, then
/// a user's session registry.
pub struct Userpanel {
    manager: Arc<dyn UserManager>,
    active_users: DashMap<Vec<u8>, Arc<User>>,
    // final snapshots of evicted users not uploaded yet; an eviction removes
    // the user and queues its snapshot under this lock
    pending_status: Mutex<Vec<UserInfo>>,
    // held by everything that reads from or writes to the user manager
    status_gate: tokio::sync::Mutex<()>,
}

impl Userpanel {
    pub fn new(manager: Arc<dyn UserManager>) -> Arc<Self> {
        Arc::new(Self {
            manager,
            active_users: DashMap::new(),
            pending_status: Mutex::new(Vec::new()),
            status_gate: tokio::sync::Mutex::new(()),
        })
    }

    pub fn manager(&self) -> &Arc<dyn UserManager> {
        &self.manager
    }

    pub fn get_active_user(&self, uid: &[u8]) -> Option<Arc<User>> {
        self.active_users.get(uid).map(|entry| entry.value().clone())
    }

    pub fn active_user_count(&self) -> usize {
        self.active_users.len()
    }

    /// Returns the active user for `uid`, activating it from the user manager
    /// if needed. Expired users are refused.
    #[instrument(skip(self, uid), fields(uid = %hex::encode(uid)))]
    pub async fn get_or_make_user(self: &Arc<Self>, uid: &[u8]) -> Result<Arc<User>> {
        if let Some(user) = self.get_active_user(uid) {
            return Ok(user);
        }

        let _gate = self.status_gate.lock().await;
        loop {
            // A user evicted moments ago must not come back with stale credit.
            self.flush_pending_status().await?;
            let info = self.manager.authenticate_user(uid).await?;
            if info.expiry_time < chrono::Utc::now().timestamp() {
                return Err(ProxyError::UserExpired(hex::encode(uid)));
            }

            let pending = self.pending_status.lock();
            if pending.iter().any(|status| status.uid == uid) {
                // Evicted while authenticating; `info` may be stale.
                continue;
            }

            let panel: Weak<Self> = Arc::downgrade(self);
            let notifier: Weak<dyn IdleNotifier> = panel;
            let user = self
                .active_users
                .entry(info.uid.clone())
                .or_insert_with(|| {
                    info!("Activating user");
                    Arc::new(User::new(info, notifier))
                })
                .value()
                .clone();
            drop(pending);
            return Ok(user);
        }
    }

    /// Persists `info` and applies it to the user if it is active. An
    /// unsynced snapshot of an evicted user is superseded by `info`.
    #[instrument(skip(self, info), fields(uid = %hex::encode(&info.uid)))]
    pub async fn update_user_info(&self, info: UserInfo) -> Result<()> {
        let _gate = self.status_gate.lock().await;
        {
            let mut pending = self.pending_status.lock();
            pending.retain(|status| status.uid != info.uid);
            if let Some(user) = self.get_active_user(&info.uid) {
                user.update_info(&info);
            }
        }
        self.manager.write_user_info(info).await
    }

    /// Closes every session of `uid` and evicts it. Returns whether the user
    /// was active.
    #[instrument(skip(self, uid), fields(uid = %hex::encode(uid)))]
    pub fn terminate_user(&self, uid: &[u8]) -> bool {
        let mut pending = self.pending_status.lock();
        let Some((_, user)) = self.active_users.remove(uid) else {
            return false;
        };
        let closed = user.take_sessions().len();
        pending.push(user.info());
        info!(closed, "User terminated");
        true
    }

    /// Evicts active users that have had no session for at least `grace`
    /// since activation. Returns how many were evicted.
    pub fn evict_unused(&self, grace: Duration) -> usize {
        let unused: Vec<Vec<u8>> = self
            .active_users
            .iter()
            .filter(|entry| {
                let user = entry.value();
                user.session_count() == 0 && user.activated_at().elapsed() >= grace
            })
            .map(|entry| entry.key().clone())
            .collect();

        unused
            .iter()
            .filter(|uid| self.evict_if_idle(uid.as_slice()))
            .count()
    }

    /// Uploads the live credit of every active user along with the final
    /// credit of users evicted since the last sync.
    pub async fn sync_status(&self) -> Result<()> {
        let _gate = self.status_gate.lock().await;
        let statuses: Vec<UserInfo> = {
            let mut pending = self.pending_status.lock();
            let mut statuses = std::mem::take(&mut *pending);
            statuses.extend(self.active_users.iter().map(|entry| entry.value().info()));
            statuses
        };
        if statuses.is_empty() {
            return Ok(());
        }

        let count = statuses.len();
        self.manager.upload_status(statuses).await?;
        debug!(count, "Status synced");
        Ok(())
    }

    /// Calls [`Userpanel::sync_status`] every `period` until the task is
    /// dropped, then evicts users left without a session for a whole period.
    /// Failures are logged and retried on the next tick.
    pub async fn run_status_sync(self: Arc<Self>, period: Duration) {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = self.sync_status().await {
                error!("Status sync failed: {}", e);
            }
            let evicted = self.evict_unused(period);
            if evicted > 0 {
                debug!(evicted, "Evicted unused users");
            }
        }
    }

    // Callers hold `status_gate`.
    async fn flush_pending_status(&self) -> Result<()> {
        let pending: Vec<UserInfo> = std::mem::take(&mut *self.pending_status.lock());
        if pending.is_empty() {
            return Ok(());
        }
        self.manager.upload_status(pending).await
    }

    fn evict_if_idle(&self, uid: &[u8]) -> bool {
        let mut pending = self.pending_status.lock();
        // A session may have been opened again since the user went idle.
        let Some((_, user)) = self
            .active_users
            .remove_if(uid, |_, user| user.session_count() == 0)
        else {
            return false;
        };

        info!(
            uid = %hex::encode(uid),
            up_bytes = user.valve().rx_bytes(),
            down_bytes = user.valve().tx_bytes(),
            "Evicting idle user"
        );
        pending.push(user.info());
        true
    }
}

impl IdleNotifier for Userpanel {
    fn notify_idle(&self, uid: &[u8]) {
        self.evict_if_idle(uid);
    }
}
