use super::user_info::{UID_LEN, UserInfo, arr_uid};
use crate::error::{ProxyError, Result};
use mux::{Deobfser, ObfsedRead, Obfser, Session, Valve};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::convert::Infallible;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use tokio::time::Instant;
use tracing::{debug, info};

/// Told when a user's last session is gone so the user can be evicted.
pub trait IdleNotifier: Send + Sync {
    fn notify_idle(&self, uid: &[u8]);
}

/// An active user: its live policy, its valve and its sessions.
///
/// Policy fields are individually atomic and never take the session lock.
/// Up traffic is the valve's rx side, down traffic its tx side.
pub struct User {
    uid: Vec<u8>,
    arr_uid: [u8; UID_LEN],
    sessions_cap: AtomicU32,
    expiry_time: AtomicI64,
    // shared by every session of this user
    valve: Arc<Valve>,
    sessions: RwLock<HashMap<u32, Arc<Session>>>,
    notifier: Weak<dyn IdleNotifier>,
    activated_at: Instant,
}

impl User {
    pub fn new(info: UserInfo, notifier: Weak<dyn IdleNotifier>) -> Self {
        let valve = Valve::new(
            info.up_rate,
            info.down_rate,
            info.up_credit,
            info.down_credit,
        );
        Self {
            arr_uid: arr_uid(&info.uid),
            uid: info.uid,
            sessions_cap: AtomicU32::new(info.sessions_cap),
            expiry_time: AtomicI64::new(info.expiry_time),
            valve: Arc::new(valve),
            sessions: RwLock::new(HashMap::new()),
            notifier,
            activated_at: Instant::now(),
        }
    }

    pub fn uid(&self) -> &[u8] {
        &self.uid
    }

    pub fn arr_uid(&self) -> &[u8; UID_LEN] {
        &self.arr_uid
    }

    pub fn valve(&self) -> &Arc<Valve> {
        &self.valve
    }

    pub fn activated_at(&self) -> Instant {
        self.activated_at
    }

    pub fn add_up_credit(&self, delta: i64) {
        self.valve.add_rx_credit(delta);
    }

    pub fn add_down_credit(&self, delta: i64) {
        self.valve.add_tx_credit(delta);
    }

    pub fn set_sessions_cap(&self, cap: u32) {
        self.sessions_cap.store(cap, Ordering::Release);
    }

    pub fn set_up_rate(&self, rate: i64) {
        self.valve.set_rx_rate(rate);
    }

    pub fn set_down_rate(&self, rate: i64) {
        self.valve.set_tx_rate(rate);
    }

    pub fn set_up_credit(&self, n: i64) {
        self.valve.set_rx_credit(n);
    }

    pub fn set_down_credit(&self, n: i64) {
        self.valve.set_tx_credit(n);
    }

    pub fn set_expiry_time(&self, time: i64) {
        self.expiry_time.store(time, Ordering::Release);
    }

    pub fn sessions_cap(&self) -> u32 {
        self.sessions_cap.load(Ordering::Acquire)
    }

    pub fn up_rate(&self) -> i64 {
        self.valve.rx_rate()
    }

    pub fn down_rate(&self) -> i64 {
        self.valve.tx_rate()
    }

    pub fn up_credit(&self) -> i64 {
        self.valve.rx_credit()
    }

    pub fn down_credit(&self) -> i64 {
        self.valve.tx_credit()
    }

    pub fn expiry_time(&self) -> i64 {
        self.expiry_time.load(Ordering::Acquire)
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.expiry_time() < now
    }

    /// Applies a whole policy record one field at a time. Readers running
    /// concurrently may see a mix of old and new fields.
    pub fn update_info(&self, info: &UserInfo) {
        self.set_sessions_cap(info.sessions_cap);
        self.set_up_credit(info.up_credit);
        self.set_down_credit(info.down_credit);
        self.set_up_rate(info.up_rate);
        self.set_down_rate(info.down_rate);
        self.set_expiry_time(info.expiry_time);
        debug!(uid = %hex::encode(&self.uid), "policy updated");
    }

    /// Field by field snapshot of the live policy.
    pub fn info(&self) -> UserInfo {
        UserInfo {
            uid: self.uid.clone(),
            sessions_cap: self.sessions_cap(),
            up_rate: self.up_rate(),
            down_rate: self.down_rate(),
            up_credit: self.up_credit(),
            down_credit: self.down_credit(),
            expiry_time: self.expiry_time(),
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn get_session(&self, session_id: u32) -> Option<Arc<Session>> {
        self.sessions.read().get(&session_id).cloned()
    }

    pub fn put_session(&self, session_id: u32, session: Arc<Session>) {
        self.sessions.write().insert(session_id, session);
    }

    /// Removes a session. When that leaves the user without sessions the
    /// notifier is told, after the lock has been released.
    pub fn del_session(&self, session_id: u32) -> Option<Arc<Session>> {
        let (removed, now_idle) = {
            let mut sessions = self.sessions.write();
            let removed = sessions.remove(&session_id);
            let now_idle = removed.is_some() && sessions.is_empty();
            (removed, now_idle)
        };

        if now_idle {
            self.notify_idle();
        }
        removed
    }

    /// Returns the session for `session_id`, building it on this user's valve
    /// if there is none yet. The flag is `true` when the session already
    /// existed. Concurrent callers with the same id all get the same session.
    pub fn get_or_create_session(
        &self,
        session_id: u32,
        obfs: Obfser,
        deobfs: Deobfser,
        obfsed_read: Arc<dyn ObfsedRead>,
    ) -> (Arc<Session>, bool) {
        let created = self.get_or_insert_with(
            session_id,
            |_| Ok::<(), Infallible>(()),
            || Session::new(session_id, self.valve.clone(), obfs, deobfs, obfsed_read),
        );
        match created {
            Ok(found) => found,
            Err(never) => match never {},
        }
    }

    /// Like [`User::get_or_create_session`] but refuses to build a new
    /// session once the user holds `sessions_cap` of them.
    pub fn try_get_or_create_session(
        &self,
        session_id: u32,
        obfs: Obfser,
        deobfs: Deobfser,
        obfsed_read: Arc<dyn ObfsedRead>,
    ) -> Result<(Arc<Session>, bool)> {
        self.get_or_insert_with(
            session_id,
            |existing| {
                let cap = self.sessions_cap();
                if existing >= cap as usize {
                    return Err(ProxyError::SessionsCapReached {
                        uid: hex::encode(&self.uid),
                        cap,
                    });
                }
                Ok(())
            },
            || Session::new(session_id, self.valve.clone(), obfs, deobfs, obfsed_read),
        )
    }

    fn get_or_insert_with<E>(
        &self,
        session_id: u32,
        admit: impl FnOnce(usize) -> std::result::Result<(), E>,
        make: impl FnOnce() -> Session,
    ) -> std::result::Result<(Arc<Session>, bool), E> {
        let mut sessions = self.sessions.write();
        let existing = sessions.len();
        match sessions.entry(session_id) {
            Entry::Occupied(entry) => Ok((entry.get().clone(), true)),
            Entry::Vacant(entry) => {
                admit(existing)?;
                info!(uid = %hex::encode(&self.uid), session_id, "creating session");
                let session = entry.insert(Arc::new(make()));
                Ok((session.clone(), false))
            }
        }
    }

    /// Closes and drops every session. Notifies idle once if any were live.
    pub fn close_all_sessions(&self) -> usize {
        let closed = self.take_sessions().len();
        if closed > 0 {
            self.notify_idle();
        }
        closed
    }

    /// Closes and drops every session without telling the notifier.
    pub(crate) fn take_sessions(&self) -> Vec<Arc<Session>> {
        let drained: Vec<_> = self.sessions.write().drain().map(|(_, s)| s).collect();
        for session in &drained {
            session.close();
        }
        drained
    }

    fn notify_idle(&self) {
        match self.notifier.upgrade() {
            Some(notifier) => notifier.notify_idle(&self.uid),
            None => debug!(uid = %hex::encode(&self.uid), "idle with no directory to notify"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mux::{Frame, LengthPrefixedRead, plain_deobfser, plain_obfser};
    use parking_lot::Mutex;
    use std::time::Duration;
    use tokio::sync::Barrier;

    #[derive(Default)]
    struct RecordingNotifier {
        idle: Mutex<Vec<Vec<u8>>>,
    }

    impl RecordingNotifier {
        fn calls(&self) -> usize {
            self.idle.lock().len()
        }
    }

    impl IdleNotifier for RecordingNotifier {
        fn notify_idle(&self, uid: &[u8]) {
            self.idle.lock().push(uid.to_vec());
        }
    }

    fn info(up_credit: i64, down_credit: i64, up_rate: i64, down_rate: i64) -> UserInfo {
        UserInfo {
            uid: b"user-uid".to_vec(),
            sessions_cap: 10,
            up_rate,
            down_rate,
            up_credit,
            down_credit,
            expiry_time: i64::MAX,
        }
    }

    fn make_user(info: UserInfo) -> (Arc<User>, Arc<RecordingNotifier>) {
        let notifier = Arc::new(RecordingNotifier::default());
        let weak: Weak<RecordingNotifier> = Arc::downgrade(&notifier);
        (Arc::new(User::new(info, weak)), notifier)
    }

    fn open(user: &User, session_id: u32) -> (Arc<Session>, bool) {
        user.get_or_create_session(
            session_id,
            plain_obfser(),
            plain_deobfser(),
            Arc::new(LengthPrefixedRead),
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_creation_builds_one_session() {
        const CALLERS: usize = 16;
        let (user, _) = make_user(info(0, 0, 0, 0));
        let barrier = Arc::new(Barrier::new(CALLERS));

        let handles: Vec<_> = (0..CALLERS)
            .map(|_| {
                let user = user.clone();
                let barrier = barrier.clone();
                tokio::spawn(async move {
                    barrier.wait().await;
                    open(&user, 7)
                })
            })
            .collect();

        let mut results = Vec::with_capacity(CALLERS);
        for handle in handles {
            results.push(handle.await.unwrap());
        }

        let created = results.iter().filter(|(_, existing)| !existing).count();
        assert_eq!(created, 1);
        let first = &results[0].0;
        assert!(results.iter().all(|(s, _)| Arc::ptr_eq(s, first)));
        assert_eq!(user.session_count(), 1);
    }

    #[test]
    fn sessions_share_the_user_valve() {
        let (user, _) = make_user(info(1000, 1000, 0, 0));
        let (one, _) = open(&user, 1);
        let (two, _) = open(&user, 2);

        assert!(Arc::ptr_eq(one.valve(), two.valve()));
        assert!(Arc::ptr_eq(one.valve(), user.valve()));

        one.valve().consume_tx(300);
        assert_eq!(two.valve().tx_credit(), 700);
        assert_eq!(user.down_credit(), 700);
    }

    #[test]
    fn last_deletion_notifies_once() {
        let (user, notifier) = make_user(info(0, 0, 0, 0));
        open(&user, 1);
        open(&user, 2);

        assert!(user.del_session(1).is_some());
        assert_eq!(notifier.calls(), 0);

        assert!(user.del_session(2).is_some());
        assert_eq!(notifier.calls(), 1);
        assert_eq!(notifier.idle.lock()[0], b"user-uid".to_vec());

        assert!(user.get_session(1).is_none());
        assert!(user.get_session(2).is_none());
    }

    #[test]
    fn deleting_absent_session_is_a_noop() {
        let (user, notifier) = make_user(info(0, 0, 0, 0));
        assert!(user.del_session(42).is_none());
        assert_eq!(notifier.calls(), 0);

        open(&user, 1);
        user.del_session(1);
        user.del_session(1);
        assert_eq!(notifier.calls(), 1);
    }

    #[test]
    fn put_session_replaces() {
        let (user, _) = make_user(info(0, 0, 0, 0));
        let (first, _) = open(&user, 3);
        let replacement = Arc::new(Session::new(
            3,
            user.valve().clone(),
            plain_obfser(),
            plain_deobfser(),
            Arc::new(LengthPrefixedRead),
        ));
        user.put_session(3, replacement.clone());

        let found = user.get_session(3).unwrap();
        assert!(Arc::ptr_eq(&found, &replacement));
        assert!(!Arc::ptr_eq(&found, &first));
        assert_eq!(user.session_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn policy_fields_update_independently() {
        let (user, _) = make_user(info(0, 0, 1, 1));
        let up = {
            let user = user.clone();
            tokio::spawn(async move { user.set_up_rate(100) })
        };
        let down = {
            let user = user.clone();
            tokio::spawn(async move { user.set_down_rate(200) })
        };
        up.await.unwrap();
        down.await.unwrap();

        assert_eq!((user.up_rate(), user.down_rate()), (100, 200));
    }

    #[test]
    fn update_info_applies_every_field() {
        let (user, _) = make_user(info(1, 2, 3, 4));
        let mut next = info(10, 20, 30, 40);
        next.sessions_cap = 2;
        next.expiry_time = 99;
        user.update_info(&next);

        assert_eq!(user.info(), next);
        assert!(user.is_expired(100));
        assert!(!user.is_expired(99));

        user.add_up_credit(5);
        user.add_down_credit(-25);
        assert_eq!(user.up_credit(), 15);
        assert_eq!(user.down_credit(), -5);
    }

    #[test]
    fn capped_creation_refuses_new_ids_only() {
        let mut capped = info(0, 0, 0, 0);
        capped.sessions_cap = 1;
        let (user, _) = make_user(capped);

        let try_open = |id| {
            user.try_get_or_create_session(
                id,
                plain_obfser(),
                plain_deobfser(),
                Arc::new(LengthPrefixedRead),
            )
        };

        let (first, existing) = try_open(1).unwrap();
        assert!(!existing);
        let (again, existing) = try_open(1).unwrap();
        assert!(existing);
        assert!(Arc::ptr_eq(&first, &again));

        assert!(matches!(
            try_open(2),
            Err(ProxyError::SessionsCapReached { cap: 1, .. })
        ));

        user.set_sessions_cap(2);
        assert!(try_open(2).is_ok());
        assert_eq!(user.session_count(), 2);
    }

    #[tokio::test]
    async fn deleted_session_stays_usable_by_holders() {
        let (user, notifier) = make_user(info(1000, 1000, 0, 0));
        let (session, _) = open(&user, 1);
        user.del_session(1);
        assert_eq!(notifier.calls(), 1);

        let (mut client, _server) = tokio::io::duplex(1024);
        let written = session
            .write_frame(&mut client, &Frame::new(1, 0, &b"late"[..]))
            .await
            .unwrap();
        assert_eq!(user.down_credit(), 1000 - written as i64);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn writers_blocked_on_credit_survive_deletion() {
        const WRITERS: usize = 4;
        let (user, notifier) = make_user(info(0, 0, 0, 0));
        let (session, _) = open(&user, 1);

        let writers: Vec<_> = (0..WRITERS)
            .map(|i| {
                let session = session.clone();
                tokio::spawn(async move {
                    let (mut client, _server) = tokio::io::duplex(1024);
                    session
                        .write_frame(&mut client, &Frame::new(1, i as u64, &b"blocked"[..]))
                        .await
                })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(writers.iter().all(|w| !w.is_finished()));

        assert!(user.del_session(1).is_some());
        assert_eq!(notifier.calls(), 1);
        user.add_down_credit(10_000);

        let mut total = 0;
        for writer in writers {
            let written = tokio::time::timeout(Duration::from_secs(5), writer)
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            assert_eq!(written, 2 + mux::FRAME_HEADER_LEN + b"blocked".len());
            total += written as i64;
        }
        assert_eq!(user.down_credit(), 10_000 - total);
    }

    #[test]
    fn close_all_sessions_closes_and_notifies() {
        let (user, notifier) = make_user(info(0, 0, 0, 0));
        let (one, _) = open(&user, 1);
        let (two, _) = open(&user, 2);

        assert_eq!(user.close_all_sessions(), 2);
        assert!(one.is_closed() && two.is_closed());
        assert_eq!(user.session_count(), 0);
        assert_eq!(notifier.calls(), 1);

        assert_eq!(user.close_all_sessions(), 0);
        assert_eq!(notifier.calls(), 1);
    }

    #[test]
    fn dropped_directory_is_tolerated() {
        let (user, notifier) = make_user(info(0, 0, 0, 0));
        drop(notifier);
        open(&user, 1);
        assert!(user.del_session(1).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn two_sessions_drain_shared_credit_into_debt() {
        let (user, _) = make_user(info(1000, 1000, 100, 100));
        let (one, _) = open(&user, 1);
        let (two, _) = open(&user, 2);

        let start = Instant::now();
        let (first, second) = tokio::join!(
            async {
                one.valve().tx_wait(400).await;
                start.elapsed()
            },
            async {
                two.valve().tx_wait(700).await;
                start.elapsed()
            },
        );

        assert_eq!(user.down_credit(), -100);
        assert!(first > Duration::ZERO);
        assert!(second > Duration::ZERO);

        // In debt: the next transfer waits for a grant.
        let blocked = tokio::time::timeout(Duration::from_secs(5), one.valve().tx_wait(1)).await;
        assert!(blocked.is_err());

        user.add_down_credit(200);
        one.valve().tx_wait(1).await;
        assert_eq!(user.down_credit(), 99);
    }
}
