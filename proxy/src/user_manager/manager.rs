use super::user_info::UserInfo;
use crate::config::UsersConfig;
use crate::error::{ProxyError, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{info, instrument};

/// Source of truth for the policy of every known user.
#[async_trait]
pub trait UserManager: Send + Sync {
    /// Looks up the stored policy of `uid`.
    async fn authenticate_user(&self, uid: &[u8]) -> Result<UserInfo>;

    async fn list_users(&self) -> Result<Vec<UserInfo>>;

    /// Inserts or replaces a user.
    async fn write_user_info(&self, info: UserInfo) -> Result<()>;

    async fn delete_user(&self, uid: &[u8]) -> Result<()>;

    /// Stores the live credit of users as observed by the proxy.
    async fn upload_status(&self, statuses: Vec<UserInfo>) -> Result<()>;
}

/// Users kept in memory and, when a path is given, mirrored to a TOML file.
pub struct LocalUserManager {
    users: RwLock<HashMap<Vec<u8>, UserInfo>>,
    users_path: Option<PathBuf>,
}

impl LocalUserManager {
    pub fn new(users: Vec<UserInfo>) -> Self {
        Self {
            users: RwLock::new(users.into_iter().map(|u| (u.uid.clone(), u)).collect()),
            users_path: None,
        }
    }

    /// Loads the users file, creating an empty one if it does not exist yet.
    #[instrument(skip(path), fields(path = %path.as_ref().display()))]
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let config = if path.exists() {
            UsersConfig::load(path)?
        } else {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let empty = UsersConfig::default();
            empty.save(path)?;
            empty
        };

        info!("Loaded {} users", config.users.len());
        let mut manager = Self::new(config.users);
        manager.users_path = Some(path.to_path_buf());
        Ok(manager)
    }

    fn persist(&self) -> Result<()> {
        let Some(path) = &self.users_path else {
            return Ok(());
        };
        let mut users: Vec<UserInfo> = self.users.read().values().cloned().collect();
        users.sort_by(|a, b| a.uid.cmp(&b.uid));
        UsersConfig { users }.save(path)
    }
}

#[async_trait]
impl UserManager for LocalUserManager {
    async fn authenticate_user(&self, uid: &[u8]) -> Result<UserInfo> {
        self.users
            .read()
            .get(uid)
            .cloned()
            .ok_or_else(|| ProxyError::UserNotFound(hex::encode(uid)))
    }

    async fn list_users(&self) -> Result<Vec<UserInfo>> {
        Ok(self.users.read().values().cloned().collect())
    }

    #[instrument(skip(self, info), fields(uid = %hex::encode(&info.uid)))]
    async fn write_user_info(&self, info: UserInfo) -> Result<()> {
        self.users.write().insert(info.uid.clone(), info);
        info!("User written");
        self.persist()
    }

    #[instrument(skip(self, uid), fields(uid = %hex::encode(uid)))]
    async fn delete_user(&self, uid: &[u8]) -> Result<()> {
        if self.users.write().remove(uid).is_none() {
            return Err(ProxyError::UserNotFound(hex::encode(uid)));
        }
        info!("User deleted");
        self.persist()
    }

    async fn upload_status(&self, statuses: Vec<UserInfo>) -> Result<()> {
        if statuses.is_empty() {
            return Ok(());
        }
        {
            let mut users = self.users.write();
            for status in statuses {
                // Users deleted meanwhile stay deleted.
                if let Some(stored) = users.get_mut(&status.uid) {
                    stored.up_credit = status.up_credit;
                    stored.down_credit = status.down_credit;
                }
            }
        }
        self.persist()
    }
}
