pub mod config;
pub mod error;
pub mod telemetry;
pub mod user_manager;

pub use error::{ProxyError, Result};
pub use user_manager::{IdleNotifier, LocalUserManager, User, UserInfo, UserManager, Userpanel};
