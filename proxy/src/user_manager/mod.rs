//! Users as seen by the proxy: their policy records, the active-user
//! directory and the per-user session registry.

mod manager;
mod panel;
mod user;
mod user_info;

pub use manager::{LocalUserManager, UserManager};
pub use panel::Userpanel;
pub use user::{IdleNotifier, User};
pub use user_info::{UID_LEN, UserInfo, arr_uid};
