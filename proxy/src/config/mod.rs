mod proxy_config;
mod users_config;

pub use proxy_config::ProxyConfig;
pub use users_config::UsersConfig;
