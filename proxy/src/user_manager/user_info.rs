use serde::{Deserialize, Serialize};

/// Length of the fixed-size key a UID is folded into.
pub const UID_LEN: usize = 32;

/// Policy record of one user as provisioned by the user manager.
///
/// Field names on the wire match the admin tooling (`UID`, `SessionsCap`,
/// `UpRate`, ...). The UID is carried as base64 text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UserInfo {
    #[serde(rename = "UID", with = "uid_base64")]
    pub uid: Vec<u8>,
    pub sessions_cap: u32,
    pub up_rate: i64,
    pub down_rate: i64,
    pub up_credit: i64,
    pub down_credit: i64,
    pub expiry_time: i64,
}

/// Folds a UID into a fixed-size key, truncating or zero padding it. The
/// folded key is not unique; lookups go by the full UID.
pub fn arr_uid(uid: &[u8]) -> [u8; UID_LEN] {
    let mut arr = [0u8; UID_LEN];
    let len = uid.len().min(UID_LEN);
    arr[..len].copy_from_slice(&uid[..len]);
    arr
}

mod uid_base64 {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(uid: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(uid))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}
