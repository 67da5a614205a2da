use crate::error::{Error, Result};
use crate::registry::UserRecord;

#[derive(serde::Deserialize)]
struct UserFile {
    users: Vec<UserRecord>,
}

/// Loads the desired user set from a local JSON file, shaped
/// `{ "users": [ { "user_id", "port", "method", "password", "enable" }, ... ] }`.
pub async fn load(path: &str) -> Result<Vec<UserRecord>> {
    let path = path.to_string();
    let content = tokio::task::spawn_blocking(move || std::fs::read_to_string(&path))
        .await
        .map_err(|e| Error::Sync(format!("json source task panicked: {e}")))?
        .map_err(|e| Error::Sync(format!("reading user config file failed: {e}")))?;

    let parsed: UserFile = serde_json::from_str(&content)
        .map_err(|e| Error::Sync(format!("user config file is not valid JSON: {e}")))?;
    Ok(parsed.users)
}
