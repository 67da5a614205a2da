use serde::Deserialize;

use crate::error::{Error, Result};
use crate::registry::{SyncRecord, UserRecord};

#[derive(Deserialize)]
struct UsersResponse {
    users: Vec<UserRecord>,
}

/// `GET {endpoint}` → `{"users": [...]}`, per spec's remote sync wire
/// shape.
pub async fn pull(endpoint: &str) -> Result<Vec<UserRecord>> {
    let response = reqwest::get(endpoint)
        .await
        .map_err(|e| Error::Sync(format!("GET {endpoint} failed: {e}")))?
        .error_for_status()
        .map_err(|e| Error::Sync(format!("GET {endpoint} returned an error status: {e}")))?;

    let parsed: UsersResponse = response
        .json()
        .await
        .map_err(|e| Error::Sync(format!("GET {endpoint} returned invalid JSON: {e}")))?;
    Ok(parsed.users)
}

/// `POST {endpoint}` with `{"data": [...]}` — the accumulated accounting
/// records drained from users with `need_sync` set.
pub async fn push(endpoint: &str, records: &[SyncRecord]) -> Result<()> {
    let client = reqwest::Client::new();
    let body = serde_json::json!({ "data": records });
    client
        .post(endpoint)
        .json(&body)
        .send()
        .await
        .map_err(|e| Error::Sync(format!("POST {endpoint} failed: {e}")))?
        .error_for_status()
        .map_err(|e| Error::Sync(format!("POST {endpoint} returned an error status: {e}")))?;
    Ok(())
}
