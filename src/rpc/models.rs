use serde::{Deserialize, Serialize};

use crate::registry::UserRecord;

#[derive(Debug, Serialize)]
pub struct UserResponse {
    pub user_id: i64,
    pub port: u16,
    pub method: String,
    pub enable: bool,
    pub tcp_conn_num: i64,
    pub upload_bytes: u64,
    pub download_bytes: u64,
    pub used_traffic: u64,
    pub access_order: u64,
}

#[derive(Debug, Serialize)]
pub struct ListUsersResponse {
    pub users: Vec<UserResponse>,
}

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
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

impl From<CreateUserRequest> for UserRecord {
    fn from(req: CreateUserRequest) -> Self {
        UserRecord {
            user_id: req.user_id,
            port: req.port,
            method: req.method,
            password: req.password,
            enable: req.enable,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct UpdateUserRequest {
    pub port: u16,
    pub method: String,
    pub password: String,
    pub enable: bool,
}

#[derive(Debug, Deserialize)]
pub struct FindAccessUserRequest {
    pub port: u16,
    pub method: String,
    pub transport: String,
    /// Base64-encoded first frame (TCP's salt+length-frame, or UDP's
    /// salt+ciphertext+tag).
    pub first_data: String,
}

#[derive(Debug, Serialize)]
pub struct FindAccessUserResponse {
    pub user_id: i64,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub active_ports: usize,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}
