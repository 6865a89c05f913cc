//! Backup artifact records.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackupKind {
    Database,
    Media,
}

impl std::fmt::Display for BackupKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackupKind::Database => write!(f, "database"),
            BackupKind::Media => write!(f, "media"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BackupRecord {
    pub id: String,
    pub kind: String,
    pub file_path: String,
    pub remote_key: Option<String>,
    pub size_bytes: i64,
    pub created_at: String,
}
