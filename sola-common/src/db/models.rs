//! Database models

use crate::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Admission rights of one account class
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::FromRow)]
pub struct Tier {
    pub concurrency: i64,
    pub quota: i64,
    pub priority: i64,
}

/// Row of `user_view`
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct UserRecord {
    pub id: i64,
    pub quota: i64,
    pub concurrency: i64,
    pub priority: i64,
}

/// Processing state of one uploaded file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QueueStatus {
    Uploaded,
    Hashing,
    Hashed,
    Loading,
    Loaded,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Uploaded => "UPLOADED",
            QueueStatus::Hashing => "HASHING",
            QueueStatus::Hashed => "HASHED",
            QueueStatus::Loading => "LOADING",
            QueueStatus::Loaded => "LOADED",
        }
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UPLOADED" => Ok(QueueStatus::Uploaded),
            "HASHING" => Ok(QueueStatus::Hashing),
            "HASHED" => Ok(QueueStatus::Hashed),
            "LOADING" => Ok(QueueStatus::Loading),
            "LOADED" => Ok(QueueStatus::Loaded),
            other => Err(Error::InvalidInput(format!("Unknown queue status: {}", other))),
        }
    }
}

/// One file in the processing queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueRow {
    pub path: String,
    pub status: QueueStatus,
}
