use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// Field names follow the stored document layout, so these types can be
// encoded straight into either backend.

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    #[serde(rename = "_id")]
    pub id: String,
    pub username: String,
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub own_channels: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unclassified_channel: Option<String>,
    /// Password-reset token, present only while a reset is pending.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_key: Option<String>,
    pub created: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserBasicInfo {
    #[serde(rename = "_id")]
    pub id: String,
    pub username: String,
    pub email: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    #[default]
    Default,
    /// The per-user intake channel that collects unsorted programs.
    Unclassified,
}

impl ChannelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelType::Default => "default",
            ChannelType::Unclassified => "unclassified",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ChannelCover {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelPermission {
    pub user_id: String,
    #[serde(default)]
    pub admin: bool,
    #[serde(default)]
    pub read: bool,
    #[serde(default)]
    pub write: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: ChannelType,
    pub name: String,
    #[serde(default)]
    pub desc: String,
    #[serde(default)]
    pub tags: Vec<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cover: Option<ChannelCover>,
    #[serde(default)]
    pub contents_seq: String,
    #[serde(default)]
    pub contents: Vec<Program>,
    /// Custom program order; empty means natural order.
    #[serde(default)]
    pub contents_order: Vec<i64>,
    #[serde(default)]
    pub owners: Vec<String>,
    #[serde(default)]
    pub permission: Vec<ChannelPermission>,
    pub created: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

impl Channel {
    pub fn is_owner(&self, user_id: &str) -> bool {
        self.owners.iter().any(|o| o == user_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgramType {
    #[default]
    Youtube,
}

impl ProgramType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgramType::Youtube => "youtube",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    #[serde(rename = "_id")]
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub desc: String,
    /// Seconds.
    #[serde(default)]
    pub duration: i64,
    #[serde(rename = "type", default)]
    pub kind: ProgramType,
    #[serde(default)]
    pub youtube_id: String,
    #[serde(default)]
    pub tags: Vec<i64>,
    pub created: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Counter {
    #[serde(rename = "_id")]
    pub id: String,
    pub seq: i64,
}

/// Audit entry for a structural migration that has been applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationRecord {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default)]
    pub description: String,
    pub executed_at: DateTime<Utc>,
}
