//! Directory lookups against the platform's relational store.
//!
//! The hub needs two facts it does not own: who belongs to a study group
//! (queried every time a group message is published, since membership
//! changes between authoring and fan-out) and the college, department and
//! semester of a connecting user (captured once per session for
//! announcement targeting).
//!
//! [`Directory`] is the seam; [`RestDirectory`] talks to the store's
//! PostgREST interface and [`InMemoryDirectory`] backs tests and local runs.
//!
//! # Example
//!
//! ```rust,ignore
//! use unilink_hub::directory::{Directory, RestDirectory};
//!
//! let directory = RestDirectory::new("https://db.campus.test", "service-key")?;
//! let members = directory.group_member_ids(12).await?;
//! ```

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error};

use crate::session::Snapshot;
use crate::types::{CollegeId, GroupId, UserId};

/// Default timeout for directory requests.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors that can occur when querying the directory.
///
/// The variants let the connection entry point answer 404 for unknown users
/// and 503 when the store itself is unreachable.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    /// The requested user or group does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// The request timed out.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The store is unreachable.
    #[error("directory unavailable: {0}")]
    Unavailable(String),

    /// The store answered with something unexpected.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Client configuration error, such as an invalid base URL.
    #[error("client configuration error: {0}")]
    Configuration(String),
}

/// Targeting-relevant profile of a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: UserId,
    pub college_id: CollegeId,
    #[serde(default)]
    pub department: Option<String>,
    #[serde(default)]
    pub semester: Option<u32>,
}

impl UserProfile {
    /// Snapshot of the attributes announcements are matched against.
    ///
    /// Blank departments and a zero semester are stored by the platform for
    /// users who never filled them in; both are treated as absent.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            college_id: self.college_id,
            department: self
                .department
                .as_ref()
                .map(|d| d.trim())
                .filter(|d| !d.is_empty())
                .map(str::to_string),
            semester: self.semester.filter(|s| *s > 0),
        }
    }
}

/// Source of membership and profile facts used for targeting.
#[async_trait]
pub trait Directory: Send + Sync + 'static {
    /// Current member user IDs of a group.
    async fn group_member_ids(&self, group_id: GroupId) -> Result<Vec<UserId>, DirectoryError>;

    /// Profile of a single user.
    async fn user_profile(&self, user_id: UserId) -> Result<UserProfile, DirectoryError>;
}

#[derive(Debug, Deserialize)]
struct GroupMemberRow {
    user_id: UserId,
}

/// Directory backed by the store's PostgREST API.
///
/// Reads `group_members` and `users` with the service key. The underlying
/// `reqwest::Client` is shared across clones.
#[derive(Debug, Clone)]
pub struct RestDirectory {
    http_client: Client,
    base_url: String,
    api_key: String,
}

impl RestDirectory {
    /// Creates a directory client.
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError::Configuration`] if the HTTP client cannot be
    /// built.
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Result<Self, DirectoryError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();

        let http_client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| {
                DirectoryError::Configuration(format!("failed to create HTTP client: {e}"))
            })?;

        Ok(Self {
            http_client,
            base_url,
            api_key: api_key.into(),
        })
    }

    /// Returns the configured base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get_rows<T>(&self, table: &str, query: &[(&str, String)]) -> Result<Vec<T>, DirectoryError>
    where
        T: for<'de> Deserialize<'de>,
    {
        let url = format!("{}/rest/v1/{table}", self.base_url);

        debug!(url = %url, "Querying directory");

        let response = self
            .http_client
            .get(&url)
            .query(query)
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DirectoryError::Timeout(REQUEST_TIMEOUT)
                } else if e.is_connect() {
                    DirectoryError::Unavailable(format!("connection failed: {e}"))
                } else {
                    DirectoryError::Unavailable(format!("request failed: {e}"))
                }
            })?;

        let status = response.status();

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            error!(status = %status, table, "Directory rejected the service key");
            return Err(DirectoryError::Configuration(format!(
                "directory rejected credentials with status {status}"
            )));
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, table, "Unexpected directory response");
            return Err(DirectoryError::InvalidResponse(format!(
                "unexpected status {status}: {body}"
            )));
        }

        response.json().await.map_err(|e| {
            DirectoryError::InvalidResponse(format!("failed to parse {table} rows: {e}"))
        })
    }
}

#[async_trait]
impl Directory for RestDirectory {
    async fn group_member_ids(&self, group_id: GroupId) -> Result<Vec<UserId>, DirectoryError> {
        let rows: Vec<GroupMemberRow> = self
            .get_rows(
                "group_members",
                &[
                    ("select", "user_id".to_string()),
                    ("group_id", format!("eq.{group_id}")),
                ],
            )
            .await?;

        debug!(group_id, members = rows.len(), "Resolved group members");

        Ok(rows.into_iter().map(|row| row.user_id).collect())
    }

    async fn user_profile(&self, user_id: UserId) -> Result<UserProfile, DirectoryError> {
        let rows: Vec<UserProfile> = self
            .get_rows(
                "users",
                &[
                    ("select", "id,college_id,department,semester".to_string()),
                    ("id", format!("eq.{user_id}")),
                    ("limit", "1".to_string()),
                ],
            )
            .await?;

        rows.into_iter()
            .next()
            .ok_or_else(|| DirectoryError::NotFound(format!("user {user_id}")))
    }
}

/// Directory held in process memory.
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    users: RwLock<HashMap<UserId, UserProfile>>,
    groups: RwLock<HashMap<GroupId, Vec<UserId>>>,
}

impl InMemoryDirectory {
    /// Creates an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a user profile.
    pub fn insert_user(&self, profile: UserProfile) {
        self.users
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(profile.id, profile);
    }

    /// Replaces the member list of a group.
    pub fn set_group_members(&self, group_id: GroupId, members: impl IntoIterator<Item = UserId>) {
        self.groups
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(group_id, members.into_iter().collect());
    }
}

#[async_trait]
impl Directory for InMemoryDirectory {
    async fn group_member_ids(&self, group_id: GroupId) -> Result<Vec<UserId>, DirectoryError> {
        let groups = self.groups.read().unwrap_or_else(PoisonError::into_inner);
        groups
            .get(&group_id)
            .cloned()
            .ok_or_else(|| DirectoryError::NotFound(format!("group {group_id}")))
    }

    async fn user_profile(&self, user_id: UserId) -> Result<UserProfile, DirectoryError> {
        let users = self.users.read().unwrap_or_else(PoisonError::into_inner);
        users
            .get(&user_id)
            .cloned()
            .ok_or_else(|| DirectoryError::NotFound(format!("user {user_id}")))
    }
}
