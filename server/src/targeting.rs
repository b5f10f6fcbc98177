//! Audience resolution for published events.
//!
//! Each event kind has its own rule for who receives it:
//!
//! | Kind | Audience |
//! |------|----------|
//! | `newMessage` in `dm_<a>_<b>` | both participants, sender included |
//! | `newMessage` in `group_<id>` | current group members, sender excluded |
//! | `newAnnouncement` | live sessions whose snapshot matches the scope |
//! | `newFriendRequest` | `friendId` |
//! | `friendRequestUpdate` | `userId` (the original requester) |
//! | `friendRemoved` | `removedUser` |
//!
//! [`resolve`] is pure: group membership is left as
//! [`Audience::GroupMembers`] for the hub to look up, and announcements are
//! returned as an [`AnnouncementFilter`] to run against the registry.

use thiserror::Error;
use tracing::warn;

use crate::session::Snapshot;
use crate::types::{CollegeId, ConversationError, ConversationId, Event, GroupId, UserId};

/// Errors that make an event undeliverable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TargetingError {
    #[error("invalid conversation id: {0}")]
    Conversation(#[from] ConversationError),
}

/// Who an event is for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Audience {
    /// Explicit users, without duplicates.
    Users(Vec<UserId>),

    /// Members of a group at delivery time, minus `exclude`.
    GroupMembers { group_id: GroupId, exclude: UserId },

    /// Every live session whose snapshot matches.
    Announcement(AnnouncementFilter),
}

/// Resolves the audience of an event.
///
/// # Errors
///
/// Returns [`TargetingError`] when a chat message names a conversation that
/// cannot be parsed.
pub fn resolve(event: &Event) -> Result<Audience, TargetingError> {
    match event {
        Event::NewMessage(message) => {
            let conversation: ConversationId = message.conversation_id.parse()?;
            let sender = message.sender.id;

            match conversation {
                ConversationId::Direct { low, high } => {
                    if sender != low && sender != high {
                        warn!(
                            conversation_id = %conversation,
                            sender_id = sender,
                            "Direct message sender is not a participant"
                        );
                    }
                    Ok(Audience::Users(dedup(vec![low, high])))
                }
                ConversationId::Group(group_id) => Ok(Audience::GroupMembers {
                    group_id,
                    exclude: sender,
                }),
            }
        }
        Event::NewAnnouncement(announcement) => {
            let mut filter = AnnouncementFilter::new(announcement.college_id);
            if let Some(department) = &announcement.department {
                filter = filter.with_department(department.clone());
            }
            if let Some(semester) = announcement.semester {
                filter = filter.with_semester(semester);
            }
            Ok(Audience::Announcement(filter))
        }
        Event::NewFriendRequest(request) => Ok(Audience::Users(vec![request.friend_id])),
        Event::FriendRequestUpdate(update) => Ok(Audience::Users(vec![update.user_id])),
        Event::FriendRemoved(removed) => Ok(Audience::Users(vec![removed.removed_user])),
    }
}

/// Recipients of a group message once membership is known.
pub fn group_recipients(members: Vec<UserId>, exclude: UserId) -> Vec<UserId> {
    dedup(members.into_iter().filter(|id| *id != exclude).collect())
}

fn dedup(mut users: Vec<UserId>) -> Vec<UserId> {
    users.sort_unstable();
    users.dedup();
    users
}

/// Announcement scope matched against session snapshots.
///
/// The college must always match. Department and semester narrow the scope
/// only when set; an unset field matches every session.
///
/// # Example
///
/// ```
/// use unilink_hub::session::Snapshot;
/// use unilink_hub::targeting::AnnouncementFilter;
///
/// let student = Snapshot {
///     college_id: 7,
///     department: Some("CS".to_string()),
///     semester: Some(4),
/// };
///
/// assert!(AnnouncementFilter::new(7).matches(&student));
/// assert!(AnnouncementFilter::new(7).with_department("CS").matches(&student));
/// assert!(!AnnouncementFilter::new(7).with_semester(2).matches(&student));
/// assert!(!AnnouncementFilter::new(8).matches(&student));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnouncementFilter {
    pub college_id: CollegeId,
    pub department: Option<String>,
    pub semester: Option<u32>,
}

impl AnnouncementFilter {
    /// Scope covering a whole college.
    pub fn new(college_id: CollegeId) -> Self {
        Self {
            college_id,
            department: None,
            semester: None,
        }
    }

    /// Narrows the scope to one department.
    #[must_use]
    pub fn with_department(mut self, department: impl Into<String>) -> Self {
        self.department = Some(department.into());
        self
    }

    /// Narrows the scope to one semester.
    #[must_use]
    pub fn with_semester(mut self, semester: u32) -> Self {
        self.semester = Some(semester);
        self
    }

    /// Whether a session with this snapshot is in scope.
    pub fn matches(&self, snapshot: &Snapshot) -> bool {
        if snapshot.college_id != self.college_id {
            return false;
        }

        if let Some(ref department) = self.department {
            if snapshot.department.as_ref() != Some(department) {
                return false;
            }
        }

        if let Some(semester) = self.semester {
            if snapshot.semester != Some(semester) {
                return false;
            }
        }

        true
    }
}
