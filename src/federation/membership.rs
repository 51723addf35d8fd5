//! Posting permission for groups

use std::sync::Arc;

use crate::data::{Database, Group};
use crate::error::AppError;

/// Decides whether an actor may post into a group.
///
/// Members may always post. Anyone may reply into a thread the group has
/// already boosted, so open discussions stay open while top-level posts
/// remain members-only.
pub struct MembershipGate {
    db: Arc<Database>,
}

impl MembershipGate {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// # Arguments
    /// * `group` - Target group
    /// * `actor_handle` - `user@host` of the posting actor
    /// * `in_reply_to` - Remote id of the note being replied to, if any
    pub async fn allowed(
        &self,
        group: &Group,
        actor_handle: &str,
        in_reply_to: Option<&str>,
    ) -> Result<bool, AppError> {
        if let Some(actor) = self.db.get_actor_by_handle(actor_handle).await? {
            if self.db.is_member(&group.id, &actor.id).await? {
                return Ok(true);
            }
        }

        let Some(parent) = in_reply_to else {
            return Ok(false);
        };

        let in_thread = self
            .db
            .get_boost_by_note_id(parent)
            .await?
            .is_some_and(|boost| boost.group_id == group.id);
        Ok(in_thread)
    }
}
