//! Reply thread resolution
//!
//! Walks the `inReplyTo` chain of a remote note and stores every missing
//! ancestor as a boost of the group, parents before children. The walk
//! is iterative and bounded by `federation.max_thread_depth`; an already
//! stored boost ends it, as does a note id seen twice in one walk.

use std::collections::HashSet;
use std::sync::Arc;

use super::activity::NoteObject;
use super::webfinger::{RemoteDirectory, is_public_collection};
use crate::config::AppConfig;
use crate::data::{Boost, Database, Group, NewBoost, NewRecipient, RecipientType, Upsert};
use crate::error::AppError;

pub struct ThreadResolver {
    config: Arc<AppConfig>,
    db: Arc<Database>,
    directory: Arc<RemoteDirectory>,
}

impl ThreadResolver {
    pub fn new(config: Arc<AppConfig>, db: Arc<Database>, directory: Arc<RemoteDirectory>) -> Self {
        Self {
            config,
            db,
            directory,
        }
    }

    /// Resolve a note id and its ancestors into stored boosts.
    ///
    /// Returns the boost for `note_id` itself, or `None` when there is
    /// nothing to link to: no id, the first fetch failed, the depth
    /// bound was already reached, or the note is stored for another group.
    /// Replies never link to a boost of another group.
    pub async fn resolve_chain(&self, note_id: Option<&str>, group: &Group) -> Result<Option<Boost>, AppError> {
        let max_depth = self.config.federation.max_thread_depth;
        let mut fetched: Vec<NoteObject> = Vec::new();
        let mut seen = HashSet::new();
        let mut anchor = None;
        let mut next = note_id.map(str::to_string);
        let mut depth = 1;

        while let Some(id) = next.take() {
            if depth > max_depth {
                tracing::debug!(note = %id, max_depth, "Thread truncated at depth bound");
                break;
            }
            if !seen.insert(id.clone()) {
                tracing::debug!(note = %id, "Reply cycle detected");
                break;
            }
            if let Some(boost) = self.db.get_boost_by_note_id(&id).await? {
                if boost.group_id == group.id {
                    anchor = Some(boost);
                } else {
                    tracing::debug!(note = %id, "Ancestor belongs to another group, truncating thread");
                }
                break;
            }

            match self.directory.fetch_note(&id).await {
                Ok(note) => {
                    next = note.in_reply_to.clone();
                    fetched.push(note);
                    depth += 1;
                }
                Err(e) => {
                    tracing::info!(note = %id, error = %e, "Could not fetch ancestor, truncating thread");
                    break;
                }
            }
        }

        let mut parent = anchor;
        for note in fetched.iter().rev() {
            let parent_id = parent.as_ref().map(|boost| boost.id.clone());
            parent = Some(self.store_note(note, group, parent_id).await?.into_inner());
        }

        Ok(parent)
    }

    /// Store a remote note as a boost of the group.
    ///
    /// Existing boosts for the same note id are returned unchanged.
    pub async fn store_note(
        &self,
        note: &NoteObject,
        group: &Group,
        in_reply_to_id: Option<String>,
    ) -> Result<Upsert<Boost>, AppError> {
        let original_poster_id = match note.attributed_to.as_deref() {
            Some(url) => self.actor_id_for_url(url).await?,
            None => None,
        };

        let mut recipients = Vec::with_capacity(note.to.len() + note.cc.len());
        for (urls, recipient_type) in [(&note.to, RecipientType::To), (&note.cc, RecipientType::Cc)] {
            for url in urls {
                let actor_id = if is_public_collection(url) {
                    None
                } else {
                    self.actor_id_for_url(url).await?
                };
                recipients.push(NewRecipient {
                    url: url.clone(),
                    recipient_type,
                    actor_id,
                });
            }
        }

        let boost = NewBoost {
            note_id: note.id.clone(),
            group_id: group.id.clone(),
            original_poster_id,
            in_reply_to_id,
            content: ammonia::clean(note.content.as_deref().unwrap_or_default()),
            source: note.source_text(),
            summary: note.summary.clone().unwrap_or_default(),
            sensitive: note.sensitive,
            attachments: note
                .attachment
                .as_ref()
                .filter(|attachment| !attachment.is_null())
                .map(|attachment| attachment.to_string()),
            original_time: note.published_at(),
            recipients,
        };

        let stored = self.db.create_boost(&boost).await?;
        if stored.is_created() {
            tracing::info!(note = %note.id, group = %group.name, "Stored boost");
        }
        Ok(stored)
    }

    /// Actor row for a URL, or `None` when it does not denote an actor
    async fn actor_id_for_url(&self, url: &str) -> Result<Option<String>, AppError> {
        match self.directory.handle_from_url(url).await {
            Ok(Some(handle)) => Ok(Some(self.db.get_or_create_actor(&handle).await?.id)),
            Ok(None) => Ok(None),
            Err(e) => {
                tracing::debug!(url = %url, error = %e, "Recipient does not resolve to an actor");
                Ok(None)
            }
        }
    }
}
