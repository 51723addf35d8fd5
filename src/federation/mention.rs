//! Mention and recipient resolution
//!
//! Finds the local groups a note is addressed to. Every `to`, `cc` and
//! `Mention` tag entry is mapped to a `user@host` handle; handles on the
//! local domain that name an existing group are the destinations.

use std::collections::HashSet;
use std::sync::Arc;

use super::activity::NoteObject;
use super::webfinger::RemoteDirectory;
use crate::config::AppConfig;
use crate::data::{Database, Group};
use crate::error::AppError;

pub struct MentionResolver {
    config: Arc<AppConfig>,
    db: Arc<Database>,
    directory: Arc<RemoteDirectory>,
}

impl MentionResolver {
    pub fn new(config: Arc<AppConfig>, db: Arc<Database>, directory: Arc<RemoteDirectory>) -> Self {
        Self {
            config,
            db,
            directory,
        }
    }

    /// Deduplicated handles of everything the note addresses or mentions.
    ///
    /// Entries that cannot be resolved are skipped.
    pub async fn resolve_handles(&self, note: &NoteObject) -> Vec<String> {
        let mut seen_urls = HashSet::new();
        let mut handles = Vec::new();
        let mut seen_handles = HashSet::new();

        let candidates = note
            .to
            .iter()
            .chain(note.cc.iter())
            .map(String::as_str)
            .chain(note.mention_hrefs());

        for url in candidates {
            if !seen_urls.insert(url) {
                continue;
            }
            match self.directory.handle_from_url(url).await {
                Ok(Some(handle)) => {
                    if seen_handles.insert(handle.clone()) {
                        handles.push(handle);
                    }
                }
                Ok(None) => {}
                Err(e) => tracing::debug!(url = %url, error = %e, "Skipping unresolvable recipient"),
            }
        }

        handles
    }

    /// Local groups the note is addressed to. Unknown local names are dropped.
    pub async fn resolve_groups(&self, note: &NoteObject) -> Result<Vec<Group>, AppError> {
        let local_suffix = format!("@{}", self.config.server.domain.to_ascii_lowercase());
        let mut groups = Vec::new();

        for handle in self.resolve_handles(note).await {
            let Some(name) = handle.strip_suffix(&local_suffix) else {
                continue;
            };
            match self.db.get_group(name).await? {
                Some(group) => groups.push(group),
                None => tracing::debug!(handle = %handle, "Mentioned local group does not exist"),
            }
        }

        Ok(groups)
    }
}
