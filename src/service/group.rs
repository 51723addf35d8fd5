//! Group service
//!
//! Locally originated group actions: creating groups, posting messages
//! as a group and boosting remote notes into a group.

use std::sync::Arc;

use crate::config::AppConfig;
use crate::data::{Database, EntityId, Group, NewNote, NewRecipient, Note, RecipientType};
use crate::error::AppError;
use crate::federation::{
    DeliveryFanout, DeliveryResult, PUBLIC_COLLECTION, RemoteDirectory, ThreadResolver, builder,
};

#[cfg(test)]
const GROUP_KEY_BITS: usize = 1024;
#[cfg(not(test))]
const GROUP_KEY_BITS: usize = 2048;

fn validate_group_name(name: &str) -> Result<String, AppError> {
    let name = name.trim().to_ascii_lowercase();
    if name.is_empty() {
        return Err(AppError::Validation("group name cannot be empty".to_string()));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(AppError::Validation(format!(
            "group name may only contain letters, digits, '_' and '-': {}",
            name
        )));
    }
    Ok(name)
}

/// Group service
pub struct GroupService {
    config: Arc<AppConfig>,
    db: Arc<Database>,
    delivery: DeliveryFanout,
    threads: ThreadResolver,
}

impl GroupService {
    pub fn new(
        config: Arc<AppConfig>,
        db: Arc<Database>,
        directory: Arc<RemoteDirectory>,
        delivery: DeliveryFanout,
    ) -> Self {
        Self {
            threads: ThreadResolver::new(config.clone(), db.clone(), directory),
            config,
            db,
            delivery,
        }
    }

    /// Create a group with a fresh RSA key pair
    ///
    /// # Arguments
    /// * `name` - Local name, becomes `name@domain`
    /// * `display_name` - Human readable name
    /// * `summary` - Group description
    /// * `creator_handle` - `user@host` of the creating actor, if any
    ///
    /// # Errors
    /// Returns `Validation` if the name is invalid or already taken
    pub async fn create_group(
        &self,
        name: &str,
        display_name: &str,
        summary: &str,
        creator_handle: Option<&str>,
    ) -> Result<Group, AppError> {
        let name = validate_group_name(name)?;

        // Fast-path guard before expensive key generation.
        if self.db.get_group(&name).await?.is_some() {
            return Err(AppError::Validation(format!("group {} already exists", name)));
        }

        let (private_key_pem, public_key_pem) =
            tokio::task::spawn_blocking(|| -> Result<(String, String), anyhow::Error> {
                use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
                use rsa::{RsaPrivateKey, RsaPublicKey};

                let mut rng = rand::thread_rng();
                let private_key = RsaPrivateKey::new(&mut rng, GROUP_KEY_BITS)?;
                let public_key = RsaPublicKey::from(&private_key);
                let private_key_pem = private_key.to_pkcs8_pem(LineEnding::LF)?.to_string();
                let public_key_pem = public_key.to_public_key_pem(LineEnding::LF)?;
                Ok((private_key_pem, public_key_pem))
            })
            .await
            .map_err(|e| AppError::Internal(e.into()))?
            .map_err(AppError::Internal)?;

        let server = &self.config.server;
        let actor = self.db.get_or_create_actor(&server.group_handle(&name)).await?;
        self.db
            .update_actor_profile(
                &actor.id,
                Some(&server.group_url(&name)),
                Some(&public_key_pem),
                None,
            )
            .await?;

        let creator_id = match creator_handle {
            Some(handle) => Some(self.db.get_or_create_actor(handle).await?.id),
            None => None,
        };

        let display_name = display_name.trim();
        let group = Group {
            id: EntityId::new().0,
            name: name.clone(),
            actor_id: actor.id,
            display_name: if display_name.is_empty() {
                name.clone()
            } else {
                display_name.to_string()
            },
            summary: summary.trim().to_string(),
            creator_id,
            discoverable: true,
            icon_url: None,
            private_key_pem,
            public_key_pem,
            created_at: chrono::Utc::now(),
        };
        self.db.create_group(&group).await?;

        tracing::info!(group = %group.name, "Created group");
        Ok(group)
    }

    async fn require_group(&self, name: &str) -> Result<Group, AppError> {
        self.db.get_group(name).await?.ok_or(AppError::NotFound)
    }

    /// Post a message as the group to all of its members
    ///
    /// Returns once every delivery has been attempted.
    pub async fn post_message(&self, group_name: &str, message: &str) -> Result<(Note, Vec<DeliveryResult>), AppError> {
        let message = message.trim();
        if message.is_empty() {
            return Err(AppError::Validation("message cannot be empty".to_string()));
        }

        let group = self.require_group(group_name).await?;
        let server = &self.config.server;
        let group_url = server.group_url(&group.name);
        let followers = server.group_followers_url(&group.name);

        let note = self
            .db
            .create_note(&NewNote {
                actor_id: group.actor_id.clone(),
                content: ammonia::clean(message),
                source: message.to_string(),
                summary: String::new(),
                recipients: [followers.as_str(), PUBLIC_COLLECTION]
                    .into_iter()
                    .map(|url| NewRecipient {
                        url: url.to_string(),
                        recipient_type: RecipientType::Cc,
                        actor_id: None,
                    })
                    .collect(),
            })
            .await?;

        let cc = vec![followers.as_str(), PUBLIC_COLLECTION];
        let object = builder::note(
            &format!("{}/note/{}", server.base_url(), note.id),
            &group_url,
            &note.content,
            Vec::new(),
            cc.clone(),
            note.created_at,
        );
        let create = builder::create(
            &format!("{}/note/{}/{}", server.base_url(), note.id, EntityId::new().0),
            &group_url,
            object,
            Vec::new(),
            cc,
        );

        let results = self
            .delivery
            .broadcast(create, &[followers.clone(), PUBLIC_COLLECTION.to_string()], &group)
            .await;
        Ok((note, results))
    }

    /// Boost a remote note (and its thread) into the group
    pub async fn boost_note(&self, group_name: &str, note_id: &str) -> Result<Vec<DeliveryResult>, AppError> {
        let group = self.require_group(group_name).await?;

        if let Some(existing) = self.db.get_boost_by_note_id(note_id).await? {
            if existing.group_id != group.id {
                return Err(AppError::Validation(format!(
                    "{} is already boosted by another group",
                    note_id
                )));
            }
        }

        let boost = self
            .threads
            .resolve_chain(Some(note_id), &group)
            .await?
            .ok_or_else(|| AppError::RemoteFetch(format!("could not fetch note {}", note_id)))?;

        let (announce, recipients) = self.delivery.boost_announcement(&group, &boost.id, &boost.note_id);
        Ok(self.delivery.broadcast(announce, &recipients, &group).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::federation::test_support::{FakeRemote, actor_document, test_config, test_database};
    use serde_json::json;

    struct Harness {
        service: GroupService,
        remote: Arc<FakeRemote>,
        db: Arc<Database>,
        _temp_dir: tempfile::TempDir,
    }

    async fn harness(remote: FakeRemote) -> Harness {
        let config = Arc::new(test_config());
        let (db, temp_dir) = test_database().await;
        let remote = Arc::new(remote);
        let directory = Arc::new(RemoteDirectory::new(config.clone(), remote.clone()));
        let delivery = DeliveryFanout::new(config.clone(), db.clone(), directory.clone(), remote.clone());
        Harness {
            service: GroupService::new(config, db.clone(), directory, delivery),
            remote,
            db,
            _temp_dir: temp_dir,
        }
    }

    async fn add_member(h: &Harness, group: &Group, id: &str, user: &str) {
        h.remote.serve(id, actor_document(id, user, "PEM"));
        let actor = h
            .db
            .get_or_create_actor(&format!("{user}@remote.example"))
            .await
            .unwrap();
        h.db.update_actor_profile(&actor.id, Some(id), None, None).await.unwrap();
        h.db.add_member(&group.id, &actor.id).await.unwrap();
    }

    #[test]
    fn group_names_are_validated() {
        assert_eq!(validate_group_name(" Cats ").unwrap(), "cats");
        assert!(validate_group_name("").is_err());
        assert!(validate_group_name("cats/dogs").is_err());
    }

    #[tokio::test]
    async fn create_group_generates_keys_and_actor() {
        let h = harness(FakeRemote::new()).await;
        let group = h
            .service
            .create_group("Cats", "Cat Lovers", "All about cats", Some("alice@remote.example"))
            .await
            .unwrap();

        assert_eq!(group.name, "cats");
        assert!(group.private_key_pem.contains("PRIVATE KEY"));
        let actor = h.db.get_actor(&group.actor_id).await.unwrap().unwrap();
        assert_eq!(actor.handle, "cats@groups.example");
        assert_eq!(actor.actor_url.as_deref(), Some("https://groups.example/group/cats"));
        assert!(group.creator_id.is_some());

        assert!(matches!(
            h.service.create_group("cats", "", "", None).await,
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn post_message_reaches_members() {
        let h = harness(FakeRemote::new()).await;
        let group = h.service.create_group("cats", "", "", None).await.unwrap();
        add_member(&h, &group, "https://remote.example/users/alice", "alice").await;

        let (note, results) = h.service.post_message("cats", "Welcome!").await.unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].success);

        let posts = h.remote.posts_to("https://remote.example/inbox");
        let create = &posts[0].body;
        assert_eq!(create["type"], "Create");
        assert_eq!(create["actor"], "https://groups.example/group/cats");
        assert_eq!(create["object"]["content"], "Welcome!");
        assert_eq!(
            create["object"]["id"],
            format!("https://groups.example/note/{}", note.id)
        );
        assert_eq!(h.db.get_note_recipients(&note.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn boost_note_stores_and_announces() {
        let remote = FakeRemote::new();
        remote.serve(
            "https://remote.example/notes/1",
            json!({
                "id": "https://remote.example/notes/1",
                "type": "Note",
                "attributedTo": "https://remote.example/users/alice",
                "content": "<p>hi</p>",
                "to": ["https://www.w3.org/ns/activitystreams#Public"]
            }),
        );
        let h = harness(remote).await;
        let group = h.service.create_group("cats", "", "", None).await.unwrap();
        add_member(&h, &group, "https://remote.example/users/alice", "alice").await;

        let results = h
            .service
            .boost_note("cats", "https://remote.example/notes/1")
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(h.db.count_boosts(&group.id).await.unwrap(), 1);

        let announce = &h.remote.posts_to("https://remote.example/inbox")[0].body;
        assert_eq!(announce["type"], "Announce");
        assert_eq!(announce["object"], "https://remote.example/notes/1");
        assert_eq!(announce["to"][0], PUBLIC_COLLECTION);
    }

    #[tokio::test]
    async fn boost_of_note_owned_by_another_group_is_refused() {
        let remote = FakeRemote::new();
        remote.serve(
            "https://remote.example/notes/1",
            json!({
                "id": "https://remote.example/notes/1",
                "type": "Note",
                "attributedTo": "https://remote.example/users/alice",
                "content": "<p>hi</p>",
                "to": ["https://www.w3.org/ns/activitystreams#Public"]
            }),
        );
        let h = harness(remote).await;
        h.service.create_group("cats", "", "", None).await.unwrap();
        let dogs = h.service.create_group("dogs", "", "", None).await.unwrap();
        h.service
            .boost_note("dogs", "https://remote.example/notes/1")
            .await
            .unwrap();

        assert!(matches!(
            h.service.boost_note("cats", "https://remote.example/notes/1").await,
            Err(AppError::Validation(_))
        ));
        let boost = h
            .db
            .get_boost_by_note_id("https://remote.example/notes/1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(boost.group_id, dogs.id);
    }

    #[tokio::test]
    async fn unknown_group_is_not_found() {
        let h = harness(FakeRemote::new()).await;
        assert!(matches!(
            h.service.post_message("ghosts", "hello").await,
            Err(AppError::NotFound)
        ));
    }
}
