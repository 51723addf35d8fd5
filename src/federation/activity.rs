//! Inbound activity processing
//!
//! Every inbox request is authenticated, classified and handled in a
//! single pass:
//!
//! 1. fetch the claimed actor's profile and public key
//! 2. verify the HTTP signature over the live request
//! 3. dispatch on the activity `type`
//!
//! Only Follow, Undo and Create have side effects. Everything that is
//! not an authentication failure ends in an [`InboxOutcome`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::sync::Arc;

use super::delivery::{DeliveryFanout, builder};
use super::membership::MembershipGate;
use super::mention::MentionResolver;
use super::signature::{RequestParts, extract_key_id, key_id_matches_actor, verify_signature};
use super::thread::ThreadResolver;
use super::webfinger::{RemoteDirectory, RemoteProfile};
use crate::config::AppConfig;
use crate::data::{Actor, Database, EntityId, Group};
use crate::error::AppError;
use crate::metrics::{BOOSTS_CREATED, INBOX_ACTIVITIES_RECEIVED, INBOX_OUTCOMES, SIGNATURE_VERIFICATIONS};

/// Object types accepted inside a Create
const NOTE_TYPES: [&str; 3] = ["Note", "Article", "Page"];

fn id_of(value: &Value) -> Option<String> {
    match value {
        Value::String(id) => Some(id.clone()),
        Value::Object(map) => map
            .get("id")
            .or_else(|| map.get("href"))
            .and_then(Value::as_str)
            .map(str::to_string),
        Value::Array(items) => items.iter().find_map(id_of),
        _ => None,
    }
}

fn one_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(id_of))
}

fn many_ids<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Array(items)) => items.iter().filter_map(id_of).collect(),
        Some(other) => id_of(&other).into_iter().collect(),
        None => Vec::new(),
    })
}

fn many_values<'de, D>(deserializer: D) -> Result<Vec<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Array(items)) => items,
        Some(Value::Null) | None => Vec::new(),
        Some(other) => vec![other],
    })
}

/// A Note (or Article/Page) as received from a remote server
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteObject {
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, deserialize_with = "one_id")]
    pub attributed_to: Option<String>,
    #[serde(default, deserialize_with = "one_id")]
    pub in_reply_to: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub source: Option<Value>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub sensitive: bool,
    #[serde(default)]
    pub attachment: Option<Value>,
    #[serde(default)]
    pub published: Option<String>,
    #[serde(default, deserialize_with = "many_ids")]
    pub to: Vec<String>,
    #[serde(default, deserialize_with = "many_ids")]
    pub cc: Vec<String>,
    #[serde(default, deserialize_with = "many_values")]
    pub tag: Vec<Value>,
}

impl NoteObject {
    pub fn is_note(&self) -> bool {
        NOTE_TYPES.contains(&self.kind.as_str())
    }

    /// Plain-text source, from either `source: "..."` or `source.content`
    pub fn source_text(&self) -> String {
        match &self.source {
            Some(Value::String(text)) => text.clone(),
            Some(source) => source
                .get("content")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            None => String::new(),
        }
    }

    pub fn published_at(&self) -> Option<DateTime<Utc>> {
        let published = self.published.as_deref()?;
        DateTime::parse_from_rfc3339(published)
            .map(|time| time.with_timezone(&Utc))
            .ok()
    }

    /// `href` of every `Mention` tag
    pub fn mention_hrefs(&self) -> impl Iterator<Item = &str> {
        self.tag.iter().filter_map(|tag| {
            if tag.get("type").and_then(Value::as_str) == Some("Mention") {
                tag.get("href").and_then(Value::as_str)
            } else {
                None
            }
        })
    }
}

/// The `object` of an activity: a bare id or an embedded object
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectRef {
    Id(String),
    Embedded(Value),
}

impl ObjectRef {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(id) => Some(Self::Id(id.clone())),
            Value::Object(_) => Some(Self::Embedded(value.clone())),
            _ => None,
        }
    }

    pub fn id(&self) -> Option<String> {
        match self {
            Self::Id(id) => Some(id.clone()),
            Self::Embedded(value) => value.get("id").and_then(Value::as_str).map(str::to_string),
        }
    }

    pub fn kind(&self) -> Option<&str> {
        match self {
            Self::Id(_) => None,
            Self::Embedded(value) => value.get("type").and_then(Value::as_str),
        }
    }
}

/// Fields shared by every activity
#[derive(Debug, Clone)]
pub struct ActivityEnvelope {
    pub id: Option<String>,
    /// Claimed actor URL
    pub actor: String,
    pub object: Option<ObjectRef>,
    /// The activity as received
    pub raw: Value,
}

/// Inbound activity, classified by `type`
#[derive(Debug, Clone)]
pub enum Activity {
    Follow(ActivityEnvelope),
    Undo(ActivityEnvelope),
    Accept(ActivityEnvelope),
    Delete(ActivityEnvelope),
    Announce(ActivityEnvelope),
    Create(ActivityEnvelope),
    Unknown { kind: String, envelope: ActivityEnvelope },
}

impl Activity {
    pub fn from_value(raw: Value) -> Result<Self, AppError> {
        let kind = raw
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::Validation("Missing activity type".to_string()))?
            .to_string();
        let actor = raw
            .get("actor")
            .and_then(id_of)
            .ok_or_else(|| AppError::Validation("Missing activity actor".to_string()))?;

        let envelope = ActivityEnvelope {
            id: raw.get("id").and_then(Value::as_str).map(str::to_string),
            actor,
            object: raw.get("object").and_then(ObjectRef::from_value),
            raw,
        };

        Ok(match kind.as_str() {
            "Follow" => Self::Follow(envelope),
            "Undo" => Self::Undo(envelope),
            "Accept" => Self::Accept(envelope),
            "Delete" => Self::Delete(envelope),
            "Announce" => Self::Announce(envelope),
            "Create" => Self::Create(envelope),
            _ => Self::Unknown { kind, envelope },
        })
    }

    pub fn kind(&self) -> &str {
        match self {
            Self::Follow(_) => "Follow",
            Self::Undo(_) => "Undo",
            Self::Accept(_) => "Accept",
            Self::Delete(_) => "Delete",
            Self::Announce(_) => "Announce",
            Self::Create(_) => "Create",
            Self::Unknown { kind, .. } => kind,
        }
    }

    pub fn envelope(&self) -> &ActivityEnvelope {
        match self {
            Self::Follow(envelope)
            | Self::Undo(envelope)
            | Self::Accept(envelope)
            | Self::Delete(envelope)
            | Self::Announce(envelope)
            | Self::Create(envelope)
            | Self::Unknown { envelope, .. } => envelope,
        }
    }
}

/// Result of an authenticated inbox request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboxOutcome {
    FollowAccepted { already_member: bool },
    Unfollowed { removed: bool },
    /// Number of groups that boosted the note
    Boosted(usize),
    DuplicateNote,
    MembershipDenied,
    NoLocalGroup,
    /// Valid activity with no local side effect
    Acknowledged(String),
    /// Unsupported activity or object type
    Ignored(String),
}

impl InboxOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::FollowAccepted { .. } => "follow_accepted",
            Self::Unfollowed { .. } => "unfollowed",
            Self::Boosted(_) => "boosted",
            Self::DuplicateNote => "duplicate_note",
            Self::MembershipDenied => "membership_denied",
            Self::NoLocalGroup => "no_local_group",
            Self::Acknowledged(_) => "acknowledged",
            Self::Ignored(_) => "ignored",
        }
    }
}

/// The authenticated sender of an activity
struct Sender {
    actor: Actor,
    profile: RemoteProfile,
}

/// Inbox state machine
pub struct ActivityRouter {
    config: Arc<AppConfig>,
    db: Arc<Database>,
    directory: Arc<RemoteDirectory>,
    mentions: MentionResolver,
    gate: MembershipGate,
    threads: ThreadResolver,
    delivery: DeliveryFanout,
}

impl ActivityRouter {
    pub fn new(
        config: Arc<AppConfig>,
        db: Arc<Database>,
        directory: Arc<RemoteDirectory>,
        delivery: DeliveryFanout,
    ) -> Self {
        Self {
            mentions: MentionResolver::new(config.clone(), db.clone(), directory.clone()),
            gate: MembershipGate::new(db.clone()),
            threads: ThreadResolver::new(config.clone(), db.clone(), directory.clone()),
            config,
            db,
            directory,
            delivery,
        }
    }

    /// Process one inbox request
    ///
    /// # Arguments
    /// * `request` - The live request: method, path, headers and raw body
    /// * `inbox_group` - Group name when posted to a group's own inbox
    ///
    /// # Errors
    /// `Validation` for malformed bodies, `NoActorKey` when the sender's
    /// key cannot be obtained, `InvalidSignature` when verification fails.
    pub async fn handle_inbound(
        &self,
        request: &RequestParts<'_>,
        inbox_group: Option<&str>,
    ) -> Result<InboxOutcome, AppError> {
        let raw: Value = serde_json::from_slice(request.body)
            .map_err(|e| AppError::Validation(format!("Invalid activity JSON: {}", e)))?;
        let activity = Activity::from_value(raw)?;
        INBOX_ACTIVITIES_RECEIVED
            .with_label_values(&[activity.kind()])
            .inc();

        let sender = self.authenticate(request, &activity.envelope().actor).await?;

        let outcome = match &activity {
            Activity::Follow(envelope) => self.handle_follow(envelope, &sender).await?,
            Activity::Undo(envelope) => self.handle_undo(envelope, &sender, inbox_group).await?,
            Activity::Create(envelope) => self.handle_create(envelope, &sender).await?,
            Activity::Accept(_) | Activity::Delete(_) | Activity::Announce(_) => {
                InboxOutcome::Acknowledged(activity.kind().to_string())
            }
            Activity::Unknown { kind, .. } => InboxOutcome::Ignored(kind.clone()),
        };

        INBOX_OUTCOMES.with_label_values(&[outcome.label()]).inc();
        tracing::info!(
            activity = activity.kind(),
            actor = %sender.actor.handle,
            outcome = ?outcome,
            "Processed inbox activity"
        );
        Ok(outcome)
    }

    /// Fetch the sender's key, verify the request and cache the profile
    async fn authenticate(&self, request: &RequestParts<'_>, actor_url: &str) -> Result<Sender, AppError> {
        let key_id = extract_key_id(request.headers).ok_or_else(|| {
            SIGNATURE_VERIFICATIONS.with_label_values(&["unsigned"]).inc();
            AppError::InvalidSignature
        })?;

        let profile = self.directory.fetch_profile(actor_url).await.map_err(|e| {
            SIGNATURE_VERIFICATIONS.with_label_values(&["no_key"]).inc();
            AppError::NoActorKey(format!("{}: {}", actor_url, e))
        })?;
        let public_key_pem = profile.public_key_pem.clone().ok_or_else(|| {
            SIGNATURE_VERIFICATIONS.with_label_values(&["no_key"]).inc();
            AppError::NoActorKey(format!("{} publishes no public key", actor_url))
        })?;

        let key_matches = match &profile.public_key_id {
            Some(advertised) => *advertised == key_id,
            None => key_id_matches_actor(&key_id, &profile.id),
        };
        if !key_matches {
            tracing::warn!(key_id = %key_id, actor = %actor_url, "Key id does not belong to actor");
            SIGNATURE_VERIFICATIONS.with_label_values(&["invalid"]).inc();
            return Err(AppError::InvalidSignature);
        }

        if !verify_signature(
            &public_key_pem,
            request,
            self.config.federation.signature_max_age_seconds,
        ) {
            tracing::warn!(key_id = %key_id, actor = %actor_url, "Signature verification failed");
            SIGNATURE_VERIFICATIONS.with_label_values(&["invalid"]).inc();
            // The key may have rotated; refetch on the next request
            self.directory.cache().invalidate(actor_url).await;
            return Err(AppError::InvalidSignature);
        }
        SIGNATURE_VERIFICATIONS.with_label_values(&["valid"]).inc();

        let handle = profile
            .handle()
            .ok_or_else(|| AppError::Validation(format!("{} has no preferredUsername", actor_url)))?;
        let actor = self.db.get_or_create_actor(&handle).await?;
        self.db
            .update_actor_profile(
                &actor.id,
                Some(&profile.id),
                Some(&public_key_pem),
                profile.icon_url.as_deref(),
            )
            .await?;

        Ok(Sender { actor, profile })
    }

    async fn local_group(&self, url: &str) -> Result<Option<Group>, AppError> {
        match self.config.server.group_name_from_url(url) {
            Some(name) => self.db.get_group(&name).await,
            None => Ok(None),
        }
    }

    /// Handle Follow: add the member and reply with an Accept
    async fn handle_follow(&self, envelope: &ActivityEnvelope, sender: &Sender) -> Result<InboxOutcome, AppError> {
        let Some(target) = envelope.object.as_ref().and_then(ObjectRef::id) else {
            return Err(AppError::Validation("Invalid object in Follow".to_string()));
        };
        let Some(group) = self.local_group(&target).await? else {
            tracing::info!(target = %target, "Follow for unknown group");
            return Ok(InboxOutcome::NoLocalGroup);
        };

        let membership = self.db.add_member(&group.id, &sender.actor.id).await?;
        let already_member = !membership.is_created();
        if already_member {
            tracing::debug!(group = %group.name, actor = %sender.actor.handle, "Already a member");
        } else {
            tracing::info!(group = %group.name, actor = %sender.actor.handle, "New member");
        }

        let group_url = self.config.server.group_url(&group.name);
        let accept = builder::accept(
            &format!("{}#accepts/follows/{}", group_url, EntityId::new().0),
            &group_url,
            envelope.raw.clone(),
        );
        match sender.profile.personal_inbox() {
            Some(inbox) => {
                self.delivery
                    .schedule_delivery(inbox.to_string(), accept, group)
                    .await
            }
            None => tracing::warn!(actor = %sender.actor.handle, "Follower has no inbox, Accept not sent"),
        }

        Ok(InboxOutcome::FollowAccepted { already_member })
    }

    /// Handle Undo of a Follow: remove the member
    async fn handle_undo(
        &self,
        envelope: &ActivityEnvelope,
        sender: &Sender,
        inbox_group: Option<&str>,
    ) -> Result<InboxOutcome, AppError> {
        let group = match &envelope.object {
            Some(ObjectRef::Embedded(follow)) => {
                if follow.get("type").and_then(Value::as_str) != Some("Follow") {
                    return Ok(InboxOutcome::Acknowledged("Undo".to_string()));
                }
                match follow.get("object").and_then(id_of) {
                    Some(target) => self.local_group(&target).await?,
                    None => None,
                }
            }
            // A bare id says nothing about the target; fall back to the inbox it arrived at
            Some(ObjectRef::Id(_)) => match inbox_group {
                Some(name) => self.db.get_group(name).await?,
                None => None,
            },
            None => return Err(AppError::Validation("Missing object in Undo".to_string())),
        };

        let Some(group) = group else {
            return Ok(InboxOutcome::NoLocalGroup);
        };

        let removed = self.db.remove_member(&group.id, &sender.actor.id).await?;
        if removed {
            tracing::info!(group = %group.name, actor = %sender.actor.handle, "Member left");
        }
        Ok(InboxOutcome::Unfollowed { removed })
    }

    /// Handle Create: boost the note into every addressed group that admits it
    async fn handle_create(&self, envelope: &ActivityEnvelope, sender: &Sender) -> Result<InboxOutcome, AppError> {
        let note = match &envelope.object {
            Some(ObjectRef::Embedded(value)) => serde_json::from_value::<NoteObject>(value.clone())
                .map_err(|e| AppError::Validation(format!("Invalid object in Create: {}", e)))?,
            Some(ObjectRef::Id(id)) => self.directory.fetch_note(id).await?,
            None => return Err(AppError::Validation("Missing object in Create".to_string())),
        };

        if !note.is_note() {
            return Ok(InboxOutcome::Ignored(format!("Create({})", note.kind)));
        }
        if note.attributed_to.as_deref() != Some(envelope.actor.as_str()) {
            return Err(AppError::Validation(
                "Note is not attributed to the sending actor".to_string(),
            ));
        }

        let groups = self.mentions.resolve_groups(&note).await?;
        if groups.is_empty() {
            return Ok(InboxOutcome::NoLocalGroup);
        }

        let mut boosted = 0;
        let mut duplicate = false;
        for group in groups {
            if self.db.get_boost_by_note_id(&note.id).await?.is_some() {
                tracing::debug!(note = %note.id, group = %group.name, "Note already boosted");
                duplicate = true;
                continue;
            }

            if !self
                .gate
                .allowed(&group, &sender.actor.handle, note.in_reply_to.as_deref())
                .await?
            {
                tracing::info!(
                    note = %note.id,
                    group = %group.name,
                    actor = %sender.actor.handle,
                    "Dropping post from non-member"
                );
                continue;
            }

            let parent = self
                .threads
                .resolve_chain(note.in_reply_to.as_deref(), &group)
                .await?;
            let stored = self
                .threads
                .store_note(&note, &group, parent.map(|boost| boost.id))
                .await?;
            if !stored.is_created() {
                duplicate = true;
                continue;
            }

            let boost = stored.into_inner();
            BOOSTS_CREATED.inc();
            boosted += 1;
            self.schedule_announce(&group, &boost.id, &note.id).await;
        }

        Ok(if boosted > 0 {
            InboxOutcome::Boosted(boosted)
        } else if duplicate {
            InboxOutcome::DuplicateNote
        } else {
            InboxOutcome::MembershipDenied
        })
    }

    /// Announce a stored boost to the group's followers in the background
    async fn schedule_announce(&self, group: &Group, boost_id: &str, note_id: &str) {
        let (announce, recipients) = self.delivery.boost_announcement(group, boost_id, note_id);
        self.delivery
            .schedule_broadcast(announce, recipients, group.clone())
            .await;
    }
}
