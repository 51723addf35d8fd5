//! Activity delivery
//!
//! Expands addressing into inbox URLs and delivers signed activities on
//! behalf of a group. Every inbox is attempted independently: one failed
//! delivery never affects another, and failures are logged, not retried.

use futures::future::join_all;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;

use super::client::FederationClient;
use super::signature::sign_request;
use super::tasks::BackgroundTasks;
use super::webfinger::{PUBLIC_COLLECTION, RemoteDirectory, is_public_collection};
use crate::config::AppConfig;
use crate::data::{Database, Group};
use crate::error::AppError;
use crate::metrics::{DELIVERIES_TOTAL, DELIVERY_DURATION_SECONDS};

/// Outcome of one inbox delivery
#[derive(Debug, Clone)]
pub struct DeliveryResult {
    /// Target inbox URI
    pub inbox_uri: String,
    /// Whether delivery succeeded
    pub success: bool,
    /// Error message if failed
    pub error: Option<String>,
    /// HTTP status code if a response was received
    pub status_code: Option<u16>,
}

/// Deduplicate identical inbox URIs while keeping distinct personal inboxes.
///
/// This preserves recipients on the same domain that use different inbox paths.
fn unique_inbox_targets(inbox_uris: Vec<String>) -> Vec<String> {
    use std::collections::HashSet;

    let mut seen = HashSet::new();
    let mut targets = Vec::new();

    for inbox_uri in inbox_uris {
        if seen.contains(&inbox_uri) {
            continue;
        }
        seen.insert(inbox_uri.clone());
        targets.push(inbox_uri);
    }

    targets
}

/// Delivery service for group activities
#[derive(Clone)]
pub struct DeliveryFanout {
    config: Arc<AppConfig>,
    db: Arc<Database>,
    directory: Arc<RemoteDirectory>,
    client: Arc<dyn FederationClient>,
    tasks: Arc<BackgroundTasks>,
}

impl DeliveryFanout {
    pub fn new(
        config: Arc<AppConfig>,
        db: Arc<Database>,
        directory: Arc<RemoteDirectory>,
        client: Arc<dyn FederationClient>,
    ) -> Self {
        Self {
            config,
            db,
            directory,
            client,
            tasks: Arc::new(BackgroundTasks::new()),
        }
    }

    /// Deliver an activity to a single inbox, signed with the group's key
    ///
    /// # Arguments
    /// * `inbox_uri` - Target inbox URL
    /// * `activity` - Activity JSON
    /// * `group` - Sending group
    pub async fn deliver_to_inbox(&self, inbox_uri: &str, activity: &Value, group: &Group) -> DeliveryResult {
        let started = Instant::now();
        let result = self.try_deliver(inbox_uri, activity, group).await;

        let delivery = match result {
            Ok(status) if (200..300).contains(&status) => DeliveryResult {
                inbox_uri: inbox_uri.to_string(),
                success: true,
                error: None,
                status_code: Some(status),
            },
            Ok(status) => DeliveryResult {
                inbox_uri: inbox_uri.to_string(),
                success: false,
                error: Some(format!("Inbox rejected activity: HTTP {}", status)),
                status_code: Some(status),
            },
            Err(e) => DeliveryResult {
                inbox_uri: inbox_uri.to_string(),
                success: false,
                error: Some(e.to_string()),
                status_code: None,
            },
        };

        let label = if delivery.success { "success" } else { "failure" };
        DELIVERIES_TOTAL.with_label_values(&[label]).inc();
        DELIVERY_DURATION_SECONDS
            .with_label_values(&[label])
            .observe(started.elapsed().as_secs_f64());

        if delivery.success {
            tracing::debug!(inbox = %inbox_uri, group = %group.name, "Delivered activity");
        } else {
            tracing::warn!(
                inbox = %inbox_uri,
                group = %group.name,
                error = delivery.error.as_deref().unwrap_or_default(),
                "Delivery failed"
            );
        }
        delivery
    }

    async fn try_deliver(&self, inbox_uri: &str, activity: &Value, group: &Group) -> Result<u16, AppError> {
        let body = serde_json::to_vec(activity)
            .map_err(|e| AppError::Validation(format!("Failed to serialize activity: {}", e)))?;

        let headers = sign_request(
            "POST",
            inbox_uri,
            Some(&body),
            &group.private_key_pem,
            &self.config.server.group_key_id(&group.name),
        )?
        .to_header_map()?;

        let response = self.client.post(inbox_uri, headers, body).await?;
        Ok(response.status)
    }

    /// Expand recipient URLs into a deduplicated inbox list.
    ///
    /// A local group followers URL expands to the inboxes of the group's
    /// members. The public collection and other local URLs are skipped;
    /// any other URL is treated as a remote actor. Unresolvable entries
    /// are logged and dropped.
    pub async fn expand_recipients(&self, recipients: &[String]) -> Vec<String> {
        let mut inboxes = Vec::new();

        for url in recipients {
            if is_public_collection(url) {
                continue;
            }

            if let Some(name) = self.config.server.group_name_from_followers_url(url) {
                match self.member_inboxes(&name).await {
                    Ok(found) => inboxes.extend(found),
                    Err(e) => tracing::warn!(group = %name, error = %e, "Could not expand followers"),
                }
                continue;
            }

            if self.config.server.is_local_url(url) {
                continue;
            }

            match self.directory.fetch_profile(url).await {
                Ok(profile) if profile.is_collection() => {
                    tracing::debug!(url = %url, "Skipping remote collection recipient");
                }
                Ok(profile) => match profile.delivery_inbox() {
                    Some(inbox) => inboxes.push(inbox.to_string()),
                    None => tracing::warn!(url = %url, "Recipient has no inbox"),
                },
                Err(e) => tracing::warn!(url = %url, error = %e, "Could not resolve recipient"),
            }
        }

        unique_inbox_targets(inboxes)
    }

    async fn member_inboxes(&self, group_name: &str) -> Result<Vec<String>, AppError> {
        let group = self.db.get_group(group_name).await?.ok_or(AppError::NotFound)?;
        let members = self.db.get_members(&group.id).await?;

        let profiles = join_all(
            members
                .iter()
                .map(|member| self.directory.profile_for_actor(member)),
        )
        .await;

        let mut inboxes = Vec::with_capacity(members.len());
        for (member, profile) in members.iter().zip(profiles) {
            match profile {
                Ok(profile) => match profile.delivery_inbox() {
                    Some(inbox) => inboxes.push(inbox.to_string()),
                    None => tracing::warn!(member = %member.handle, "Member has no inbox"),
                },
                Err(e) => tracing::warn!(member = %member.handle, error = %e, "Could not resolve member inbox"),
            }
        }
        Ok(inboxes)
    }

    /// Deliver an activity to every inbox the recipients expand to.
    ///
    /// Returns once every delivery has been attempted.
    pub async fn broadcast(&self, activity: Value, recipients: &[String], group: &Group) -> Vec<DeliveryResult> {
        let targets = self.expand_recipients(recipients).await;
        self.deliver_all(Arc::new(activity), targets, group).await
    }

    /// Deliver to an explicit inbox list concurrently, bounded by
    /// `federation.delivery_concurrency`
    pub async fn deliver_all(&self, activity: Arc<Value>, inbox_uris: Vec<String>, group: &Group) -> Vec<DeliveryResult> {
        let semaphore = Arc::new(Semaphore::new(self.config.federation.delivery_concurrency));
        let group = Arc::new(group.clone());

        tracing::info!(
            group = %group.name,
            inboxes = inbox_uris.len(),
            "Delivering activity"
        );

        let mut tasks = Vec::with_capacity(inbox_uris.len());
        for inbox_uri in inbox_uris {
            let semaphore = semaphore.clone();
            let activity = activity.clone();
            let group = group.clone();
            let fanout = self.clone();

            tasks.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                fanout.deliver_to_inbox(&inbox_uri, &activity, &group).await
            }));
        }

        let mut results = Vec::with_capacity(tasks.len());
        for task in tasks {
            match task.await {
                Ok(result) => results.push(result),
                Err(e) => tracing::warn!(error = %e, "Delivery task panicked"),
            }
        }

        let success_count = results.iter().filter(|r| r.success).count();
        tracing::info!(
            group = %group.name,
            succeeded = success_count,
            failed = results.len() - success_count,
            "Batch delivery complete"
        );

        results
    }

    /// Announce of a stored boost: public, copied to the group's followers
    pub fn boost_announcement(&self, group: &Group, boost_id: &str, note_id: &str) -> (Value, Vec<String>) {
        let server = &self.config.server;
        let group_url = server.group_url(&group.name);
        let followers = server.group_followers_url(&group.name);
        let announce = builder::announce(
            &format!("{}/boost/{}", group_url, boost_id),
            &group_url,
            note_id,
            vec![PUBLIC_COLLECTION],
            vec![&followers],
        );
        (announce, vec![PUBLIC_COLLECTION.to_string(), followers])
    }

    /// Queue a broadcast in the background
    pub async fn schedule_broadcast(&self, activity: Value, recipients: Vec<String>, group: Group) {
        let fanout = self.clone();
        self.tasks
            .spawn(async move {
                fanout.broadcast(activity, &recipients, &group).await;
            })
            .await;
    }

    /// Queue a single-inbox delivery in the background
    pub async fn schedule_delivery(&self, inbox_uri: String, activity: Value, group: Group) {
        let fanout = self.clone();
        self.tasks
            .spawn(async move {
                fanout.deliver_to_inbox(&inbox_uri, &activity, &group).await;
            })
            .await;
    }

    /// Wait for every queued delivery to finish
    pub async fn join_background(&self) {
        self.tasks.join_all().await;
    }
}

/// Build ActivityPub activity JSON
pub mod builder {
    use serde_json::Value;

    /// Build an Accept activity
    ///
    /// # Arguments
    /// * `id` - Activity ID (unique URI)
    /// * `actor` - Actor URI (accepter)
    /// * `object` - Original activity being accepted (usually a Follow)
    pub fn accept(id: &str, actor: &str, object: Value) -> Value {
        serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Accept",
            "id": id,
            "actor": actor,
            "object": object
        })
    }

    /// Build a Create activity
    ///
    /// # Arguments
    /// * `id` - Activity ID (unique URI)
    /// * `actor` - Actor URI (creator)
    /// * `object` - Object being created (usually a Note)
    /// * `to` - Primary recipients
    /// * `cc` - CC recipients
    pub fn create(id: &str, actor: &str, object: Value, to: Vec<&str>, cc: Vec<&str>) -> Value {
        serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Create",
            "id": id,
            "actor": actor,
            "object": object,
            "to": to,
            "cc": cc,
            "published": chrono::Utc::now().to_rfc3339()
        })
    }

    /// Build an Announce activity (boost)
    ///
    /// # Arguments
    /// * `id` - Activity ID (unique URI)
    /// * `actor` - Actor URI (announcer)
    /// * `object` - Object URI being announced
    /// * `to` - Recipients
    /// * `cc` - Secondary recipients
    pub fn announce(id: &str, actor: &str, object: &str, to: Vec<&str>, cc: Vec<&str>) -> Value {
        serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Announce",
            "id": id,
            "actor": actor,
            "object": object,
            "to": to,
            "cc": cc,
            "published": chrono::Utc::now().to_rfc3339()
        })
    }

    /// Build a Note object
    pub fn note(
        id: &str,
        attributed_to: &str,
        content: &str,
        to: Vec<&str>,
        cc: Vec<&str>,
        published: chrono::DateTime<chrono::Utc>,
    ) -> Value {
        serde_json::json!({
            "type": "Note",
            "id": id,
            "attributedTo": attributed_to,
            "content": content,
            "to": to,
            "cc": cc,
            "published": published.to_rfc3339()
        })
    }
}
