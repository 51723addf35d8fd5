//! SQLite database operations
//!
//! All database access goes through this module. Uniqueness constraints
//! in the schema are the authority for idempotent inserts (memberships,
//! boosts keyed by remote note id).

use chrono::Utc;
use sqlx::{Pool, Sqlite, SqlitePool};
use std::path::Path;

use super::models::*;
use crate::error::AppError;

/// Database connection pool wrapper
pub struct Database {
    pool: Pool<Sqlite>,
}

fn normalize_handle(handle: &str) -> String {
    handle.trim().trim_start_matches('@').to_ascii_lowercase()
}

impl Database {
    /// Connect to SQLite database and run migrations
    ///
    /// # Arguments
    /// * `path` - Path to SQLite database file
    ///
    /// # Errors
    /// Returns error if connection or migration fails
    pub async fn connect(path: &Path) -> Result<Self, AppError> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AppError::Database(sqlx::Error::Io(e)))?;
        }

        // Create connection string
        let connection_string = format!("sqlite:{}?mode=rwc", path.display());

        // Create connection pool
        let pool = SqlitePool::connect(&connection_string).await?;

        // Run migrations
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| {
                tracing::error!("Migration failed: {}", e);
                AppError::Internal(anyhow::anyhow!("Migration failed: {}", e))
            })?;

        tracing::info!(path = %path.display(), "Database connected and migrated successfully");

        Ok(Self { pool })
    }

    // =========================================================================
    // Actors
    // =========================================================================

    /// Get an actor by `user@host` handle (case-insensitive)
    pub async fn get_actor_by_handle(&self, handle: &str) -> Result<Option<Actor>, AppError> {
        let actor = sqlx::query_as::<_, Actor>("SELECT * FROM actors WHERE handle = ?")
            .bind(normalize_handle(handle))
            .fetch_optional(&self.pool)
            .await?;

        Ok(actor)
    }

    pub async fn get_actor(&self, id: &str) -> Result<Option<Actor>, AppError> {
        let actor = sqlx::query_as::<_, Actor>("SELECT * FROM actors WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(actor)
    }

    /// Get the actor for a handle, creating a bare row on first reference
    pub async fn get_or_create_actor(&self, handle: &str) -> Result<Actor, AppError> {
        let handle = normalize_handle(handle);
        if handle.is_empty() {
            return Err(AppError::Validation("actor handle must not be empty".to_string()));
        }

        let now = Utc::now();
        sqlx::query(
            "INSERT OR IGNORE INTO actors (id, handle, created_at, updated_at) VALUES (?, ?, ?, ?)",
        )
        .bind(EntityId::new().0)
        .bind(&handle)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get_actor_by_handle(&handle)
            .await?
            .ok_or_else(|| AppError::Internal(anyhow::anyhow!("actor {handle} vanished after insert")))
    }

    /// Write fetched profile details back to an actor row.
    ///
    /// `None` leaves the stored value untouched.
    pub async fn update_actor_profile(
        &self,
        actor_id: &str,
        actor_url: Option<&str>,
        public_key_pem: Option<&str>,
        profile_picture_url: Option<&str>,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE actors SET
                actor_url = COALESCE(?, actor_url),
                public_key_pem = COALESCE(?, public_key_pem),
                profile_picture_url = COALESCE(?, profile_picture_url),
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(actor_url)
        .bind(public_key_pem)
        .bind(profile_picture_url)
        .bind(Utc::now())
        .bind(actor_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // =========================================================================
    // Groups
    // =========================================================================

    pub async fn get_group(&self, name: &str) -> Result<Option<Group>, AppError> {
        let group = sqlx::query_as::<_, Group>("SELECT * FROM groups WHERE name = ?")
            .bind(name.to_ascii_lowercase())
            .fetch_optional(&self.pool)
            .await?;

        Ok(group)
    }

    pub async fn list_groups(&self) -> Result<Vec<Group>, AppError> {
        let groups = sqlx::query_as::<_, Group>("SELECT * FROM groups ORDER BY name")
            .fetch_all(&self.pool)
            .await?;

        Ok(groups)
    }

    /// Insert a new group
    ///
    /// # Errors
    /// Fails with `Validation` if a group with the same name exists
    pub async fn create_group(&self, group: &Group) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO groups (
                id, name, actor_id, display_name, summary, creator_id,
                discoverable, icon_url, private_key_pem, public_key_pem, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&group.id)
        .bind(group.name.to_ascii_lowercase())
        .bind(&group.actor_id)
        .bind(&group.display_name)
        .bind(&group.summary)
        .bind(&group.creator_id)
        .bind(group.discoverable)
        .bind(&group.icon_url)
        .bind(&group.private_key_pem)
        .bind(&group.public_key_pem)
        .bind(group.created_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::Validation(format!(
                "group {} already exists",
                group.name
            )));
        }

        Ok(())
    }

    // =========================================================================
    // Membership
    // =========================================================================

    /// Add an actor to a group.
    ///
    /// Returns `Upsert::Existing` when the membership already exists.
    pub async fn add_member(&self, group_id: &str, actor_id: &str) -> Result<Upsert<Member>, AppError> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO group_members (id, group_id, actor_id, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(EntityId::new().0)
        .bind(group_id)
        .bind(actor_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        let member = sqlx::query_as::<_, Member>(
            "SELECT * FROM group_members WHERE group_id = ? AND actor_id = ?",
        )
        .bind(group_id)
        .bind(actor_id)
        .fetch_one(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            Ok(Upsert::Created(member))
        } else {
            Ok(Upsert::Existing(member))
        }
    }

    /// Remove a membership. Returns false if there was none.
    pub async fn remove_member(&self, group_id: &str, actor_id: &str) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM group_members WHERE group_id = ? AND actor_id = ?")
            .bind(group_id)
            .bind(actor_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn is_member(&self, group_id: &str, actor_id: &str) -> Result<bool, AppError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM group_members WHERE group_id = ? AND actor_id = ?",
        )
        .bind(group_id)
        .bind(actor_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count > 0)
    }

    /// Current members of a group, oldest membership first
    pub async fn get_members(&self, group_id: &str) -> Result<Vec<Actor>, AppError> {
        let members = sqlx::query_as::<_, Actor>(
            r#"
            SELECT a.* FROM actors a
            JOIN group_members m ON m.actor_id = a.id
            WHERE m.group_id = ?
            ORDER BY m.created_at, a.handle
            "#,
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(members)
    }

    // =========================================================================
    // Boosts
    // =========================================================================

    pub async fn get_boost_by_note_id(&self, note_id: &str) -> Result<Option<Boost>, AppError> {
        let boost = sqlx::query_as::<_, Boost>("SELECT * FROM boosts WHERE note_id = ?")
            .bind(note_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(boost)
    }

    pub async fn get_boost(&self, id: &str) -> Result<Option<Boost>, AppError> {
        let boost = sqlx::query_as::<_, Boost>("SELECT * FROM boosts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(boost)
    }

    /// Boosts of a group, newest first
    pub async fn list_boosts(&self, group_id: &str, limit: i64) -> Result<Vec<Boost>, AppError> {
        let boosts = sqlx::query_as::<_, Boost>(
            "SELECT * FROM boosts WHERE group_id = ? ORDER BY created_at DESC, id DESC LIMIT ?",
        )
        .bind(group_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(boosts)
    }

    pub async fn count_boosts(&self, group_id: &str) -> Result<i64, AppError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM boosts WHERE group_id = ?")
            .bind(group_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }

    /// Create a boost and its recipients in one transaction.
    ///
    /// A boost whose `note_id` is already stored is left untouched and
    /// returned as `Upsert::Existing`.
    pub async fn create_boost(&self, boost: &NewBoost) -> Result<Upsert<Boost>, AppError> {
        let id = EntityId::new().0;
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO boosts (
                id, note_id, group_id, original_poster_id, in_reply_to_id,
                content, source, summary, sensitive, attachments, original_time, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&boost.note_id)
        .bind(&boost.group_id)
        .bind(&boost.original_poster_id)
        .bind(&boost.in_reply_to_id)
        .bind(&boost.content)
        .bind(&boost.source)
        .bind(&boost.summary)
        .bind(boost.sensitive)
        .bind(&boost.attachments)
        .bind(boost.original_time)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            let existing = self.get_boost_by_note_id(&boost.note_id).await?.ok_or_else(|| {
                AppError::Internal(anyhow::anyhow!(
                    "boost for {} ignored but not found",
                    boost.note_id
                ))
            })?;
            return Ok(Upsert::Existing(existing));
        }

        for recipient in &boost.recipients {
            sqlx::query(
                "INSERT INTO boost_recipients (id, boost_id, url, recipient_type, actor_id) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(EntityId::new().0)
            .bind(&id)
            .bind(&recipient.url)
            .bind(recipient.recipient_type.as_str())
            .bind(&recipient.actor_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        let created = self.get_boost(&id).await?.ok_or_else(|| {
            AppError::Internal(anyhow::anyhow!("boost {id} vanished after insert"))
        })?;
        Ok(Upsert::Created(created))
    }

    pub async fn get_boost_recipients(&self, boost_id: &str) -> Result<Vec<Recipient>, AppError> {
        let recipients = sqlx::query_as::<_, Recipient>(
            r#"
            SELECT id, boost_id AS parent_id, url, recipient_type, actor_id
            FROM boost_recipients WHERE boost_id = ?
            ORDER BY recipient_type DESC, url
            "#,
        )
        .bind(boost_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(recipients)
    }

    // =========================================================================
    // Notes
    // =========================================================================

    /// Create a locally authored note and its recipients
    pub async fn create_note(&self, note: &NewNote) -> Result<Note, AppError> {
        let id = EntityId::new().0;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO notes (id, actor_id, content, source, summary, created_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&note.actor_id)
        .bind(&note.content)
        .bind(&note.source)
        .bind(&note.summary)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        for recipient in &note.recipients {
            sqlx::query(
                "INSERT INTO note_recipients (id, note_id, url, recipient_type, actor_id) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(EntityId::new().0)
            .bind(&id)
            .bind(&recipient.url)
            .bind(recipient.recipient_type.as_str())
            .bind(&recipient.actor_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        self.get_note(&id)
            .await?
            .ok_or_else(|| AppError::Internal(anyhow::anyhow!("note {id} vanished after insert")))
    }

    pub async fn get_note(&self, id: &str) -> Result<Option<Note>, AppError> {
        let note = sqlx::query_as::<_, Note>("SELECT * FROM notes WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(note)
    }

    pub async fn get_note_recipients(&self, note_id: &str) -> Result<Vec<Recipient>, AppError> {
        let recipients = sqlx::query_as::<_, Recipient>(
            r#"
            SELECT id, note_id AS parent_id, url, recipient_type, actor_id
            FROM note_recipients WHERE note_id = ?
            ORDER BY recipient_type DESC, url
            "#,
        )
        .bind(note_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(recipients)
    }
}
