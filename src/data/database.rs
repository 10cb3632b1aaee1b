//! SQLite database operations
//!
//! All database access goes through this module.
//! Multi-row writes run inside a transaction; duplicate-key conflicts on
//! follow edges and public keys are swallowed, everything else rolls back.

use chrono::Utc;
use sqlx::{Pool, Sqlite, SqliteConnection, SqlitePool};
use std::path::Path;

use super::models::*;
use crate::error::{AppError, is_unique_violation};
use crate::federation::SigningKey;

const ACTOR_COLUMNS: &str = "a.id, a.actor_id, a.kind, a.username, a.display_name, a.summary, \
     a.inbox, a.outbox, a.followers, a.following, a.shared_inbox, a.avatar_url, a.avatar_type, \
     a.host, a.discovered_at, a.key_id, k.public_key_pem";

const POST_COLUMNS: &str = "id, activity_id, owner_id, actor_id, kind, published, url, title, \
     content, created_at";

/// Database connection pool wrapper.
pub struct Database {
    pool: Pool<Sqlite>,
}

/// Insert the actor row. A duplicate identifier becomes `Conflict`.
async fn insert_actor_row(conn: &mut SqliteConnection, actor: &Actor) -> Result<i64, AppError> {
    let result = sqlx::query(
        r#"
        INSERT INTO actors (
            actor_id, kind, username, display_name, summary, inbox, outbox,
            followers, following, shared_inbox, avatar_url, avatar_type,
            key_id, host, discovered_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&actor.id)
    .bind(actor.kind.as_str())
    .bind(&actor.username)
    .bind(&actor.display_name)
    .bind(&actor.summary)
    .bind(&actor.inbox)
    .bind(&actor.outbox)
    .bind(&actor.followers)
    .bind(&actor.following)
    .bind(&actor.shared_inbox)
    .bind(&actor.avatar_url)
    .bind(&actor.avatar_type)
    .bind(&actor.public_key.id)
    .bind(&actor.host)
    .bind(actor.discovered_at)
    .execute(&mut *conn)
    .await;

    match result {
        Ok(done) => Ok(done.last_insert_rowid()),
        Err(e) if is_unique_violation(&e) => Err(AppError::Conflict(format!(
            "actor {} already exists",
            actor.id
        ))),
        Err(e) => Err(e.into()),
    }
}

/// Insert a public key row. Returns `false` when the key id was already stored.
async fn insert_public_key(
    conn: &mut SqliteConnection,
    actor_row_id: i64,
    key: &PublicKey,
) -> Result<bool, AppError> {
    let result = sqlx::query(
        "INSERT INTO actor_keys (key_id, actor_row_id, public_key_pem) VALUES (?, ?, ?)",
    )
    .bind(&key.id)
    .bind(actor_row_id)
    .bind(&key.pem)
    .execute(&mut *conn)
    .await;

    match result {
        Ok(_) => Ok(true),
        Err(e) if is_unique_violation(&e) => {
            tracing::debug!(key_id = %key.id, "Public key already stored; keeping existing row");
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

impl Database {
    // =========================================================================
    // Connection
    // =========================================================================

    /// Connect to SQLite database
    ///
    /// Creates the database file if it doesn't exist.
    /// Runs pending migrations automatically.
    ///
    /// # Errors
    /// Returns error if connection or migration fails
    pub async fn connect(path: &Path) -> Result<Self, AppError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AppError::Database(sqlx::Error::Io(e)))?;
        }

        let connection_string = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePool::connect(&connection_string).await?;

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
    // Local actors
    // =========================================================================

    /// Insert a local actor with its public key and credentials atomically.
    ///
    /// A taken username or identifier is `Conflict`; nothing is written.
    pub async fn create_local_actor(
        &self,
        actor: &Actor,
        credentials: &NewLocalCredentials,
    ) -> Result<i64, AppError> {
        let mut tx = self.pool.begin().await?;

        let row_id = insert_actor_row(&mut tx, actor).await?;
        insert_public_key(&mut tx, row_id, &actor.public_key).await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO local_credentials (actor_row_id, username, password_hash, private_key_pem, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(row_id)
        .bind(&credentials.username)
        .bind(&credentials.password_hash)
        .bind(&credentials.private_key_pem)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                tx.rollback().await?;
                return Err(AppError::Conflict(format!(
                    "username {} is taken",
                    credentials.username
                )));
            }
            Err(e) => return Err(e.into()),
        }

        tx.commit().await?;
        Ok(row_id)
    }

    /// Get a local actor by username
    pub async fn get_local_actor(&self, username: &str) -> Result<Option<Actor>, AppError> {
        let query = format!(
            "SELECT {ACTOR_COLUMNS} FROM actors a \
             JOIN actor_keys k ON k.key_id = a.key_id \
             JOIN local_credentials c ON c.actor_row_id = a.id \
             WHERE c.username = ?"
        );
        let actor = sqlx::query_as::<_, Actor>(&query)
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;

        Ok(actor)
    }

    /// Number of provisioned local actors
    pub async fn count_local_actors(&self) -> Result<i64, AppError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM local_credentials")
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }

    /// Load the signing key of a local actor.
    ///
    /// The PEM never leaves this call; callers only see the opaque handle.
    pub async fn load_signing_key(&self, actor_id: &str) -> Result<Option<SigningKey>, AppError> {
        let row = sqlx::query_as::<_, (String, String)>(
            r#"
            SELECT a.key_id, c.private_key_pem
            FROM actors a
            JOIN local_credentials c ON c.actor_row_id = a.id
            WHERE a.actor_id = ?
            "#,
        )
        .bind(actor_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((key_id, pem)) => Ok(Some(SigningKey::from_pkcs8_pem(key_id, &pem)?)),
            None => Ok(None),
        }
    }

    // =========================================================================
    // Actors
    // =========================================================================

    /// Get an actor (local or remote) by identifier
    pub async fn get_actor(&self, actor_id: &str) -> Result<Option<Actor>, AppError> {
        let query = format!(
            "SELECT {ACTOR_COLUMNS} FROM actors a \
             JOIN actor_keys k ON k.key_id = a.key_id \
             WHERE a.actor_id = ?"
        );
        let actor = sqlx::query_as::<_, Actor>(&query)
            .bind(actor_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(actor)
    }

    /// Insert a remote actor and its public key atomically.
    ///
    /// A key id that is already stored is kept as is. When a WebFinger record
    /// exists for the identifier, its username and host win over the
    /// document's.
    pub async fn insert_actor(&self, actor: &Actor) -> Result<i64, AppError> {
        let mut tx = self.pool.begin().await?;

        let discovered = sqlx::query_as::<_, (String, String)>(
            "SELECT username, host FROM webfinger_records WHERE actor_id = ?",
        )
        .bind(&actor.id)
        .fetch_optional(&mut *tx)
        .await?;

        let mut actor = actor.clone();
        if let Some((username, host)) = discovered {
            actor.username = username;
            actor.host = host;
        }

        let row_id = insert_actor_row(&mut tx, &actor).await?;
        insert_public_key(&mut tx, row_id, &actor.public_key).await?;

        tx.commit().await?;
        Ok(row_id)
    }

    /// Look up a public key by key id, with its owning actor
    pub async fn get_public_key(&self, key_id: &str) -> Result<Option<StoredKey>, AppError> {
        let key = sqlx::query_as::<_, StoredKey>(
            r#"
            SELECT k.key_id, a.actor_id, k.public_key_pem
            FROM actor_keys k
            JOIN actors a ON a.id = k.actor_row_id
            WHERE k.key_id = ?
            "#,
        )
        .bind(key_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(key)
    }

    // =========================================================================
    // WebFinger records
    // =========================================================================

    /// Record which handle resolved to an actor identifier
    pub async fn upsert_webfinger_record(&self, record: &WebfingerRecord) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO webfinger_records (actor_id, username, host, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(actor_id) DO UPDATE SET username = excluded.username, host = excluded.host
            "#,
        )
        .bind(&record.actor_id)
        .bind(&record.username)
        .bind(&record.host)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_webfinger_record(
        &self,
        actor_id: &str,
    ) -> Result<Option<WebfingerRecord>, AppError> {
        let record = sqlx::query_as::<_, WebfingerRecord>(
            "SELECT actor_id, username, host, created_at FROM webfinger_records WHERE actor_id = ?",
        )
        .bind(actor_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    // =========================================================================
    // Follows
    // =========================================================================

    /// Add a follow edge
    ///
    /// Idempotent: returns `false` when the edge already existed.
    pub async fn add_follow(&self, follower_id: &str, followee_id: &str) -> Result<bool, AppError> {
        let result = sqlx::query(
            "INSERT INTO follows (follower_id, followee_id, created_at) VALUES (?, ?, ?)",
        )
        .bind(follower_id)
        .bind(followee_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(true),
            Err(e) if is_unique_violation(&e) => {
                tracing::debug!(follower_id, followee_id, "Follow edge already exists");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a follow edge
    ///
    /// Returns `false` when there was nothing to remove.
    pub async fn remove_follow(
        &self,
        followee_id: &str,
        follower_id: &str,
    ) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM follows WHERE followee_id = ? AND follower_id = ?")
            .bind(followee_id)
            .bind(follower_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn follow_exists(
        &self,
        follower_id: &str,
        followee_id: &str,
    ) -> Result<bool, AppError> {
        let exists = sqlx::query_scalar::<_, i64>(
            "SELECT EXISTS(SELECT 1 FROM follows WHERE follower_id = ? AND followee_id = ?)",
        )
        .bind(follower_id)
        .bind(followee_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists != 0)
    }

    pub async fn count_followers(&self, followee_id: &str) -> Result<i64, AppError> {
        let count =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM follows WHERE followee_id = ?")
                .bind(followee_id)
                .fetch_one(&self.pool)
                .await?;

        Ok(count)
    }

    /// Follower identifiers, newest first
    pub async fn get_followers(
        &self,
        followee_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<String>, AppError> {
        let followers = sqlx::query_scalar::<_, String>(
            r#"
            SELECT follower_id FROM follows
            WHERE followee_id = ?
            ORDER BY created_at DESC, follower_id
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(followee_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(followers)
    }

    pub async fn count_following(&self, follower_id: &str) -> Result<i64, AppError> {
        let count =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM follows WHERE follower_id = ?")
                .bind(follower_id)
                .fetch_one(&self.pool)
                .await?;

        Ok(count)
    }

    /// Followee identifiers, newest first
    pub async fn get_following(
        &self,
        follower_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<String>, AppError> {
        let following = sqlx::query_scalar::<_, String>(
            r#"
            SELECT followee_id FROM follows
            WHERE follower_id = ?
            ORDER BY created_at DESC, followee_id
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(follower_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(following)
    }

    // =========================================================================
    // Posts
    // =========================================================================

    /// Insert a post
    ///
    /// Returns `None` when a post with the same activity id is already stored.
    pub async fn insert_post(&self, post: &NewPost) -> Result<Option<i64>, AppError> {
        let result = sqlx::query(
            r#"
            INSERT INTO posts (activity_id, owner_id, actor_id, kind, published, url, title, content, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&post.activity_id)
        .bind(post.owner_id)
        .bind(&post.actor_id)
        .bind(post.content.kind.as_str())
        .bind(post.content.published)
        .bind(&post.content.url)
        .bind(&post.content.title)
        .bind(&post.content.content)
        .bind(Utc::now())
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) => Ok(Some(done.last_insert_rowid())),
            Err(e) if is_unique_violation(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Replace a post's content, matched by activity id and authoring actor
    pub async fn update_post(
        &self,
        activity_id: &str,
        actor_id: &str,
        content: &PostContent,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE posts
            SET kind = ?, published = ?, url = ?, title = ?, content = ?
            WHERE activity_id = ? AND actor_id = ?
            "#,
        )
        .bind(content.kind.as_str())
        .bind(content.published)
        .bind(&content.url)
        .bind(&content.title)
        .bind(&content.content)
        .bind(activity_id)
        .bind(actor_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Delete a post, matched by activity id and authoring actor
    pub async fn delete_post(&self, activity_id: &str, actor_id: &str) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM posts WHERE activity_id = ? AND actor_id = ?")
            .bind(activity_id)
            .bind(actor_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn get_post(&self, activity_id: &str) -> Result<Option<Post>, AppError> {
        let query = format!("SELECT {POST_COLUMNS} FROM posts WHERE activity_id = ?");
        let post = sqlx::query_as::<_, Post>(&query)
            .bind(activity_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(post)
    }

    /// Posts owned by an actor, in insertion order
    pub async fn get_posts_by_owner(&self, owner_id: i64) -> Result<Vec<Post>, AppError> {
        let query = format!("SELECT {POST_COLUMNS} FROM posts WHERE owner_id = ? ORDER BY id ASC");
        let posts = sqlx::query_as::<_, Post>(&query)
            .bind(owner_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(posts)
    }
}
