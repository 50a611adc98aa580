//! Entity persistence layer.
//!
//! Every collection lives in its own SQLite table. Scalar fields map to
//! columns one to one; ordered id sets (`watchHistory`, playlist `videos`)
//! are kept as JSON text. Rows leave the store either as typed entities
//! (point lookups) or as JSON documents (scans feeding the view executor).

use std::{path::Path, sync::Arc};

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{
    Connection, OptionalExtension, Row, TransactionBehavior, params, params_from_iter,
    types::Value as SqlValue,
};
use serde_json::Value;
use tokio::task;
use tracing::debug;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::model::{Comment, Like, LikeSubject, MediaAsset, Playlist, Subscription, Tweet, User, Video};

/// Named collections the store can scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Users,
    Videos,
    Comments,
    Tweets,
    Likes,
    Subscriptions,
    Playlists,
}

/// SQL column backing a document field. Like subjects share one
/// `subject_id` column and are told apart by `subject_kind`.
struct Column {
    name: &'static str,
    discriminant: Option<(&'static str, &'static str)>,
}

impl Column {
    const fn plain(name: &'static str) -> Self {
        Self {
            name,
            discriminant: None,
        }
    }

    const fn subject(kind: &'static str) -> Self {
        Self {
            name: "subject_id",
            discriminant: Some(("subject_kind", kind)),
        }
    }
}

impl Collection {
    pub fn table(self) -> &'static str {
        match self {
            Collection::Users => "users",
            Collection::Videos => "videos",
            Collection::Comments => "comments",
            Collection::Tweets => "tweets",
            Collection::Likes => "likes",
            Collection::Subscriptions => "subscriptions",
            Collection::Playlists => "playlists",
        }
    }

    /// Document fields covered by the text index of this collection.
    pub fn search_fields(self) -> &'static [&'static str] {
        match self {
            Collection::Videos => &["title", "description"],
            Collection::Comments | Collection::Tweets => &["content"],
            Collection::Users => &["username", "fullName"],
            Collection::Likes | Collection::Subscriptions | Collection::Playlists => &[],
        }
    }

    /// Whether a filter on `field` can be answered by the SQL scan.
    pub fn can_filter(self, field: &str) -> bool {
        self.column(field).is_some()
    }

    fn column(self, field: &str) -> Option<Column> {
        let column = match (self, field) {
            (_, "_id") => Column::plain("id"),
            (Collection::Users, "username") => Column::plain("username"),
            (Collection::Users, "fullName") => Column::plain("full_name"),
            (Collection::Videos, "owner") => Column::plain("owner"),
            (Collection::Videos, "isPublished") => Column::plain("is_published"),
            (Collection::Videos, "title") => Column::plain("title"),
            (Collection::Videos, "description") => Column::plain("description"),
            (Collection::Comments, "video") => Column::plain("video"),
            (Collection::Comments, "owner") => Column::plain("owner"),
            (Collection::Comments, "content") => Column::plain("content"),
            (Collection::Tweets, "owner") => Column::plain("owner"),
            (Collection::Tweets, "content") => Column::plain("content"),
            (Collection::Likes, "likedBy") => Column::plain("liked_by"),
            (Collection::Likes, "video") => Column::subject("video"),
            (Collection::Likes, "comment") => Column::subject("comment"),
            (Collection::Likes, "tweet") => Column::subject("tweet"),
            (Collection::Subscriptions, "subscriber") => Column::plain("subscriber"),
            (Collection::Subscriptions, "channel") => Column::plain("channel"),
            (Collection::Playlists, "owner") => Column::plain("owner"),
            _ => return None,
        };
        Some(column)
    }
}

/// Predicate pushed down into a collection scan.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanFilter {
    Eq { field: String, value: Value },
    In { field: String, values: Vec<Value> },
    Exists { field: String },
    /// Matches when any term occurs (case-insensitively) in any field.
    Text { fields: Vec<String>, terms: Vec<String> },
}

/// Edge records flipped by the toggle primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    Like(LikeSubject),
    Subscription { channel: Uuid },
}

/// Handle to the SQLite database. Cloning is cheap; all clones share one
/// connection and every call runs on the blocking thread pool.
#[derive(Clone)]
pub struct EntityStore {
    conn: Arc<Mutex<Connection>>,
}

impl EntityStore {
    /// Opens (and if necessary creates) the database file and ensures the
    /// schema exists. WAL mode is enabled to avoid readers blocking writers.
    pub fn open(path: &Path) -> CoreResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> CoreResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(mut conn: Connection) -> CoreResult<Self> {
        ensure_tables(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<F, T>(&self, f: F) -> CoreResult<T>
    where
        F: FnOnce(&mut Connection) -> CoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        task::spawn_blocking(move || {
            let mut conn = conn.lock();
            f(&mut conn)
        })
        .await
        .map_err(|err| CoreError::upstream(format!("store task join error: {err}")))?
    }

    /// Filtered scan in insertion order, returning JSON documents.
    pub async fn scan(
        &self,
        collection: Collection,
        filters: Vec<ScanFilter>,
    ) -> CoreResult<Vec<Value>> {
        let (sql, values) = build_scan(collection, &filters)?;
        debug!(table = collection.table(), %sql, "scanning collection");
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(params_from_iter(values.iter()))?;
            let mut docs = Vec::new();
            while let Some(row) = rows.next()? {
                docs.push(row_to_document(collection, row)?);
            }
            Ok(docs)
        })
        .await
    }

    pub async fn insert_user(&self, user: &User) -> CoreResult<()> {
        let user = user.clone();
        self.with_conn(move |conn| {
            conn.execute(
                r#"
                INSERT INTO users (
                    id, username, full_name, email, avatar_url, avatar_storage_id,
                    watch_history_json, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
                params![
                    user.id.to_string(),
                    user.username,
                    user.full_name,
                    user.email,
                    user.avatar.as_ref().map(|asset| asset.url.as_str()),
                    user.avatar.as_ref().map(|asset| asset.storage_id.as_str()),
                    id_list_json(&user.watch_history)?,
                    timestamp(&user.created_at),
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_user(&self, id: Uuid) -> CoreResult<Option<User>> {
        self.with_conn(move |conn| fetch_by_id(conn, "users", id, row_to_user))
            .await
    }

    /// Appends `video` to the user's watch history unless already present.
    pub async fn add_to_watch_history(&self, user: Uuid, video: Uuid) -> CoreResult<()> {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let raw: Option<String> = tx
                .query_row(
                    "SELECT watch_history_json FROM users WHERE id = ?1",
                    params![user.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            let raw = raw.ok_or_else(|| CoreError::not_found("user not found"))?;
            let mut history = parse_id_list(&raw)?;
            if !history.contains(&video) {
                history.push(video);
                tx.execute(
                    "UPDATE users SET watch_history_json = ?2 WHERE id = ?1",
                    params![user.to_string(), id_list_json(&history)?],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    pub async fn insert_video(&self, video: &Video) -> CoreResult<()> {
        let video = video.clone();
        self.with_conn(move |conn| {
            conn.execute(
                r#"
                INSERT INTO videos (
                    id, title, description, video_url, video_storage_id,
                    thumbnail_url, thumbnail_storage_id, duration, views,
                    is_published, owner, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                "#,
                params![
                    video.id.to_string(),
                    video.title,
                    video.description,
                    video.video_file.url,
                    video.video_file.storage_id,
                    video.thumbnail.url,
                    video.thumbnail.storage_id,
                    video.duration,
                    video.views,
                    video.is_published,
                    video.owner.to_string(),
                    timestamp(&video.created_at),
                    timestamp(&video.updated_at),
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_video(&self, id: Uuid) -> CoreResult<Option<Video>> {
        self.with_conn(move |conn| fetch_by_id(conn, "videos", id, row_to_video))
            .await
    }

    /// Replaces the mutable fields of a video. Returns `false` when the row
    /// no longer exists.
    pub async fn update_video(&self, video: &Video) -> CoreResult<bool> {
        let video = video.clone();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                r#"
                UPDATE videos SET
                    title = ?2,
                    description = ?3,
                    thumbnail_url = ?4,
                    thumbnail_storage_id = ?5,
                    is_published = ?6,
                    updated_at = ?7
                WHERE id = ?1
                "#,
                params![
                    video.id.to_string(),
                    video.title,
                    video.description,
                    video.thumbnail.url,
                    video.thumbnail.storage_id,
                    video.is_published,
                    timestamp(&video.updated_at),
                ],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    pub async fn increment_views(&self, id: Uuid) -> CoreResult<()> {
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE videos SET views = views + 1 WHERE id = ?1",
                params![id.to_string()],
            )?;
            if changed == 0 {
                return Err(CoreError::not_found("video not found"));
            }
            Ok(())
        })
        .await
    }

    /// Deletes a video together with its comments and every like that
    /// references the video or one of those comments.
    pub async fn delete_video(&self, id: Uuid) -> CoreResult<bool> {
        self.with_conn(move |conn| {
            let id = id.to_string();
            let tx = conn.transaction()?;
            tx.execute(
                r#"
                DELETE FROM likes
                WHERE subject_kind = 'comment'
                  AND subject_id IN (SELECT id FROM comments WHERE video = ?1)
                "#,
                params![id],
            )?;
            tx.execute(
                "DELETE FROM likes WHERE subject_kind = 'video' AND subject_id = ?1",
                params![id],
            )?;
            tx.execute("DELETE FROM comments WHERE video = ?1", params![id])?;
            let removed = tx.execute("DELETE FROM videos WHERE id = ?1", params![id])?;
            tx.commit()?;
            Ok(removed > 0)
        })
        .await
    }

    pub async fn insert_comment(&self, comment: &Comment) -> CoreResult<()> {
        let comment = comment.clone();
        self.with_conn(move |conn| {
            conn.execute(
                r#"
                INSERT INTO comments (id, content, video, owner, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
                params![
                    comment.id.to_string(),
                    comment.content,
                    comment.video.to_string(),
                    comment.owner.to_string(),
                    timestamp(&comment.created_at),
                    timestamp(&comment.updated_at),
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_comment(&self, id: Uuid) -> CoreResult<Option<Comment>> {
        self.with_conn(move |conn| fetch_by_id(conn, "comments", id, row_to_comment))
            .await
    }

    pub async fn update_comment(&self, comment: &Comment) -> CoreResult<bool> {
        let comment = comment.clone();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE comments SET content = ?2, updated_at = ?3 WHERE id = ?1",
                params![
                    comment.id.to_string(),
                    comment.content,
                    timestamp(&comment.updated_at),
                ],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    pub async fn delete_comment(&self, id: Uuid) -> CoreResult<bool> {
        self.delete_with_likes("comments", "comment", id).await
    }

    pub async fn insert_tweet(&self, tweet: &Tweet) -> CoreResult<()> {
        let tweet = tweet.clone();
        self.with_conn(move |conn| {
            conn.execute(
                r#"
                INSERT INTO tweets (id, content, owner, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
                params![
                    tweet.id.to_string(),
                    tweet.content,
                    tweet.owner.to_string(),
                    timestamp(&tweet.created_at),
                    timestamp(&tweet.updated_at),
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_tweet(&self, id: Uuid) -> CoreResult<Option<Tweet>> {
        self.with_conn(move |conn| fetch_by_id(conn, "tweets", id, row_to_tweet))
            .await
    }

    pub async fn update_tweet(&self, tweet: &Tweet) -> CoreResult<bool> {
        let tweet = tweet.clone();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE tweets SET content = ?2, updated_at = ?3 WHERE id = ?1",
                params![
                    tweet.id.to_string(),
                    tweet.content,
                    timestamp(&tweet.updated_at),
                ],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    pub async fn delete_tweet(&self, id: Uuid) -> CoreResult<bool> {
        self.delete_with_likes("tweets", "tweet", id).await
    }

    async fn delete_with_likes(
        &self,
        table: &'static str,
        subject_kind: &'static str,
        id: Uuid,
    ) -> CoreResult<bool> {
        self.with_conn(move |conn| {
            let id = id.to_string();
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM likes WHERE subject_kind = ?1 AND subject_id = ?2",
                params![subject_kind, id],
            )?;
            let removed = tx.execute(&format!("DELETE FROM {table} WHERE id = ?1"), params![id])?;
            tx.commit()?;
            Ok(removed > 0)
        })
        .await
    }

    pub async fn insert_playlist(&self, playlist: &Playlist) -> CoreResult<()> {
        let playlist = playlist.clone();
        self.with_conn(move |conn| {
            conn.execute(
                r#"
                INSERT INTO playlists (
                    id, name, description, owner, videos_json, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
                params![
                    playlist.id.to_string(),
                    playlist.name,
                    playlist.description,
                    playlist.owner.to_string(),
                    id_list_json(&playlist.videos)?,
                    timestamp(&playlist.created_at),
                    timestamp(&playlist.updated_at),
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_playlist(&self, id: Uuid) -> CoreResult<Option<Playlist>> {
        self.with_conn(move |conn| fetch_by_id(conn, "playlists", id, row_to_playlist))
            .await
    }

    pub async fn update_playlist(&self, playlist: &Playlist) -> CoreResult<bool> {
        let playlist = playlist.clone();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                r#"
                UPDATE playlists SET name = ?2, description = ?3, updated_at = ?4
                WHERE id = ?1
                "#,
                params![
                    playlist.id.to_string(),
                    playlist.name,
                    playlist.description,
                    timestamp(&playlist.updated_at),
                ],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    pub async fn delete_playlist(&self, id: Uuid) -> CoreResult<bool> {
        self.with_conn(move |conn| {
            let removed = conn.execute(
                "DELETE FROM playlists WHERE id = ?1",
                params![id.to_string()],
            )?;
            Ok(removed > 0)
        })
        .await
    }

    /// Adds (`insert = true`) or removes a video from a playlist inside one
    /// transaction and returns the updated playlist.
    pub async fn edit_playlist_videos(
        &self,
        playlist: Uuid,
        video: Uuid,
        insert: bool,
    ) -> CoreResult<Playlist> {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut current = fetch_by_id(&tx, "playlists", playlist, row_to_playlist)?
                .ok_or_else(|| CoreError::not_found("playlist not found"))?;
            let present = current.videos.contains(&video);
            if insert && !present {
                current.videos.push(video);
            } else if !insert && present {
                current.videos.retain(|id| *id != video);
            }
            current.updated_at = Utc::now();
            tx.execute(
                "UPDATE playlists SET videos_json = ?2, updated_at = ?3 WHERE id = ?1",
                params![
                    playlist.to_string(),
                    id_list_json(&current.videos)?,
                    timestamp(&current.updated_at),
                ],
            )?;
            tx.commit()?;
            Ok(current)
        })
        .await
    }

    /// Atomic insert-if-absent-else-delete on an edge record. Returns whether
    /// the relation exists afterwards. Fails with `NotFound` when the subject
    /// entity is missing.
    pub async fn toggle_relation(&self, relation: Relation, actor: Uuid) -> CoreResult<bool> {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let (subject_table, subject_id) = match relation {
                Relation::Like(LikeSubject::Video(id)) => ("videos", id),
                Relation::Like(LikeSubject::Comment(id)) => ("comments", id),
                Relation::Like(LikeSubject::Tweet(id)) => ("tweets", id),
                Relation::Subscription { channel } => ("users", channel),
            };
            if !row_exists(&tx, subject_table, subject_id)? {
                return Err(CoreError::not_found(format!(
                    "{} not found",
                    subject_label(subject_table)
                )));
            }

            let now = timestamp(&Utc::now());
            let active = match relation {
                Relation::Like(subject) => {
                    let removed = tx.execute(
                        r#"
                        DELETE FROM likes
                        WHERE subject_kind = ?1 AND subject_id = ?2 AND liked_by = ?3
                        "#,
                        params![subject.kind(), subject.id().to_string(), actor.to_string()],
                    )?;
                    if removed == 0 {
                        tx.execute(
                            r#"
                            INSERT INTO likes (id, subject_kind, subject_id, liked_by, created_at)
                            VALUES (?1, ?2, ?3, ?4, ?5)
                            "#,
                            params![
                                Uuid::new_v4().to_string(),
                                subject.kind(),
                                subject.id().to_string(),
                                actor.to_string(),
                                now,
                            ],
                        )?;
                    }
                    removed == 0
                }
                Relation::Subscription { channel } => {
                    let removed = tx.execute(
                        "DELETE FROM subscriptions WHERE subscriber = ?1 AND channel = ?2",
                        params![actor.to_string(), channel.to_string()],
                    )?;
                    if removed == 0 {
                        tx.execute(
                            r#"
                            INSERT INTO subscriptions (id, subscriber, channel, created_at)
                            VALUES (?1, ?2, ?3, ?4)
                            "#,
                            params![
                                Uuid::new_v4().to_string(),
                                actor.to_string(),
                                channel.to_string(),
                                now,
                            ],
                        )?;
                    }
                    removed == 0
                }
            };
            tx.commit()?;
            Ok(active)
        })
        .await
    }
}

/// Runs the DDL inside a transaction so a failure leaves the DB untouched.
/// The UNIQUE indexes on `likes` and `subscriptions` back the toggle
/// invariant.
fn ensure_tables(conn: &mut Connection) -> CoreResult<()> {
    let tx = conn.transaction()?;
    tx.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            username TEXT NOT NULL UNIQUE,
            full_name TEXT NOT NULL,
            email TEXT NOT NULL UNIQUE,
            avatar_url TEXT,
            avatar_storage_id TEXT,
            watch_history_json TEXT NOT NULL DEFAULT '[]',
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS videos (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            video_url TEXT NOT NULL,
            video_storage_id TEXT NOT NULL,
            thumbnail_url TEXT NOT NULL,
            thumbnail_storage_id TEXT NOT NULL,
            duration REAL NOT NULL DEFAULT 0,
            views INTEGER NOT NULL DEFAULT 0,
            is_published INTEGER NOT NULL DEFAULT 0,
            owner TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_videos_owner ON videos(owner);

        CREATE TABLE IF NOT EXISTS comments (
            id TEXT PRIMARY KEY,
            content TEXT NOT NULL,
            video TEXT NOT NULL,
            owner TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_comments_video ON comments(video);

        CREATE TABLE IF NOT EXISTS tweets (
            id TEXT PRIMARY KEY,
            content TEXT NOT NULL,
            owner TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_tweets_owner ON tweets(owner);

        CREATE TABLE IF NOT EXISTS likes (
            id TEXT PRIMARY KEY,
            subject_kind TEXT NOT NULL CHECK (subject_kind IN ('video', 'comment', 'tweet')),
            subject_id TEXT NOT NULL,
            liked_by TEXT NOT NULL,
            created_at TEXT NOT NULL,
            UNIQUE (subject_kind, subject_id, liked_by)
        );
        CREATE INDEX IF NOT EXISTS idx_likes_liked_by ON likes(liked_by);

        CREATE TABLE IF NOT EXISTS subscriptions (
            id TEXT PRIMARY KEY,
            subscriber TEXT NOT NULL,
            channel TEXT NOT NULL,
            created_at TEXT NOT NULL,
            UNIQUE (subscriber, channel)
        );
        CREATE INDEX IF NOT EXISTS idx_subscriptions_channel ON subscriptions(channel);

        CREATE TABLE IF NOT EXISTS playlists (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            owner TEXT NOT NULL,
            videos_json TEXT NOT NULL DEFAULT '[]',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_playlists_owner ON playlists(owner);
        "#,
    )?;
    tx.commit()?;
    Ok(())
}

fn build_scan(collection: Collection, filters: &[ScanFilter]) -> CoreResult<(String, Vec<SqlValue>)> {
    let mut clauses = Vec::new();
    let mut values = Vec::new();

    for filter in filters {
        match filter {
            ScanFilter::Eq { field, value } => {
                let column = scan_column(collection, field)?;
                push_discriminant(&column, &mut clauses, &mut values);
                clauses.push(format!("{} = ?", column.name));
                values.push(to_sql_value(value)?);
            }
            ScanFilter::In { field, values: candidates } => {
                let column = scan_column(collection, field)?;
                push_discriminant(&column, &mut clauses, &mut values);
                if candidates.is_empty() {
                    clauses.push("0".to_owned());
                    continue;
                }
                let placeholders = vec!["?"; candidates.len()].join(", ");
                clauses.push(format!("{} IN ({placeholders})", column.name));
                for candidate in candidates {
                    values.push(to_sql_value(candidate)?);
                }
            }
            ScanFilter::Exists { field } => {
                let column = scan_column(collection, field)?;
                push_discriminant(&column, &mut clauses, &mut values);
                clauses.push(format!("{} IS NOT NULL", column.name));
            }
            ScanFilter::Text { fields, terms } => {
                let mut alternatives = Vec::new();
                for term in terms {
                    let pattern = format!("%{}%", escape_like(term));
                    for field in fields {
                        let column = scan_column(collection, field)?;
                        alternatives.push(format!("{} LIKE ? ESCAPE '\\'", column.name));
                        values.push(SqlValue::Text(pattern.clone()));
                    }
                }
                if alternatives.is_empty() {
                    clauses.push("0".to_owned());
                } else {
                    clauses.push(format!("({})", alternatives.join(" OR ")));
                }
            }
        }
    }

    let where_clause = if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    };
    let sql = format!(
        "SELECT * FROM {}{} ORDER BY rowid ASC",
        collection.table(),
        where_clause
    );
    Ok((sql, values))
}

fn scan_column(collection: Collection, field: &str) -> CoreResult<Column> {
    collection.column(field).ok_or_else(|| {
        CoreError::query(format!(
            "field `{field}` cannot be filtered on {}",
            collection.table()
        ))
    })
}

fn push_discriminant(column: &Column, clauses: &mut Vec<String>, values: &mut Vec<SqlValue>) {
    if let Some((name, kind)) = column.discriminant {
        clauses.push(format!("{name} = ?"));
        values.push(SqlValue::Text(kind.to_owned()));
    }
}

fn escape_like(term: &str) -> String {
    term.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

fn to_sql_value(value: &Value) -> CoreResult<SqlValue> {
    match value {
        Value::Null => Ok(SqlValue::Null),
        Value::Bool(flag) => Ok(SqlValue::Integer(i64::from(*flag))),
        Value::String(text) => Ok(SqlValue::Text(text.clone())),
        Value::Number(number) => number
            .as_i64()
            .map(SqlValue::Integer)
            .or_else(|| number.as_f64().map(SqlValue::Real))
            .ok_or_else(|| CoreError::query(format!("unsupported number {number}"))),
        Value::Array(_) | Value::Object(_) => Err(CoreError::query(
            "scan filters only accept scalar values",
        )),
    }
}

fn subject_label(table: &str) -> &'static str {
    match table {
        "videos" => "video",
        "comments" => "comment",
        "tweets" => "tweet",
        _ => "channel",
    }
}

fn row_exists(conn: &Connection, table: &str, id: Uuid) -> CoreResult<bool> {
    let found: Option<i64> = conn
        .query_row(
            &format!("SELECT 1 FROM {table} WHERE id = ?1 LIMIT 1"),
            params![id.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn fetch_by_id<T>(
    conn: &Connection,
    table: &str,
    id: Uuid,
    map: fn(&Row<'_>) -> CoreResult<T>,
) -> CoreResult<Option<T>> {
    let mut stmt = conn.prepare(&format!("SELECT * FROM {table} WHERE id = ?1"))?;
    let mut rows = stmt.query(params![id.to_string()])?;
    let found = match rows.next()? {
        Some(row) => Some(map(row)?),
        None => None,
    };
    Ok(found)
}

fn timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn read_timestamp(row: &Row<'_>, column: &str) -> CoreResult<DateTime<Utc>> {
    let raw: String = row.get(column)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|value| value.with_timezone(&Utc))
        .map_err(|err| CoreError::upstream(format!("corrupt timestamp in {column}: {err}")))
}

fn read_id(row: &Row<'_>, column: &str) -> CoreResult<Uuid> {
    let raw: String = row.get(column)?;
    Uuid::parse_str(&raw)
        .map_err(|err| CoreError::upstream(format!("corrupt id in {column}: {err}")))
}

fn id_list_json(ids: &[Uuid]) -> CoreResult<String> {
    serde_json::to_string(ids)
        .map_err(|err| CoreError::upstream(format!("serializing id list: {err}")))
}

fn parse_id_list(raw: &str) -> CoreResult<Vec<Uuid>> {
    serde_json::from_str(raw)
        .map_err(|err| CoreError::upstream(format!("parsing stored id list: {err}")))
}

fn row_to_document(collection: Collection, row: &Row<'_>) -> CoreResult<Value> {
    let doc = match collection {
        Collection::Users => serde_json::to_value(row_to_user(row)?),
        Collection::Videos => serde_json::to_value(row_to_video(row)?),
        Collection::Comments => serde_json::to_value(row_to_comment(row)?),
        Collection::Tweets => serde_json::to_value(row_to_tweet(row)?),
        Collection::Likes => serde_json::to_value(row_to_like(row)?),
        Collection::Subscriptions => serde_json::to_value(row_to_subscription(row)?),
        Collection::Playlists => serde_json::to_value(row_to_playlist(row)?),
    };
    doc.map_err(|err| CoreError::upstream(format!("encoding {} row: {err}", collection.table())))
}

fn row_to_user(row: &Row<'_>) -> CoreResult<User> {
    let avatar_url: Option<String> = row.get("avatar_url")?;
    let avatar_storage_id: Option<String> = row.get("avatar_storage_id")?;
    let history_json: String = row.get("watch_history_json")?;
    Ok(User {
        id: read_id(row, "id")?,
        username: row.get("username")?,
        full_name: row.get("full_name")?,
        email: row.get("email")?,
        avatar: avatar_url.map(|url| MediaAsset {
            url,
            storage_id: avatar_storage_id.unwrap_or_default(),
        }),
        watch_history: parse_id_list(&history_json)?,
        created_at: read_timestamp(row, "created_at")?,
    })
}

fn row_to_video(row: &Row<'_>) -> CoreResult<Video> {
    Ok(Video {
        id: read_id(row, "id")?,
        title: row.get("title")?,
        description: row.get("description")?,
        video_file: MediaAsset {
            url: row.get("video_url")?,
            storage_id: row.get("video_storage_id")?,
        },
        thumbnail: MediaAsset {
            url: row.get("thumbnail_url")?,
            storage_id: row.get("thumbnail_storage_id")?,
        },
        duration: row.get("duration")?,
        views: row.get("views")?,
        is_published: row.get::<_, i64>("is_published").map(|value| value != 0)?,
        owner: read_id(row, "owner")?,
        created_at: read_timestamp(row, "created_at")?,
        updated_at: read_timestamp(row, "updated_at")?,
    })
}

fn row_to_comment(row: &Row<'_>) -> CoreResult<Comment> {
    Ok(Comment {
        id: read_id(row, "id")?,
        content: row.get("content")?,
        video: read_id(row, "video")?,
        owner: read_id(row, "owner")?,
        created_at: read_timestamp(row, "created_at")?,
        updated_at: read_timestamp(row, "updated_at")?,
    })
}

fn row_to_tweet(row: &Row<'_>) -> CoreResult<Tweet> {
    Ok(Tweet {
        id: read_id(row, "id")?,
        content: row.get("content")?,
        owner: read_id(row, "owner")?,
        created_at: read_timestamp(row, "created_at")?,
        updated_at: read_timestamp(row, "updated_at")?,
    })
}

fn row_to_like(row: &Row<'_>) -> CoreResult<Like> {
    let kind: String = row.get("subject_kind")?;
    let subject_id = read_id(row, "subject_id")?;
    let subject = LikeSubject::from_parts(&kind, subject_id)
        .ok_or_else(|| CoreError::upstream(format!("unknown like subject kind {kind}")))?;
    Ok(Like {
        id: read_id(row, "id")?,
        subject,
        liked_by: read_id(row, "liked_by")?,
        created_at: read_timestamp(row, "created_at")?,
    })
}

fn row_to_subscription(row: &Row<'_>) -> CoreResult<Subscription> {
    Ok(Subscription {
        id: read_id(row, "id")?,
        subscriber: read_id(row, "subscriber")?,
        channel: read_id(row, "channel")?,
        created_at: read_timestamp(row, "created_at")?,
    })
}

fn row_to_playlist(row: &Row<'_>) -> CoreResult<Playlist> {
    let videos_json: String = row.get("videos_json")?;
    Ok(Playlist {
        id: read_id(row, "id")?,
        name: row.get("name")?,
        description: row.get("description")?,
        owner: read_id(row, "owner")?,
        videos: parse_id_list(&videos_json)?,
        created_at: read_timestamp(row, "created_at")?,
        updated_at: read_timestamp(row, "updated_at")?,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn sample_user(username: &str) -> User {
        User {
            id: Uuid::new_v4(),
            username: username.to_owned(),
            full_name: format!("{username} fullname"),
            email: format!("{username}@example.com"),
            avatar: Some(MediaAsset {
                url: format!("/media/image/{username}.png"),
                storage_id: format!("{username}.png"),
            }),
            watch_history: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub(crate) fn sample_video(owner: Uuid, title: &str, published: bool) -> Video {
        let now = Utc::now();
        Video {
            id: Uuid::new_v4(),
            title: title.to_owned(),
            description: format!("about {title}"),
            video_file: MediaAsset {
                url: format!("/media/video/{title}.mp4"),
                storage_id: format!("{title}.mp4"),
            },
            thumbnail: MediaAsset {
                url: format!("/media/image/{title}.jpg"),
                storage_id: format!("{title}.jpg"),
            },
            duration: 12.5,
            views: 0,
            is_published: published,
            owner,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn video_round_trips_through_point_lookup() {
        let store = EntityStore::open_in_memory().unwrap();
        let owner = sample_user("alice");
        store.insert_user(&owner).await.unwrap();
        let video = sample_video(owner.id, "intro", true);
        store.insert_video(&video).await.unwrap();

        let fetched = store.get_video(video.id).await.unwrap().unwrap();
        assert_eq!(fetched.title, "intro");
        assert!(fetched.is_published);
        assert_eq!(fetched.owner, owner.id);
        assert!(store.get_video(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_username_is_a_conflict() {
        let store = EntityStore::open_in_memory().unwrap();
        store.insert_user(&sample_user("bob")).await.unwrap();
        let mut again = sample_user("bob");
        again.email = "other@example.com".into();
        let err = store.insert_user(&again).await.unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn scan_pushes_down_equality_and_text() {
        let store = EntityStore::open_in_memory().unwrap();
        let owner = sample_user("carol");
        store.insert_user(&owner).await.unwrap();
        store
            .insert_video(&sample_video(owner.id, "rust tips", true))
            .await
            .unwrap();
        store
            .insert_video(&sample_video(owner.id, "cooking 100%", false))
            .await
            .unwrap();

        let published = store
            .scan(
                Collection::Videos,
                vec![ScanFilter::Eq {
                    field: "isPublished".into(),
                    value: json!(true),
                }],
            )
            .await
            .unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0]["title"], json!("rust tips"));

        let found = store
            .scan(
                Collection::Videos,
                vec![ScanFilter::Text {
                    fields: vec!["title".into(), "description".into()],
                    terms: vec!["100%".into()],
                }],
            )
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0]["title"], json!("cooking 100%"));
    }

    #[tokio::test]
    async fn scan_rejects_unindexed_fields() {
        let store = EntityStore::open_in_memory().unwrap();
        let err = store
            .scan(
                Collection::Videos,
                vec![ScanFilter::Eq {
                    field: "views".into(),
                    value: json!(1),
                }],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Query(_)));
    }

    #[tokio::test]
    async fn toggle_relation_alternates_and_checks_subject() {
        let store = EntityStore::open_in_memory().unwrap();
        let owner = sample_user("dave");
        store.insert_user(&owner).await.unwrap();
        let video = sample_video(owner.id, "clip", true);
        store.insert_video(&video).await.unwrap();

        let relation = Relation::Like(LikeSubject::Video(video.id));
        assert!(store.toggle_relation(relation, owner.id).await.unwrap());
        assert!(!store.toggle_relation(relation, owner.id).await.unwrap());
        assert!(store.toggle_relation(relation, owner.id).await.unwrap());

        let likes = store.scan(Collection::Likes, Vec::new()).await.unwrap();
        assert_eq!(likes.len(), 1);

        let missing = Relation::Like(LikeSubject::Tweet(Uuid::new_v4()));
        let err = store.toggle_relation(missing, owner.id).await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn watch_history_has_set_semantics() {
        let store = EntityStore::open_in_memory().unwrap();
        let user = sample_user("erin");
        store.insert_user(&user).await.unwrap();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        store.add_to_watch_history(user.id, first).await.unwrap();
        store.add_to_watch_history(user.id, second).await.unwrap();
        store.add_to_watch_history(user.id, first).await.unwrap();

        let stored = store.get_user(user.id).await.unwrap().unwrap();
        assert_eq!(stored.watch_history, vec![first, second]);
    }

    #[tokio::test]
    async fn deleting_a_video_removes_its_comments_and_likes() {
        let store = EntityStore::open_in_memory().unwrap();
        let owner = sample_user("frank");
        store.insert_user(&owner).await.unwrap();
        let video = sample_video(owner.id, "gone", true);
        store.insert_video(&video).await.unwrap();
        let now = Utc::now();
        let comment = Comment {
            id: Uuid::new_v4(),
            content: "nice".into(),
            video: video.id,
            owner: owner.id,
            created_at: now,
            updated_at: now,
        };
        store.insert_comment(&comment).await.unwrap();
        store
            .toggle_relation(Relation::Like(LikeSubject::Video(video.id)), owner.id)
            .await
            .unwrap();
        store
            .toggle_relation(Relation::Like(LikeSubject::Comment(comment.id)), owner.id)
            .await
            .unwrap();

        assert!(store.delete_video(video.id).await.unwrap());
        assert!(store.get_comment(comment.id).await.unwrap().is_none());
        assert!(store.scan(Collection::Likes, Vec::new()).await.unwrap().is_empty());
        assert!(!store.delete_video(video.id).await.unwrap());
    }

    #[tokio::test]
    async fn open_creates_database_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("vidtube.db");
        let store = EntityStore::open(&path).unwrap();
        store.insert_user(&sample_user("gina")).await.unwrap();
        assert!(path.exists());
    }
}
