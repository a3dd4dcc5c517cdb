//! src/services/local_store.rs
//!
//! LocalStore: a multipart object backend for development, backed by SQLite
//! for session and object metadata and by local disk for payloads. Completed
//! objects live under `base_path/{shard}/{shard}/{key}`; parts are staged
//! under `base_path/.multipart/{upload_id}/` until the session completes.

use super::backend::{
    BackendError, BackendResult, ObjectBackend, Presence, check_part_number, check_part_order,
};
use crate::models::{
    multipart::{MultipartPart, MultipartUpload},
    object::Object,
    session::CompletedPart,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use md5::Context;
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use std::{
    collections::HashMap,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tokio_util::io::ReaderStream;
use tracing::{debug, info};
use uuid::Uuid;

const MAX_OBJECT_KEY_LEN: usize = 1024;
const STAGING_DIR: &str = ".multipart";
const INIT_SQL: &str = include_str!("../../migrations/0001_init.sql");

#[derive(Clone)]
pub struct LocalStore {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: Arc<SqlitePool>,

    /// Base directory on disk where payloads are stored.
    pub base_path: PathBuf,

    min_part_size: usize,
}

impl LocalStore {
    /// Wrap an existing pool. Call [`migrate`](Self::migrate) before use.
    pub fn new(db: Arc<SqlitePool>, base_path: impl Into<PathBuf>, min_part_size: usize) -> Self {
        Self {
            db,
            base_path: base_path.into(),
            min_part_size,
        }
    }

    /// Open (creating if needed) the SQLite database and storage directory,
    /// then apply the schema.
    pub async fn connect(
        database_url: &str,
        base_path: impl Into<PathBuf>,
        min_part_size: usize,
    ) -> BackendResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        if let Some(parent) = options.get_filename().parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).await?;
                info!("Created missing directory {:?}", parent);
            }
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self::new(Arc::new(pool), base_path, min_part_size);
        fs::create_dir_all(&store.base_path).await?;
        store.migrate().await?;
        Ok(store)
    }

    /// Apply the embedded schema. Every statement is idempotent.
    pub async fn migrate(&self) -> BackendResult<()> {
        let statements = INIT_SQL
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        debug!("Running {} migration statements...", statements.len());
        for stmt in statements {
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(())
    }

    /// Map a location to a relative key, rejecting traversal and control
    /// characters. Locations are absolute-looking (`/chat/...`); the leading
    /// slash is dropped.
    fn relative_key(location: &str) -> BackendResult<&str> {
        let key = location.trim_start_matches('/');
        let invalid = || {
            BackendError::Io(io::Error::new(
                ErrorKind::InvalidInput,
                format!("invalid object key `{location}`"),
            ))
        };
        if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN {
            return Err(invalid());
        }
        if key.split('/').any(|segment| segment.is_empty() || segment == "..") {
            return Err(invalid());
        }
        if key
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return Err(invalid());
        }
        Ok(key)
    }

    /// Two-level shard directories from MD5(key), to bound files per directory.
    fn object_shards(key: &str) -> (String, String) {
        let digest = md5::compute(key);
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn object_path(&self, key: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(key);
        let mut path = self.base_path.clone();
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        path
    }

    fn staging_dir(&self, upload_id: Uuid) -> PathBuf {
        self.base_path.join(STAGING_DIR).join(upload_id.to_string())
    }

    fn part_path(&self, upload_id: Uuid, part_number: u32) -> PathBuf {
        self.staging_dir(upload_id).join(format!("{part_number:05}"))
    }

    /// Fetch an open (not completed) session.
    async fn fetch_open_upload(&self, session_id: &str) -> BackendResult<MultipartUpload> {
        let id = Uuid::parse_str(session_id)
            .map_err(|_| BackendError::UnknownSession(session_id.to_string()))?;

        let upload = sqlx::query_as::<_, MultipartUpload>(
            "SELECT id, key, content_type, initiated_at, completed
             FROM multipart_uploads WHERE id = ?",
        )
        .bind(id)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => BackendError::UnknownSession(session_id.to_string()),
            other => BackendError::Sqlx(other),
        })?;

        if upload.completed {
            return Err(BackendError::SessionCompleted(session_id.to_string()));
        }
        Ok(upload)
    }

    /// Concatenate staged parts into a temp file next to `file_path`, fsync,
    /// then rename into place. Returns the object size.
    async fn assemble(
        &self,
        upload_id: Uuid,
        parts: &[CompletedPart],
        file_path: &Path,
    ) -> BackendResult<i64> {
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            BackendError::Io(io::Error::new(
                ErrorKind::Other,
                "object path missing parent directory",
            ))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));

        let size_bytes = match self.write_parts(upload_id, parts, &tmp_path).await {
            Ok(size) => size,
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(err);
            }
        };

        if let Err(err) = fs::rename(&tmp_path, file_path).await {
            if err.kind() == ErrorKind::AlreadyExists {
                fs::remove_file(file_path).await?;
                fs::rename(&tmp_path, file_path).await?;
            } else {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(BackendError::Io(err));
            }
        }
        Ok(size_bytes)
    }

    async fn write_parts(
        &self,
        upload_id: Uuid,
        parts: &[CompletedPart],
        tmp_path: &Path,
    ) -> BackendResult<i64> {
        let mut file = File::create(tmp_path).await?;
        let mut size_bytes: i64 = 0;
        for part in parts {
            let source = File::open(self.part_path(upload_id, part.part_number)).await?;
            let mut stream = ReaderStream::new(source);
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                size_bytes += chunk.len() as i64;
                file.write_all(&chunk).await?;
            }
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok(size_bytes)
    }
}

/// S3-style multipart etag: digest of the part etags plus the part count.
fn multipart_etag(parts: &[CompletedPart]) -> String {
    let mut digest = Context::new();
    for part in parts {
        digest.consume(part.etag.as_bytes());
    }
    format!("{:x}-{}", digest.compute(), parts.len())
}

#[async_trait]
impl ObjectBackend for LocalStore {
    fn name(&self) -> &'static str {
        "local"
    }

    fn min_part_size(&self) -> usize {
        self.min_part_size
    }

    async fn probe(&self, location: &str) -> BackendResult<Presence> {
        let key = Self::relative_key(location)?;
        let found = sqlx::query_as::<_, Object>(
            "SELECT id, key, content_type, size_bytes, etag, last_modified FROM objects WHERE key = ?",
        )
        .bind(key)
        .fetch_optional(&*self.db)
        .await?;

        Ok(match found {
            Some(object) => {
                debug!(
                    key = %object.key,
                    size_bytes = object.size_bytes,
                    etag = %object.etag,
                    "location occupied"
                );
                Presence::Exists
            }
            None => Presence::NotFound,
        })
    }

    async fn create_session(&self, location: &str, content_type: &str) -> BackendResult<String> {
        let key = Self::relative_key(location)?;
        let upload = MultipartUpload {
            id: Uuid::new_v4(),
            key: key.to_string(),
            content_type: content_type.to_string(),
            initiated_at: Utc::now(),
            completed: false,
        };

        fs::create_dir_all(self.staging_dir(upload.id)).await?;
        sqlx::query(
            "INSERT INTO multipart_uploads (id, key, content_type, initiated_at, completed)
             VALUES (?, ?, ?, ?, 0)",
        )
        .bind(upload.id)
        .bind(&upload.key)
        .bind(&upload.content_type)
        .bind(upload.initiated_at)
        .execute(&*self.db)
        .await?;

        debug!(key, upload_id = %upload.id, "multipart upload initiated");
        Ok(upload.id.to_string())
    }

    async fn upload_part(
        &self,
        _location: &str,
        session_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> BackendResult<String> {
        check_part_number(part_number)?;
        let upload = self.fetch_open_upload(session_id).await?;

        let part_path = self.part_path(upload.id, part_number);
        let tmp_path = self
            .staging_dir(upload.id)
            .join(format!(".tmp-{}", Uuid::new_v4()));
        let write = async {
            let mut file = File::create(&tmp_path).await?;
            file.write_all(&body).await?;
            file.flush().await?;
            file.sync_all().await?;
            fs::rename(&tmp_path, &part_path).await
        };
        if let Err(err) = write.await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(BackendError::Io(err));
        }

        let part = MultipartPart {
            upload_id: upload.id,
            part_number: i64::from(part_number),
            size_bytes: body.len() as i64,
            etag: format!("{:x}", md5::compute(&body)),
            uploaded_at: Utc::now(),
        };
        sqlx::query(
            r#"
            INSERT INTO multipart_parts (upload_id, part_number, size_bytes, etag, uploaded_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(upload_id, part_number) DO UPDATE SET
                size_bytes = excluded.size_bytes,
                etag = excluded.etag,
                uploaded_at = excluded.uploaded_at
            "#,
        )
        .bind(part.upload_id)
        .bind(part.part_number)
        .bind(part.size_bytes)
        .bind(&part.etag)
        .bind(part.uploaded_at)
        .execute(&*self.db)
        .await?;

        Ok(part.etag)
    }

    async fn complete_session(
        &self,
        _location: &str,
        session_id: &str,
        parts: &[CompletedPart],
    ) -> BackendResult<()> {
        check_part_order(session_id, parts)?;
        let upload = self.fetch_open_upload(session_id).await?;

        let stored: HashMap<i64, MultipartPart> = sqlx::query_as::<_, MultipartPart>(
            "SELECT upload_id, part_number, size_bytes, etag, uploaded_at
             FROM multipart_parts WHERE upload_id = ?",
        )
        .bind(upload.id)
        .fetch_all(&*self.db)
        .await?
        .into_iter()
        .map(|p| (p.part_number, p))
        .collect();

        for (idx, part) in parts.iter().enumerate() {
            let row = stored
                .get(&i64::from(part.part_number))
                .filter(|row| row.etag == part.etag)
                .ok_or_else(|| BackendError::InvalidPart {
                    session_id: session_id.to_string(),
                    part_number: part.part_number,
                })?;
            let size = row.size_bytes as usize;
            if idx + 1 < parts.len() && size < self.min_part_size {
                return Err(BackendError::PartTooSmall {
                    part_number: part.part_number,
                    size,
                    min: self.min_part_size,
                });
            }
        }

        let file_path = self.object_path(&upload.key);
        let size_bytes = self.assemble(upload.id, parts, &file_path).await?;

        let mut tx = self.db.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO objects (id, key, content_type, size_bytes, etag, last_modified)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                content_type = excluded.content_type,
                size_bytes = excluded.size_bytes,
                etag = excluded.etag,
                last_modified = excluded.last_modified
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&upload.key)
        .bind(&upload.content_type)
        .bind(size_bytes)
        .bind(multipart_etag(parts))
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;
        sqlx::query("UPDATE multipart_uploads SET completed = 1 WHERE id = ?")
            .bind(upload.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        let staging = self.staging_dir(upload.id);
        if let Err(err) = fs::remove_dir_all(&staging).await {
            debug!(
                "failed to remove staging directory {}: {}",
                staging.display(),
                err
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store(dir: &tempfile::TempDir, min_part_size: usize) -> LocalStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = LocalStore::new(Arc::new(pool), dir.path(), min_part_size);
        store.migrate().await.unwrap();
        store
    }

    #[tokio::test]
    async fn completed_session_is_visible_and_concatenated() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, 3).await;
        let location = "/chat/2024-01-01/content_logs_2024-01-01_5";

        assert_eq!(store.probe(location).await.unwrap(), Presence::NotFound);

        let id = store.create_session(location, "application/x-ndjson").await.unwrap();
        let e1 = store.upload_part(location, &id, 1, Bytes::from_static(b"{}\n")).await.unwrap();
        let e2 = store.upload_part(location, &id, 2, Bytes::from_static(b"x\n")).await.unwrap();
        let parts = [
            CompletedPart { part_number: 1, etag: e1 },
            CompletedPart { part_number: 2, etag: e2 },
        ];
        store.complete_session(location, &id, &parts).await.unwrap();

        assert_eq!(store.probe(location).await.unwrap(), Presence::Exists);
        let key = LocalStore::relative_key(location).unwrap();
        let body = fs::read(store.object_path(key)).await.unwrap();
        assert_eq!(body, b"{}\nx\n");

        let object = sqlx::query_as::<_, Object>(
            "SELECT id, key, content_type, size_bytes, etag, last_modified FROM objects",
        )
        .fetch_one(&*store.db)
        .await
        .unwrap();
        assert_eq!(object.size_bytes, 5);
        assert_eq!(object.content_type, "application/x-ndjson");
        assert!(object.etag.ends_with("-2"));
        assert!(!store.staging_dir(Uuid::parse_str(&id).unwrap()).exists());
    }

    #[tokio::test]
    async fn reuploading_a_part_replaces_it() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, 0).await;
        let id = store.create_session("/a/b", "text/plain").await.unwrap();
        store.upload_part("/a/b", &id, 1, Bytes::from_static(b"old")).await.unwrap();
        let etag = store.upload_part("/a/b", &id, 1, Bytes::from_static(b"new")).await.unwrap();

        store
            .complete_session("/a/b", &id, &[CompletedPart { part_number: 1, etag }])
            .await
            .unwrap();
        let body = fs::read(store.object_path("a/b")).await.unwrap();
        assert_eq!(body, b"new");
    }

    #[tokio::test]
    async fn completed_session_rejects_further_parts() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, 0).await;
        let id = store.create_session("/a/b", "text/plain").await.unwrap();
        let etag = store.upload_part("/a/b", &id, 1, Bytes::from_static(b"x")).await.unwrap();
        store
            .complete_session("/a/b", &id, &[CompletedPart { part_number: 1, etag }])
            .await
            .unwrap();

        let err = store
            .upload_part("/a/b", &id, 2, Bytes::from_static(b"y"))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::SessionCompleted(_)));
    }

    #[tokio::test]
    async fn rejects_small_non_final_parts_and_bad_etags() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, 4).await;
        let id = store.create_session("/a/b", "text/plain").await.unwrap();
        let e1 = store.upload_part("/a/b", &id, 1, Bytes::from_static(b"ab")).await.unwrap();
        let e2 = store.upload_part("/a/b", &id, 2, Bytes::from_static(b"cd")).await.unwrap();

        let err = store
            .complete_session(
                "/a/b",
                &id,
                &[
                    CompletedPart { part_number: 1, etag: e1 },
                    CompletedPart { part_number: 2, etag: e2.clone() },
                ],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::PartTooSmall { part_number: 1, .. }));

        let err = store
            .complete_session(
                "/a/b",
                &id,
                &[CompletedPart { part_number: 2, etag: "bogus".into() }],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::InvalidPart { part_number: 2, .. }));
        assert_eq!(store.probe("/a/b").await.unwrap(), Presence::NotFound);
    }

    #[tokio::test]
    async fn unknown_sessions_and_unsafe_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, 0).await;

        let err = store
            .upload_part("/a", "not-a-uuid", 1, Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::UnknownSession(_)));

        let err = store
            .upload_part("/a", &Uuid::new_v4().to_string(), 1, Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::UnknownSession(_)));

        assert!(store.create_session("/chat/../etc", "text/plain").await.is_err());
        assert!(store.probe("/").await.is_err());
    }

    #[tokio::test]
    async fn connect_creates_database_and_storage_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("meta/chatlog.db");
        let url = format!("sqlite://{}", db_path.display());
        let store = LocalStore::connect(&url, dir.path().join("objects"), 0)
            .await
            .unwrap();

        assert!(db_path.exists());
        assert!(store.base_path.exists());
        assert_eq!(store.probe("/x").await.unwrap(), Presence::NotFound);
    }
}
