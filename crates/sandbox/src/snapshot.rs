//! Snapshot store — compressed tar archives of workspace paths, with
//! optional object-store offload.
//!
//! Archives are produced and consumed *inside* the sandbox by shelling out
//! to `tar` through the executor; the store never interprets archive
//! contents. At most one snapshot is in flight per session.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use af_domain::config::ObjectStoreConfig;
use af_domain::session::{SandboxSession, Snapshot};
use af_domain::{Error, Result};

use crate::lifecycle::SandboxExecutor;
use crate::runtime::shell_quote;
use crate::store::{append_jsonl, load_jsonl, rewrite_jsonl, SessionStore};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Object store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Vec<u8>>;
    async fn exists(&self, key: &str) -> Result<bool>;
}

/// Local-directory object store for development and tests.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, bytes).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        tokio::fs::read(self.path_for(key))
            .await
            .map_err(|e| Error::NotFound(format!("object {key}: {e}")))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.path_for(key)).await.unwrap_or(false))
    }
}

/// S3-compatible HTTP object store (path-style `endpoint/bucket/key`).
pub struct HttpObjectStore {
    client: reqwest::Client,
    endpoint: String,
    bucket: String,
    access_key: Option<String>,
    secret_key: Option<String>,
}

impl HttpObjectStore {
    pub fn new(config: &ObjectStoreConfig, endpoint: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            bucket: config.bucket.clone(),
            access_key: config.access_key.clone(),
            secret_key: config.secret_key.clone(),
        }
    }

    fn url_for(&self, key: &str) -> String {
        format!("{}/{}/{}", self.endpoint, self.bucket, key)
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match (&self.access_key, &self.secret_key) {
            (Some(access), secret) => req.basic_auth(access, secret.as_deref()),
            _ => req,
        }
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        let resp = self
            .authed(self.client.put(self.url_for(key)).body(bytes))
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(Error::Http(format!(
                "object PUT {key} returned {}",
                resp.status()
            )));
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let resp = self
            .authed(self.client.get(self.url_for(key)))
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::NotFound(format!("object {key}")));
        }
        if !resp.status().is_success() {
            return Err(Error::Http(format!(
                "object GET {key} returned {}",
                resp.status()
            )));
        }
        Ok(resp
            .bytes()
            .await
            .map_err(|e| Error::Http(e.to_string()))?
            .to_vec())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let resp = self
            .authed(self.client.head(self.url_for(key)))
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(resp.status().is_success())
    }
}

/// Build the configured object store, if any.
pub fn object_store_from_config(
    config: &Option<ObjectStoreConfig>,
) -> Result<Option<Arc<dyn ObjectStore>>> {
    let Some(config) = config else {
        return Ok(None);
    };
    if let Some(endpoint) = &config.endpoint {
        return Ok(Some(Arc::new(HttpObjectStore::new(
            config,
            endpoint.clone(),
        ))));
    }
    if let Some(dir) = &config.local_dir {
        return Ok(Some(Arc::new(FsObjectStore::new(dir.clone()))));
    }
    Err(Error::Config(
        "snapshots.object_store needs an endpoint or a local_dir".into(),
    ))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Snapshot store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub const SNAPSHOT_DIR: &str = ".sandbox-snapshots";

/// Restore flags are mandatory: they keep the restore from trashing
/// ownership metadata or clobbering live-mounted directories.
const RESTORE_FLAGS: &str = "--no-same-owner --no-same-permissions --no-overwrite-dir -m";

#[derive(Debug, Clone, Default)]
pub struct SnapshotOptions {
    pub label: String,
    pub include_paths: Vec<String>,
    pub exclude_paths: Vec<String>,
}

pub struct SnapshotStore {
    records: RwLock<HashMap<Uuid, Snapshot>>,
    log_path: PathBuf,
    executor: Arc<SandboxExecutor>,
    sessions: Arc<SessionStore>,
    object_store: Option<Arc<dyn ObjectStore>>,
    /// One snapshot in flight per session.
    in_flight: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl SnapshotStore {
    pub fn new(
        state_path: &Path,
        executor: Arc<SandboxExecutor>,
        sessions: Arc<SessionStore>,
        object_store: Option<Arc<dyn ObjectStore>>,
    ) -> Self {
        std::fs::create_dir_all(state_path).ok();
        let log_path = state_path.join("snapshots.jsonl");
        let (records, total) = load_jsonl::<Snapshot>(&log_path, |s| s.id);
        if total > records.len() {
            rewrite_jsonl(&log_path, records.values().cloned());
        }
        Self {
            records: RwLock::new(records),
            log_path,
            executor,
            sessions,
            object_store,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, id: &Uuid) -> Option<Snapshot> {
        self.records.read().get(id).cloned()
    }

    pub fn list_for_session(&self, session_id: &Uuid) -> Vec<Snapshot> {
        let mut items: Vec<_> = self
            .records
            .read()
            .values()
            .filter(|s| s.session_id == *session_id)
            .cloned()
            .collect();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        items
    }

    fn session_lock(&self, session_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        self.in_flight
            .lock()
            .entry(session_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Archive the include paths into `<workspace>/.sandbox-snapshots/` and
    /// optionally offload to the object store.
    pub async fn create(
        &self,
        session: &SandboxSession,
        opts: SnapshotOptions,
    ) -> Result<Snapshot> {
        let lock = self.session_lock(session.id);
        let _guard = lock.lock().await;

        let include_paths = if opts.include_paths.is_empty() {
            vec![session.workspace_path.clone()]
        } else {
            opts.include_paths
        };

        let snapshot_id = Uuid::new_v4();
        let archive_dir = format!("{}/{SNAPSHOT_DIR}", session.workspace_path);
        let archive_path = format!("{archive_dir}/{snapshot_id}.tar.gz");

        let excludes = opts
            .exclude_paths
            .iter()
            .map(|p| format!("--exclude={}", shell_quote(p)))
            .collect::<Vec<_>>()
            .join(" ");
        let includes = include_paths
            .iter()
            .map(|p| shell_quote(p))
            .collect::<Vec<_>>()
            .join(" ");
        // The archive dir lives under the workspace, so it is always excluded
        // to keep snapshots from nesting earlier snapshots.
        let script = format!(
            "mkdir -p {dir} && tar -czf {archive} --exclude={dir_q} {excludes} {includes}",
            dir = shell_quote(&archive_dir),
            archive = shell_quote(&archive_path),
            dir_q = shell_quote(&archive_dir),
        );

        let out = self.executor.exec(session, &script, None).await?;
        if out.exit_code != 0 {
            return Err(Error::Other(format!(
                "snapshot failed: {}",
                out.combined().trim()
            )));
        }

        let size_out = self
            .executor
            .exec(
                session,
                &format!("stat -c %s {}", shell_quote(&archive_path)),
                None,
            )
            .await?;
        let size_bytes: u64 = size_out.stdout.trim().parse().unwrap_or(0);

        let mut object_store_key = None;
        if let Some(store) = &self.object_store {
            let key = format!("snapshots/{}/{snapshot_id}.tar.gz", session.id);
            let bytes = self.executor.read_file(session, &archive_path).await?;
            store.put(&key, bytes).await?;
            object_store_key = Some(key);
        }

        let snapshot = Snapshot {
            id: snapshot_id,
            session_id: session.id,
            label: opts.label,
            archive_path,
            object_store_key,
            size_bytes,
            include_paths,
            exclude_paths: opts.exclude_paths,
            created_at: Utc::now(),
        };

        append_jsonl(&self.log_path, &snapshot);
        self.records.write().insert(snapshot_id, snapshot.clone());
        self.sessions.update(&session.id, |s| {
            s.set_latest_snapshot_id(snapshot_id);
            s.storage_bytes = s.storage_bytes.saturating_add(size_bytes);
            s.mark_activity(Utc::now());
        });

        tracing::info!(
            session_id = %session.id,
            snapshot_id = %snapshot_id,
            size_bytes,
            offloaded = snapshot.object_store_key.is_some(),
            "snapshot created"
        );
        Ok(snapshot)
    }

    /// Unpack a snapshot into the target session. Fetches the archive from
    /// the object store when it is not present in the sandbox.
    pub async fn restore(&self, session: &SandboxSession, snapshot: &Snapshot) -> Result<()> {
        let lock = self.session_lock(session.id);
        let _guard = lock.lock().await;

        let archive = &snapshot.archive_path;
        let present = self
            .executor
            .exec(session, &format!("test -f {}", shell_quote(archive)), None)
            .await?
            .exit_code
            == 0;

        if !present {
            let Some(key) = &snapshot.object_store_key else {
                return Err(Error::NotFound(format!(
                    "snapshot {} archive is missing and has no object store key",
                    snapshot.id
                )));
            };
            let Some(store) = &self.object_store else {
                return Err(Error::Config(
                    "snapshot is offloaded but no object store is configured".into(),
                ));
            };
            let bytes = store.get(key).await?;
            self.executor.upload(session, archive, &bytes).await?;
        }

        let script = format!(
            "tar -xzf {} -C / {RESTORE_FLAGS}",
            shell_quote(archive)
        );
        let out = self.executor.exec(session, &script, None).await?;
        if out.exit_code != 0 {
            return Err(Error::Other(format!(
                "restore failed: {}",
                out.combined().trim()
            )));
        }

        self.sessions.update(&session.id, |s| {
            s.set_latest_snapshot_id(snapshot.id);
            s.mark_activity(Utc::now());
        });
        tracing::info!(
            session_id = %session.id,
            snapshot_id = %snapshot.id,
            "snapshot restored"
        );
        Ok(())
    }
}
