use devicehub_protocol::rpc::{error_code, UploadAppProgressResponse, UploadAppRequest};
use devicehub_protocol::AppParameter;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{error, info};

use crate::error::{HubError, Result};

#[derive(Debug, Default)]
struct UploadProgress {
    data_received: AtomicU64,
    completed: AtomicBool,
    failed: AtomicBool,
}

/// App binaries uploaded by the master, stored by content hash
pub struct AppBundleStore {
    dir: PathBuf,
    http: reqwest::Client,
    uploads: RwLock<HashMap<u32, Arc<UploadProgress>>>,
}

impl AppBundleStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            http: reqwest::Client::new(),
            uploads: RwLock::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, hash: &str) -> PathBuf {
        self.dir.join(sanitize(hash))
    }

    pub fn contains(&self, hash: &str) -> bool {
        !hash.is_empty() && self.path_for(hash).is_file()
    }

    /// Point the app parameters at the local copy of the binary, if present
    pub fn resolve(&self, mut app: AppParameter) -> AppParameter {
        let hash = app.hash().to_string();
        if self.contains(&hash) {
            if let Some(params) = app.app.as_mut() {
                params.app_path = self.path_for(&hash).to_string_lossy().into_owned();
            }
        }
        app
    }

    /// Begin fetching a binary from the master in the background
    pub async fn start_upload(self: &Arc<Self>, request: UploadAppRequest) -> Result<()> {
        let progress = Arc::new(UploadProgress::default());
        self.uploads
            .write()
            .await
            .insert(request.app_id, Arc::clone(&progress));

        if self.contains(&request.hash) {
            progress.data_received.store(request.size, Ordering::SeqCst);
            progress.completed.store(true, Ordering::SeqCst);
            return Ok(());
        }

        tokio::fs::create_dir_all(&self.dir).await?;
        let store = Arc::clone(self);
        tokio::spawn(async move {
            match store.download(&request, &progress).await {
                Ok(()) => {
                    info!("Received {} ({} bytes)", request.name, request.size);
                    progress.completed.store(true, Ordering::SeqCst);
                }
                Err(e) => {
                    error!("Upload of {} failed: {}", request.name, e);
                    progress.failed.store(true, Ordering::SeqCst);
                }
            }
        });
        Ok(())
    }

    async fn download(&self, request: &UploadAppRequest, progress: &UploadProgress) -> Result<()> {
        let target = self.path_for(&request.hash);
        let partial = target.with_extension("part");

        let mut response = self.http.get(&request.url).send().await?.error_for_status()?;
        let mut file = tokio::fs::File::create(&partial).await?;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
            progress
                .data_received
                .fetch_add(chunk.len() as u64, Ordering::SeqCst);
        }
        file.flush().await?;
        drop(file);

        tokio::fs::rename(&partial, &target).await?;
        Ok(())
    }

    pub async fn progress(&self, app_id: u32) -> Result<UploadAppProgressResponse> {
        let uploads = self.uploads.read().await;
        let progress = uploads.get(&app_id).ok_or_else(|| HubError::Rpc {
            code: error_code::UPLOAD_NOT_FOUND,
            message: format!("no upload for app {}", app_id),
        })?;
        Ok(UploadAppProgressResponse {
            app_id,
            data_received: progress.data_received.load(Ordering::SeqCst),
            completed: progress.completed.load(Ordering::SeqCst),
            failed: progress.failed.load(Ordering::SeqCst),
        })
    }
}

/// Hashes become file names; keep them to a safe alphabet
fn sanitize(hash: &str) -> String {
    hash.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use devicehub_protocol::types::{AppParams, AppPlatform};

    fn app(hash: &str) -> AppParameter {
        AppParameter {
            platform: AppPlatform::Android,
            name: "Game".to_string(),
            identifier: "com.example.game".to_string(),
            version: "1.0".to_string(),
            app: Some(AppParams {
                hash: hash.to_string(),
                app_path: "/master/apps/game.apk".to_string(),
                ..Default::default()
            }),
            web: None,
        }
    }

    #[test]
    fn test_sanitize_hash() {
        assert_eq!(sanitize("ab12"), "ab12");
        assert_eq!(sanitize("../etc/passwd"), "___etc_passwd");
    }

    #[tokio::test]
    async fn test_resolve_uses_local_copy() {
        let dir = tempfile::tempdir().unwrap();
        let store = AppBundleStore::new(dir.path());

        let unresolved = store.resolve(app("abc"));
        assert_eq!(unresolved.app.unwrap().app_path, "/master/apps/game.apk");

        std::fs::write(store.path_for("abc"), b"binary").unwrap();
        assert!(store.contains("abc"));
        let resolved = store.resolve(app("abc"));
        assert_eq!(
            resolved.app.unwrap().app_path,
            dir.path().join("abc").to_string_lossy()
        );
    }

    #[tokio::test]
    async fn test_known_hash_completes_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(AppBundleStore::new(dir.path()));
        std::fs::write(store.path_for("abc"), b"binary").unwrap();

        store
            .start_upload(UploadAppRequest {
                app_id: 9,
                name: "game.apk".to_string(),
                hash: "abc".to_string(),
                size: 6,
                url: "http://127.0.0.1:1/upload/game.apk".to_string(),
            })
            .await
            .unwrap();

        let progress = store.progress(9).await.unwrap();
        assert!(progress.completed);
        assert_eq!(progress.data_received, 6);
    }

    #[tokio::test]
    async fn test_unknown_upload() {
        let store = AppBundleStore::new(std::env::temp_dir());
        match store.progress(42).await {
            Err(HubError::Rpc { code, .. }) => assert_eq!(code, error_code::UPLOAD_NOT_FOUND),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unreachable_master_marks_failed() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(AppBundleStore::new(dir.path()));
        store
            .start_upload(UploadAppRequest {
                app_id: 1,
                name: "game.apk".to_string(),
                hash: "def".to_string(),
                size: 10,
                url: "http://127.0.0.1:1/upload/game.apk".to_string(),
            })
            .await
            .unwrap();

        for _ in 0..500 {
            let progress = store.progress(1).await.unwrap();
            if progress.failed {
                assert!(!progress.completed);
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("download never failed");
    }
}
