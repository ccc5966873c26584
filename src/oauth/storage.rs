use super::Credential;
use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::task;

/// Holds the one OAuth credential of this deployment.
#[async_trait]
pub trait CredentialStore: Send + Sync + 'static {
    async fn load(&self) -> Result<Option<Credential>>;
    async fn save(&self, credential: &Credential) -> Result<()>;
}

#[derive(Debug)]
pub struct FileCredentialStore {
    path: PathBuf,
    cache: RwLock<Option<Credential>>,
}

impl FileCredentialStore {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let cache = if path.exists() {
            let data = fs::read_to_string(&path)
                .with_context(|| format!("failed to read credential file {}", path.display()))?;
            if data.trim().is_empty() {
                None
            } else {
                Some(serde_json::from_str::<Credential>(&data).with_context(|| {
                    format!("failed to parse credential file {}", path.display())
                })?)
            }
        } else {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent)?;
                }
            }
            None
        };

        Ok(Self {
            path,
            cache: RwLock::new(cache),
        })
    }

    fn serialize(credential: &Credential) -> Result<String> {
        let data = serde_json::to_string_pretty(credential)?;
        Ok(data)
    }

    /// Writes next to the target and renames over it, so the previous record
    /// survives a crash mid-write and readers never see a partial file.
    fn write_to_disk(path: PathBuf, body: String) -> Result<()> {
        let mut staging = path.clone().into_os_string();
        staging.push(".tmp");
        let staging = PathBuf::from(staging);

        {
            let mut file = File::create(&staging)?;
            file.write_all(body.as_bytes())?;
            file.sync_all()?;
        }

        fs::rename(&staging, &path)
            .with_context(|| format!("failed to replace credential file {}", path.display()))?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryCredentialStore {
    cache: RwLock<Option<Credential>>,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn load(&self) -> Result<Option<Credential>> {
        Ok(self.cache.read().clone())
    }

    async fn save(&self, credential: &Credential) -> Result<()> {
        let path = self.path.clone();
        let snapshot = credential.clone();

        task::spawn_blocking(move || {
            let serialized = FileCredentialStore::serialize(&snapshot)?;
            FileCredentialStore::write_to_disk(path, serialized)
        })
        .await??;

        *self.cache.write() = Some(credential.clone());
        tracing::debug!(path = %self.path.display(), "persisted credential");
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn load(&self) -> Result<Option<Credential>> {
        Ok(self.cache.read().clone())
    }

    async fn save(&self, credential: &Credential) -> Result<()> {
        *self.cache.write() = Some(credential.clone());
        Ok(())
    }
}
