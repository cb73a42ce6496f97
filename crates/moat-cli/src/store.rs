//! File-backed credential store
//!
//! A JSON file of provider credentials plus the SSH key mappings from the
//! global config. Encryption at rest belongs to the full moat daemon; this
//! store is the plain fallback used by the standalone CLI, with 0600
//! permissions on the file.

use async_trait::async_trait;
use moat_config::GlobalConfig;
use moat_core::{CoreError, Credential, CredentialStore, SshKeyMapping};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

pub struct FileCredentialStore {
    path: PathBuf,
    creds: Mutex<HashMap<String, Credential>>,
    ssh_keys: HashMap<String, Vec<String>>,
}

impl FileCredentialStore {
    pub fn open(global: &GlobalConfig) -> moat_core::Result<Self> {
        let base = match &global.data_dir {
            Some(dir) => dir.clone(),
            None => GlobalConfig::data_dir()?,
        };
        let path = base.join("credentials.json");
        let creds: HashMap<String, Credential> = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            serde_json::from_str(&content)?
        } else {
            HashMap::new()
        };

        Ok(Self {
            path,
            creds: Mutex::new(creds),
            ssh_keys: global.ssh.keys.clone(),
        })
    }

    fn persist(&self) -> moat_core::Result<()> {
        let creds = self.creds.lock().unwrap();
        let content = serde_json::to_vec_pretty(&*creds)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, content)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn get(&self, provider: &str) -> moat_core::Result<Credential> {
        self.creds
            .lock()
            .unwrap()
            .get(provider)
            .cloned()
            .ok_or_else(|| CoreError::GrantNotConfigured(provider.to_string()))
    }

    async fn save(&self, cred: &Credential) -> moat_core::Result<()> {
        self.creds
            .lock()
            .unwrap()
            .insert(cred.provider.clone(), cred.clone());
        self.persist()
    }

    async fn ssh_mappings_for_hosts(&self, hosts: &[String]) -> moat_core::Result<Vec<SshKeyMapping>> {
        Ok(self
            .ssh_keys
            .iter()
            .filter(|(_, mapped)| mapped.iter().any(|h| hosts.contains(h)))
            .map(|(fingerprint, mapped)| SshKeyMapping {
                fingerprint: fingerprint.clone(),
                hosts: mapped.clone(),
            })
            .collect())
    }
}
