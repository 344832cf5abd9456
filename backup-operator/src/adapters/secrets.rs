use async_trait::async_trait;
use backup_engine::ports::{Credential, CredentialResolver, SecretRef};
use backup_engine::{EngineError, Result};
use std::path::PathBuf;

/// Resolves secrets from `{dir}/{namespace}/{name}/{key}` (the layout of a
/// mounted secret volume), falling back to the `{NAME}_{KEY}` environment
/// variable.
pub struct SecretFileResolver {
    dir: PathBuf,
    env: fn(&str) -> Option<String>,
}

fn process_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

/// `vectors-auth` / `api-key` becomes `VECTORS_AUTH_API_KEY`.
pub fn env_name(secret: &SecretRef) -> String {
    format!("{}_{}", secret.name, secret.key)
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect()
}

impl SecretFileResolver {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            env: process_env,
        }
    }

    #[cfg(test)]
    fn with_env(mut self, env: fn(&str) -> Option<String>) -> Self {
        self.env = env;
        self
    }
}

#[async_trait]
impl CredentialResolver for SecretFileResolver {
    async fn resolve(&self, secret: &SecretRef) -> Result<Credential> {
        let path = self.dir.join(&secret.namespace).join(&secret.name).join(&secret.key);
        match tokio::fs::read_to_string(&path).await {
            Ok(value) => return Ok(Credential::new(value.trim_end_matches(['\r', '\n']))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(EngineError::Transient(format!(
                    "failed to read secret {}/{}: {e}",
                    secret.namespace, secret.name
                )))
            }
        }

        (self.env)(&env_name(secret))
            .map(Credential::new)
            .ok_or_else(|| {
                EngineError::NotFound(format!(
                    "secret {}/{} has no key {}",
                    secret.namespace, secret.name, secret.key
                ))
            })
    }
}
