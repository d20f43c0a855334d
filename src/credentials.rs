use crate::secret_string::SecretString;
use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use std::collections::HashMap;

/// Username and password sent to a registry. Both empty means anonymous access.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryCredentials {
    pub username: String,
    pub password: SecretString,
}

impl RegistryCredentials {
    pub fn is_anonymous(&self) -> bool {
        self.username.is_empty() && self.password.is_empty()
    }
}

#[derive(Debug, Deserialize)]
struct DockerConfig {
    #[serde(default)]
    auths: HashMap<String, DockerRepoAuth>,
}

#[derive(Debug, Deserialize)]
struct DockerRepoAuth {
    username: Option<String>,
    password: Option<SecretString>,
    /// base64 of `username:password`, as written by `docker login`
    auth: Option<SecretString>,
}

/// Registry host to credentials, loaded once at startup and read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct CredentialTable {
    entries: HashMap<String, RegistryCredentials>,
}

impl CredentialTable {
    /// Parses a docker config document of the form `{"auths": {"<host>": {...}}}`.
    pub fn from_docker_config(document: &str) -> Result<Self> {
        let config: DockerConfig =
            serde_json::from_str(document).context("Failed to parse docker config JSON")?;

        let mut entries = HashMap::with_capacity(config.auths.len());
        for (host, repo_auth) in config.auths {
            let credentials = resolve_repo_auth(repo_auth)
                .with_context(|| format!("Invalid credentials for registry {}", host))?;
            entries.insert(host, credentials);
        }

        Ok(Self { entries })
    }

    pub fn lookup(&self, host: &str) -> RegistryCredentials {
        self.entries.get(host).cloned().unwrap_or_default()
    }

    pub fn registry_count(&self) -> usize {
        self.entries.len()
    }
}

fn resolve_repo_auth(repo_auth: DockerRepoAuth) -> Result<RegistryCredentials> {
    let (mut username, mut password) = match &repo_auth.auth {
        Some(auth) if !auth.is_empty() => decode_basic_auth(auth.expose_secret())?,
        _ => (String::new(), SecretString::default()),
    };

    if let Some(explicit) = repo_auth.username {
        username = explicit;
    }
    if let Some(explicit) = repo_auth.password {
        password = explicit;
    }

    Ok(RegistryCredentials { username, password })
}

fn decode_basic_auth(encoded: &str) -> Result<(String, SecretString)> {
    let decoded = STANDARD
        .decode(encoded.trim())
        .context("auth field is not valid base64")?;
    let decoded = String::from_utf8(decoded).context("auth field is not valid UTF-8")?;
    let (username, password) = decoded
        .split_once(':')
        .context("auth field does not have the form username:password")?;
    Ok((username.to_string(), SecretString::new(password)))
}
