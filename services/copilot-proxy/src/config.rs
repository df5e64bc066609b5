//! Configuration types and loading
//!
//! Precedence: CLI args > env vars > config file > defaults. The config file
//! is optional; every field has a default. The GitHub token is never read
//! from the TOML itself: it comes from `GITHUB_TOKEN` or the token file.

use common::Secret;
use copilot_auth::{COPILOT_API_HOST, CredentialFile, TOKEN_EXCHANGE_URL};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Config file looked up in the working directory when none is named.
pub const DEFAULT_CONFIG_FILE: &str = "copilot-api-proxy.toml";

/// Root configuration
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    /// Credential supplied through `GITHUB_TOKEN`
    #[serde(skip)]
    pub github_token: Option<Secret<String>>,
}

/// HTTP proxy settings
#[derive(Debug, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    #[serde(default = "default_upstream_url")]
    pub upstream_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

/// GitHub credential settings
#[derive(Debug, Deserialize)]
pub struct AuthConfig {
    /// Where the GitHub token is persisted. Defaults to the local data dir.
    #[serde(default)]
    pub token_file: Option<PathBuf>,
    #[serde(default = "default_exchange_url")]
    pub exchange_url: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            upstream_url: default_upstream_url(),
            timeout_secs: default_timeout(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_file: None,
            exchange_url: default_exchange_url(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_upstream_url() -> String {
    format!("https://{COPILOT_API_HOST}")
}

fn default_timeout() -> u64 {
    30
}

fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_exchange_url() -> String {
    TOKEN_EXCHANGE_URL.to_string()
}

impl Config {
    /// Load configuration, then overlay environment variables.
    ///
    /// `path` is a file the user asked for explicitly and must exist. With
    /// `None`, `DEFAULT_CONFIG_FILE` is used if present, else defaults.
    pub fn load(path: Option<&Path>) -> common::Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match std::fs::read_to_string(DEFAULT_CONFIG_FILE) {
                Ok(contents) => toml::from_str(&contents)?,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Config::default(),
                Err(e) => return Err(e.into()),
            },
        };

        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    fn apply_env(&mut self) -> common::Result<()> {
        if let Ok(port) = std::env::var("PROXY_PORT")
            && !port.trim().is_empty()
        {
            let port: u16 = port.trim().parse().map_err(|e| common::Error::Env {
                name: "PROXY_PORT",
                reason: format!("{port:?} is not a port number: {e}"),
            })?;
            self.proxy.listen_addr.set_port(port);
        }

        if let Ok(token) = std::env::var("GITHUB_TOKEN") {
            self.github_token = Secret::from_trimmed(&token);
        }

        if let Some(path) = self.auth.token_file.take() {
            self.auth.token_file = Some(expand_home(path));
        }

        Ok(())
    }

    fn validate(&self) -> common::Result<()> {
        for (field, url) in [
            ("proxy.upstream_url", &self.proxy.upstream_url),
            ("auth.exchange_url", &self.auth.exchange_url),
        ] {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(common::Error::Config(format!(
                    "{field} must start with http:// or https://, got: {url}"
                )));
            }
        }

        if self.proxy.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }

        if self.proxy.max_body_bytes == 0 {
            return Err(common::Error::Config(
                "max_body_bytes must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Config file named by the CLI, else by `CONFIG_PATH`.
    pub fn resolve_path(cli_path: Option<&Path>) -> Option<PathBuf> {
        if let Some(p) = cli_path {
            return Some(p.to_path_buf());
        }
        std::env::var_os("CONFIG_PATH").map(PathBuf::from)
    }

    /// Where the GitHub token is read from and saved to.
    pub fn credential_file(&self) -> Option<CredentialFile> {
        self.auth
            .token_file
            .clone()
            .or_else(CredentialFile::default_path)
            .map(CredentialFile::new)
    }
}

fn expand_home(path: PathBuf) -> PathBuf {
    let Some(home) = dirs::home_dir() else {
        return path;
    };
    match path.strip_prefix("~") {
        Ok(rest) => home.join(rest),
        Err(_) => path.clone(),
    }
}
