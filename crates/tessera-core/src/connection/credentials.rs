//! Credential resolution
//!
//! Precedence, first match wins:
//!
//! 1. forced key: session override, then `TESSERA_AUTH_KEY`, then the first
//!    line of `<config_dir>/auth.key`. The value `GUEST` selects a guest
//!    login, anything else is an API key.
//! 2. a valid credentials file for the configured upstream
//!    (`{"refresh_token": ...}`)
//! 3. a guest login chosen earlier in this session
//! 4. the interactive browser flow (see [`super::auth_server`])
//!
//! Refresh tokens are exchanged for short-lived bearer tokens through a
//! [`TokenExchange`]; the bearer is cached until it expires.

use super::auth_server::{AuthServer, LoginReply};
use crate::config::{ClientConfig, ENV_AUTH_KEY, LoginConfig};
use crate::{Error, Result};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Value, json};
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tessera_protocol::envelope::Who;

/// Forced-key value selecting a guest login
pub const GUEST_KEY: &str = "GUEST";

/// A resolved credential
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// Long-lived API key
    ApiKey(String),
    /// Refresh token obtained through the login flow
    RefreshToken(String),
    /// Anonymous guest access
    Guest,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ApiKey(key) => write!(f, "ApiKey({}...)", prefix(key)),
            Self::RefreshToken(_) => f.write_str("RefreshToken(..)"),
            Self::Guest => f.write_str("Guest"),
        }
    }
}

fn prefix(key: &str) -> &str {
    key.char_indices().nth(4).map_or(key, |(i, _)| &key[..i])
}

/// Short-lived bearer token
#[derive(Debug, Clone)]
pub struct BearerToken {
    /// Token presented upstream
    pub token: String,
    /// Validity from the moment of issue
    pub expires_in: Duration,
}

/// Turns a refresh token into a bearer token
pub trait TokenExchange: Send + Sync {
    /// Exchange `refresh_token`
    fn exchange(&self, refresh_token: &str) -> Result<BearerToken>;
}

/// [`TokenExchange`] posting to an HTTP token endpoint.
///
/// Without an endpoint the refresh token is presented as-is.
pub struct HttpTokenExchange {
    endpoint: Option<String>,
    client: reqwest::blocking::Client,
}

#[derive(Deserialize)]
struct TokenEndpointReply {
    id_token: String,
    expires_in: String,
}

impl HttpTokenExchange {
    /// Exchange against `endpoint`
    pub fn new(endpoint: Option<String>) -> Self {
        Self {
            endpoint,
            client: reqwest::blocking::Client::new(),
        }
    }
}

impl TokenExchange for HttpTokenExchange {
    fn exchange(&self, refresh_token: &str) -> Result<BearerToken> {
        let Some(endpoint) = self.endpoint.as_deref() else {
            return Ok(BearerToken {
                token: refresh_token.to_string(),
                expires_in: Duration::from_secs(u32::MAX as u64),
            });
        };

        let reply: TokenEndpointReply = self
            .client
            .post(endpoint)
            .json(&json!({
                "grant_type": "refresh_token",
                "refresh_token": refresh_token,
            }))
            .send()
            .and_then(|r| r.error_for_status())
            .and_then(|r| r.json())
            .map_err(|e| Error::no_credentials(format!("Token exchange failed: {}", e)))?;

        let secs = reply
            .expires_in
            .trim()
            .parse::<u64>()
            .map_err(|_| Error::malformed(format!("Bad expires_in '{}'", reply.expires_in)))?;
        Ok(BearerToken {
            token: reply.id_token,
            expires_in: Duration::from_secs(secs),
        })
    }
}

struct CachedBearer {
    refresh_token: String,
    token: String,
    expires_at: Instant,
}

/// Resolves, persists and caches credentials for one upstream
pub struct CredentialStore {
    forced_key_path: PathBuf,
    credentials_path: PathBuf,
    login: LoginConfig,
    exchange: Arc<dyn TokenExchange>,
    env_key: Box<dyn Fn() -> Option<String> + Send + Sync>,
    session_key: Mutex<Option<String>>,
    resolved: Mutex<Option<Credential>>,
    guest: AtomicBool,
    bearer: Mutex<Option<CachedBearer>>,
}

impl CredentialStore {
    /// Store for the upstream configured in `config`
    pub fn new(config: &ClientConfig, exchange: Arc<dyn TokenExchange>) -> Self {
        Self {
            forced_key_path: config.forced_key_path(),
            credentials_path: config.credentials_path(),
            login: config.login.clone(),
            exchange,
            env_key: Box::new(|| std::env::var(ENV_AUTH_KEY).ok()),
            session_key: Mutex::new(None),
            resolved: Mutex::new(None),
            guest: AtomicBool::new(false),
            bearer: Mutex::new(None),
        }
    }

    /// Replace the environment lookup of the forced key
    pub fn with_env_key<F>(mut self, lookup: F) -> Self
    where
        F: Fn() -> Option<String> + Send + Sync + 'static,
    {
        self.env_key = Box::new(lookup);
        self
    }

    /// Credentials file location
    pub fn credentials_path(&self) -> &PathBuf {
        &self.credentials_path
    }

    /// Set or clear the per-session forced key
    pub fn set_session_key(&self, key: Option<String>) {
        *self.session_key.lock() = key;
        self.resolved.lock().take();
    }

    /// Forced key from the session, environment or key file
    pub fn forced_key(&self) -> Option<String> {
        if let Some(key) = self.session_key.lock().clone() {
            return Some(key);
        }
        if let Some(key) = (self.env_key)().filter(|k| !k.is_empty()) {
            return Some(key);
        }
        match fs::read_to_string(&self.forced_key_path) {
            Ok(content) => Some(content.lines().next().unwrap_or("").trim().to_string()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => {
                tracing::warn!(
                    "Unable to read key file {}: {}",
                    self.forced_key_path.display(),
                    e
                );
                None
            }
        }
    }

    /// Whether a guest login was chosen in this session
    pub fn is_guest(&self) -> bool {
        self.guest.load(Ordering::SeqCst)
    }

    /// Refresh token from the credentials file. `None` when the file does
    /// not exist; a file that exists but cannot be used is an error.
    pub fn read_refresh_token(&self) -> Result<Option<String>> {
        let content = match fs::read_to_string(&self.credentials_path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let value: Value = serde_json::from_str(&content).map_err(|_| {
            Error::malformed(format!(
                "Credentials file {} is not in JSON format",
                self.credentials_path.display()
            ))
        })?;
        match value.get("refresh_token").and_then(Value::as_str) {
            Some(token) => Ok(Some(token.to_string())),
            None => Err(Error::malformed(format!(
                "Credentials file {} does not have a refresh_token field",
                self.credentials_path.display()
            ))),
        }
    }

    /// Whether the credentials file exists and holds a refresh token.
    /// Problems are logged, not raised.
    pub fn is_credentials_file_valid(&self) -> bool {
        match self.read_refresh_token() {
            Ok(token) => token.is_some(),
            Err(e) => {
                tracing::warn!("{}", e);
                false
            }
        }
    }

    /// Whether any credential is available without user interaction
    pub fn have_credentials(&self) -> bool {
        let resolved = self.resolved.lock().is_some();
        resolved
            || self.forced_key().is_some()
            || self.is_credentials_file_valid()
            || self.is_guest()
    }

    /// Resolve a credential, running the browser login when `interactive`
    /// and nothing else is available
    pub fn ensure(&self, interactive: bool) -> Result<Credential> {
        let credential = if let Some(key) = self.forced_key() {
            if key == GUEST_KEY {
                self.guest.store(true, Ordering::SeqCst);
                Credential::Guest
            } else {
                Credential::ApiKey(key)
            }
        } else if let Some(token) = self.read_refresh_token().unwrap_or_else(|e| {
            tracing::warn!("{}", e);
            None
        }) {
            Credential::RefreshToken(token)
        } else if self.is_guest() {
            Credential::Guest
        } else if interactive {
            self.obtain_interactively()?
        } else {
            return Err(Error::no_credentials(
                "Have no existing credentials to determine an auth token. Log in first",
            ));
        };

        *self.resolved.lock() = Some(credential.clone());
        Ok(credential)
    }

    fn obtain_interactively(&self) -> Result<Credential> {
        let server = AuthServer::start(
            self.login.auth_port_start,
            self.login.auth_port_end,
            self.login.login_page.clone(),
        )?;
        let url = server.auth_url();
        if self.login.open_browser {
            super::auth_server::open_browser(&url);
        }
        tracing::warn!("Waiting for login through {}", url);

        match server.wait_with_timeout(self.login.auth_timeout)? {
            None => Err(Error::no_credentials("Unable to obtain credentials")),
            Some(LoginReply::Guest) => {
                tracing::info!("Logging in as guest");
                self.guest.store(true, Ordering::SeqCst);
                Ok(Credential::Guest)
            }
            Some(LoginReply::RefreshToken(token)) => {
                self.guest.store(false, Ordering::SeqCst);
                self.store_refresh_token(&token)?;
                tracing::info!(
                    "Credentials stored at {}",
                    self.credentials_path.display()
                );
                Ok(Credential::RefreshToken(token))
            }
        }
    }

    /// Persist a refresh token to the credentials file
    pub fn store_refresh_token(&self, refresh_token: &str) -> Result<()> {
        if let Some(dir) = self.credentials_path.parent() {
            fs::create_dir_all(dir)?;
        }
        let content = serde_json::to_string(&json!({ "refresh_token": refresh_token }))?;
        fs::write(&self.credentials_path, content)?;
        Ok(())
    }

    /// Remove stored credentials and forget any guest choice.
    ///
    /// Refused while an API key or forced key is in effect.
    pub fn logout(&self) -> Result<()> {
        self.set_session_key(None);
        let forced = self.forced_key().is_some();
        let api_key = matches!(*self.resolved.lock(), Some(Credential::ApiKey(_)));
        if forced || api_key {
            return Err(Error::config(format!(
                "Can't logout when an explicit key is given in {} or {}",
                ENV_AUTH_KEY,
                self.forced_key_path.display()
            )));
        }

        if self.credentials_path.exists() {
            fs::remove_file(&self.credentials_path)?;
        } else if !self.is_guest() {
            tracing::warn!("No credentials, so logout did not remove any");
        }
        self.guest.store(false, Ordering::SeqCst);
        self.resolved.lock().take();
        self.bearer.lock().take();
        Ok(())
    }

    /// Credential block for outgoing messages
    pub fn who(&self) -> Result<Who> {
        let resolved = self.resolved.lock().clone();
        let credential = match resolved {
            Some(c) => c,
            None => self.ensure(false)?,
        };
        Ok(match credential {
            Credential::ApiKey(key) => Who::ApiKey(key),
            Credential::RefreshToken(token) => Who::Token(self.bearer_token(&token)?),
            Credential::Guest => Who::Token(String::new()),
        })
    }

    /// Bearer token for a refresh token, cached until expiry
    pub fn bearer_token(&self, refresh_token: &str) -> Result<String> {
        if refresh_token.is_empty() {
            return Ok(String::new());
        }
        let mut cached = self.bearer.lock();
        if let Some(c) = cached.as_ref() {
            if c.refresh_token == refresh_token && Instant::now() < c.expires_at {
                return Ok(c.token.clone());
            }
        }
        let bearer = self.exchange.exchange(refresh_token)?;
        let now = Instant::now();
        let expires_at = now.checked_add(bearer.expires_in).unwrap_or(now);
        *cached = Some(CachedBearer {
            refresh_token: refresh_token.to_string(),
            token: bearer.token.clone(),
            expires_at,
        });
        Ok(bearer.token)
    }

    /// Identity description without secrets; empty when there are no
    /// credentials
    pub fn describe(&self) -> String {
        if let Some(key) = self.forced_key() {
            return if key == GUEST_KEY {
                "GUEST via forced key".to_string()
            } else {
                format!("API key beginning with {}...", prefix(&key))
            };
        }
        if !self.have_credentials() {
            return String::new();
        }
        if self.is_guest() {
            return "GUEST via login prompt".to_string();
        }
        let Ok(Some(refresh)) = self.read_refresh_token() else {
            return String::new();
        };
        match self.bearer_token(&refresh).ok().and_then(|t| jwt_claims(&t)) {
            Some(claims) => {
                let mut name = claims
                    .get("email")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown user")
                    .to_string();
                if let Some(provider) = claims
                    .pointer("/firebase/sign_in_provider")
                    .and_then(Value::as_str)
                {
                    name.push_str(&format!(" through firebase provider: {}", provider));
                }
                name
            }
            None => "user with stored refresh token".to_string(),
        }
    }
}

/// Payload claims of a JWT, without verifying the signature
pub fn jwt_claims(token: &str) -> Option<Value> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    serde_json::from_slice(&bytes).ok()
}
