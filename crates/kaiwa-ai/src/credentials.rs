//! Access-token sources for Vertex AI requests.
//!
//! Each source yields an OAuth2 bearer token. [`resolve_access_token_provider`]
//! picks one from the configured [`VertexAuthMode`] and a [`CredentialProbe`]
//! snapshot of the process environment.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::sync::Mutex;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

use crate::KaiwaAiError;

pub const DEFAULT_METADATA_HOST: &str = "metadata.google.internal";
const METADATA_TOKEN_PATH: &str = "/computeMetadata/v1/instance/service-accounts/default/token";
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);
const GCLOUD_TIMEOUT: Duration = Duration::from_secs(30);
pub const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";
pub const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const JWT_BEARER_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: u64 = 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VertexAuthMode {
    #[default]
    Auto,
    AccessToken,
    ServiceAccountKey,
    MetadataServer,
    Gcloud,
}

impl VertexAuthMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::AccessToken => "access-token",
            Self::ServiceAccountKey => "service-account-key",
            Self::MetadataServer => "metadata-server",
            Self::Gcloud => "gcloud",
        }
    }
}

#[async_trait]
pub trait AccessTokenProvider: Send + Sync {
    async fn access_token(&self) -> Result<String, KaiwaAiError>;

    fn source_name(&self) -> &'static str;
}

#[derive(Debug, Clone)]
pub struct StaticAccessToken {
    token: String,
}

impl StaticAccessToken {
    pub fn new(token: impl Into<String>) -> Result<Self, KaiwaAiError> {
        let token = token.into();
        if token.trim().is_empty() {
            return Err(KaiwaAiError::MissingCredentials(
                "VERTEX_AI_ACCESS_TOKEN is empty".to_string(),
            ));
        }
        Ok(Self {
            token: token.trim().to_string(),
        })
    }
}

#[async_trait]
impl AccessTokenProvider for StaticAccessToken {
    async fn access_token(&self) -> Result<String, KaiwaAiError> {
        Ok(self.token.clone())
    }

    fn source_name(&self) -> &'static str {
        "access-token"
    }
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    refresh_after: Instant,
}

/// Fetches tokens for the default service account from the GCE / Cloud Run
/// metadata server and caches them until shortly before expiry.
#[derive(Debug)]
pub struct MetadataServerTokenProvider {
    http: reqwest::Client,
    token_url: String,
    cached: Mutex<Option<CachedToken>>,
}

impl MetadataServerTokenProvider {
    pub fn new(metadata_host: &str, request_timeout_ms: u64) -> Result<Self, KaiwaAiError> {
        let host = metadata_host.trim().trim_end_matches('/');
        let host = if host.is_empty() {
            DEFAULT_METADATA_HOST
        } else {
            host
        };
        let origin = if host.starts_with("http://") || host.starts_with("https://") {
            host.to_string()
        } else {
            format!("http://{host}")
        };
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(request_timeout_ms.max(1)))
            .build()?;
        Ok(Self {
            http,
            token_url: format!("{origin}{METADATA_TOKEN_PATH}"),
            cached: Mutex::new(None),
        })
    }

    async fn fetch(&self) -> Result<CachedToken, KaiwaAiError> {
        let response = self
            .http
            .get(&self.token_url)
            .header("Metadata-Flavor", "Google")
            .send()
            .await?;
        let status = response.status();
        let raw = response.text().await?;
        cached_token_from_response("metadata server", status, &raw)
    }
}

#[async_trait]
impl AccessTokenProvider for MetadataServerTokenProvider {
    async fn access_token(&self) -> Result<String, KaiwaAiError> {
        let mut cached = self.cached.lock().await;
        if let Some(entry) = cached.as_ref() {
            if Instant::now() < entry.refresh_after {
                return Ok(entry.token.clone());
            }
        }
        let fresh = self.fetch().await?;
        let token = fresh.token.clone();
        *cached = Some(fresh);
        Ok(token)
    }

    fn source_name(&self) -> &'static str {
        "metadata-server"
    }
}

#[derive(Debug, Deserialize)]
struct OAuthTokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

fn cached_token_from_response(
    source: &str,
    status: reqwest::StatusCode,
    raw: &str,
) -> Result<CachedToken, KaiwaAiError> {
    if !status.is_success() {
        return Err(KaiwaAiError::Credentials(format!(
            "{source} returned status {}: {}",
            status.as_u16(),
            raw.trim()
        )));
    }
    let parsed: OAuthTokenResponse = serde_json::from_str(raw)?;
    if parsed.access_token.trim().is_empty() {
        return Err(KaiwaAiError::Credentials(format!(
            "{source} returned an empty access token"
        )));
    }
    let lifetime = Duration::from_secs(parsed.expires_in.unwrap_or(0));
    let refresh_after = Instant::now() + lifetime.saturating_sub(TOKEN_REFRESH_MARGIN);
    Ok(CachedToken {
        token: parsed.access_token,
        refresh_after,
    })
}

/// The fields of a Google service-account JSON key that the JWT-bearer grant
/// needs.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    #[serde(rename = "type")]
    pub key_type: String,
    pub client_email: String,
    pub private_key: String,
    #[serde(default)]
    pub private_key_id: Option<String>,
    #[serde(default)]
    pub token_uri: Option<String>,
}

impl ServiceAccountKey {
    pub fn from_file(path: &Path) -> Result<Self, KaiwaAiError> {
        let raw = std::fs::read_to_string(path).map_err(|error| {
            KaiwaAiError::Credentials(format!(
                "failed to read service account key '{}': {error}",
                path.display()
            ))
        })?;
        let key: Self = serde_json::from_str(&raw).map_err(|error| {
            KaiwaAiError::Credentials(format!(
                "invalid service account key '{}': {error}",
                path.display()
            ))
        })?;
        if key.key_type != "service_account" {
            return Err(KaiwaAiError::Credentials(format!(
                "'{}' has type '{}', expected 'service_account'",
                path.display(),
                key.key_type
            )));
        }
        Ok(key)
    }
}

#[derive(Debug, Serialize)]
struct JwtBearerClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: u64,
    exp: u64,
}

/// Exchanges an RS256-signed assertion from a service-account key for an
/// access token and caches it until shortly before expiry.
pub struct ServiceAccountTokenProvider {
    http: reqwest::Client,
    client_email: String,
    key_id: Option<String>,
    token_uri: String,
    signing_key: EncodingKey,
    cached: Mutex<Option<CachedToken>>,
}

impl std::fmt::Debug for ServiceAccountTokenProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceAccountTokenProvider")
            .field("client_email", &self.client_email)
            .field("token_uri", &self.token_uri)
            .finish()
    }
}

impl ServiceAccountTokenProvider {
    pub fn new(key: ServiceAccountKey, request_timeout_ms: u64) -> Result<Self, KaiwaAiError> {
        let signing_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes()).map_err(|error| {
            KaiwaAiError::Credentials(format!("invalid service account private key: {error}"))
        })?;
        let token_uri = key
            .token_uri
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(DEFAULT_TOKEN_URI)
            .to_string();
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(request_timeout_ms.max(1)))
            .build()?;
        Ok(Self {
            http,
            client_email: key.client_email,
            key_id: key.private_key_id,
            token_uri,
            signing_key,
            cached: Mutex::new(None),
        })
    }

    fn assertion(&self, issued_at: u64) -> Result<String, KaiwaAiError> {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = self.key_id.clone();
        let claims = JwtBearerClaims {
            iss: &self.client_email,
            scope: CLOUD_PLATFORM_SCOPE,
            aud: &self.token_uri,
            iat: issued_at,
            exp: issued_at + ASSERTION_LIFETIME_SECS,
        };
        encode(&header, &claims, &self.signing_key).map_err(|error| {
            KaiwaAiError::Credentials(format!("failed to sign service account assertion: {error}"))
        })
    }

    async fn fetch(&self) -> Result<CachedToken, KaiwaAiError> {
        let assertion = self.assertion(current_unix_timestamp())?;
        let response = self
            .http
            .post(&self.token_uri)
            .form(&[
                ("grant_type", JWT_BEARER_GRANT_TYPE),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await?;
        let status = response.status();
        let raw = response.text().await?;
        cached_token_from_response("token endpoint", status, &raw)
    }
}

#[async_trait]
impl AccessTokenProvider for ServiceAccountTokenProvider {
    async fn access_token(&self) -> Result<String, KaiwaAiError> {
        let mut cached = self.cached.lock().await;
        if let Some(entry) = cached.as_ref() {
            if Instant::now() < entry.refresh_after {
                return Ok(entry.token.clone());
            }
        }
        let fresh = self.fetch().await?;
        let token = fresh.token.clone();
        *cached = Some(fresh);
        Ok(token)
    }

    fn source_name(&self) -> &'static str {
        "service-account-key"
    }
}

fn current_unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

/// Shells out to `gcloud auth print-access-token` for every request.
#[derive(Debug, Clone)]
pub struct GcloudCliTokenProvider {
    executable: String,
}

impl GcloudCliTokenProvider {
    pub fn new(executable: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
        }
    }
}

#[async_trait]
impl AccessTokenProvider for GcloudCliTokenProvider {
    async fn access_token(&self) -> Result<String, KaiwaAiError> {
        let mut command = Command::new(&self.executable);
        command.kill_on_drop(true);
        command.args(["auth", "print-access-token"]);
        command.stdin(Stdio::null());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        let child = command.spawn().map_err(|error| {
            KaiwaAiError::Credentials(format!(
                "failed to spawn '{}': {error}",
                self.executable
            ))
        })?;

        let output = tokio::time::timeout(GCLOUD_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| {
                KaiwaAiError::Credentials(format!(
                    "gcloud timed out after {}s",
                    GCLOUD_TIMEOUT.as_secs()
                ))
            })?
            .map_err(|error| KaiwaAiError::Credentials(format!("gcloud process failed: {error}")))?;

        if !output.status.success() {
            let status = output
                .status
                .code()
                .map(|value| value.to_string())
                .unwrap_or_else(|| "signal".to_string());
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(KaiwaAiError::Credentials(format!(
                "gcloud failed with status {status}: {}",
                stderr.trim()
            )));
        }

        let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if token.is_empty() {
            return Err(KaiwaAiError::Credentials(
                "gcloud printed an empty access token".to_string(),
            ));
        }
        Ok(token)
    }

    fn source_name(&self) -> &'static str {
        "gcloud"
    }
}

/// Environment facts consulted by [`VertexAuthMode::Auto`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialProbe {
    /// `GOOGLE_APPLICATION_CREDENTIALS`, kept only when it names a file.
    pub credentials_file: Option<PathBuf>,
    pub on_cloud_run: bool,
    pub metadata_host: Option<String>,
    pub gcloud_available: bool,
}

impl CredentialProbe {
    pub fn from_env() -> Self {
        let metadata_host = std::env::var("GCE_METADATA_HOST")
            .ok()
            .filter(|value| !value.trim().is_empty());
        let credentials_file = std::env::var_os("GOOGLE_APPLICATION_CREDENTIALS")
            .map(PathBuf::from)
            .filter(|path| path.is_file());
        Self {
            credentials_file,
            on_cloud_run: std::env::var_os("K_SERVICE").is_some(),
            metadata_host,
            gcloud_available: is_executable_available("gcloud"),
        }
    }

    fn metadata_reachable(&self) -> bool {
        self.on_cloud_run || self.metadata_host.is_some()
    }

    fn metadata_host(&self) -> &str {
        self.metadata_host
            .as_deref()
            .unwrap_or(DEFAULT_METADATA_HOST)
    }
}

/// Names the source `resolve_access_token_provider` would pick, without
/// building it.
pub fn describe_credential_source(
    mode: VertexAuthMode,
    explicit_token: Option<&str>,
    probe: &CredentialProbe,
) -> Result<&'static str, KaiwaAiError> {
    let has_token = explicit_token.is_some_and(|token| !token.trim().is_empty());
    match mode {
        VertexAuthMode::AccessToken if has_token => Ok("access-token"),
        VertexAuthMode::AccessToken => Err(KaiwaAiError::MissingCredentials(
            "auth mode access-token requires VERTEX_AI_ACCESS_TOKEN".to_string(),
        )),
        VertexAuthMode::ServiceAccountKey if probe.credentials_file.is_some() => {
            Ok("service-account-key")
        }
        VertexAuthMode::ServiceAccountKey => Err(KaiwaAiError::MissingCredentials(
            "auth mode service-account-key requires GOOGLE_APPLICATION_CREDENTIALS to name a key file"
                .to_string(),
        )),
        VertexAuthMode::MetadataServer => Ok("metadata-server"),
        VertexAuthMode::Gcloud if probe.gcloud_available => Ok("gcloud"),
        VertexAuthMode::Gcloud => Err(KaiwaAiError::MissingCredentials(
            "gcloud executable not found on PATH".to_string(),
        )),
        VertexAuthMode::Auto => {
            if has_token {
                Ok("access-token")
            } else if probe.credentials_file.is_some() {
                Ok("service-account-key")
            } else if probe.metadata_reachable() {
                Ok("metadata-server")
            } else if probe.gcloud_available {
                Ok("gcloud")
            } else {
                Err(KaiwaAiError::MissingCredentials(
                    "set VERTEX_AI_ACCESS_TOKEN or GOOGLE_APPLICATION_CREDENTIALS, run on Cloud Run/GCE, or install gcloud"
                        .to_string(),
                ))
            }
        }
    }
}

pub fn resolve_access_token_provider(
    mode: VertexAuthMode,
    explicit_token: Option<&str>,
    probe: &CredentialProbe,
    request_timeout_ms: u64,
) -> Result<Arc<dyn AccessTokenProvider>, KaiwaAiError> {
    let provider: Arc<dyn AccessTokenProvider> =
        match describe_credential_source(mode, explicit_token, probe)? {
            "access-token" => Arc::new(StaticAccessToken::new(
                explicit_token.unwrap_or_default(),
            )?),
            "service-account-key" => {
                let path = probe.credentials_file.as_deref().ok_or_else(|| {
                    KaiwaAiError::MissingCredentials(
                        "GOOGLE_APPLICATION_CREDENTIALS is not set".to_string(),
                    )
                })?;
                Arc::new(ServiceAccountTokenProvider::new(
                    ServiceAccountKey::from_file(path)?,
                    request_timeout_ms,
                )?)
            }
            "metadata-server" => Arc::new(MetadataServerTokenProvider::new(
                probe.metadata_host(),
                request_timeout_ms,
            )?),
            _ => Arc::new(GcloudCliTokenProvider::new("gcloud")),
        };
    Ok(provider)
}

fn is_executable_file(path: &Path) -> bool {
    let Ok(metadata) = std::fs::metadata(path) else {
        return false;
    };
    if !metadata.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        metadata.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}

pub fn is_executable_available(executable: &str) -> bool {
    let trimmed = executable.trim();
    if trimmed.is_empty() {
        return false;
    }

    let candidate = Path::new(trimmed);
    if candidate.is_absolute() || trimmed.contains(std::path::MAIN_SEPARATOR) {
        return is_executable_file(candidate);
    }

    let Some(path_var) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path_var).any(|mut dir| {
        dir.push(trimmed);
        is_executable_file(&dir)
    })
}
