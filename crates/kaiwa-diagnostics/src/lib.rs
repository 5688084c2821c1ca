//! Configuration validator for the kaiwa bot.
//!
//! Runs doctor-style checks over the environment, Vertex AI credentials and
//! deployment files, and renders them as text or JSON.

use std::path::{Path, PathBuf};

use kaiwa_ai::{describe_credential_source, CredentialProbe, VertexAuthMode};

pub const SLACK_MANIFEST_FILE: &str = "manifest.json";

/// Environment values the bot cannot start without.
pub const REQUIRED_ENV: [(&str, &str); 3] = [
    ("SLACK_BOT_TOKEN", "Bot user OAuth token"),
    ("SLACK_SIGNING_SECRET", "Slack app signing secret"),
    ("GCP_PROJECT_ID", "Google Cloud project ID"),
];

pub const OPTIONAL_ENV: [(&str, &str); 4] = [
    (
        "SLACK_APP_TOKEN",
        "App-level token for Socket Mode development",
    ),
    (
        "GOOGLE_APPLICATION_CREDENTIALS",
        "Path to service account key",
    ),
    (
        "VERTEX_AI_LOCATION",
        "Vertex AI region (defaults to us-central1)",
    ),
    (
        "VERTEX_AI_MODEL",
        "Gemini model name (defaults to gemini-2.5-flash)",
    ),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoctorStatus {
    Pass,
    Warn,
    Fail,
}

impl DoctorStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DoctorStatus::Pass => "pass",
            DoctorStatus::Warn => "warn",
            DoctorStatus::Fail => "fail",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DoctorCheckResult {
    pub key: String,
    pub status: DoctorStatus,
    pub code: String,
    pub path: Option<String>,
    pub action: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ConfigValidationConfig {
    /// Directory expected to contain the Slack app manifest.
    pub root_dir: PathBuf,
    pub auth_mode: VertexAuthMode,
    pub probe: CredentialProbe,
}

/// Runs every check, reading configuration values through `lookup_env`.
pub fn run_config_checks_with_lookup<F>(
    config: &ConfigValidationConfig,
    lookup_env: F,
) -> Vec<DoctorCheckResult>
where
    F: Fn(&str) -> Option<String>,
{
    let lookup = |name: &str| lookup_env(name).filter(|value| !value.trim().is_empty());
    let mut checks = Vec::new();

    checks.push(check_file(
        &config.root_dir,
        SLACK_MANIFEST_FILE,
        "Slack app manifest",
    ));

    for (name, description) in REQUIRED_ENV {
        let present = lookup(name).is_some();
        checks.push(DoctorCheckResult {
            key: format!("env.{name}"),
            status: if present {
                DoctorStatus::Pass
            } else {
                DoctorStatus::Fail
            },
            code: if present { "present" } else { "missing" }.to_string(),
            path: None,
            action: (!present).then(|| format!("set {name}: {description}")),
        });
    }

    for (name, description) in OPTIONAL_ENV {
        let present = lookup(name).is_some();
        checks.push(DoctorCheckResult {
            key: format!("env.{name}"),
            status: if present {
                DoctorStatus::Pass
            } else {
                DoctorStatus::Warn
            },
            code: if present { "present" } else { "missing_optional" }.to_string(),
            path: None,
            action: (!present).then(|| format!("optional: {description}")),
        });
    }

    if let Some(path) = lookup("GOOGLE_APPLICATION_CREDENTIALS") {
        let exists = Path::new(&path).is_file();
        checks.push(DoctorCheckResult {
            key: "google_application_credentials_file".to_string(),
            status: if exists {
                DoctorStatus::Pass
            } else {
                DoctorStatus::Warn
            },
            code: if exists { "present" } else { "missing" }.to_string(),
            path: Some(path),
            action: (!exists)
                .then(|| "point GOOGLE_APPLICATION_CREDENTIALS at a key file".to_string()),
        });
    }

    let explicit_token = lookup("VERTEX_AI_ACCESS_TOKEN");
    let credential_check = match describe_credential_source(
        config.auth_mode,
        explicit_token.as_deref(),
        &config.probe,
    ) {
        Ok(source) => DoctorCheckResult {
            key: "vertex_credentials".to_string(),
            status: DoctorStatus::Pass,
            code: source.to_string(),
            path: None,
            action: None,
        },
        Err(error) => DoctorCheckResult {
            key: "vertex_credentials".to_string(),
            status: DoctorStatus::Warn,
            code: format!("unresolved:{}", config.auth_mode.as_str()),
            path: None,
            action: Some(error.to_string()),
        },
    };
    checks.push(credential_check);

    checks
}

fn check_file(root: &Path, relative: &str, description: &str) -> DoctorCheckResult {
    let path = root.join(relative);
    let exists = path.is_file();
    DoctorCheckResult {
        key: format!("file.{relative}"),
        status: if exists {
            DoctorStatus::Pass
        } else {
            DoctorStatus::Fail
        },
        code: if exists { "present" } else { "missing" }.to_string(),
        path: Some(path.display().to_string()),
        action: (!exists).then(|| format!("add {relative}: {description}")),
    }
}

pub fn has_failures(checks: &[DoctorCheckResult]) -> bool {
    checks
        .iter()
        .any(|check| check.status == DoctorStatus::Fail)
}

fn count_status(checks: &[DoctorCheckResult], status: DoctorStatus) -> usize {
    checks.iter().filter(|item| item.status == status).count()
}

pub fn render_doctor_report(checks: &[DoctorCheckResult]) -> String {
    let mut lines = vec![format!(
        "config summary: checks={} pass={} warn={} fail={}",
        checks.len(),
        count_status(checks, DoctorStatus::Pass),
        count_status(checks, DoctorStatus::Warn),
        count_status(checks, DoctorStatus::Fail)
    )];

    for check in checks {
        lines.push(format!(
            "config check: key={} status={} code={} path={} action={}",
            check.key,
            check.status.as_str(),
            check.code,
            check.path.as_deref().unwrap_or("none"),
            check.action.as_deref().unwrap_or("none")
        ));
    }

    lines.join("\n")
}

pub fn render_doctor_report_json(checks: &[DoctorCheckResult]) -> String {
    serde_json::json!({
        "summary": {
            "checks": checks.len(),
            "pass": count_status(checks, DoctorStatus::Pass),
            "warn": count_status(checks, DoctorStatus::Warn),
            "fail": count_status(checks, DoctorStatus::Fail),
        },
        "checks": checks
            .iter()
            .map(|check| {
                serde_json::json!({
                    "key": check.key,
                    "status": check.status.as_str(),
                    "code": check.code,
                    "path": check.path,
                    "action": check.action,
                })
            })
            .collect::<Vec<_>>()
    })
    .to_string()
}
