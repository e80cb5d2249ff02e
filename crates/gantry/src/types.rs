use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// All runtime knobs for one pipeline run. Defaults reproduce the observed
/// deployment: the `apwm` binary, built with the `cli` feature, released
/// from `refs/heads/main`.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Ref that gates the Deploy job, compared by exact match.
    pub release_ref: String,
    /// Binary (and artifact) name.
    pub binary: String,
    /// Feature flag passed to the build.
    pub features: String,
    /// Source tree the Build job compiles.
    pub context_dir: PathBuf,
    /// Directory for state, receipts, events, and the artifact store.
    pub state_dir: PathBuf,
    /// Best-effort build cache location; `None` disables caching.
    pub cache_dir: Option<PathBuf>,
    /// Artifact store location; defaults to `<state_dir>/artifacts`.
    pub artifacts_dir: Option<PathBuf>,
    /// Container engine program (image builds).
    pub engine: String,
    /// Secure-copy program (deploys).
    pub transfer: String,
    /// Optional wall-clock limit per external command.
    pub step_timeout: Option<Duration>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            release_ref: "refs/heads/main".to_string(),
            binary: "apwm".to_string(),
            features: "cli".to_string(),
            context_dir: PathBuf::from("."),
            state_dir: PathBuf::from(".gantry"),
            cache_dir: None,
            artifacts_dir: None,
            engine: "docker".to_string(),
            transfer: "scp".to_string(),
            step_timeout: None,
        }
    }
}

impl PipelineOptions {
    pub fn artifacts_root(&self) -> PathBuf {
        self.artifacts_dir
            .clone()
            .unwrap_or_else(|| self.state_dir.join(crate::artifact::ARTIFACTS_DIR))
    }
}

/// Where a deployed artifact lands: `user@host:path`, fully secret-sourced.
///
/// Intentionally not serializable, and `Debug` is redacted: the tuple comes
/// from the platform secret store and must never reach state files or logs.
#[derive(Clone, PartialEq, Eq)]
pub struct RemoteTarget {
    pub user: String,
    pub host: String,
    pub path: String,
}

impl RemoteTarget {
    /// Destination string in secure-copy form.
    pub fn scp_destination(&self) -> String {
        format!("{}@{}:{}", self.user, self.host, self.path)
    }
}

impl fmt::Debug for RemoteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RemoteTarget(<redacted>)")
    }
}

/// Failure taxonomy for pipeline steps.
///
/// A false branch guard is not an error and never appears here; it maps to
/// [`JobState::Skipped`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// A build step failed (context check, toolchain, compile, publish).
    BuildStep,
    /// The artifact store rejected a publish or fetch.
    Artifact,
    /// The remote transfer failed (network, auth, path).
    Transfer,
    /// Secret material was missing or could not be materialized.
    Credential,
    /// The run was misconfigured before any step executed.
    Config,
}

/// Typed step failure. Jobs abort on the first error; the class survives
/// into the job state so receipts can distinguish a compile failure from a
/// transfer failure.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("build step failed: {0}")]
    Build(String),
    #[error("artifact store error: {0}")]
    Artifact(#[from] crate::artifact::ArtifactError),
    #[error("transfer failed: {0}")]
    Transfer(String),
    #[error("credential error: {0}")]
    Credential(String),
    #[error("configuration error: {0}")]
    Config(String),
}

impl StepError {
    pub fn class(&self) -> ErrorClass {
        match self {
            StepError::Build(_) => ErrorClass::BuildStep,
            StepError::Artifact(_) => ErrorClass::Artifact,
            StepError::Transfer(_) => ErrorClass::Transfer,
            StepError::Credential(_) => ErrorClass::Credential,
            StepError::Config(_) => ErrorClass::Config,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed { class: ErrorClass, message: String },
    Skipped { reason: String },
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobState::Pending | JobState::Running)
    }

    /// Whether this state counts toward a successful run. A skipped job is
    /// a normal outcome (non-release ref), not a failure.
    pub fn is_ok(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Skipped { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobProgress {
    pub name: String,
    pub state: JobState,
    pub last_updated_at: DateTime<Utc>,
}

/// Live run state, persisted after every job transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: String,
    pub ref_name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub jobs: BTreeMap<String, JobProgress>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReceipt {
    pub name: String,
    pub state: JobState,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u128,
}

/// Final audit receipt for one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReceipt {
    pub receipt_version: String,
    pub run_id: String,
    pub ref_name: String,
    /// Verdict of the branch guard for this run's ref.
    pub deploy_allowed: bool,
    pub environment: EnvironmentFingerprint,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub jobs: Vec<JobReceipt>,
}

impl RunReceipt {
    /// A run succeeds when every job either succeeded or was skipped by the
    /// branch guard.
    pub fn success(&self) -> bool {
        self.jobs.iter().all(|j| j.state.is_ok())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentFingerprint {
    pub gantry_version: String,
    pub hostname: String,
    pub os: String,
    pub arch: String,
    pub toolchain_version: Option<String>,
    pub engine_version: Option<String>,
    pub transfer_version: Option<String>,
}

/// One entry in the append-only `events.jsonl` log.
///
/// Event payloads carry names and digests only — never secret values and
/// never metadata about credential material.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
    /// Job this event belongs to (`build`, `deploy`, or `run` for
    /// run-level events).
    pub job: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventKind {
    RunStarted { ref_name: String },
    JobStarted { name: String },
    StepStarted { name: String },
    StepFinished { name: String, success: bool },
    CacheRestored { hit: bool },
    ArtifactPublished { name: String, digest: String },
    ArtifactFetched { name: String },
    CredentialScopeOpened,
    CredentialScopeClosed,
    DeploySkipped { ref_name: String },
    JobFinished { name: String, state: JobState },
    RunFinished { success: bool },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_target_debug_is_redacted() {
        let target = RemoteTarget {
            user: "deploy".to_string(),
            host: "worlds.example.net".to_string(),
            path: "/srv/apwm/apwm".to_string(),
        };
        let rendered = format!("{target:?}");
        assert!(!rendered.contains("worlds.example.net"));
        assert!(!rendered.contains("/srv"));
        assert_eq!(target.scp_destination(), "deploy@worlds.example.net:/srv/apwm/apwm");
    }

    #[test]
    fn job_state_serializes_with_tagged_representation() {
        let st = JobState::Failed {
            class: ErrorClass::Transfer,
            message: "connection refused".to_string(),
        };

        let json = serde_json::to_string(&st).expect("serialize");
        assert!(json.contains("\"state\":\"failed\""));
        assert!(json.contains("\"class\":\"transfer\""));

        let rt: JobState = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(rt, st);
    }

    #[test]
    fn skipped_job_counts_as_ok() {
        let skipped = JobState::Skipped {
            reason: "ref refs/heads/feature/x is not the release ref".to_string(),
        };
        assert!(skipped.is_ok());
        assert!(skipped.is_terminal());
        assert!(!JobState::Running.is_terminal());
        assert!(!JobState::Failed { class: ErrorClass::BuildStep, message: "x".into() }.is_ok());
    }

    #[test]
    fn run_state_roundtrips_json() {
        let mut jobs = BTreeMap::new();
        jobs.insert(
            "build".to_string(),
            JobProgress {
                name: "build".to_string(),
                state: JobState::Succeeded,
                last_updated_at: Utc::now(),
            },
        );

        let st = RunState {
            run_id: "run-1".to_string(),
            ref_name: "refs/heads/main".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            jobs,
        };

        let json = serde_json::to_string_pretty(&st).expect("serialize");
        let parsed: RunState = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed.run_id, "run-1");
        assert!(parsed.jobs.contains_key("build"));
    }

    #[test]
    fn event_kind_uses_flattened_tag() {
        let ev = RunEvent {
            timestamp: Utc::now(),
            kind: EventKind::DeploySkipped {
                ref_name: "refs/heads/feature/x".to_string(),
            },
            job: "deploy".to_string(),
        };

        let json = serde_json::to_string(&ev).expect("serialize");
        assert!(json.contains("\"event\":\"deploy_skipped\""));
        let rt: RunEvent = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(rt.kind, ev.kind);
    }
}
