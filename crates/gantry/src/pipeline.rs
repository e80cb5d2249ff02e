//! The build/deploy pipeline engine.
//!
//! A run is a two-state machine: **Build** on every push ref, then a
//! branch-guard check, then **Deploy** only for the release ref. Each step
//! inside a job must succeed in order; the first failure aborts the job
//! with no retry and no rollback. A failed Build means Deploy never
//! starts. Runs are strictly sequential within themselves; nothing here
//! coordinates concurrent runs against the shared deploy target —
//! last-writer-wins, reconstructable from receipts.

use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::artifact::ArtifactStore;
use crate::environment;
use crate::events::{EventLog, events_path};
use crate::image::verify_build_context;
use crate::runner::CommandRunner;
use crate::secrets::{CredentialFile, DeploySecrets};
use crate::state::{self, CURRENT_RECEIPT_VERSION};
use crate::types::{
    EventKind, JobProgress, JobReceipt, JobState, PipelineOptions, RunReceipt, RunState, StepError,
};

pub const BUILD_JOB: &str = "build";
pub const DEPLOY_JOB: &str = "deploy";

/// Progress sink for operators; the CLI prints these to stderr.
pub trait Reporter {
    fn info(&mut self, msg: &str);
    fn warn(&mut self, msg: &str);
    fn error(&mut self, msg: &str);
}

/// The branch guard: Deploy runs only when the triggering ref is exactly
/// the release ref. `refs/heads/main2` and `refs/heads/feature/main` are
/// not `refs/heads/main`.
pub fn deploy_allowed(ref_name: &str, release_ref: &str) -> bool {
    ref_name == release_ref
}

/// Run the full pipeline: Build, branch guard, Deploy.
pub fn run_pipeline(
    trigger_ref: &str,
    opts: &PipelineOptions,
    runner: &mut dyn CommandRunner,
    reporter: &mut dyn Reporter,
) -> Result<RunReceipt> {
    run_inner(trigger_ref, opts, runner, reporter, true)
}

/// Run the Build job only; Deploy is recorded as skipped.
pub fn run_build(
    trigger_ref: &str,
    opts: &PipelineOptions,
    runner: &mut dyn CommandRunner,
    reporter: &mut dyn Reporter,
) -> Result<RunReceipt> {
    run_inner(trigger_ref, opts, runner, reporter, false)
}

fn run_inner(
    trigger_ref: &str,
    opts: &PipelineOptions,
    runner: &mut dyn CommandRunner,
    reporter: &mut dyn Reporter,
    with_deploy: bool,
) -> Result<RunReceipt> {
    let started_at = Utc::now();
    let fingerprint = environment::collect_fingerprint(&opts.engine, &opts.transfer);
    let run_id = compute_run_id(trigger_ref, &started_at, &fingerprint.hostname);
    let state_dir = opts.state_dir.clone();

    let store = ArtifactStore::open(opts.artifacts_root())?;

    let mut events = EventLog::new();
    events.record(
        "run",
        EventKind::RunStarted {
            ref_name: trigger_ref.to_string(),
        },
    );

    let mut run_state = RunState {
        run_id: run_id.clone(),
        ref_name: trigger_ref.to_string(),
        created_at: started_at,
        updated_at: started_at,
        jobs: [BUILD_JOB, DEPLOY_JOB]
            .into_iter()
            .map(|name| {
                (
                    name.to_string(),
                    JobProgress {
                        name: name.to_string(),
                        state: JobState::Pending,
                        last_updated_at: started_at,
                    },
                )
            })
            .collect(),
    };
    state::save_state(&state_dir, &run_state)?;

    let mut jobs: Vec<JobReceipt> = Vec::new();

    // State: Build. Entered on every push.
    reporter.info(&format!("run {run_id}: build starting for {trigger_ref}"));
    mark_job(&mut run_state, &state_dir, BUILD_JOB, JobState::Running)?;
    events.record(
        BUILD_JOB,
        EventKind::JobStarted {
            name: BUILD_JOB.to_string(),
        },
    );

    let build_started = Utc::now();
    let build_clock = Instant::now();
    let build_state = match build_steps(opts, runner, reporter, &store, &mut events) {
        Ok(()) => {
            reporter.info("build: succeeded");
            JobState::Succeeded
        }
        Err(err) => {
            reporter.error(&format!("build: {err}"));
            JobState::Failed {
                class: err.class(),
                message: err.to_string(),
            }
        }
    };
    finish_job(
        &mut run_state,
        &state_dir,
        &mut events,
        &mut jobs,
        BUILD_JOB,
        build_state,
        build_started,
        build_clock,
    )?;
    events.flush_to_file(&events_path(&state_dir))?;

    let build_ok = jobs[0].state.is_ok();

    // Transition guard, then state: Deploy.
    let guard_passed = deploy_allowed(trigger_ref, &opts.release_ref);
    let deploy_started = Utc::now();
    let deploy_clock = Instant::now();
    let deploy_state = if !build_ok {
        JobState::Skipped {
            reason: "build did not succeed".to_string(),
        }
    } else if !with_deploy {
        JobState::Skipped {
            reason: "deploy disabled for this invocation".to_string(),
        }
    } else if !guard_passed {
        reporter.info(&format!(
            "deploy: skipped ({trigger_ref} is not the release ref)"
        ));
        events.record(
            DEPLOY_JOB,
            EventKind::DeploySkipped {
                ref_name: trigger_ref.to_string(),
            },
        );
        JobState::Skipped {
            reason: format!("ref {trigger_ref} is not the release ref"),
        }
    } else {
        reporter.info(&format!("run {run_id}: deploy starting"));
        mark_job(&mut run_state, &state_dir, DEPLOY_JOB, JobState::Running)?;
        events.record(
            DEPLOY_JOB,
            EventKind::JobStarted {
                name: DEPLOY_JOB.to_string(),
            },
        );

        let scratch = tempfile::tempdir().context("failed to create deploy scratch dir")?;
        match deploy_steps(opts, runner, reporter, &store, &mut events, scratch.path()) {
            Ok(()) => {
                reporter.info("deploy: succeeded");
                JobState::Succeeded
            }
            Err(err) => {
                reporter.error(&format!("deploy: {err}"));
                JobState::Failed {
                    class: err.class(),
                    message: err.to_string(),
                }
            }
        }
    };
    finish_job(
        &mut run_state,
        &state_dir,
        &mut events,
        &mut jobs,
        DEPLOY_JOB,
        deploy_state,
        deploy_started,
        deploy_clock,
    )?;

    let receipt = RunReceipt {
        receipt_version: CURRENT_RECEIPT_VERSION.to_string(),
        run_id,
        ref_name: trigger_ref.to_string(),
        deploy_allowed: guard_passed,
        environment: fingerprint,
        started_at,
        finished_at: Utc::now(),
        jobs,
    };

    events.record(
        "run",
        EventKind::RunFinished {
            success: receipt.success(),
        },
    );
    events.flush_to_file(&events_path(&state_dir))?;
    state::write_receipt(&state_dir, &receipt)?;
    state::clear_state(&state_dir)?;

    Ok(receipt)
}

/// Build job body. Steps in order: context check, toolchain probe, cache
/// restore (best-effort), compile, publish, cache save (best-effort).
fn build_steps(
    opts: &PipelineOptions,
    runner: &mut dyn CommandRunner,
    reporter: &mut dyn Reporter,
    store: &ArtifactStore,
    events: &mut EventLog,
) -> Result<(), StepError> {
    let context = &opts.context_dir;
    verify_build_context(context).map_err(|e| StepError::Build(e.to_string()))?;

    let probe = runner
        .run("cargo", &["--version"], None)
        .map_err(|e| StepError::Build(e.to_string()))?;
    if !probe.success {
        return Err(StepError::Build(format!(
            "toolchain probe failed: {}",
            probe.stderr.trim()
        )));
    }

    // Best-effort cache: a miss or a copy failure is a performance
    // penalty, never a build failure.
    if let Some(cache_dir) = &opts.cache_dir {
        match cache::restore(cache_dir, context) {
            Ok(hit) => {
                if !hit {
                    reporter.warn("build cache miss");
                }
                events.record(BUILD_JOB, EventKind::CacheRestored { hit });
            }
            Err(err) => reporter.warn(&format!("build cache restore failed: {err}")),
        }
    }

    events.record(
        BUILD_JOB,
        EventKind::StepStarted {
            name: "compile".to_string(),
        },
    );
    reporter.info(&format!(
        "build: cargo build --bin {} --features {} --release",
        opts.binary, opts.features
    ));
    let result = runner
        .run(
            "cargo",
            &[
                "build",
                "--bin",
                &opts.binary,
                "--features",
                &opts.features,
                "--release",
            ],
            Some(context),
        )
        .map_err(|e| StepError::Build(e.to_string()))?;
    events.record(
        BUILD_JOB,
        EventKind::StepFinished {
            name: "compile".to_string(),
            success: result.success,
        },
    );
    if !result.success {
        return Err(StepError::Build(format!(
            "compile failed with exit code {:?}: {}",
            result.exit_code,
            stderr_tail(&result.stderr)
        )));
    }

    let binary_path = context.join("target").join("release").join(&opts.binary);
    let record = store.publish(&opts.binary, &binary_path, BUILD_JOB)?;
    events.record(
        BUILD_JOB,
        EventKind::ArtifactPublished {
            name: record.name.clone(),
            digest: record.sha256.clone(),
        },
    );
    reporter.info(&format!(
        "build: artifact {} published ({} bytes)",
        record.name, record.size_bytes
    ));

    if let Some(cache_dir) = &opts.cache_dir {
        if let Err(err) = cache::save(context, cache_dir) {
            reporter.warn(&format!("build cache save failed: {err}"));
        }
    }

    Ok(())
}

/// Deploy job body. Steps in order: consume the artifact, read secrets,
/// materialize the credential inside the job scope, transfer.
fn deploy_steps(
    opts: &PipelineOptions,
    runner: &mut dyn CommandRunner,
    reporter: &mut dyn Reporter,
    store: &ArtifactStore,
    events: &mut EventLog,
    scratch: &Path,
) -> Result<(), StepError> {
    let artifact_path = store.fetch(&opts.binary, &scratch.join("fetched"))?;
    events.record(
        DEPLOY_JOB,
        EventKind::ArtifactFetched {
            name: opts.binary.clone(),
        },
    );
    reporter.info(&format!("deploy: fetched artifact {}", opts.binary));

    let secrets = DeploySecrets::from_env().map_err(|e| StepError::Credential(e.to_string()))?;

    // The credential lives exactly as long as this scope; no diagnostics
    // of the material are emitted anywhere.
    let credential = CredentialFile::materialize(secrets.key_bytes(), &scratch.join("cred"))
        .map_err(|e| StepError::Credential(e.to_string()))?;
    events.record(DEPLOY_JOB, EventKind::CredentialScopeOpened);

    events.record(
        DEPLOY_JOB,
        EventKind::StepStarted {
            name: "transfer".to_string(),
        },
    );
    let key_arg = credential.path().display().to_string();
    let artifact_arg = artifact_path.display().to_string();
    let destination = secrets.target().scp_destination();
    let result = runner
        .run(
            &opts.transfer,
            &[
                "-i",
                &key_arg,
                "-o",
                "StrictHostKeyChecking=no",
                "-o",
                "UserKnownHostsFile=/dev/null",
                "-p",
                &artifact_arg,
                &destination,
            ],
            None,
        )
        .map_err(|e| StepError::Transfer(e.to_string()));

    drop(credential);
    events.record(DEPLOY_JOB, EventKind::CredentialScopeClosed);

    events.record(
        DEPLOY_JOB,
        EventKind::StepFinished {
            name: "transfer".to_string(),
            success: result.as_ref().map(|r| r.success).unwrap_or(false),
        },
    );

    let result = result?;
    if !result.success {
        return Err(StepError::Transfer(format!(
            "exit code {:?}: {}",
            result.exit_code,
            stderr_tail(&result.stderr)
        )));
    }

    Ok(())
}

fn mark_job(
    state: &mut RunState,
    state_dir: &Path,
    name: &str,
    job_state: JobState,
) -> Result<()> {
    let now = Utc::now();
    if let Some(progress) = state.jobs.get_mut(name) {
        progress.state = job_state;
        progress.last_updated_at = now;
    }
    state.updated_at = now;
    state::save_state(state_dir, state)
}

#[allow(clippy::too_many_arguments)]
fn finish_job(
    state: &mut RunState,
    state_dir: &Path,
    events: &mut EventLog,
    jobs: &mut Vec<JobReceipt>,
    name: &str,
    job_state: JobState,
    started_at: DateTime<Utc>,
    clock: Instant,
) -> Result<()> {
    mark_job(state, state_dir, name, job_state.clone())?;
    events.record(
        name,
        EventKind::JobFinished {
            name: name.to_string(),
            state: job_state.clone(),
        },
    );
    jobs.push(JobReceipt {
        name: name.to_string(),
        state: job_state,
        started_at,
        finished_at: Utc::now(),
        duration_ms: clock.elapsed().as_millis(),
    });
    Ok(())
}

fn compute_run_id(ref_name: &str, started_at: &DateTime<Utc>, hostname: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(ref_name.as_bytes());
    hasher.update(b"\n");
    hasher.update(started_at.to_rfc3339().as_bytes());
    hasher.update(b"\n");
    hasher.update(hostname.as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..16].to_string()
}

fn stderr_tail(stderr: &str) -> String {
    const LINES: usize = 10;
    let lines: Vec<&str> = stderr.trim().lines().collect();
    let start = lines.len().saturating_sub(LINES);
    lines[start..].join("\n")
}

/// Best-effort build cache: the compiled `target/` tree copied aside
/// between runs, keyed only by location.
mod cache {
    use std::fs;
    use std::path::Path;

    use anyhow::Result;

    /// Copy the cached `target/` into the context. Returns whether the
    /// cache had anything to offer.
    pub(super) fn restore(cache_dir: &Path, context: &Path) -> Result<bool> {
        let cached = cache_dir.join("target");
        if !cached.is_dir() {
            return Ok(false);
        }
        copy_dir_all(&cached, &context.join("target"))?;
        Ok(true)
    }

    /// Copy the context's `target/` into the cache for the next run.
    pub(super) fn save(context: &Path, cache_dir: &Path) -> Result<()> {
        let target = context.join("target");
        if !target.is_dir() {
            return Ok(());
        }
        copy_dir_all(&target, &cache_dir.join("target"))?;
        Ok(())
    }

    fn copy_dir_all(src: &Path, dst: &Path) -> Result<()> {
        fs::create_dir_all(dst)?;
        for entry in fs::read_dir(src)? {
            let entry = entry?;
            let ty = entry.file_type()?;
            if ty.is_dir() {
                copy_dir_all(&entry.path(), &dst.join(entry.file_name()))?;
            } else {
                fs::copy(entry.path(), dst.join(entry.file_name()))?;
            }
        }
        Ok(())
    }
}
