//! # Gantry
//!
//! A typed, testable build-and-deploy orchestrator.
//!
//! Gantry models the pipeline behind a container-shipped binary: build a
//! release binary in a hosted environment, publish it as a named artifact,
//! and — only for the designated release ref — copy it to a deployment host
//! with ephemeral credentials. It also models the image family those
//! binaries ship in: a declarative image spec with two build strategies and
//! a shared non-root worker layout, rendered to a containerfile and executed
//! through an external container engine.
//!
//! ## Pipeline
//!
//! The core flow is **build → branch guard → deploy**:
//!
//! 1. [`pipeline::run_pipeline`] enters the Build job on every push ref:
//!    verify the build context, probe the toolchain, restore the build cache
//!    (best-effort), compile the named binary with the named feature flag,
//!    and publish the single output file to the [`artifact::ArtifactStore`].
//! 2. [`pipeline::deploy_allowed`] is a pure exact-match predicate over the
//!    triggering ref. A non-release ref skips Deploy and the run still
//!    succeeds.
//! 3. The Deploy job fetches the artifact (consume-once), materializes the
//!    deploy key into a permission-restricted [`secrets::CredentialFile`],
//!    and transfers the file to the secret-sourced remote target. The
//!    credential file is discarded when the job scope ends.
//!
//! Any step failure aborts its job immediately: no retry, no rollback. The
//! run leaves behind an audit trail — `state.json`, `receipt.json`, and an
//! append-only `events.jsonl` — in the state directory.
//!
//! ## Key Types
//!
//! - `ImageSpec` / `BuildStrategy` — declarative image description with a
//!   compile-then-package or copy-prebuilt strategy
//! - `PipelineOptions` — all runtime knobs (refs, binary, feature flag,
//!   directories, external tool names)
//! - `RunReceipt` — audit receipt with per-job states and durations
//! - `DeploySecrets` / `CredentialFile` — scoped deploy credential material
//! - `CommandRunner` — the seam through which every external tool runs
//!
//! ## Modules
//!
//! - [`types`] — domain types: job states, receipts, events, error classes
//! - [`image`] — image specs, layer plans, containerfile rendering, builds
//! - [`pipeline`] — the two-state build/deploy engine and branch guard
//! - [`artifact`] — filesystem artifact store with consume-once fetch
//! - [`secrets`] — environment-sourced secrets and the credential file scope
//! - [`config`] — `.gantry.toml` loading and merging
//! - [`state`] — state and receipt persistence
//! - [`events`] — append-only JSONL event log
//! - [`environment`] — environment fingerprinting (host, tools)
//! - [`runner`] — `CommandRunner` trait and the system implementation

/// Filesystem artifact store with consume-once fetch.
pub mod artifact;

/// Configuration file (`.gantry.toml`) loading and merging.
pub mod config;

/// Environment fingerprinting (host, OS, external tool versions).
pub mod environment;

/// Append-only JSONL event log.
pub mod events;

/// Image specs, layer plans, containerfile rendering, and image builds.
pub mod image;

/// Core build, branch-guard, and deploy logic.
pub mod pipeline;

/// `CommandRunner` trait and the system implementation.
pub mod runner;

/// Environment-sourced deploy secrets and the scoped credential file.
pub mod secrets;

/// State and receipt persistence.
pub mod state;

/// Domain types: job states, receipts, events, error classes.
pub mod types;

/// External command execution with capture and timeouts.
/// Re-exported from the gantry-process microcrate.
pub use gantry_process as process;
