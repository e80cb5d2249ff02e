//! Image specs and the Image Builder.
//!
//! An [`ImageSpec`] is a declarative description of one container image:
//! a build strategy, the shared non-root worker layout, and optional
//! package installs. The spec renders to a deterministic ordered layer
//! plan, which is what gets hashed for identity and what the external
//! container engine executes. Building is all-or-nothing: any layer
//! failure aborts the whole build with a non-zero status, no partial
//! image, no retry.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::runner::CommandRunner;

/// One layer operation in an image's build plan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum LayerOp {
    From {
        image: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stage: Option<String>,
    },
    Copy {
        src: String,
        dst: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        chown: Option<String>,
    },
    CopyFromStage {
        stage: String,
        src: String,
        dst: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        chown: Option<String>,
    },
    Run {
        command: String,
    },
    Env {
        key: String,
        value: String,
    },
    Volume {
        path: String,
    },
    Workdir {
        path: String,
    },
    User {
        name: String,
    },
}

impl LayerOp {
    /// Render this operation as one containerfile instruction.
    pub fn render(&self) -> String {
        match self {
            LayerOp::From { image, stage: None } => format!("FROM {image}"),
            LayerOp::From {
                image,
                stage: Some(stage),
            } => format!("FROM {image} AS {stage}"),
            LayerOp::Copy {
                src,
                dst,
                chown: None,
            } => format!("COPY {src} {dst}"),
            LayerOp::Copy {
                src,
                dst,
                chown: Some(chown),
            } => format!("COPY --chown={chown} {src} {dst}"),
            LayerOp::CopyFromStage {
                stage,
                src,
                dst,
                chown: None,
            } => format!("COPY --from={stage} {src} {dst}"),
            LayerOp::CopyFromStage {
                stage,
                src,
                dst,
                chown: Some(chown),
            } => format!("COPY --from={stage} --chown={chown} {src} {dst}"),
            LayerOp::Run { command } => format!("RUN {command}"),
            LayerOp::Env { key, value } => format!("ENV {key}={value}"),
            LayerOp::Volume { path } => format!("VOLUME {path}"),
            LayerOp::Workdir { path } => format!("WORKDIR {path}"),
            LayerOp::User { name } => format!("USER {name}"),
        }
    }
}

/// The execution-sandbox convention shared by every image in the family:
/// a non-root worker account with a fixed home, a writable artifacts
/// subdirectory, and declared mount points for per-run mutable state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerLayout {
    pub user: String,
    pub home: String,
    /// Writable subdirectory under `home`.
    pub artifacts_dir: String,
    /// Mount points relative to `home`.
    pub volumes: Vec<String>,
}

impl Default for WorkerLayout {
    fn default() -> Self {
        Self {
            user: "worker".to_string(),
            home: "/home/worker".to_string(),
            artifacts_dir: "artifacts".to_string(),
            volumes: vec!["checkouts".to_string(), ".cache".to_string()],
        }
    }
}

impl WorkerLayout {
    /// Root-phase layers: create the account and its writable tree.
    fn provision_layers(&self) -> Vec<LayerOp> {
        let WorkerLayout {
            user,
            home,
            artifacts_dir,
            volumes,
        } = self;

        let mut dirs = vec![format!("{home}/{artifacts_dir}")];
        dirs.extend(volumes.iter().map(|v| format!("{home}/{v}")));
        let dirs = dirs.join(" ");

        vec![
            LayerOp::Run {
                command: format!("useradd --create-home --home-dir {home} {user}"),
            },
            LayerOp::Run {
                command: format!("mkdir -p {dirs} && chown -R {user}:{user} {home}"),
            },
        ]
    }

    /// Trailing layers: environment, declared volumes, working directory,
    /// and the drop to the non-root account.
    fn runtime_layers(&self) -> Vec<LayerOp> {
        let mut ops = vec![LayerOp::Env {
            key: "HOME".to_string(),
            value: self.home.clone(),
        }];
        for volume in &self.volumes {
            ops.push(LayerOp::Volume {
                path: format!("{}/{}", self.home, volume),
            });
        }
        ops.push(LayerOp::Workdir {
            path: self.home.clone(),
        });
        ops.push(LayerOp::User {
            name: self.user.clone(),
        });
        ops
    }

    fn file_owner(&self) -> String {
        format!("{0}:{0}", self.user)
    }
}

/// A file copied verbatim into a copy-prebuilt image.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CopySpec {
    pub src: String,
    pub dst: String,
}

/// How the image gets its payload. A capability choice made at
/// configuration time; both variants share the worker-layout and
/// package-install layers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum BuildStrategy {
    /// Builder stage compiles the binary; the runtime stage copies only
    /// the compiled artifact, never the toolchain.
    CompileThenPackage {
        builder_image: String,
        runtime_image: String,
        binary: String,
        features: String,
    },
    /// No compilation: externally supplied files are copied straight into
    /// the runtime image.
    CopyPrebuilt {
        runtime_image: String,
        files: Vec<CopySpec>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageSpec {
    /// Image name; when specs come from `.gantry.toml` this is filled from
    /// the table key.
    #[serde(default)]
    pub name: String,
    #[serde(flatten)]
    pub strategy: BuildStrategy,
    #[serde(default)]
    pub layout: WorkerLayout,
    /// Distribution packages installed into the runtime stage.
    #[serde(default)]
    pub packages: Vec<String>,
}

impl ImageSpec {
    /// The deterministic ordered layer plan for this spec.
    pub fn layer_plan(&self) -> Vec<LayerOp> {
        match &self.strategy {
            BuildStrategy::CompileThenPackage {
                builder_image,
                runtime_image,
                binary,
                features,
            } => {
                let mut ops = vec![
                    LayerOp::From {
                        image: builder_image.clone(),
                        stage: Some("builder".to_string()),
                    },
                    LayerOp::Workdir {
                        path: "/build".to_string(),
                    },
                    LayerOp::Copy {
                        src: ".".to_string(),
                        dst: ".".to_string(),
                        chown: None,
                    },
                    LayerOp::Run {
                        command: format!(
                            "cargo build --bin {binary} --features {features} --release"
                        ),
                    },
                ];
                let copy = LayerOp::CopyFromStage {
                    stage: "builder".to_string(),
                    src: format!("/build/target/release/{binary}"),
                    dst: format!("{}/{binary}", self.layout.home),
                    chown: Some(self.layout.file_owner()),
                };
                ops.extend(self.runtime_stage(runtime_image, vec![copy]));
                ops
            }
            BuildStrategy::CopyPrebuilt {
                runtime_image,
                files,
            } => {
                let copies = files
                    .iter()
                    .map(|f| LayerOp::Copy {
                        src: f.src.clone(),
                        dst: f.dst.clone(),
                        chown: Some(self.layout.file_owner()),
                    })
                    .collect();
                self.runtime_stage(runtime_image, copies)
            }
        }
    }

    /// The runtime stage shared by both strategies: base image, package
    /// installs, worker provisioning, payload copies, then the worker
    /// runtime layers.
    fn runtime_stage(&self, runtime_image: &str, copies: Vec<LayerOp>) -> Vec<LayerOp> {
        let mut ops = vec![LayerOp::From {
            image: runtime_image.to_string(),
            stage: None,
        }];
        if let Some(install) = package_install_layer(&self.packages) {
            ops.push(install);
        }
        ops.extend(self.layout.provision_layers());
        ops.extend(copies);
        ops.extend(self.layout.runtime_layers());
        ops
    }

    /// Render the layer plan as containerfile text.
    pub fn render_containerfile(&self) -> String {
        let mut out = String::new();
        for op in self.layer_plan() {
            let _ = writeln!(out, "{}", op.render());
        }
        out
    }

    /// Content identity of this spec: sha256 over the rendered plan.
    /// Identical specs always produce identical digests.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.render_containerfile().as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Installs must never prompt; automated builds have no one to answer.
/// Forced default-config options keep pre-existing configuration files
/// from stalling the layer.
fn package_install_layer(packages: &[String]) -> Option<LayerOp> {
    if packages.is_empty() {
        return None;
    }
    let list = packages.join(" ");
    Some(LayerOp::Run {
        command: format!(
            "apt-get update && apt-get install -y \
             -o Dpkg::Options::=--force-confdef -o Dpkg::Options::=--force-confold \
             {list} && rm -rf /var/lib/apt/lists/*"
        ),
    })
}

/// A successfully built image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuiltImage {
    pub name: String,
    pub tag: String,
    pub digest: String,
}

/// Reject empty or missing build contexts before any external tool runs.
pub fn verify_build_context(context: &Path) -> Result<()> {
    if !context.is_dir() {
        bail!("build context {} is missing", context.display());
    }
    let mut entries = fs::read_dir(context)
        .with_context(|| format!("failed to read build context {}", context.display()))?;
    if entries.next().is_none() {
        bail!("build context {} is empty", context.display());
    }
    Ok(())
}

/// Execute the container engine build for `spec` against `context`.
///
/// The containerfile is written to a scratch directory and passed with
/// `-f`, so the context directory itself is never modified.
pub fn build_image(
    spec: &ImageSpec,
    context: &Path,
    engine: &str,
    runner: &mut dyn CommandRunner,
) -> Result<BuiltImage> {
    verify_build_context(context)?;

    let digest = spec.digest();
    let tag = format!("{}:{}", spec.name, &digest[..12]);

    let scratch = tempfile::tempdir().context("failed to create containerfile scratch dir")?;
    let containerfile = scratch.path().join("Containerfile");
    fs::write(&containerfile, spec.render_containerfile())
        .context("failed to write containerfile")?;

    let containerfile = containerfile.display().to_string();
    let context_arg = context.display().to_string();
    let result = runner.run(
        engine,
        &["build", "-t", &tag, "-f", &containerfile, &context_arg],
        None,
    )?;

    if !result.success {
        bail!(
            "image build for `{}` failed with exit code {:?}: {}",
            spec.name,
            result.exit_code,
            result.stderr.trim()
        );
    }

    Ok(BuiltImage {
        name: spec.name.clone(),
        tag,
        digest,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::ScriptedRunner;

    fn compile_spec() -> ImageSpec {
        ImageSpec {
            name: "apwm".to_string(),
            strategy: BuildStrategy::CompileThenPackage {
                builder_image: "rust:1.79-bookworm".to_string(),
                runtime_image: "debian:12-slim".to_string(),
                binary: "apwm".to_string(),
                features: "cli".to_string(),
            },
            layout: WorkerLayout::default(),
            packages: vec!["git".to_string(), "mercurial".to_string()],
        }
    }

    fn prebuilt_spec() -> ImageSpec {
        ImageSpec {
            name: "apwm-prebuilt".to_string(),
            strategy: BuildStrategy::CopyPrebuilt {
                runtime_image: "debian:12-slim".to_string(),
                files: vec![
                    CopySpec {
                        src: "apwm".to_string(),
                        dst: "/home/worker/apwm".to_string(),
                    },
                    CopySpec {
                        src: "hgrc".to_string(),
                        dst: "/home/worker/.hgrc".to_string(),
                    },
                ],
            },
            layout: WorkerLayout::default(),
            packages: vec!["mercurial".to_string()],
        }
    }

    #[test]
    fn compile_strategy_renders_two_stages() {
        let rendered = compile_spec().render_containerfile();
        assert!(rendered.contains("FROM rust:1.79-bookworm AS builder"));
        assert!(rendered.contains("RUN cargo build --bin apwm --features cli --release"));
        assert!(rendered.contains("FROM debian:12-slim\n"));
        assert!(
            rendered.contains(
                "COPY --from=builder --chown=worker:worker /build/target/release/apwm /home/worker/apwm"
            )
        );
        // The toolchain stays in the builder stage.
        assert_eq!(rendered.matches("FROM ").count(), 2);
    }

    #[test]
    fn prebuilt_strategy_has_single_stage_and_no_compile() {
        let rendered = prebuilt_spec().render_containerfile();
        assert_eq!(rendered.matches("FROM ").count(), 1);
        assert!(!rendered.contains("cargo build"));
        assert!(rendered.contains("COPY --chown=worker:worker hgrc /home/worker/.hgrc"));
    }

    #[test]
    fn both_strategies_share_the_worker_layout() {
        for spec in [compile_spec(), prebuilt_spec()] {
            let rendered = spec.render_containerfile();
            assert!(rendered.contains("useradd --create-home --home-dir /home/worker worker"));
            assert!(rendered.contains("/home/worker/artifacts"));
            assert!(rendered.contains("VOLUME /home/worker/checkouts"));
            assert!(rendered.contains("VOLUME /home/worker/.cache"));
            assert!(rendered.contains("ENV HOME=/home/worker"));
            assert!(rendered.trim_end().ends_with("USER worker"));
        }
    }

    #[test]
    fn package_installs_never_prompt() {
        let rendered = compile_spec().render_containerfile();
        assert!(rendered.contains("apt-get install -y"));
        assert!(rendered.contains("--force-confdef"));

        let bare = ImageSpec {
            packages: vec![],
            ..compile_spec()
        };
        assert!(!bare.render_containerfile().contains("apt-get"));
    }

    #[test]
    fn digest_is_idempotent_and_spec_sensitive() {
        let spec = compile_spec();
        assert_eq!(spec.digest(), compile_spec().digest());

        let mut other = compile_spec();
        other.packages.push("openssh-client".to_string());
        assert_ne!(spec.digest(), other.digest());
    }

    #[test]
    fn build_invokes_engine_with_tag_and_context() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("Cargo.toml"), "[package]").expect("seed context");

        let mut runner = ScriptedRunner::succeeding();
        let built =
            build_image(&compile_spec(), dir.path(), "docker", &mut runner).expect("build");

        assert_eq!(built.tag, format!("apwm:{}", &built.digest[..12]));
        let (program, args) = &runner.calls[0];
        assert_eq!(program, "docker");
        assert_eq!(args[0], "build");
        assert!(args.contains(&built.tag));
    }

    #[test]
    fn failed_layer_aborts_the_build() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("Cargo.toml"), "[package]").expect("seed context");

        let mut runner = ScriptedRunner::failing("layer 4 exploded");
        let err = build_image(&compile_spec(), dir.path(), "docker", &mut runner).unwrap_err();
        assert!(err.to_string().contains("layer 4 exploded"));
    }

    #[test]
    fn empty_context_fails_before_the_engine_runs() {
        let dir = tempfile::tempdir().expect("tempdir");

        let mut runner = ScriptedRunner::succeeding();
        let err = build_image(&compile_spec(), dir.path(), "docker", &mut runner).unwrap_err();
        assert!(err.to_string().contains("is empty"));
        assert!(runner.calls.is_empty());

        let err =
            build_image(&compile_spec(), &dir.path().join("missing"), "docker", &mut runner)
                .unwrap_err();
        assert!(err.to_string().contains("is missing"));
        assert!(runner.calls.is_empty());
    }
}
