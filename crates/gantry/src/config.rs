//! Configuration file support (`.gantry.toml`).
//!
//! The file is optional; when present it is merged *under* CLI flags:
//! defaults < file < flags. Unknown keys are rejected so a typo fails the
//! run instead of silently using a default.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::image::ImageSpec;
use crate::types::PipelineOptions;

/// Configuration file name, looked up in the project root.
pub const CONFIG_FILE: &str = ".gantry.toml";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigFile {
    pub pipeline: PipelineSection,
    pub artifacts: ArtifactsSection,
    pub deploy: DeploySection,
    /// Image specs keyed by image name.
    pub image: BTreeMap<String, ImageSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineSection {
    /// Ref that gates the Deploy job.
    pub release_ref: Option<String>,
    /// Binary (and artifact) name.
    pub binary: Option<String>,
    /// Feature flag passed to the build.
    pub features: Option<String>,
    /// Source tree the Build job compiles.
    pub context: Option<PathBuf>,
    /// Best-effort build cache directory.
    pub cache_dir: Option<PathBuf>,
    /// Wall-clock limit per external command, in humantime form ("90s").
    #[serde(
        deserialize_with = "deserialize_opt_duration",
        serialize_with = "serialize_opt_duration"
    )]
    pub step_timeout: Option<Duration>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct ArtifactsSection {
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct DeploySection {
    /// Container engine program override.
    pub engine: Option<String>,
    /// Secure-copy program override.
    pub transfer: Option<String>,
}

impl ConfigFile {
    /// Merge file values into `opts`. Only set fields override; the caller
    /// applies CLI flags afterwards.
    pub fn apply(&self, opts: &mut PipelineOptions) {
        let PipelineSection {
            release_ref,
            binary,
            features,
            context,
            cache_dir,
            step_timeout,
        } = &self.pipeline;

        if let Some(release_ref) = release_ref {
            opts.release_ref = release_ref.clone();
        }
        if let Some(binary) = binary {
            opts.binary = binary.clone();
        }
        if let Some(features) = features {
            opts.features = features.clone();
        }
        if let Some(context) = context {
            opts.context_dir = context.clone();
        }
        if let Some(cache_dir) = cache_dir {
            opts.cache_dir = Some(cache_dir.clone());
        }
        if let Some(timeout) = step_timeout {
            opts.step_timeout = Some(*timeout);
        }
        if let Some(dir) = &self.artifacts.dir {
            opts.artifacts_dir = Some(dir.clone());
        }
        if let Some(engine) = &self.deploy.engine {
            opts.engine = engine.clone();
        }
        if let Some(transfer) = &self.deploy.transfer {
            opts.transfer = transfer.clone();
        }
    }

    pub fn image_spec(&self, name: &str) -> Option<&ImageSpec> {
        self.image.get(name)
    }
}

/// Load `.gantry.toml` from `root`, if present. Image spec names are
/// filled from their table keys.
pub fn load_config(root: &Path) -> Result<Option<ConfigFile>> {
    let path = root.join(CONFIG_FILE);
    if !path.exists() {
        return Ok(None);
    }

    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let mut config: ConfigFile = toml::from_str(&content)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;

    for (name, spec) in config.image.iter_mut() {
        spec.name = name.clone();
    }

    Ok(Some(config))
}

fn deserialize_opt_duration<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
    let raw: Option<String> = Option::deserialize(d)?;
    raw.map(|s| humantime::parse_duration(&s).map_err(serde::de::Error::custom))
        .transpose()
}

fn serialize_opt_duration<S: Serializer>(
    value: &Option<Duration>,
    s: S,
) -> Result<S::Ok, S::Error> {
    match value {
        Some(d) => s.serialize_some(&humantime::format_duration(*d).to_string()),
        None => s.serialize_none(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::BuildStrategy;

    const SAMPLE: &str = r#"
[pipeline]
release_ref = "refs/heads/main"
binary = "apwm"
features = "cli"
step_timeout = "90s"

[artifacts]
dir = "/var/lib/gantry/artifacts"

[deploy]
engine = "podman"

[image.apwm]
strategy = "compile_then_package"
builder_image = "rust:1.79-bookworm"
runtime_image = "debian:12-slim"
binary = "apwm"
features = "cli"
packages = ["git", "mercurial"]

[image.apwm-prebuilt]
strategy = "copy_prebuilt"
runtime_image = "debian:12-slim"
files = [{ src = "apwm", dst = "/home/worker/apwm" }]
"#;

    fn load_sample(content: &str) -> Result<Option<ConfigFile>> {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join(CONFIG_FILE), content).expect("write config");
        load_config(dir.path())
    }

    #[test]
    fn sample_config_parses_and_applies() {
        let config = load_sample(SAMPLE).expect("load").expect("some");

        let mut opts = PipelineOptions::default();
        config.apply(&mut opts);
        assert_eq!(opts.release_ref, "refs/heads/main");
        assert_eq!(opts.engine, "podman");
        assert_eq!(opts.transfer, "scp");
        assert_eq!(opts.step_timeout, Some(Duration::from_secs(90)));
        assert_eq!(
            opts.artifacts_root(),
            PathBuf::from("/var/lib/gantry/artifacts")
        );
    }

    #[test]
    fn image_names_come_from_table_keys() {
        let config = load_sample(SAMPLE).expect("load").expect("some");
        let spec = config.image_spec("apwm").expect("apwm spec");
        assert_eq!(spec.name, "apwm");
        assert!(matches!(spec.strategy, BuildStrategy::CompileThenPackage { .. }));

        let prebuilt = config.image_spec("apwm-prebuilt").expect("prebuilt spec");
        assert!(matches!(prebuilt.strategy, BuildStrategy::CopyPrebuilt { .. }));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = load_sample("[pipeline]\nrelease_branch = \"main\"\n").unwrap_err();
        assert!(err.to_string().contains("failed to parse config file"));
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(load_config(dir.path()).expect("load").is_none());
    }

    #[test]
    fn bad_duration_is_rejected() {
        let err = load_sample("[pipeline]\nstep_timeout = \"ninety\"\n").unwrap_err();
        assert!(err.to_string().contains("failed to parse config file"));
    }
}
