//! Deploy secrets and the credential file scope.
//!
//! Secrets arrive through the environment (the platform secret store's
//! injection point) and live for one Deploy job: read at job start,
//! materialized into a permission-restricted file, removed when the scope
//! drops. Nothing here ever writes secret values — or metadata about
//! them — to logs, events, or error messages.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

use crate::types::RemoteTarget;

pub const DEPLOY_KEY_VAR: &str = "GANTRY_DEPLOY_KEY";
pub const DEPLOY_USER_VAR: &str = "GANTRY_DEPLOY_USER";
pub const DEPLOY_HOST_VAR: &str = "GANTRY_DEPLOY_HOST";
pub const DEPLOY_PATH_VAR: &str = "GANTRY_DEPLOY_PATH";

/// All four deploy secrets. `Debug` is redacted.
#[derive(Clone)]
pub struct DeploySecrets {
    key: String,
    target: RemoteTarget,
}

impl DeploySecrets {
    /// Read the deploy secrets from the environment. Errors name the
    /// missing variable but never echo any value.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            key: require(DEPLOY_KEY_VAR)?,
            target: RemoteTarget {
                user: require(DEPLOY_USER_VAR)?,
                host: require(DEPLOY_HOST_VAR)?,
                path: require(DEPLOY_PATH_VAR)?,
            },
        })
    }

    pub fn target(&self) -> &RemoteTarget {
        &self.target
    }

    pub fn key_bytes(&self) -> &[u8] {
        self.key.as_bytes()
    }

    /// Which secret variables are set, by name only. Used by diagnostics.
    pub fn present_vars() -> Vec<(&'static str, bool)> {
        [DEPLOY_KEY_VAR, DEPLOY_USER_VAR, DEPLOY_HOST_VAR, DEPLOY_PATH_VAR]
            .into_iter()
            .map(|var| (var, std::env::var(var).map(|v| !v.is_empty()).unwrap_or(false)))
            .collect()
    }
}

impl fmt::Debug for DeploySecrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DeploySecrets(<redacted>)")
    }
}

fn require(var: &str) -> Result<String> {
    match std::env::var(var) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => bail!("missing required secret environment variable {var}"),
    }
}

/// Scoped private-key file: created owner-read/write only *before* the key
/// bytes land on disk, removed on drop.
pub struct CredentialFile {
    path: PathBuf,
}

impl CredentialFile {
    /// Write `key` into `dir/deploy_key` with mode 0600. The transfer
    /// client requires the material to end in a newline.
    pub fn materialize(key: &[u8], dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create credential dir {}", dir.display()))?;
        let path = dir.join("deploy_key");

        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options
            .open(&path)
            .context("failed to create credential file")?;
        file.write_all(key).context("failed to write credential file")?;
        if !key.ends_with(b"\n") {
            file.write_all(b"\n").context("failed to write credential file")?;
        }
        file.sync_all().context("failed to flush credential file")?;

        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for CredentialFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

impl fmt::Debug for CredentialFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialFile")
            .field("path", &self.path)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn with_deploy_env<F: FnOnce()>(f: F) {
        temp_env::with_vars(
            [
                (DEPLOY_KEY_VAR, Some("-----BEGIN KEY-----\nabc\n-----END KEY-----")),
                (DEPLOY_USER_VAR, Some("deploy")),
                (DEPLOY_HOST_VAR, Some("worlds.example.net")),
                (DEPLOY_PATH_VAR, Some("/srv/apwm/apwm")),
            ],
            f,
        );
    }

    #[test]
    #[serial]
    fn from_env_reads_all_four_secrets() {
        with_deploy_env(|| {
            let secrets = DeploySecrets::from_env().expect("from_env");
            assert_eq!(secrets.target().user, "deploy");
            assert_eq!(
                secrets.target().scp_destination(),
                "deploy@worlds.example.net:/srv/apwm/apwm"
            );
        });
    }

    #[test]
    #[serial]
    fn missing_variable_is_named_but_never_echoed() {
        temp_env::with_vars(
            [
                (DEPLOY_KEY_VAR, Some("top-secret-key")),
                (DEPLOY_USER_VAR, Some("deploy")),
                (DEPLOY_HOST_VAR, None),
                (DEPLOY_PATH_VAR, Some("/srv/apwm/apwm")),
            ],
            || {
                let err = DeploySecrets::from_env().unwrap_err();
                let msg = err.to_string();
                assert!(msg.contains(DEPLOY_HOST_VAR));
                assert!(!msg.contains("top-secret-key"));
            },
        );
    }

    #[test]
    #[serial]
    fn debug_output_is_redacted() {
        with_deploy_env(|| {
            let secrets = DeploySecrets::from_env().expect("from_env");
            let rendered = format!("{secrets:?}");
            assert!(!rendered.contains("BEGIN KEY"));
            assert!(!rendered.contains("worlds.example.net"));
        });
    }

    #[test]
    fn credential_file_is_owner_only_and_newline_terminated() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cred = CredentialFile::materialize(b"key-material", dir.path()).expect("materialize");

        let content = fs::read(cred.path()).expect("read");
        assert_eq!(content, b"key-material\n");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(cred.path()).expect("metadata").permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn credential_file_is_removed_on_drop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = {
            let cred = CredentialFile::materialize(b"key\n", dir.path()).expect("materialize");
            cred.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn second_materialization_in_same_dir_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let _cred = CredentialFile::materialize(b"key", dir.path()).expect("materialize");
        // create_new refuses to clobber live credential material.
        assert!(CredentialFile::materialize(b"other", dir.path()).is_err());
    }
}
