//! Environment fingerprinting.
//!
//! Captures where a run executed and which external tool versions were
//! present. Probes are best-effort; a missing tool records as `None` and
//! the Build/Deploy steps report their own hard failures.

use gantry_process::run;

use crate::types::EnvironmentFingerprint;

/// Collect the fingerprint for a run, probing the container engine and
/// transfer client by name.
pub fn collect_fingerprint(engine: &str, transfer: &str) -> EnvironmentFingerprint {
    EnvironmentFingerprint {
        gantry_version: env!("CARGO_PKG_VERSION").to_string(),
        hostname: gethostname::gethostname().to_string_lossy().to_string(),
        os: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
        toolchain_version: probe_version("cargo", &["--version"]),
        engine_version: probe_version(engine, &["--version"]),
        transfer_version: probe_transfer_version(transfer),
    }
}

fn probe_version(program: &str, args: &[&str]) -> Option<String> {
    let result = run(program, args).ok()?;
    if !result.success {
        return None;
    }
    result.stdout.lines().next().map(|l| l.trim().to_string())
}

/// scp has no version flag of its own; the ssh client shares its release,
/// so only scp falls back to the `ssh -V` banner (printed on stderr).
fn probe_transfer_version(transfer: &str) -> Option<String> {
    if transfer != "scp" {
        return probe_version(transfer, &["--version"]);
    }
    let result = run("ssh", &["-V"]).ok()?;
    let banner = if result.stderr.trim().is_empty() {
        result.stdout
    } else {
        result.stderr
    };
    banner.lines().next().map(|l| l.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_has_host_identity() {
        let fp = collect_fingerprint("gantry-no-such-engine", "scp");
        assert_eq!(fp.gantry_version, env!("CARGO_PKG_VERSION"));
        assert!(!fp.hostname.is_empty());
        assert!(!fp.os.is_empty());
        assert!(!fp.arch.is_empty());
        // Unknown engine probes as absent rather than failing the run.
        assert!(fp.engine_version.is_none());
    }

    #[test]
    fn transfer_probe_targets_the_configured_program() {
        // A non-scp transfer is probed by its own name; an unknown one
        // records as absent instead of reporting the ssh banner.
        let fp = collect_fingerprint("docker", "gantry-no-such-transfer");
        assert!(fp.transfer_version.is_none());
    }
}
