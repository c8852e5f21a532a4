//! APK signing via the external Android SDK tools.
//!
//! Patched archives carry a recomputed DEX seal but the zip signature blocks
//! are gone, so the package must be re-signed before any device will install
//! it. Signing runs out of process: `apksigner` first, `jarsigner` as the
//! fallback. Both sign with an on-demand debug keystore generated by
//! `keytool`.

use log::{info, warn};
use std::error::Error;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

const KEYSTORE_ALIAS: &str = "androiddebugkey";
const KEYSTORE_PASS: &str = "android";
const SIGN_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug)]
pub enum SignError {
    /// The tool ran but exited non-zero.
    Failed { tool: String, detail: String },
    /// The tool did not finish within the deadline and was killed.
    Timeout { tool: String },
    /// The tool could not be spawned at all.
    Io { tool: String, source: io::Error },
}

impl fmt::Display for SignError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignError::Failed { tool, detail } => write!(f, "{} failed: {}", tool, detail),
            SignError::Timeout { tool } => write!(f, "{} timed out", tool),
            SignError::Io { tool, source } => write!(f, "could not run {}: {}", tool, source),
        }
    }
}

impl Error for SignError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            SignError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Anything that can attach a valid signature to an APK on disk.
pub trait Signer {
    fn sign(&self, apk: &Path) -> Result<(), SignError>;
    fn name(&self) -> &str;
}

/// Runs a command to completion with a hard deadline, killing the child if
/// it overruns. Captures stderr for the failure message.
fn run_with_timeout(tool: &str, cmd: &mut Command, deadline: Duration) -> Result<(), SignError> {
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| SignError::Io { tool: tool.to_string(), source })?;

    let started = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                if status.success() {
                    return Ok(());
                }
                let mut detail = String::new();
                if let Some(mut err) = child.stderr.take() {
                    use std::io::Read;
                    let _ = err.read_to_string(&mut detail);
                }
                let detail = detail.lines().last().unwrap_or("non-zero exit").to_string();
                return Err(SignError::Failed { tool: tool.to_string(), detail });
            }
            Ok(None) => {
                if started.elapsed() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(SignError::Timeout { tool: tool.to_string() });
                }
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(source) => {
                return Err(SignError::Io { tool: tool.to_string(), source });
            }
        }
    }
}

/// Creates a throwaway debug keystore next to the APK if one is not already
/// there, mirroring the keystore the Android build tools generate.
fn ensure_debug_keystore(dir: &Path) -> Result<PathBuf, SignError> {
    let keystore = dir.join("debug.keystore");
    if keystore.exists() {
        return Ok(keystore);
    }
    info!("generating debug keystore at {}", keystore.display());
    let mut cmd = Command::new("keytool");
    cmd.arg("-genkey")
        .arg("-v")
        .arg("-keystore")
        .arg(&keystore)
        .arg("-alias")
        .arg(KEYSTORE_ALIAS)
        .arg("-keyalg")
        .arg("RSA")
        .arg("-keysize")
        .arg("2048")
        .arg("-validity")
        .arg("10000")
        .arg("-storepass")
        .arg(KEYSTORE_PASS)
        .arg("-keypass")
        .arg(KEYSTORE_PASS)
        .arg("-dname")
        .arg("CN=Android Debug,O=Android,C=US");
    run_with_timeout("keytool", &mut cmd, SIGN_TIMEOUT)?;
    Ok(keystore)
}

/// Signs with `apksigner` (v1+v2 schemes, v4 disabled so no .idsig file is
/// emitted next to the output).
pub struct ApkSignerTool;

impl Signer for ApkSignerTool {
    fn sign(&self, apk: &Path) -> Result<(), SignError> {
        let dir = apk.parent().unwrap_or_else(|| Path::new("."));
        let keystore = ensure_debug_keystore(dir)?;
        let mut cmd = Command::new("apksigner");
        cmd.arg("sign")
            .arg("--ks")
            .arg(&keystore)
            .arg("--ks-key-alias")
            .arg(KEYSTORE_ALIAS)
            .arg("--ks-pass")
            .arg(format!("pass:{}", KEYSTORE_PASS))
            .arg("--key-pass")
            .arg(format!("pass:{}", KEYSTORE_PASS))
            .arg("--v4-signing-enabled")
            .arg("false")
            .arg(apk);
        run_with_timeout("apksigner", &mut cmd, SIGN_TIMEOUT)
    }

    fn name(&self) -> &str {
        "apksigner"
    }
}

/// Legacy v1-only signing with `jarsigner`. Enough for old devices and for
/// environments where the Android SDK build tools are not on the path.
pub struct JarSignerTool;

impl Signer for JarSignerTool {
    fn sign(&self, apk: &Path) -> Result<(), SignError> {
        let dir = apk.parent().unwrap_or_else(|| Path::new("."));
        let keystore = ensure_debug_keystore(dir)?;
        let mut cmd = Command::new("jarsigner");
        cmd.arg("-verbose")
            .arg("-sigalg")
            .arg("SHA256withRSA")
            .arg("-digestalg")
            .arg("SHA-256")
            .arg("-keystore")
            .arg(&keystore)
            .arg("-storepass")
            .arg(KEYSTORE_PASS)
            .arg(apk)
            .arg(KEYSTORE_ALIAS);
        run_with_timeout("jarsigner", &mut cmd, SIGN_TIMEOUT)
    }

    fn name(&self) -> &str {
        "jarsigner"
    }
}

/// Tries the primary signer and falls back to the secondary exactly once.
pub fn sign_with_fallback(
    primary: &dyn Signer,
    fallback: &dyn Signer,
    apk: &Path,
) -> Result<String, SignError> {
    match primary.sign(apk) {
        Ok(()) => Ok(primary.name().to_string()),
        Err(err) => {
            warn!("{} signing failed ({}), falling back to {}", primary.name(), err, fallback.name());
            fallback.sign(apk)?;
            Ok(fallback.name().to_string())
        }
    }
}

/// Signer that records nothing and always succeeds. Test seam.
pub struct NoopSigner;

impl Signer for NoopSigner {
    fn sign(&self, _apk: &Path) -> Result<(), SignError> {
        Ok(())
    }

    fn name(&self) -> &str {
        "noop"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct FailingSigner {
        calls: Cell<u32>,
    }

    impl Signer for FailingSigner {
        fn sign(&self, _apk: &Path) -> Result<(), SignError> {
            self.calls.set(self.calls.get() + 1);
            Err(SignError::Failed { tool: "failing".into(), detail: "boom".into() })
        }

        fn name(&self) -> &str {
            "failing"
        }
    }

    #[test]
    fn fallback_used_when_primary_fails() {
        let primary = FailingSigner { calls: Cell::new(0) };
        let used = sign_with_fallback(&primary, &NoopSigner, Path::new("/tmp/x.apk")).unwrap();
        assert_eq!(used, "noop");
        assert_eq!(primary.calls.get(), 1);
    }

    #[test]
    fn fallback_failure_surfaces() {
        let primary = FailingSigner { calls: Cell::new(0) };
        let fallback = FailingSigner { calls: Cell::new(0) };
        let err = sign_with_fallback(&primary, &fallback, Path::new("/tmp/x.apk")).unwrap_err();
        assert!(matches!(err, SignError::Failed { .. }));
        assert_eq!(fallback.calls.get(), 1);
    }

    #[test]
    fn timeout_kills_slow_tool() {
        let mut cmd = Command::new("sleep");
        cmd.arg("5");
        let err = run_with_timeout("sleep", &mut cmd, Duration::from_millis(200)).unwrap_err();
        assert!(matches!(err, SignError::Timeout { .. }));
    }
}
