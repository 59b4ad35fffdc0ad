use crate::core::{HarnessError, Result};
use std::path::{Path, PathBuf};
use std::process::Output;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

#[derive(Debug, Clone)]
pub struct AdbClient {
    adb_path: PathBuf,
    cmd_timeout: Duration,
}

impl AdbClient {
    pub fn new(adb_override: Option<&Path>, cmd_timeout: Duration) -> Result<Self> {
        let adb_path = match adb_override {
            Some(p) if p.exists() => p.to_path_buf(),
            Some(p) => {
                return Err(HarnessError::Config(format!(
                    "adb not found at {}",
                    p.display()
                )))
            }
            None => Self::resolve_adb()?,
        };
        Ok(Self { adb_path, cmd_timeout })
    }

    fn resolve_adb() -> Result<PathBuf> {
        let exe = if cfg!(windows) { "adb.exe" } else { "adb" };
        for var in ["ANDROID_HOME", "ANDROID_SDK_ROOT"] {
            if let Some(root) = std::env::var_os(var) {
                let candidate = Path::new(&root).join("platform-tools").join(exe);
                if candidate.exists() {
                    return Ok(candidate);
                }
            }
        }
        if let Some(paths) = std::env::var_os("PATH") {
            for dir in std::env::split_paths(&paths) {
                let candidate = dir.join(exe);
                if candidate.exists() {
                    return Ok(candidate);
                }
            }
        }
        Err(HarnessError::AdbNotFound)
    }

    pub async fn ensure_present(&self) -> Result<()> {
        let output = timeout(
            Duration::from_secs(10),
            Command::new(&self.adb_path).arg("version").output(),
        )
        .await
        .map_err(|_| HarnessError::Timeout(10))??;
        if output.status.success() {
            Ok(())
        } else {
            Err(HarnessError::CommandFailed("adb version failed".to_string()))
        }
    }

    pub async fn start_server(&self) -> Result<()> {
        timeout(
            Duration::from_secs(10),
            Command::new(&self.adb_path).arg("start-server").output(),
        )
        .await
        .map_err(|_| HarnessError::Timeout(10))??;
        Ok(())
    }

    pub async fn execute(&self, args: &[&str]) -> Result<(String, String)> {
        self.execute_with_timeout(args, self.cmd_timeout).await
    }

    pub async fn execute_with_timeout(
        &self,
        args: &[&str],
        limit: Duration,
    ) -> Result<(String, String)> {
        let output = timeout(limit, Command::new(&self.adb_path).args(args).output())
            .await
            .map_err(|_| HarnessError::Timeout(limit.as_secs()))??;
        let stdout = String::from_utf8(output.stdout)?;
        let stderr = String::from_utf8(output.stderr)?;
        if !output.status.success() {
            return Err(classify_failure(&stderr));
        }
        Ok((stdout, stderr))
    }

    pub async fn try_execute(&self, args: &[&str]) -> Result<(bool, String, String)> {
        self.try_execute_with_timeout(args, self.cmd_timeout).await
    }

    pub async fn try_execute_with_timeout(
        &self,
        args: &[&str],
        limit: Duration,
    ) -> Result<(bool, String, String)> {
        let output = timeout(limit, Command::new(&self.adb_path).args(args).output())
            .await
            .map_err(|_| HarnessError::Timeout(limit.as_secs()))??;
        complete_try(output)
    }

    pub async fn shell(&self, serial: &str, cmd: &[&str]) -> Result<String> {
        self.shell_with_timeout(serial, cmd, self.cmd_timeout).await
    }

    pub async fn shell_with_timeout(
        &self,
        serial: &str,
        cmd: &[&str],
        limit: Duration,
    ) -> Result<String> {
        let mut args = vec!["-s", serial, "shell"];
        args.extend_from_slice(cmd);
        let (stdout, _) = self.execute_with_timeout(&args, limit).await?;
        Ok(stdout)
    }

    pub async fn try_shell(&self, serial: &str, cmd: &[&str]) -> Result<(bool, String, String)> {
        self.try_shell_with_timeout(serial, cmd, self.cmd_timeout).await
    }

    pub async fn try_shell_with_timeout(
        &self,
        serial: &str,
        cmd: &[&str],
        limit: Duration,
    ) -> Result<(bool, String, String)> {
        let mut args = vec!["-s", serial, "shell"];
        args.extend_from_slice(cmd);
        self.try_execute_with_timeout(&args, limit).await
    }

    /// Request adb root, verifying the shell actually runs as uid 0 afterwards.
    pub async fn root(&self, serial: &str) -> Result<()> {
        self.execute(&["-s", serial, "root"]).await?;
        // adbd restarts after root; give it a moment to come back
        let _ = self.wait_for_device(serial, Duration::from_secs(10)).await;
        let uid = self.shell(serial, &["id", "-u"]).await?;
        if uid.trim() != "0" {
            return Err(HarnessError::CommandFailed(
                "adb root declined; userdebug or eng build required".to_string(),
            ));
        }
        Ok(())
    }

    pub async fn wait_for_device(&self, serial: &str, limit: Duration) -> Result<()> {
        let output = timeout(
            limit,
            Command::new(&self.adb_path)
                .args(["-s", serial, "wait-for-device"])
                .output(),
        )
        .await
        .map_err(|_| HarnessError::Timeout(limit.as_secs()))??;
        if output.status.success() {
            Ok(())
        } else {
            Err(classify_failure(&String::from_utf8_lossy(&output.stderr)))
        }
    }

    pub async fn logcat_dump(&self, serial: &str, max_lines: u32) -> Result<String> {
        let lines = max_lines.to_string();
        let (stdout, _) = self
            .execute_with_timeout(
                &["-s", serial, "logcat", "-d", "-t", &lines],
                Duration::from_secs(60),
            )
            .await?;
        Ok(stdout)
    }

    pub async fn logcat_clear(&self, serial: &str) -> Result<()> {
        self.execute(&["-s", serial, "logcat", "-c"]).await?;
        Ok(())
    }
}

fn complete_try(output: Output) -> Result<(bool, String, String)> {
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    if !output.status.success() {
        let err = classify_failure(&stderr);
        if err.is_device_gone() {
            return Err(err);
        }
    }
    Ok((output.status.success(), stdout, stderr))
}

fn classify_failure(stderr: &str) -> HarnessError {
    let lower = stderr.to_lowercase();
    if lower.contains("device offline")
        || lower.contains("device still authorizing")
        || lower.contains("no devices/emulators found")
    {
        HarnessError::DeviceGone(stderr.trim().to_string())
    } else if lower.contains("device") && lower.contains("not found") {
        HarnessError::DeviceNotFound(stderr.trim().to_string())
    } else {
        HarnessError::CommandFailed(stderr.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offline_device_classifies_as_gone() {
        let err = classify_failure("adb: device offline");
        assert!(err.is_device_gone());
    }

    #[test]
    fn missing_device_classifies_as_not_found() {
        let err = classify_failure("adb: device 'XY123' not found");
        assert!(matches!(err, HarnessError::DeviceNotFound(_)));
        assert!(err.is_device_gone());
    }

    #[test]
    fn plain_failure_is_command_failed() {
        let err = classify_failure("error: closed");
        assert!(matches!(err, HarnessError::CommandFailed(_)));
        assert!(!err.is_device_gone());
    }
}
