use crate::core::{HarnessError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

/// The fastboot operations the flash sequence needs. Real hardware goes
/// through [`FastbootTool`]; tests drive the sequence with a scripted fake.
#[async_trait]
pub trait Fastboot: Send + Sync {
    async fn getvar(&self, serial: &str, name: &str) -> Result<String>;
    async fn flash(&self, serial: &str, partition: &str, image: &Path) -> Result<()>;
    async fn reboot_bootloader(&self, serial: &str) -> Result<()>;
    async fn update(&self, serial: &str, package: &Path) -> Result<()>;
    async fn reboot(&self, serial: &str) -> Result<()>;
}

pub struct FastbootTool {
    path: PathBuf,
}

impl FastbootTool {
    pub fn new(override_path: Option<&Path>) -> Result<Self> {
        let path = match override_path {
            Some(p) if p.exists() => p.to_path_buf(),
            Some(p) => {
                return Err(HarnessError::Config(format!(
                    "fastboot not found at {}",
                    p.display()
                )))
            }
            None => Self::resolve_fastboot()?,
        };
        Ok(Self { path })
    }

    fn resolve_fastboot() -> Result<PathBuf> {
        let exe = if cfg!(windows) { "fastboot.exe" } else { "fastboot" };
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
        Err(HarnessError::FastbootNotFound)
    }

    async fn run(&self, args: &[&str], limit: Duration) -> Result<(String, String)> {
        let output = timeout(limit, Command::new(&self.path).args(args).output())
            .await
            .map_err(|_| HarnessError::Timeout(limit.as_secs()))??;
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if !output.status.success() {
            return Err(HarnessError::Flash(stderr.trim().to_string()));
        }
        Ok((stdout, stderr))
    }
}

#[async_trait]
impl Fastboot for FastbootTool {
    async fn getvar(&self, serial: &str, name: &str) -> Result<String> {
        // fastboot prints getvar results on stderr
        let (stdout, stderr) = self
            .run(&["-s", serial, "getvar", name], Duration::from_secs(30))
            .await?;
        parse_getvar(&format!("{stderr}\n{stdout}"), name)
            .ok_or_else(|| HarnessError::Flash(format!("getvar {name} gave no value")))
    }

    async fn flash(&self, serial: &str, partition: &str, image: &Path) -> Result<()> {
        let image_arg = image.to_string_lossy().into_owned();
        self.run(
            &["-s", serial, "flash", partition, &image_arg],
            Duration::from_secs(600),
        )
        .await?;
        Ok(())
    }

    async fn reboot_bootloader(&self, serial: &str) -> Result<()> {
        self.run(&["-s", serial, "reboot-bootloader"], Duration::from_secs(60))
            .await?;
        Ok(())
    }

    async fn update(&self, serial: &str, package: &Path) -> Result<()> {
        let package_arg = package.to_string_lossy().into_owned();
        self.run(&["-s", serial, "update", &package_arg], Duration::from_secs(900))
            .await?;
        Ok(())
    }

    async fn reboot(&self, serial: &str) -> Result<()> {
        self.run(&["-s", serial, "reboot"], Duration::from_secs(60))
            .await?;
        Ok(())
    }
}

pub(crate) fn parse_getvar(out: &str, name: &str) -> Option<String> {
    let prefix = format!("{name}:");
    for line in out.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix(&prefix) {
            let value = rest.trim();
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_the_named_variable() {
        let out = "version-bootloader: MSM8909W_1.2\nfinished. total time: 0.001s\n";
        assert_eq!(
            parse_getvar(out, "version-bootloader").as_deref(),
            Some("MSM8909W_1.2")
        );
    }

    #[test]
    fn ignores_other_variables_and_blanks() {
        let out = "product: sturgeon\nversion-baseband:\nfinished. total time: 0.001s\n";
        assert_eq!(parse_getvar(out, "product").as_deref(), Some("sturgeon"));
        assert!(parse_getvar(out, "version-baseband").is_none());
        assert!(parse_getvar(out, "serialno").is_none());
    }
}
