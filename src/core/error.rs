use thiserror::Error;

#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("adb not found; pass --adb or set ANDROID_HOME")]
    AdbNotFound,
    #[error("fastboot not found; pass --fastboot or set ANDROID_HOME")]
    FastbootNotFound,
    #[error("command failed: {0}")]
    CommandFailed(String),
    #[error("timed out after {0}s")]
    Timeout(u64),
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("device went away: {0}")]
    DeviceGone(String),
    #[error("no devices connected")]
    NoDevices,
    #[error("tool missing on device: {0}")]
    ToolMissing(String),
    #[error("attenuator: {0}")]
    Attenuator(String),
    #[error("gate service: {0}")]
    Gate(String),
    #[error("flash aborted: {0}")]
    Flash(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("UTF-8 decode error: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl HarnessError {
    /// True for errors that mean the device itself is unreachable, as opposed
    /// to a single command going wrong. Stress loops abort on these.
    pub fn is_device_gone(&self) -> bool {
        matches!(
            self,
            HarnessError::DeviceGone(_) | HarnessError::DeviceNotFound(_) | HarnessError::NoDevices
        )
    }
}

pub type Result<T> = std::result::Result<T, HarnessError>;
