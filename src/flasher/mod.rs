pub mod fastboot;
pub mod version;

use crate::core::{HarnessError, Result};
use fastboot::Fastboot;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::info;
use version::{is_downgrade, needs_update};

/// Image bundle metadata, parsed from the bundle's android-info.txt plus the
/// files actually present in the directory.
#[derive(Debug, Clone, Serialize)]
pub struct FlashImage {
    pub board: String,
    pub bootloader_version: Option<String>,
    pub baseband_version: Option<String>,
    pub bootloader_image: Option<PathBuf>,
    pub radio_image: Option<PathBuf>,
    pub update_package: Option<PathBuf>,
    pub dir: PathBuf,
}

impl FlashImage {
    pub fn load(dir: &Path) -> Result<Self> {
        let info_path = dir.join("android-info.txt");
        let text = std::fs::read_to_string(&info_path).map_err(|_| {
            HarnessError::Flash(format!("missing android-info.txt in {}", dir.display()))
        })?;
        let mut board = None;
        let mut bootloader_version = None;
        let mut baseband_version = None;
        for line in text.lines() {
            let line = line.trim();
            if let Some(rest) = line.strip_prefix("require board=") {
                board = Some(rest.trim().to_string());
            } else if let Some(rest) = line.strip_prefix("require version-bootloader=") {
                bootloader_version = Some(rest.trim().to_string());
            } else if let Some(rest) = line.strip_prefix("require version-baseband=") {
                baseband_version = Some(rest.trim().to_string());
            }
        }
        let board = board.ok_or_else(|| {
            HarnessError::Flash("android-info.txt has no 'require board=' line".to_string())
        })?;
        Ok(Self {
            board,
            bootloader_version,
            baseband_version,
            bootloader_image: existing(dir, "bootloader.img"),
            radio_image: existing(dir, "radio.img"),
            update_package: find_update_package(dir),
            dir: dir.to_path_buf(),
        })
    }
}

fn existing(dir: &Path, name: &str) -> Option<PathBuf> {
    let path = dir.join(name);
    path.exists().then_some(path)
}

fn find_update_package(dir: &Path) -> Option<PathBuf> {
    let exact = dir.join("update.zip");
    if exact.exists() {
        return Some(exact);
    }
    let entries = std::fs::read_dir(dir).ok()?;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with("image-") && name.ends_with(".zip") {
            return Some(entry.path());
        }
    }
    None
}

/// Per-hardware-family flashing shape, selected by fastboot's product name.
#[derive(Debug, Clone, Copy)]
pub struct FlashProfile {
    pub board: &'static str,
    pub has_radio: bool,
    pub bootloader_partition: &'static str,
    pub radio_partition: &'static str,
}

const PROFILES: &[FlashProfile] = &[
    // wearables: no radio partition
    FlashProfile { board: "dory", has_radio: false, bootloader_partition: "bootloader", radio_partition: "radio" },
    FlashProfile { board: "sturgeon", has_radio: false, bootloader_partition: "bootloader", radio_partition: "radio" },
    FlashProfile { board: "swordfish", has_radio: false, bootloader_partition: "bootloader", radio_partition: "radio" },
    FlashProfile { board: "angelfish", has_radio: false, bootloader_partition: "bootloader", radio_partition: "radio" },
    // phones used as companions
    FlashProfile { board: "angler", has_radio: true, bootloader_partition: "bootloader", radio_partition: "radio" },
    FlashProfile { board: "bullhead", has_radio: true, bootloader_partition: "bootloader", radio_partition: "radio" },
];

pub fn profile_for(board: &str) -> Result<&'static FlashProfile> {
    PROFILES
        .iter()
        .find(|p| p.board == board)
        .ok_or_else(|| HarnessError::Flash(format!("no flasher for product '{board}'")))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FlashOptions {
    pub allow_downgrade: bool,
    /// Reboot into Android afterwards when the bundle has no update package
    /// (fastboot update reboots on its own).
    pub reboot_after: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlashOutcome {
    pub flashed_bootloader: bool,
    pub flashed_radio: bool,
    pub updated_system: bool,
}

pub struct DeviceFlasher<'a> {
    fastboot: &'a dyn Fastboot,
}

impl<'a> DeviceFlasher<'a> {
    pub fn new(fastboot: &'a dyn Fastboot) -> Self {
        Self { fastboot }
    }

    /// Bring the device to the image's firmware versions: bootloader, then
    /// radio (on radio hardware), then the system package. Steps already at
    /// the image version are skipped, and downgrades abort unless explicitly
    /// allowed. Nothing is flashed before the product check passes.
    pub async fn flash(
        &self,
        serial: &str,
        image: &FlashImage,
        opts: FlashOptions,
    ) -> Result<FlashOutcome> {
        let product = self.fastboot.getvar(serial, "product").await?;
        if product != image.board {
            return Err(HarnessError::Flash(format!(
                "image is for '{}' but device reports '{product}'",
                image.board
            )));
        }
        let profile = profile_for(&product)?;
        let mut outcome = FlashOutcome::default();

        if let (Some(want), Some(img)) = (&image.bootloader_version, &image.bootloader_image) {
            let have = self.fastboot.getvar(serial, "version-bootloader").await?;
            let downgrade = is_downgrade(&have, want);
            if downgrade && !opts.allow_downgrade {
                return Err(HarnessError::Flash(format!(
                    "device bootloader {have} is newer than image {want}; pass --allow-downgrade to force"
                )));
            }
            if downgrade || needs_update(&have, want) {
                info!(from = %have, to = %want, "flashing bootloader");
                self.fastboot
                    .flash(serial, profile.bootloader_partition, img)
                    .await?;
                self.fastboot.reboot_bootloader(serial).await?;
                outcome.flashed_bootloader = true;
            } else {
                info!(version = %have, "bootloader already at image version");
            }
        }

        if profile.has_radio {
            if let (Some(want), Some(img)) = (&image.baseband_version, &image.radio_image) {
                let have = self.fastboot.getvar(serial, "version-baseband").await?;
                let downgrade = is_downgrade(&have, want);
                if downgrade && !opts.allow_downgrade {
                    return Err(HarnessError::Flash(format!(
                        "device baseband {have} is newer than image {want}; pass --allow-downgrade to force"
                    )));
                }
                if downgrade || needs_update(&have, want) {
                    info!(from = %have, to = %want, "flashing radio");
                    self.fastboot
                        .flash(serial, profile.radio_partition, img)
                        .await?;
                    self.fastboot.reboot_bootloader(serial).await?;
                    outcome.flashed_radio = true;
                } else {
                    info!(version = %have, "baseband already at image version");
                }
            }
        }

        if let Some(package) = &image.update_package {
            self.fastboot.update(serial, package).await?;
            outcome.updated_system = true;
        } else if opts.reboot_after {
            self.fastboot.reboot(serial).await?;
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct FakeFastboot {
        vars: HashMap<String, String>,
        log: Mutex<Vec<String>>,
    }

    impl FakeFastboot {
        fn new(vars: &[(&str, &str)]) -> Self {
            Self {
                vars: vars
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                log: Mutex::new(Vec::new()),
            }
        }

        fn commands(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Fastboot for FakeFastboot {
        async fn getvar(&self, _serial: &str, name: &str) -> Result<String> {
            self.log.lock().unwrap().push(format!("getvar {name}"));
            self.vars
                .get(name)
                .cloned()
                .ok_or_else(|| HarnessError::Flash(format!("getvar {name} gave no value")))
        }

        async fn flash(&self, _serial: &str, partition: &str, image: &Path) -> Result<()> {
            let file = image.file_name().unwrap().to_string_lossy().into_owned();
            self.log.lock().unwrap().push(format!("flash {partition} {file}"));
            Ok(())
        }

        async fn reboot_bootloader(&self, _serial: &str) -> Result<()> {
            self.log.lock().unwrap().push("reboot-bootloader".to_string());
            Ok(())
        }

        async fn update(&self, _serial: &str, package: &Path) -> Result<()> {
            let file = package.file_name().unwrap().to_string_lossy().into_owned();
            self.log.lock().unwrap().push(format!("update {file}"));
            Ok(())
        }

        async fn reboot(&self, _serial: &str) -> Result<()> {
            self.log.lock().unwrap().push("reboot".to_string());
            Ok(())
        }
    }

    fn write_bundle(dir: &Path, board: &str, bootloader: Option<&str>, baseband: Option<&str>) {
        let mut info = format!("require board={board}\n");
        if let Some(v) = bootloader {
            info.push_str(&format!("require version-bootloader={v}\n"));
            std::fs::write(dir.join("bootloader.img"), b"bl").unwrap();
        }
        if let Some(v) = baseband {
            info.push_str(&format!("require version-baseband={v}\n"));
            std::fs::write(dir.join("radio.img"), b"radio").unwrap();
        }
        std::fs::write(dir.join("android-info.txt"), info).unwrap();
        std::fs::write(dir.join("image-bundle.zip"), b"zip").unwrap();
    }

    #[tokio::test]
    async fn flashes_older_bootloader_then_updates() {
        let dir = tempfile::tempdir().unwrap();
        write_bundle(dir.path(), "sturgeon", Some("MSM8909W_1.2"), None);
        let image = FlashImage::load(dir.path()).unwrap();
        let fake = FakeFastboot::new(&[
            ("product", "sturgeon"),
            ("version-bootloader", "MSM8909W_1.1"),
        ]);

        let outcome = DeviceFlasher::new(&fake)
            .flash("FA123", &image, FlashOptions::default())
            .await
            .unwrap();

        assert!(outcome.flashed_bootloader);
        assert!(outcome.updated_system);
        assert_eq!(
            fake.commands(),
            vec![
                "getvar product",
                "getvar version-bootloader",
                "flash bootloader bootloader.img",
                "reboot-bootloader",
                "update image-bundle.zip",
            ]
        );
    }

    #[tokio::test]
    async fn skips_bootloader_already_at_version() {
        let dir = tempfile::tempdir().unwrap();
        write_bundle(dir.path(), "sturgeon", Some("MSM8909W_1.2"), None);
        let image = FlashImage::load(dir.path()).unwrap();
        let fake = FakeFastboot::new(&[
            ("product", "sturgeon"),
            ("version-bootloader", "MSM8909W_1.2"),
        ]);

        let outcome = DeviceFlasher::new(&fake)
            .flash("FA123", &image, FlashOptions::default())
            .await
            .unwrap();

        assert!(!outcome.flashed_bootloader);
        assert!(outcome.updated_system);
        assert!(!fake.commands().iter().any(|c| c.starts_with("flash ")));
    }

    #[tokio::test]
    async fn refuses_downgrade_without_flag() {
        let dir = tempfile::tempdir().unwrap();
        write_bundle(dir.path(), "sturgeon", Some("MSM8909W_1.2"), None);
        let image = FlashImage::load(dir.path()).unwrap();
        let fake = FakeFastboot::new(&[
            ("product", "sturgeon"),
            ("version-bootloader", "MSM8909W_2.0"),
        ]);

        let err = DeviceFlasher::new(&fake)
            .flash("FA123", &image, FlashOptions::default())
            .await
            .unwrap_err();

        assert!(err.to_string().contains("newer than image"));
        assert!(!fake.commands().iter().any(|c| c.starts_with("flash ")));
    }

    #[tokio::test]
    async fn allow_downgrade_forces_the_flash() {
        let dir = tempfile::tempdir().unwrap();
        write_bundle(dir.path(), "sturgeon", Some("MSM8909W_1.2"), None);
        let image = FlashImage::load(dir.path()).unwrap();
        let fake = FakeFastboot::new(&[
            ("product", "sturgeon"),
            ("version-bootloader", "MSM8909W_2.0"),
        ]);

        let outcome = DeviceFlasher::new(&fake)
            .flash(
                "FA123",
                &image,
                FlashOptions { allow_downgrade: true, reboot_after: false },
            )
            .await
            .unwrap();

        assert!(outcome.flashed_bootloader);
    }

    #[tokio::test]
    async fn product_mismatch_aborts_before_any_flash() {
        let dir = tempfile::tempdir().unwrap();
        write_bundle(dir.path(), "sturgeon", Some("MSM8909W_1.2"), None);
        let image = FlashImage::load(dir.path()).unwrap();
        let fake = FakeFastboot::new(&[("product", "dory")]);

        let err = DeviceFlasher::new(&fake)
            .flash("FA123", &image, FlashOptions::default())
            .await
            .unwrap_err();

        assert!(err.to_string().contains("device reports 'dory'"));
        assert_eq!(fake.commands(), vec!["getvar product"]);
    }

    #[tokio::test]
    async fn radio_is_flashed_only_on_radio_hardware() {
        let dir = tempfile::tempdir().unwrap();
        write_bundle(dir.path(), "angler", Some("angler-03.58"), Some("angler-02.50"));
        let image = FlashImage::load(dir.path()).unwrap();
        let fake = FakeFastboot::new(&[
            ("product", "angler"),
            ("version-bootloader", "angler-03.54"),
            ("version-baseband", "angler-02.45"),
        ]);

        let outcome = DeviceFlasher::new(&fake)
            .flash("FA123", &image, FlashOptions::default())
            .await
            .unwrap();

        assert!(outcome.flashed_bootloader);
        assert!(outcome.flashed_radio);
        assert!(fake.commands().contains(&"flash radio radio.img".to_string()));
    }

    #[tokio::test]
    async fn wearable_profile_never_touches_radio() {
        let dir = tempfile::tempdir().unwrap();
        // bundle carries a radio even though the board has none
        write_bundle(dir.path(), "sturgeon", Some("MSM8909W_1.2"), Some("W_0.9"));
        let image = FlashImage::load(dir.path()).unwrap();
        let fake = FakeFastboot::new(&[
            ("product", "sturgeon"),
            ("version-bootloader", "MSM8909W_1.1"),
        ]);

        let outcome = DeviceFlasher::new(&fake)
            .flash("FA123", &image, FlashOptions::default())
            .await
            .unwrap();

        assert!(!outcome.flashed_radio);
        assert!(!fake.commands().iter().any(|c| c.contains("radio")));
    }

    #[test]
    fn unknown_product_has_no_profile() {
        assert!(profile_for("minnow-prototype").is_err());
        assert!(profile_for("sturgeon").is_ok());
    }

    #[test]
    fn bundle_parsing_reads_info_and_files() {
        let dir = tempfile::tempdir().unwrap();
        write_bundle(dir.path(), "bullhead", Some("BHZ32c"), Some("M8994F-2.6.42"));
        let image = FlashImage::load(dir.path()).unwrap();
        assert_eq!(image.board, "bullhead");
        assert_eq!(image.bootloader_version.as_deref(), Some("BHZ32c"));
        assert_eq!(image.baseband_version.as_deref(), Some("M8994F-2.6.42"));
        assert!(image.bootloader_image.is_some());
        assert!(image.radio_image.is_some());
        assert!(image.update_package.is_some());
    }

    #[test]
    fn missing_info_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = FlashImage::load(dir.path()).unwrap_err();
        assert!(err.to_string().contains("android-info.txt"));
    }
}
