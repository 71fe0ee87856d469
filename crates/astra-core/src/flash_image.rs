//! Flash update payloads: an eMMC partition stream or an SPI image, plus
//! the U-Boot command that writes them.

use std::fmt;
use std::io::BufRead;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::boot_image::{MemoryLayout, SecureBootVersion};
use crate::image::{Image, ImageKind};

// Sleep before resetting to let console messages reach the host.
const RESET_COMMAND: &str = "; sleep 1; reset";

const EMMC_IMAGE_LIST: &str = "emmc_image_list";
const EMMC_PART_LIST: &str = "emmc_part_list";

#[derive(Error, Debug)]
pub enum FlashImageError {
    #[error("flash image not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("unsupported flash image type: {0}")]
    Unsupported(String),
    #[error("no final image could be determined from {EMMC_IMAGE_LIST}")]
    NoFinalImage,
    #[error("failed to parse manifest: {0}")]
    Manifest(#[from] toml::de::Error),
    #[error(transparent)]
    BootImage(#[from] crate::boot_image::BootImageError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashKind {
    Emmc,
    Spi,
}

impl fmt::Display for FlashKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlashKind::Emmc => write!(f, "eMMC"),
            FlashKind::Spi => write!(f, "SPI"),
        }
    }
}

/// Options for loading a flash image. Command-line values take precedence
/// over a `manifest.toml` found next to the image.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FlashConfig {
    pub image_type: Option<String>,
    pub chip: Option<String>,
    pub board: Option<String>,
    pub boot_image: Option<String>,
    pub secure_boot: Option<String>,
    pub memory_layout: Option<String>,
    pub reset_when_complete: Option<bool>,
    pub image_file: Option<String>,
    pub read_address: Option<String>,
    pub write_first_copy_address: Option<String>,
    pub write_second_copy_address: Option<String>,
    pub write_length: Option<String>,
    pub erase_first_start_address: Option<String>,
    pub erase_first_end_address: Option<String>,
    pub erase_second_start_address: Option<String>,
    pub erase_second_end_address: Option<String>,
}

impl FlashConfig {
    /// Fill unset fields from another config (manifest under CLI overrides).
    fn or(self, fallback: FlashConfig) -> FlashConfig {
        FlashConfig {
            image_type: self.image_type.or(fallback.image_type),
            chip: self.chip.or(fallback.chip),
            board: self.board.or(fallback.board),
            boot_image: self.boot_image.or(fallback.boot_image),
            secure_boot: self.secure_boot.or(fallback.secure_boot),
            memory_layout: self.memory_layout.or(fallback.memory_layout),
            reset_when_complete: self.reset_when_complete.or(fallback.reset_when_complete),
            image_file: self.image_file.or(fallback.image_file),
            read_address: self.read_address.or(fallback.read_address),
            write_first_copy_address: self
                .write_first_copy_address
                .or(fallback.write_first_copy_address),
            write_second_copy_address: self
                .write_second_copy_address
                .or(fallback.write_second_copy_address),
            write_length: self.write_length.or(fallback.write_length),
            erase_first_start_address: self
                .erase_first_start_address
                .or(fallback.erase_first_start_address),
            erase_first_end_address: self
                .erase_first_end_address
                .or(fallback.erase_first_end_address),
            erase_second_start_address: self
                .erase_second_start_address
                .or(fallback.erase_second_start_address),
            erase_second_end_address: self
                .erase_second_end_address
                .or(fallback.erase_second_end_address),
        }
    }
}

/// A loaded flash update: the images to serve and the command that flashes
/// them.
#[derive(Debug, Clone)]
pub struct FlashImage {
    pub kind: FlashKind,
    pub boot_image_id: Option<String>,
    pub chip: String,
    pub board: String,
    pub secure_boot: SecureBootVersion,
    pub memory_layout: MemoryLayout,
    pub images: Vec<Image>,
    /// Injected over the USB console when the boot image has no uEnv
    /// support, or baked into `uEnv.txt` when it does.
    pub flash_command: String,
    /// Once an image whose name contains this has been sent, the update is
    /// done (after the size-reply exchange for eMMC/SPI payloads).
    pub final_image: String,
    pub reset_when_complete: bool,
}

impl FlashImage {
    /// Load a flash image from `path`, merging `config` over any
    /// `manifest.toml` found beside it.
    pub fn load(path: &Path, config: FlashConfig) -> Result<Self, FlashImageError> {
        let mut path = path.to_path_buf();
        if !path.exists() {
            // The Yocto build system names its output directory SYNAIMG.
            if path == Path::new("eMMCimg") {
                path = PathBuf::from("SYNAIMG");
            }
            if !path.exists() {
                return Err(FlashImageError::NotFound(path));
            }
        }

        let manifest_path = if path.is_dir() {
            path.join("manifest.toml")
        } else {
            path.with_extension("toml")
        };
        let config = if manifest_path.exists() {
            let manifest: FlashConfig =
                toml::from_str(&std::fs::read_to_string(&manifest_path)?)?;
            config.or(manifest)
        } else {
            config
        };

        let kind = match config.image_type.as_deref() {
            Some("emmc") => FlashKind::Emmc,
            Some("spi") => FlashKind::Spi,
            Some(other) => return Err(FlashImageError::Unsupported(other.to_string())),
            None => {
                if path.is_dir() && path.join(EMMC_PART_LIST).exists() {
                    FlashKind::Emmc
                } else if path.is_file() {
                    FlashKind::Spi
                } else {
                    FlashKind::Emmc
                }
            }
        };

        let secure_boot = match config.secure_boot.as_deref() {
            Some(s) => SecureBootVersion::parse(s)?,
            None => SecureBootVersion::V3,
        };
        let chip = config.chip.clone().unwrap_or_default().to_lowercase();
        let memory_layout = match config.memory_layout.as_deref() {
            Some(s) => MemoryLayout::parse(s)?,
            // sl1680 boards ship with 4GB; everything else defaults to 2GB.
            None if chip == "sl1680" => MemoryLayout::FourGb,
            None => MemoryLayout::TwoGb,
        };

        let mut flash = FlashImage {
            kind,
            boot_image_id: config.boot_image.clone(),
            chip,
            board: config.board.clone().unwrap_or_default().to_lowercase(),
            secure_boot,
            memory_layout,
            images: Vec::new(),
            flash_command: String::new(),
            final_image: String::new(),
            reset_when_complete: config.reset_when_complete.unwrap_or(true),
        };

        match kind {
            FlashKind::Emmc => flash.load_emmc(&path)?,
            FlashKind::Spi => flash.load_spi(&path, &config)?,
        }

        info!(
            kind = %flash.kind,
            chip = %flash.chip,
            final_image = %flash.final_image,
            command = %flash.flash_command,
            "Loaded flash image"
        );

        Ok(flash)
    }

    fn load_emmc(&mut self, path: &Path) -> Result<(), FlashImageError> {
        if !path.is_dir() {
            return Err(FlashImageError::NotFound(path.to_path_buf()));
        }

        let directory_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.flash_command = format!("l2emmc {directory_name}");
        if self.reset_when_complete {
            self.flash_command.push_str(RESET_COMMAND);
        }

        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            if !entry.path().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.contains("emmc") || name.contains("subimg") {
                debug!(file = %name, "Found eMMC image file");
                self.images
                    .push(Image::new(entry.path(), ImageKind::UpdateEmmc));
            } else if name.contains("TAG--") && name.contains("astra") {
                // Yocto builds drop a TAG file whose name carries the chip
                // and image names; it can stand in for a missing config.
                self.detect_chip_from_tag(&name);
            }
        }
        self.images.sort_by(|a, b| a.name().cmp(b.name()));

        let list = self
            .images
            .iter()
            .find(|i| i.name() == EMMC_IMAGE_LIST)
            .map(|i| i.path().to_path_buf());
        match list {
            Some(list_path) => {
                self.final_image = parse_image_list(&list_path)?.ok_or(FlashImageError::NoFinalImage)?;
            }
            None => {
                warn!("No {EMMC_IMAGE_LIST} found in image directory");
                return Err(FlashImageError::NoFinalImage);
            }
        }
        debug!(final_image = %self.final_image, "Parsed eMMC image list");

        Ok(())
    }

    /// Infer chip details from a Yocto TAG file name carrying an
    /// `sl`-prefixed chip name, when the config left them unset.
    fn detect_chip_from_tag(&mut self, file_name: &str) {
        let Some(pos) = file_name.find("sl") else {
            return;
        };
        let Some(candidate) = file_name.get(pos..pos + 6) else {
            return;
        };
        if !candidate.as_bytes()[2..].iter().all(u8::is_ascii_digit) {
            return;
        }

        if !self.chip.is_empty() {
            if self.chip != candidate {
                warn!(
                    tag_chip = %candidate,
                    config_chip = %self.chip,
                    "Image tag chip name does not match the configured chip"
                );
            }
            return;
        }

        match candidate {
            "sl1680" => {
                self.chip = candidate.to_string();
                self.secure_boot = SecureBootVersion::V3;
                self.memory_layout = MemoryLayout::FourGb;
            }
            "sl1640" | "sl1620" => {
                self.chip = candidate.to_string();
                self.secure_boot = SecureBootVersion::V3;
                self.memory_layout = MemoryLayout::TwoGb;
            }
            _ => return,
        }
        info!(chip = %self.chip, "Detected that this image is for chip");
    }

    fn load_spi(&mut self, path: &Path, config: &FlashConfig) -> Result<(), FlashImageError> {
        let read_address = config.read_address.as_deref().unwrap_or("0x10000000");
        let write_first = config
            .write_first_copy_address
            .as_deref()
            .unwrap_or("0xf0000000");
        let write_second = config
            .write_second_copy_address
            .as_deref()
            .unwrap_or("0xf0200000");
        let write_length = config.write_length.as_deref().unwrap_or("0x200000");
        let erase_first_start = config
            .erase_first_start_address
            .as_deref()
            .unwrap_or("0xf0000000");
        let erase_first_end = config
            .erase_first_end_address
            .as_deref()
            .unwrap_or("0xf01fffff");
        let erase_second_start = config
            .erase_second_start_address
            .as_deref()
            .unwrap_or("0xf0200000");
        let erase_second_end = config
            .erase_second_end_address
            .as_deref()
            .unwrap_or("0xf03fffff");

        let image_file;
        if let Some(file) = &config.image_file {
            let full = path.join(file);
            if !full.exists() {
                return Err(FlashImageError::NotFound(full));
            }
            image_file = file.clone();
            self.images.push(Image::new(full, ImageKind::UpdateSpi));
        } else {
            if !path.is_file() {
                return Err(FlashImageError::NotFound(path.to_path_buf()));
            }
            image_file = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            self.images.push(Image::new(path, ImageKind::UpdateSpi));
        }
        self.final_image = image_file.clone();

        // Flash primary and secondary copies of the SPI U-Boot image.
        self.flash_command = format!(
            "usbload {image_file} {read_address}; spinit; erase {erase_first_start} {erase_first_end}; \
cp.b {read_address} {write_first} {write_length}; erase {erase_second_start} {erase_second_end}; \
cp.b {read_address} {write_second} {write_length};{RESET_COMMAND}"
        );
        self.reset_when_complete = true;

        Ok(())
    }
}

/// The last entry of `emmc_image_list` is the final partition image the
/// device will request.
fn parse_image_list(path: &Path) -> Result<Option<String>, FlashImageError> {
    let file = std::fs::File::open(path)?;
    let mut last = None;
    for line in std::io::BufReader::new(file).lines() {
        let line = line?;
        let name = line.split(',').next().unwrap_or("").trim().to_string();
        if !name.is_empty() {
            last = Some(name);
        }
    }
    Ok(last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot_image::tests::scratch_dir;

    fn write_emmc_dir(list: &str) -> PathBuf {
        let dir = scratch_dir("astra-flashimage-test");
        std::fs::write(dir.join(EMMC_PART_LIST), "boot\nrootfs\n").unwrap();
        std::fs::write(dir.join(EMMC_IMAGE_LIST), list).unwrap();
        std::fs::write(dir.join("boot.subimg"), b"boot").unwrap();
        std::fs::write(dir.join("rootfs.subimg"), b"rootfs").unwrap();
        std::fs::write(dir.join("unrelated.txt"), b"skip me").unwrap();
        dir
    }

    #[test]
    fn emmc_directory_load() {
        let dir = write_emmc_dir("boot.subimg,0x1000\nrootfs.subimg,0x2000\n");
        let flash = FlashImage::load(&dir, FlashConfig::default()).unwrap();
        assert_eq!(flash.kind, FlashKind::Emmc);
        assert_eq!(flash.final_image, "rootfs.subimg");
        assert!(flash.reset_when_complete);

        let dir_name = dir.file_name().unwrap().to_string_lossy().into_owned();
        assert_eq!(
            flash.flash_command,
            format!("l2emmc {dir_name}; sleep 1; reset")
        );

        let names: Vec<_> = flash.images.iter().map(|i| i.name().to_string()).collect();
        assert!(names.contains(&"boot.subimg".to_string()));
        assert!(names.contains(&"rootfs.subimg".to_string()));
        assert!(names.contains(&EMMC_IMAGE_LIST.to_string()));
        assert!(!names.contains(&"unrelated.txt".to_string()));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn emmc_without_reset_skips_reset_command() {
        let dir = write_emmc_dir("boot.subimg\n");
        let config = FlashConfig {
            reset_when_complete: Some(false),
            ..Default::default()
        };
        let flash = FlashImage::load(&dir, config).unwrap();
        assert!(!flash.flash_command.contains("reset"));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn spi_file_load_builds_command() {
        let dir = scratch_dir("astra-flashimage-test");
        let image = dir.join("u-boot.spi.bin");
        std::fs::write(&image, b"spi image").unwrap();

        let flash = FlashImage::load(&image, FlashConfig::default()).unwrap();
        assert_eq!(flash.kind, FlashKind::Spi);
        assert_eq!(flash.final_image, "u-boot.spi.bin");
        assert_eq!(
            flash.flash_command,
            "usbload u-boot.spi.bin 0x10000000; spinit; erase 0xf0000000 0xf01fffff; \
cp.b 0x10000000 0xf0000000 0x200000; erase 0xf0200000 0xf03fffff; \
cp.b 0x10000000 0xf0200000 0x200000;; sleep 1; reset"
        );
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn tag_file_detects_chip() {
        let dir = write_emmc_dir("boot.subimg,0x0\n");
        std::fs::write(dir.join("TAG--astra-media-sl1680-rdk"), b"").unwrap();

        let flash = FlashImage::load(&dir, FlashConfig::default()).unwrap();
        assert_eq!(flash.chip, "sl1680");
        assert_eq!(flash.secure_boot, SecureBootVersion::V3);
        assert_eq!(flash.memory_layout, MemoryLayout::FourGb);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn tag_file_does_not_override_configured_chip() {
        let dir = write_emmc_dir("boot.subimg,0x0\n");
        std::fs::write(dir.join("TAG--astra-media-sl1640-rdk"), b"").unwrap();

        let config = FlashConfig {
            chip: Some("sl1680".to_string()),
            ..Default::default()
        };
        let flash = FlashImage::load(&dir, config).unwrap();
        assert_eq!(flash.chip, "sl1680");
        assert_eq!(flash.memory_layout, MemoryLayout::FourGb);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn nand_is_rejected() {
        let dir = scratch_dir("astra-flashimage-test");
        let config = FlashConfig {
            image_type: Some("nand".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            FlashImage::load(&dir, config),
            Err(FlashImageError::Unsupported(_))
        ));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn image_list_last_entry_wins() {
        let dir = scratch_dir("astra-flashimage-test");
        let list = dir.join(EMMC_IMAGE_LIST);
        std::fs::write(&list, "first.subimg,0x0\nsecond.subimg,0x1\n\n").unwrap();
        assert_eq!(
            parse_image_list(&list).unwrap().as_deref(),
            Some("second.subimg")
        );
        std::fs::remove_dir_all(&dir).ok();
    }
}
