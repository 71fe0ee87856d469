//! Boot images: a directory of first-stage loaders plus a `manifest.toml`
//! describing the board they target.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::image::{Image, ImageKind};

/// Name of the synthesized U-Boot environment file.
pub const UENV_IMAGE: &str = "uEnv.txt";

#[derive(Error, Debug)]
pub enum BootImageError {
    #[error("boot image directory not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("missing manifest.toml in {}", .0.display())]
    MissingManifest(PathBuf),
    #[error("invalid {field} in manifest: {value}")]
    InvalidField { field: &'static str, value: String },
    #[error("failed to parse manifest: {0}")]
    Manifest(#[from] toml::de::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecureBootVersion {
    V2,
    V3,
}

impl fmt::Display for SecureBootVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecureBootVersion::V2 => write!(f, "gen2"),
            SecureBootVersion::V3 => write!(f, "genx"),
        }
    }
}

impl SecureBootVersion {
    pub fn parse(s: &str) -> Result<Self, BootImageError> {
        match s.to_ascii_lowercase().as_str() {
            "gen2" => Ok(SecureBootVersion::V2),
            "gen3" | "genx" => Ok(SecureBootVersion::V3),
            _ => Err(BootImageError::InvalidField {
                field: "secure_boot",
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryLayout {
    OneGb,
    TwoGb,
    ThreeGb,
    FourGb,
}

impl fmt::Display for MemoryLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MemoryLayout::OneGb => "1GB",
            MemoryLayout::TwoGb => "2GB",
            MemoryLayout::ThreeGb => "3GB",
            MemoryLayout::FourGb => "4GB",
        };
        write!(f, "{s}")
    }
}

impl MemoryLayout {
    pub fn parse(s: &str) -> Result<Self, BootImageError> {
        match s.to_ascii_lowercase().as_str() {
            "1gb" => Ok(MemoryLayout::OneGb),
            "2gb" => Ok(MemoryLayout::TwoGb),
            "3gb" => Ok(MemoryLayout::ThreeGb),
            "4gb" => Ok(MemoryLayout::FourGb),
            _ => Err(BootImageError::InvalidField {
                field: "memory_layout",
                value: s.to_string(),
            }),
        }
    }
}

/// Which console U-Boot talks on for this image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UbootConsole {
    Uart,
    Usb,
}

impl fmt::Display for UbootConsole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UbootConsole::Uart => write!(f, "UART"),
            UbootConsole::Usb => write!(f, "USB"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UbootVariant {
    /// Upstream U-Boot.
    Stock,
    /// Vendor U-Boot with the extended recovery commands.
    Vendor,
    Unknown,
}

#[derive(Debug, Deserialize)]
struct Manifest {
    id: String,
    chip: String,
    board: String,
    vendor_id: String,
    product_id: String,
    secure_boot: String,
    memory_layout: String,
    console: String,
    uboot: String,
    uenv_support: bool,
}

/// A loaded boot image: board description plus the images served during the
/// boot phase.
#[derive(Debug, Clone)]
pub struct BootImage {
    pub id: String,
    pub chip: String,
    pub board: String,
    pub vendor_id: u16,
    pub product_id: u16,
    pub secure_boot: SecureBootVersion,
    pub memory_layout: MemoryLayout,
    pub uboot_console: UbootConsole,
    pub uboot_variant: UbootVariant,
    pub uenv_support: bool,
    pub linux_boot: bool,
    /// Once an image whose name contains this has been sent, boot is done.
    pub final_boot_image: String,
    pub images: Vec<Image>,
}

impl BootImage {
    /// Load a boot image directory containing `manifest.toml`.
    pub fn load(path: &Path) -> Result<Self, BootImageError> {
        if !path.is_dir() {
            return Err(BootImageError::NotFound(path.to_path_buf()));
        }
        let manifest_path = path.join("manifest.toml");
        if !manifest_path.exists() {
            return Err(BootImageError::MissingManifest(path.to_path_buf()));
        }

        let manifest: Manifest = toml::from_str(&std::fs::read_to_string(&manifest_path)?)?;

        let vendor_id = parse_hex_id("vendor_id", &manifest.vendor_id)?;
        let product_id = parse_hex_id("product_id", &manifest.product_id)?;
        let secure_boot = SecureBootVersion::parse(&manifest.secure_boot)?;
        let memory_layout = MemoryLayout::parse(&manifest.memory_layout)?;
        let uboot_console = match manifest.console.to_ascii_lowercase().as_str() {
            "uart" => UbootConsole::Uart,
            _ => UbootConsole::Usb,
        };
        let uboot_variant = match manifest.uboot.to_ascii_lowercase().as_str() {
            "uboot" => UbootVariant::Stock,
            "suboot" => UbootVariant::Vendor,
            _ => UbootVariant::Unknown,
        };

        let mut images = Vec::new();
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            if entry.path() == manifest_path || !entry.path().is_file() {
                continue;
            }
            debug!(file = %entry.path().display(), "Found boot image file");
            images.push(Image::new(entry.path(), ImageKind::Boot));
        }
        images.sort_by(|a, b| a.name().cmp(b.name()));

        let mut linux_boot = false;
        let final_boot_image;
        if path.join("Image.gz").exists() && path.join("ramdisk.cpio.gz").exists() {
            linux_boot = true;
            final_boot_image = "ramdisk.cpio.gz".to_string();
        } else if path.join("Image").exists() && path.join("rootfs.cpio.gz").exists() {
            linux_boot = true;
            final_boot_image = "rootfs.cpio.gz".to_string();
        } else {
            final_boot_image = match secure_boot {
                SecureBootVersion::V2 => "minildr.img".to_string(),
                SecureBootVersion::V3 => {
                    if manifest.uenv_support {
                        UENV_IMAGE.to_string()
                    } else {
                        "gen3_uboot.bin.usb".to_string()
                    }
                }
            };
        }

        info!(
            id = %manifest.id,
            chip = %manifest.chip,
            board = %manifest.board,
            secure_boot = %secure_boot,
            console = %uboot_console,
            uenv_support = manifest.uenv_support,
            "Loaded boot image"
        );

        Ok(Self {
            id: manifest.id,
            chip: manifest.chip,
            board: manifest.board,
            vendor_id,
            product_id,
            secure_boot,
            memory_layout,
            uboot_console,
            uboot_variant,
            uenv_support: manifest.uenv_support,
            linux_boot,
            final_boot_image,
            images,
        })
    }

    /// Multi-line human description used for the manager Info event.
    pub fn description(&self) -> String {
        format!(
            "Boot Image: {} {} ({})\n    Secure Boot: {}\n    Memory Layout: {}\n    U-Boot Console: {}\n    uEnv.txt Support: {}\n    U-Boot Variant: {}",
            self.chip,
            self.board,
            self.id,
            self.secure_boot,
            self.memory_layout,
            self.uboot_console,
            if self.uenv_support { "enabled" } else { "disabled" },
            match self.uboot_variant {
                UbootVariant::Stock => "U-Boot",
                UbootVariant::Vendor => "Synaptics U-Boot",
                UbootVariant::Unknown => "unknown",
            }
        )
    }
}

fn parse_hex_id(field: &'static str, value: &str) -> Result<u16, BootImageError> {
    let trimmed = value.trim_start_matches("0x").trim_start_matches("0X");
    u16::from_str_radix(trimmed, 16).map_err(|_| BootImageError::InvalidField {
        field,
        value: value.to_string(),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub(crate) const MANIFEST: &str = r#"
id = "3f6ebd6b"
chip = "sl1680"
board = "rdk"
vendor_id = "0x06CB"
product_id = "0x00B1"
secure_boot = "genx"
memory_layout = "4gb"
console = "usb"
uboot = "suboot"
uenv_support = true
"#;

    pub(crate) fn scratch_dir(prefix: &str) -> PathBuf {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        let dir = std::env::temp_dir().join(format!(
            "{prefix}-{}-{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write_boot_dir(manifest: &str, files: &[&str]) -> PathBuf {
        let dir = scratch_dir("astra-bootimage-test");
        std::fs::write(dir.join("manifest.toml"), manifest).unwrap();
        for file in files {
            std::fs::write(dir.join(file), b"data").unwrap();
        }
        dir
    }

    #[test]
    fn loads_manifest_and_images() {
        let dir = write_boot_dir(MANIFEST, &["gen3_miniloader.bin.usb", "gen3_uboot.bin.usb"]);
        let boot = BootImage::load(&dir).unwrap();
        assert_eq!(boot.chip, "sl1680");
        assert_eq!(boot.vendor_id, 0x06CB);
        assert_eq!(boot.product_id, 0x00B1);
        assert_eq!(boot.secure_boot, SecureBootVersion::V3);
        assert_eq!(boot.uboot_console, UbootConsole::Usb);
        assert_eq!(boot.uboot_variant, UbootVariant::Vendor);
        assert!(boot.uenv_support);
        assert_eq!(boot.images.len(), 2);
        // V3 with uEnv support terminates on uEnv.txt delivery.
        assert_eq!(boot.final_boot_image, UENV_IMAGE);
        assert!(!boot.linux_boot);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn v3_without_uenv_ends_on_uboot() {
        let manifest = MANIFEST.replace("uenv_support = true", "uenv_support = false");
        let dir = write_boot_dir(&manifest, &["gen3_uboot.bin.usb"]);
        let boot = BootImage::load(&dir).unwrap();
        assert_eq!(boot.final_boot_image, "gen3_uboot.bin.usb");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn v2_ends_on_miniloader() {
        let manifest = MANIFEST.replace("secure_boot = \"genx\"", "secure_boot = \"gen2\"");
        let dir = write_boot_dir(&manifest, &["minildr.img"]);
        let boot = BootImage::load(&dir).unwrap();
        assert_eq!(boot.secure_boot, SecureBootVersion::V2);
        assert_eq!(boot.final_boot_image, "minildr.img");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn linux_pair_marks_linux_boot() {
        let dir = write_boot_dir(MANIFEST, &["Image.gz", "ramdisk.cpio.gz", "uEnv.txt"]);
        let boot = BootImage::load(&dir).unwrap();
        assert!(boot.linux_boot);
        assert_eq!(boot.final_boot_image, "ramdisk.cpio.gz");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn missing_manifest_is_an_error() {
        let dir = scratch_dir("astra-bootimage-test");
        std::fs::write(dir.join("loader.bin"), b"x").unwrap();
        assert!(matches!(
            BootImage::load(&dir),
            Err(BootImageError::MissingManifest(_))
        ));
        std::fs::remove_dir_all(&dir).ok();
    }
}
