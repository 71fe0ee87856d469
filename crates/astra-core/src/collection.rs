//! A directory of boot images and the selection rules that pick one for a
//! flash image.

use std::path::Path;

use thiserror::Error;
use tracing::{debug, info};

use crate::boot_image::{BootImage, BootImageError, UbootConsole, UbootVariant};
use crate::flash_image::FlashImage;

#[derive(Error, Debug)]
pub enum CollectionError {
    #[error("boot images directory {} not found", .0.display())]
    NotFound(std::path::PathBuf),
    #[error("boot image {0} not found in collection")]
    UnknownId(String),
    #[error("no boot image found for chip {0}")]
    NoMatch(String),
    #[error("chip name and boot image id missing")]
    Unconstrained,
    #[error(transparent)]
    BootImage(#[from] BootImageError),
}

/// All boot images found under one directory.
pub struct BootImageCollection {
    images: Vec<BootImage>,
}

impl BootImageCollection {
    /// Load every subdirectory carrying a `manifest.toml`. A path that is
    /// itself a boot image directory is accepted too.
    pub fn load(path: &Path) -> Result<Self, CollectionError> {
        if !path.exists() {
            return Err(CollectionError::NotFound(path.to_path_buf()));
        }

        let mut images = Vec::new();
        if path.join("manifest.toml").exists() {
            images.push(BootImage::load(path)?);
        } else {
            for entry in std::fs::read_dir(path).map_err(BootImageError::Io)? {
                let entry = entry.map_err(BootImageError::Io)?;
                if entry.path().is_dir() && entry.path().join("manifest.toml").exists() {
                    debug!(path = %entry.path().display(), "Loading boot image");
                    images.push(BootImage::load(&entry.path())?);
                }
            }
        }

        info!(count = images.len(), "Loaded boot image collection");
        Ok(Self { images })
    }

    pub fn images(&self) -> &[BootImage] {
        &self.images
    }

    pub fn by_id(&self, id: &str) -> Option<&BootImage> {
        self.images.iter().find(|b| b.id == id)
    }

    /// Every (vendor, product) pair in the collection.
    pub fn device_ids(&self) -> Vec<(u16, u16)> {
        self.images
            .iter()
            .map(|b| (b.vendor_id, b.product_id))
            .collect()
    }

    /// Pick the boot image for a flash image: an explicit id wins; otherwise
    /// match chip, secure boot and memory layout (and board when given),
    /// preferring the vendor U-Boot with uEnv support, then any uEnv
    /// support, then a USB console.
    pub fn select(&self, flash: &FlashImage) -> Result<BootImage, CollectionError> {
        if let Some(id) = &flash.boot_image_id {
            return self
                .by_id(id)
                .cloned()
                .ok_or_else(|| CollectionError::UnknownId(id.clone()));
        }

        if flash.chip.is_empty() {
            return Err(CollectionError::Unconstrained);
        }

        let candidates: Vec<&BootImage> = self
            .images
            .iter()
            .filter(|b| {
                b.chip == flash.chip
                    && b.secure_boot == flash.secure_boot
                    && b.memory_layout == flash.memory_layout
                    && (flash.board.is_empty() || b.board == flash.board)
            })
            .collect();

        let mut selected = *candidates
            .first()
            .ok_or_else(|| CollectionError::NoMatch(flash.chip.clone()))?;

        for candidate in candidates.iter().copied() {
            info!(chip = %candidate.chip, board = %candidate.board, "Boot image candidate");
            if candidate.uboot_variant == UbootVariant::Vendor && candidate.uenv_support {
                selected = candidate;
                break;
            } else if candidate.uenv_support {
                selected = candidate;
            } else if !selected.uenv_support && candidate.uboot_console == UbootConsole::Usb {
                selected = candidate;
            }
        }

        Ok(selected.clone())
    }
}
