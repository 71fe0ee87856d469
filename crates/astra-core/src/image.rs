//! Catalog entries for the files served to a device.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

/// How the device consumes an image once delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    /// First-stage loaders, U-Boot, kernel, uEnv.
    Boot,
    /// Part of an eMMC partition stream.
    UpdateEmmc,
    /// SPI flash payload.
    UpdateSpi,
}

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("image file does not exist: {}", .0.display())]
    NotFound(PathBuf),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Immutable descriptor of a servable file. Opening is lazy: the file is
/// only touched when the device actually requests it.
#[derive(Debug, Clone)]
pub struct Image {
    name: String,
    path: PathBuf,
    kind: ImageKind,
}

impl Image {
    pub fn new(path: impl Into<PathBuf>, kind: ImageKind) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self { name, path, kind }
    }

    /// Request-matching key: the file name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> ImageKind {
        self.kind
    }

    /// Open the file, recording its size at open time.
    pub fn open(&self) -> Result<ImageReader, ImageError> {
        if !self.path.exists() {
            return Err(ImageError::NotFound(self.path.clone()));
        }
        let file = File::open(&self.path)?;
        let size = file.metadata()?.len();
        debug!(image = %self.name, size, "Opened image");
        Ok(ImageReader { file, size })
    }
}

/// Streaming reader over an opened image.
pub struct ImageReader {
    file: File,
    size: u64,
}

impl ImageReader {
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Read the next block, up to `buf.len()` bytes. Returns 0 at EOF.
    pub fn read_block(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.file.read(buf)
    }
}
