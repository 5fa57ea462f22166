// src/packages/archive.rs

//! Managed package archive format (`.hpkg`)
//!
//! An uncompressed outer tar holding:
//!
//! - `metadata.json`: the package [`Metadata`]
//! - `payload.tar.{gz,zst,xz}`: the files, relative to the install root
//! - `checksum.sha256`: hex SHA-256 of the payload entry
//! - `hooks/{preinstall,postinstall,preremove,postremove}` (optional)

use crate::error::{Error, Result};
use crate::packages::metadata::Metadata;
use crate::packages::requirement::is_valid_name;
use crate::packages::traits::ArchiveReader;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tar::{Archive, Builder, Header};
use tracing::{debug, info};
use xz2::read::XzDecoder;
use xz2::write::XzEncoder;

pub const METADATA_ENTRY: &str = "metadata.json";
pub const CHECKSUM_ENTRY: &str = "checksum.sha256";
const PAYLOAD_STEM: &str = "payload.tar";
const HOOKS_DIR: &str = "hooks";

/// Hook scripts an archive may carry
pub const HOOK_NAMES: [&str; 4] = ["preinstall", "postinstall", "preremove", "postremove"];

/// Payload compression
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    Gzip,
    Zstd,
    Xz,
}

impl Compression {
    fn extension(self) -> &'static str {
        match self {
            Compression::Gzip => "gz",
            Compression::Zstd => "zst",
            Compression::Xz => "xz",
        }
    }

    /// Detect from the payload entry name, falling back to magic bytes
    fn detect(entry_name: &str, data: &[u8]) -> Result<Self> {
        if entry_name.ends_with(".gz") {
            return Ok(Compression::Gzip);
        } else if entry_name.ends_with(".zst") {
            return Ok(Compression::Zstd);
        } else if entry_name.ends_with(".xz") {
            return Ok(Compression::Xz);
        }

        if data.starts_with(&[0x1F, 0x8B]) {
            Ok(Compression::Gzip)
        } else if data.starts_with(&[0x28, 0xB5, 0x2F, 0xFD]) {
            Ok(Compression::Zstd)
        } else if data.starts_with(&[0xFD, 0x37, 0x7A, 0x58, 0x5A, 0x00]) {
            Ok(Compression::Xz)
        } else {
            Err(Error::ParseError(format!(
                "Unable to detect payload compression of {}",
                entry_name
            )))
        }
    }

    fn compress(self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Compression::Gzip => {
                let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
                encoder.write_all(data)?;
                Ok(encoder.finish()?)
            }
            Compression::Zstd => Ok(zstd::encode_all(data, 0)?),
            Compression::Xz => {
                let mut encoder = XzEncoder::new(Vec::new(), 6);
                encoder.write_all(data)?;
                Ok(encoder.finish()?)
            }
        }
    }
}

/// The decoded contents of an archive, checksum already verified
#[derive(Debug)]
pub struct PackageArchive {
    pub metadata: Metadata,
    payload_name: String,
    payload: Vec<u8>,
    hooks: Vec<(String, Vec<u8>)>,
}

impl PackageArchive {
    pub fn open(path: &Path) -> Result<Self> {
        debug!("Opening package archive {}", path.display());
        let file = File::open(path).map_err(|e| {
            Error::IoError(format!("Failed to open package {}: {}", path.display(), e))
        })?;

        let mut metadata = None;
        let mut checksum = None;
        let mut payload = None;
        let mut hooks = Vec::new();

        let mut outer = Archive::new(file);
        for entry in outer.entries()? {
            let mut entry = entry?;
            let name = entry.path()?.to_string_lossy().trim_start_matches("./").to_string();
            let mut data = Vec::new();
            entry.read_to_end(&mut data)?;

            if name == METADATA_ENTRY {
                metadata = Some(serde_json::from_slice::<Metadata>(&data)?);
            } else if name == CHECKSUM_ENTRY {
                checksum = Some(String::from_utf8_lossy(&data).trim().to_string());
            } else if name.starts_with(PAYLOAD_STEM) {
                payload = Some((name, data));
            } else if let Some(hook) = name.strip_prefix("hooks/") {
                if HOOK_NAMES.contains(&hook) {
                    hooks.push((hook.to_string(), data));
                }
            }
        }

        let missing = |what: &str| {
            Error::ParseError(format!("{} has no {} entry", path.display(), what))
        };
        let metadata = metadata.ok_or_else(|| missing(METADATA_ENTRY))?;
        let expected = checksum.ok_or_else(|| missing(CHECKSUM_ENTRY))?;
        let (payload_name, payload) = payload.ok_or_else(|| missing(PAYLOAD_STEM))?;

        let actual = sha256_hex(&payload);
        if !actual.eq_ignore_ascii_case(&expected) {
            return Err(Error::ChecksumMismatch { expected, actual });
        }

        if !is_valid_name(&metadata.name) {
            return Err(Error::ParseError(format!(
                "Invalid package name '{}' in {}",
                metadata.name,
                path.display()
            )));
        }

        Ok(Self {
            metadata,
            payload_name,
            payload,
            hooks,
        })
    }

    /// Decompressing reader over the payload tar
    pub fn payload(&self) -> Result<Archive<Box<dyn Read + '_>>> {
        let data = self.payload.as_slice();
        let reader: Box<dyn Read + '_> = match Compression::detect(&self.payload_name, data)? {
            Compression::Gzip => Box::new(GzDecoder::new(data)),
            Compression::Zstd => Box::new(zstd::Decoder::new(data).map_err(|e| {
                Error::ParseError(format!("Failed to create zstd decoder: {}", e))
            })?),
            Compression::Xz => Box::new(XzDecoder::new(data)),
        };
        Ok(Archive::new(reader))
    }

    /// Non-directory payload paths, absolute
    pub fn payload_files(&self) -> Result<Vec<String>> {
        let mut files = Vec::new();
        for entry in self.payload()?.entries()? {
            let entry = entry?;
            if entry.header().entry_type().is_dir() {
                continue;
            }
            let path = entry.path()?.to_string_lossy().trim_start_matches("./").to_string();
            files.push(format!("/{}", path));
        }
        Ok(files)
    }

    pub fn hook(&self, name: &str) -> Option<&[u8]> {
        self.hooks
            .iter()
            .find(|(hook, _)| hook == name)
            .map(|(_, data)| data.as_slice())
    }
}

/// Reads `.hpkg` files from disk
#[derive(Debug, Clone, Copy, Default)]
pub struct HpkgReader;

impl ArchiveReader for HpkgReader {
    fn read_metadata(&self, path: &Path) -> Result<Metadata> {
        Ok(PackageArchive::open(path)?.metadata)
    }

    fn payload_files(&self, path: &Path) -> Result<Vec<String>> {
        PackageArchive::open(path)?.payload_files()
    }
}

/// Packs a build directory into an archive.
///
/// The directory holds `metadata.json`, the payload under `root/` and
/// optional hook scripts under `hooks/`.
#[derive(Debug, Clone)]
pub struct ArchiveBuilder {
    source: PathBuf,
    compression: Compression,
}

impl ArchiveBuilder {
    pub fn new(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            compression: Compression::default(),
        }
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    /// Write the archive into `output_dir`, returning its path
    pub fn build(&self, output_dir: &Path) -> Result<PathBuf> {
        let metadata_path = self.source.join(METADATA_ENTRY);
        let metadata: Metadata = serde_json::from_slice(&fs::read(&metadata_path).map_err(
            |e| Error::IoError(format!("Failed to read {}: {}", metadata_path.display(), e)),
        )?)?;
        if !is_valid_name(&metadata.name) {
            return Err(Error::ParseError(format!(
                "Invalid package name '{}'",
                metadata.name
            )));
        }

        let payload = self.compression.compress(&self.payload_tar()?)?;
        let checksum = sha256_hex(&payload);

        fs::create_dir_all(output_dir)?;
        let output = output_dir.join(metadata.filename());
        let mut outer = Builder::new(File::create(&output)?);

        append_bytes(
            &mut outer,
            METADATA_ENTRY,
            &serde_json::to_vec_pretty(&metadata)?,
            0o644,
        )?;
        append_bytes(
            &mut outer,
            &format!("{}.{}", PAYLOAD_STEM, self.compression.extension()),
            &payload,
            0o644,
        )?;
        append_bytes(&mut outer, CHECKSUM_ENTRY, checksum.as_bytes(), 0o644)?;

        for hook in HOOK_NAMES {
            let hook_path = self.source.join(HOOKS_DIR).join(hook);
            if hook_path.is_file() {
                let data = fs::read(&hook_path)?;
                append_bytes(&mut outer, &format!("{}/{}", HOOKS_DIR, hook), &data, 0o755)?;
            }
        }

        outer.into_inner()?.flush()?;
        info!("Built {}", output.display());
        Ok(output)
    }

    fn payload_tar(&self) -> Result<Vec<u8>> {
        let mut builder = Builder::new(Vec::new());
        builder.follow_symlinks(false);
        let root = self.source.join("root");
        if root.is_dir() {
            builder.append_dir_all("", &root)?;
        }
        Ok(builder.into_inner()?)
    }
}

fn append_bytes<W: Write>(builder: &mut Builder<W>, name: &str, data: &[u8], mode: u32) -> Result<()> {
    let mut header = Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(mode);
    header.set_mtime(chrono::Utc::now().timestamp().max(0) as u64);
    header.set_cksum();
    builder.append_data(&mut header, name, data)?;
    Ok(())
}

pub fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Streaming SHA-256 of a file
pub fn file_sha256(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}
