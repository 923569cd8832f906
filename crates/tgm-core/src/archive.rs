//! Archive writers/readers for finished session files.
//!
//! A session file is archived as a single-entry `.zip` or `.tar.gz`, or moved
//! as-is. Reading back is bounded so a corrupt or hostile archive cannot blow
//! up memory.

use std::{
    fmt,
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
    str::FromStr,
};

use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use tar::{Archive, Builder};
use zip::{write::FileOptions, CompressionMethod, ZipArchive, ZipWriter};

use crate::{errors::Error, Result};

/// Upper bound for a single archived session document.
const MAX_ENTRY_BYTES: u64 = 16 * 1024 * 1024;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ArchiveFormat {
    /// Move the JSON file without compression.
    Plain,
    #[default]
    Zip,
    TarGz,
}

impl ArchiveFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ArchiveFormat::Plain => "",
            ArchiveFormat::Zip => ".zip",
            ArchiveFormat::TarGz => ".tar.gz",
        }
    }
}

impl fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ArchiveFormat::Plain => "none",
            ArchiveFormat::Zip => "zip",
            ArchiveFormat::TarGz => "tar.gz",
        })
    }
}

impl FromStr for ArchiveFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "none" | "plain" => Ok(ArchiveFormat::Plain),
            "zip" => Ok(ArchiveFormat::Zip),
            "tar.gz" | "tgz" | "targz" => Ok(ArchiveFormat::TarGz),
            other => Err(Error::InvalidFormat(format!(
                "unknown archive format: {other} (expected zip, tar.gz or none)"
            ))),
        }
    }
}

pub fn detect_archive_format(file_name: &str) -> ArchiveFormat {
    let lower = file_name.to_lowercase();
    if lower.ends_with(".zip") {
        return ArchiveFormat::Zip;
    }
    if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
        return ArchiveFormat::TarGz;
    }
    ArchiveFormat::Plain
}

/// Archive `src` into `archive_dir` and remove the original.
///
/// Returns the path of the archive (or moved file).
pub fn archive_file(src: &Path, archive_dir: &Path, format: ArchiveFormat) -> Result<PathBuf> {
    fs::create_dir_all(archive_dir)?;

    let file_name = src
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::InvalidFormat(format!("not a file path: {}", src.display())))?;
    let dest = archive_dir.join(format!("{file_name}{}", format.extension()));

    let written = match format {
        ArchiveFormat::Plain => move_file(src, &dest),
        ArchiveFormat::Zip => write_zip(src, file_name, &dest),
        ArchiveFormat::TarGz => write_tar_gz(src, file_name, &dest),
    };

    if let Err(e) = written {
        if format != ArchiveFormat::Plain {
            let _ = fs::remove_file(&dest);
        }
        return Err(e);
    }

    if format != ArchiveFormat::Plain {
        fs::remove_file(src)?;
    }
    Ok(dest)
}

fn move_file(src: &Path, dest: &Path) -> Result<()> {
    if fs::rename(src, dest).is_ok() {
        return Ok(());
    }
    // Rename fails across filesystems; fall back to copy + delete.
    fs::copy(src, dest)?;
    fs::remove_file(src)?;
    Ok(())
}

fn write_zip(src: &Path, entry_name: &str, dest: &Path) -> Result<()> {
    let bytes = fs::read(src)?;
    let mut zip = ZipWriter::new(File::create(dest)?);
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
    zip.start_file(entry_name, options)?;
    zip.write_all(&bytes)?;
    zip.finish()?;
    Ok(())
}

fn write_tar_gz(src: &Path, entry_name: &str, dest: &Path) -> Result<()> {
    let gz = GzEncoder::new(File::create(dest)?, Compression::default());
    let mut builder = Builder::new(gz);
    builder.append_path_with_name(src, entry_name)?;
    builder.into_inner()?.finish()?;
    Ok(())
}

/// Read the session document stored in an archive produced by [`archive_file`].
pub fn read_archived_session(path: &Path) -> Result<serde_json::Value> {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    let bytes = match detect_archive_format(name) {
        ArchiveFormat::Plain => read_limited(File::open(path)?)?,
        ArchiveFormat::Zip => read_zip_entry(path)?,
        ArchiveFormat::TarGz => read_tar_gz_entry(path)?,
    };
    Ok(serde_json::from_slice(&bytes)?)
}

fn read_zip_entry(path: &Path) -> Result<Vec<u8>> {
    let mut zip = ZipArchive::new(File::open(path)?)?;
    for i in 0..zip.len() {
        let entry = zip.by_index(i)?;
        if entry.is_file() && entry.name().ends_with(".json") {
            return read_limited(entry);
        }
    }
    Err(Error::InvalidFormat(format!(
        "no session document in {}",
        path.display()
    )))
}

fn read_tar_gz_entry(path: &Path) -> Result<Vec<u8>> {
    let mut archive = Archive::new(GzDecoder::new(File::open(path)?));
    for entry in archive.entries()? {
        let entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let is_json = entry
            .path()?
            .extension()
            .is_some_and(|ext| ext == "json");
        if is_json {
            return read_limited(entry);
        }
    }
    Err(Error::InvalidFormat(format!(
        "no session document in {}",
        path.display()
    )))
}

fn read_limited<R: Read>(r: R) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    r.take(MAX_ENTRY_BYTES + 1).read_to_end(&mut buf)?;
    if buf.len() as u64 > MAX_ENTRY_BYTES {
        return Err(Error::InvalidFormat(format!(
            "archived session exceeds {MAX_ENTRY_BYTES} bytes"
        )));
    }
    Ok(buf)
}
