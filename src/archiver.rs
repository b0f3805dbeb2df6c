//! Archive packing and unpacking for firmware uploads and EMBA log downloads.
//!
//! Unpack formats live in a small registry, `zip`, `tar` and `gztar` by
//! default. `Archiver::new` additionally registers `gz` for single gzip
//! compressed files.

use crate::error::EmbarkError;
use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, error, info};
use zip::{CompressionMethod, ZipArchive, ZipWriter, write::SimpleFileOptions};

/// Extracts `file` into `work_dir`.
pub type UnpackFn = fn(&Path, &Path) -> Result<(), EmbarkError>;

#[derive(Clone)]
pub struct UnpackFormat {
    pub name: &'static str,
    pub extensions: Vec<&'static str>,
    pub description: &'static str,
    unpack: UnpackFn,
}

/// Formats accepted by [`Archiver::pack`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackFormat {
    Zip,
    Tar,
    GzTar,
}

impl PackFormat {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Zip => ".zip",
            Self::Tar => ".tar",
            Self::GzTar => ".tar.gz",
        }
    }
}

impl std::str::FromStr for PackFormat {
    type Err = EmbarkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "zip" => Ok(Self::Zip),
            "tar" => Ok(Self::Tar),
            "gztar" => Ok(Self::GzTar),
            other => Err(EmbarkError::UnsupportedFormat(other.to_string())),
        }
    }
}

#[derive(Clone)]
pub struct Archiver {
    formats: Vec<UnpackFormat>,
}

impl Default for Archiver {
    fn default() -> Self {
        Self::new()
    }
}

impl Archiver {
    pub fn new() -> Self {
        let mut archiver = Self {
            formats: vec![
                UnpackFormat {
                    name: "zip",
                    extensions: vec![".zip"],
                    description: "ZIP file",
                    unpack: unpack_zip,
                },
                UnpackFormat {
                    name: "tar",
                    extensions: vec![".tar"],
                    description: "uncompressed tar file",
                    unpack: unpack_tar,
                },
                UnpackFormat {
                    name: "gztar",
                    extensions: vec![".tar.gz", ".tgz"],
                    description: "gzip'ed tar-file",
                    unpack: unpack_gztar,
                },
            ],
        };
        archiver.register_unpack_format("gz", vec![".gz"], "gzip'ed file", Self::gunzip_file);
        archiver
    }

    pub fn register_unpack_format(
        &mut self,
        name: &'static str,
        extensions: Vec<&'static str>,
        description: &'static str,
        unpack: UnpackFn,
    ) {
        self.formats.retain(|f| f.name != name);
        self.formats.push(UnpackFormat {
            name,
            extensions,
            description,
            unpack,
        });
    }

    /// Decompress a single `.gz` file into `work_dir`, dropping the suffix.
    pub fn gunzip_file(file_name: &Path, work_dir: &Path) -> Result<(), EmbarkError> {
        let name = file_name
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| EmbarkError::Validation(format!("bad file name {}", file_name.display())))?;
        let out_name = strip_gz_suffix(name);

        let mut input = GzDecoder::new(File::open(file_name)?);
        let mut output = File::create(work_dir.join(out_name))?;
        io::copy(&mut input, &mut output)?;
        Ok(())
    }

    /// Create `base_name` + format extension from `root_dir`, starting at `base_dir`.
    /// Entry names are relative to `root_dir`.
    pub fn pack(
        base_name: &Path,
        format: PackFormat,
        root_dir: &Path,
        base_dir: Option<&Path>,
    ) -> Result<PathBuf, EmbarkError> {
        let mut archive_name = base_name.as_os_str().to_owned();
        archive_name.push(format.extension());
        let archive_path = PathBuf::from(archive_name);
        if let Some(parent) = archive_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let start = match base_dir {
            Some(b) => root_dir.join(b),
            None => root_dir.to_path_buf(),
        };
        let entries = walk(&start)?;
        debug!(archive = %archive_path.display(), entries = entries.len(), "packing");

        let out = File::create(&archive_path)?;
        match format {
            PackFormat::Zip => {
                let mut zip = ZipWriter::new(out);
                write_zip_entries(&mut zip, root_dir, &entries)?;
                zip.finish()?;
            }
            PackFormat::Tar => {
                let mut builder = tar::Builder::new(out);
                write_tar_entries(&mut builder, root_dir, &entries)?;
                builder.into_inner()?;
            }
            PackFormat::GzTar => {
                let encoder = GzEncoder::new(out, Compression::default());
                let mut builder = tar::Builder::new(encoder);
                write_tar_entries(&mut builder, root_dir, &entries)?;
                builder.into_inner()?.finish()?;
            }
        }
        Ok(archive_path)
    }

    /// Zip `source_dir` recursively. Entries keep the directory's own name and
    /// directories are written explicitly so empty ones survive.
    pub fn make_zipfile(output: &Path, source_dir: &Path) -> Result<PathBuf, EmbarkError> {
        let source_dir = std::path::absolute(source_dir)?;
        let relroot = source_dir.parent().unwrap_or(Path::new("/")).to_path_buf();

        let mut entries = vec![source_dir.clone()];
        entries.extend(walk(&source_dir)?);

        let mut zip = ZipWriter::new(File::create(output)?);
        write_zip_entries(&mut zip, &relroot, &entries)?;
        zip.finish()?;
        Ok(output.to_path_buf())
    }

    /// Extract `file_location` into `extract_dir` (current directory when `None`).
    pub fn unpack(&self, file_location: &Path, extract_dir: Option<&Path>) -> Result<(), EmbarkError> {
        let file_name = file_location.to_string_lossy();
        let Some(format) = self.format_for(&file_name) else {
            let ext = file_name
                .rsplit('/')
                .next()
                .and_then(|n| n.split_once('.').map(|(_, e)| e.to_string()))
                .unwrap_or_else(|| file_name.to_string());
            error!("Format {ext} is not supported");
            return Err(EmbarkError::UnsupportedFormat(ext));
        };

        let target = extract_dir.unwrap_or(Path::new("."));
        let outcome = fs::create_dir_all(target)
            .map_err(EmbarkError::from)
            .and_then(|_| (format.unpack)(file_location, target));
        match outcome {
            Ok(()) => {
                info!("Unpacked file successful: {}", file_location.display());
                Ok(())
            }
            Err(e) => {
                error!(
                    "Undefined Error during unpacking file: {}",
                    file_location.display()
                );
                error!("{e}");
                Err(e)
            }
        }
    }

    pub fn get_supported_formats(&self) -> Vec<&'static str> {
        self.formats.iter().map(|f| f.name).collect()
    }

    pub fn get_supported_extensions(&self) -> Vec<&'static str> {
        self.formats
            .iter()
            .flat_map(|f| f.extensions.iter().copied())
            .collect()
    }

    pub fn check_extensions(&self, file_name: &str) -> bool {
        if self
            .get_supported_extensions()
            .iter()
            .any(|ext| file_name.ends_with(ext))
        {
            return true;
        }
        info!("Format for {file_name} is not supported by archiver");
        false
    }

    /// Copy `src` into the new directory `dst`; `None` on any failure.
    pub fn copy(src: &Path, dst: &Path) -> Option<PathBuf> {
        debug!("copying file {} to {}", src.display(), dst.display());
        let copied = (|| -> Result<PathBuf, EmbarkError> {
            if dst.exists() {
                return Err(io::Error::from(io::ErrorKind::AlreadyExists).into());
            }
            fs::create_dir_all(dst)?;
            let name = src.file_name().ok_or_else(|| {
                EmbarkError::Validation(format!("no file name in {}", src.display()))
            })?;
            let target = dst.join(name);
            fs::copy(src, &target)?;
            Ok(target)
        })();
        copied
            .inspect_err(|e| error!("Error copying firmware to active dir: {e}"))
            .ok()
    }

    /// Longest matching extension wins, so `.tar.gz` is not taken for `.gz`.
    fn format_for(&self, file_name: &str) -> Option<&UnpackFormat> {
        self.formats
            .iter()
            .filter_map(|f| {
                f.extensions
                    .iter()
                    .filter(|ext| file_name.ends_with(*ext))
                    .map(|ext| ext.len())
                    .max()
                    .map(|len| (len, f))
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, f)| f)
    }
}

fn strip_gz_suffix(name: &str) -> &str {
    let cut = name.len().saturating_sub(3);
    match name.get(cut..) {
        Some(tail) if tail.eq_ignore_ascii_case(".gz") => &name[..cut],
        _ => name,
    }
}

/// All files and directories below `dir`, parents before children.
/// Symlinks are left out and never followed.
fn walk(dir: &Path) -> Result<Vec<PathBuf>, EmbarkError> {
    let mut out = Vec::new();
    let mut children = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_symlink() {
            debug!(path = %entry.path().display(), "skipping symlink");
            continue;
        }
        children.push((entry.path(), file_type.is_dir()));
    }
    children.sort();
    for (child, is_dir) in children {
        out.push(child.clone());
        if is_dir {
            out.extend(walk(&child)?);
        }
    }
    Ok(out)
}

fn archive_name(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<_> = rel
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => s.to_str(),
            _ => None,
        })
        .collect();
    (!parts.is_empty()).then(|| parts.join("/"))
}

fn write_zip_entries(
    zip: &mut ZipWriter<File>,
    root: &Path,
    entries: &[PathBuf],
) -> Result<(), EmbarkError> {
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    for path in entries {
        let Some(name) = archive_name(root, path) else {
            continue;
        };
        let file_type = fs::symlink_metadata(path)?.file_type();
        if file_type.is_dir() {
            zip.add_directory(name, options)?;
        } else if file_type.is_file() {
            zip.start_file(name, options)?;
            io::copy(&mut File::open(path)?, zip)?;
        }
    }
    Ok(())
}

fn write_tar_entries<W: io::Write>(
    builder: &mut tar::Builder<W>,
    root: &Path,
    entries: &[PathBuf],
) -> Result<(), EmbarkError> {
    for path in entries {
        let Some(name) = archive_name(root, path) else {
            continue;
        };
        let file_type = fs::symlink_metadata(path)?.file_type();
        if file_type.is_dir() {
            builder.append_dir(&name, path)?;
        } else if file_type.is_file() {
            builder.append_path_with_name(path, &name)?;
        }
    }
    Ok(())
}

fn unpack_zip(file: &Path, work_dir: &Path) -> Result<(), EmbarkError> {
    let mut zip = ZipArchive::new(File::open(file)?)?;
    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        let Some(name) = entry.enclosed_name() else {
            debug!(entry = entry.name(), "skipping unsafe archive entry");
            continue;
        };
        let target = work_dir.join(name);
        if entry.is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        io::copy(&mut entry, &mut File::create(&target)?)?;
    }
    Ok(())
}

fn unpack_tar(file: &Path, work_dir: &Path) -> Result<(), EmbarkError> {
    tar::Archive::new(File::open(file)?).unpack(work_dir)?;
    Ok(())
}

fn unpack_gztar(file: &Path, work_dir: &Path) -> Result<(), EmbarkError> {
    tar::Archive::new(GzDecoder::new(File::open(file)?)).unpack(work_dir)?;
    Ok(())
}
