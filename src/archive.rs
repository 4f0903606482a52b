use std::fs::{self, File};
use std::path::Path;

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use tar::Archive;
use zip::ZipArchive;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    TarGz,
    Tar,
}

impl ArchiveKind {
    /// Recognise an archive by file name, falling back to its magic bytes.
    pub fn detect(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?.to_ascii_lowercase();
        if let Some(kind) = Self::from_name(&name) {
            return Some(kind);
        }
        let kind = infer::get_from_path(path).ok().flatten()?;
        match kind.mime_type() {
            "application/zip" => Some(ArchiveKind::Zip),
            "application/gzip" => Some(ArchiveKind::TarGz),
            "application/x-tar" => Some(ArchiveKind::Tar),
            _ => None,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        if name.ends_with(".zip") {
            Some(ArchiveKind::Zip)
        } else if name.ends_with(".tgz") || name.ends_with(".tar.gz") {
            Some(ArchiveKind::TarGz)
        } else if name.ends_with(".tar") {
            Some(ArchiveKind::Tar)
        } else {
            None
        }
    }

    /// File name without the archive extension.
    pub fn stem<'a>(&self, name: &'a str) -> &'a str {
        let lower = name.to_ascii_lowercase();
        let suffix = match self {
            ArchiveKind::Zip => ".zip",
            ArchiveKind::TarGz if lower.ends_with(".tar.gz") => ".tar.gz",
            ArchiveKind::TarGz => ".tgz",
            ArchiveKind::Tar => ".tar",
        };
        if lower.ends_with(suffix) {
            &name[..name.len() - suffix.len()]
        } else {
            name
        }
    }
}

/// Unpack `archive` into `target`, creating it when needed.
pub fn extract(archive: &Path, kind: ArchiveKind, target: &Path) -> Result<()> {
    fs::create_dir_all(target)
        .with_context(|| format!("failed to create {}", target.display()))?;
    let file =
        File::open(archive).with_context(|| format!("failed to open {}", archive.display()))?;
    match kind {
        ArchiveKind::Zip => {
            let mut zip = ZipArchive::new(file)
                .with_context(|| format!("{} is not a valid zip", archive.display()))?;
            zip.extract(target)
                .with_context(|| format!("failed to extract {}", archive.display()))?;
        }
        ArchiveKind::TarGz => {
            Archive::new(GzDecoder::new(file))
                .unpack(target)
                .with_context(|| format!("failed to extract {}", archive.display()))?;
        }
        ArchiveKind::Tar => {
            Archive::new(file)
                .unpack(target)
                .with_context(|| format!("failed to extract {}", archive.display()))?;
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod fixtures {
    use std::fs::File;
    use std::io::Write;
    use std::path::Path;

    use flate2::Compression;
    use flate2::write::GzEncoder;

    pub(crate) fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut buffer = std::io::Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buffer);
            for (name, data) in entries {
                writer
                    .start_file(*name, zip::write::FileOptions::default())
                    .unwrap();
                writer.write_all(data).unwrap();
            }
            writer.finish().unwrap();
        }
        buffer.into_inner()
    }

    pub(crate) fn tar_gz_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (name, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    pub(crate) fn write(path: &Path, bytes: &[u8]) {
        File::create(path).unwrap().write_all(bytes).unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn detects_by_extension() {
        assert_eq!(ArchiveKind::from_name("grcov.zip"), Some(ArchiveKind::Zip));
        assert_eq!(
            ArchiveKind::from_name("browsertime-results.tgz"),
            Some(ArchiveKind::TarGz)
        );
        assert_eq!(ArchiveKind::from_name("a.tar.gz"), Some(ArchiveKind::TarGz));
        assert_eq!(ArchiveKind::from_name("perfherder-data.json"), None);
    }

    #[test]
    fn stem_strips_archive_suffix() {
        assert_eq!(ArchiveKind::TarGz.stem("results.tar.gz"), "results");
        assert_eq!(ArchiveKind::TarGz.stem("results.tgz"), "results");
        assert_eq!(ArchiveKind::Zip.stem("grcov.ZIP"), "grcov");
    }

    #[test]
    fn detects_zip_without_extension() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t1_code-coverage");
        write(&path, &zip_bytes(&[("a.json", b"{}")]));
        assert_eq!(ArchiveKind::detect(&path), Some(ArchiveKind::Zip));

        let plain = dir.path().join("t1_notes");
        write(&plain, b"just text");
        assert_eq!(ArchiveKind::detect(&plain), None);
    }

    #[test]
    fn extracts_zip_and_tar_gz() {
        let dir = tempdir().unwrap();
        let zip_path = dir.path().join("grcov.zip");
        write(&zip_path, &zip_bytes(&[("nested/cov.json", b"{\"x\":1}")]));
        let zip_target = dir.path().join("zip-out");
        extract(&zip_path, ArchiveKind::Zip, &zip_target).unwrap();
        assert_eq!(
            fs::read(zip_target.join("nested").join("cov.json")).unwrap(),
            b"{\"x\":1}"
        );

        let tgz_path = dir.path().join("browsertime-results.tgz");
        write(
            &tgz_path,
            &tar_gz_bytes(&[("browsertime-results/browsertime.json", b"[]")]),
        );
        let tgz_target = dir.path().join("tgz-out");
        extract(&tgz_path, ArchiveKind::TarGz, &tgz_target).unwrap();
        assert!(
            tgz_target
                .join("browsertime-results")
                .join("browsertime.json")
                .is_file()
        );
    }
}
