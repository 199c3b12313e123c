use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use std::io::{Cursor, Write};
use zip::write::FileOptions;
use zip::ZipWriter;

#[derive(Debug, Clone)]
pub enum EntryBody {
    File(Vec<u8>),
    Dir,
    Symlink(String),
}

/// One entry of an archive built in memory for tests.
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    pub name: String,
    pub body: EntryBody,
    pub mode: Option<u32>,
}

impl ArchiveEntry {
    pub fn file(name: impl Into<String>, contents: impl AsRef<[u8]>) -> Self {
        Self {
            name: name.into(),
            body: EntryBody::File(contents.as_ref().to_vec()),
            mode: None,
        }
    }

    pub fn dir(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            body: EntryBody::Dir,
            mode: None,
        }
    }

    pub fn symlink(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            body: EntryBody::Symlink(target.into()),
            mode: None,
        }
    }

    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = Some(mode);
        self
    }
}

/// Builds a zip archive. Entry names are written verbatim, `..` included.
pub fn zip_bytes(entries: &[ArchiveEntry]) -> Vec<u8> {
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    for entry in entries {
        let mut options = FileOptions::default();
        if let Some(mode) = entry.mode {
            options = options.unix_permissions(mode);
        }
        match &entry.body {
            EntryBody::File(contents) => {
                zip.start_file(entry.name.as_str(), options).unwrap();
                zip.write_all(contents).unwrap();
            }
            EntryBody::Dir => {
                zip.add_directory(entry.name.as_str(), options).unwrap();
            }
            EntryBody::Symlink(target) => {
                zip.add_symlink(entry.name.as_str(), target.as_str(), options).unwrap();
            }
        }
    }
    zip.finish().unwrap().into_inner()
}

/// Builds a gzip-compressed tar archive.
pub fn tar_gz_bytes(entries: &[ArchiveEntry]) -> Vec<u8> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);

    for entry in entries {
        let mut header = tar::Header::new_gnu();
        match &entry.body {
            EntryBody::File(contents) => {
                header.set_entry_type(tar::EntryType::Regular);
                header.set_size(contents.len() as u64);
                header.set_mode(entry.mode.unwrap_or(0o644));
                header.set_cksum();
                builder
                    .append_data(&mut header, entry.name.as_str(), contents.as_slice())
                    .unwrap();
            }
            EntryBody::Dir => {
                header.set_entry_type(tar::EntryType::Directory);
                header.set_size(0);
                header.set_mode(entry.mode.unwrap_or(0o755));
                header.set_cksum();
                builder
                    .append_data(&mut header, entry.name.as_str(), std::io::empty())
                    .unwrap();
            }
            EntryBody::Symlink(target) => {
                header.set_entry_type(tar::EntryType::Symlink);
                header.set_size(0);
                header.set_mode(0o777);
                header.set_link_name(target.as_str()).unwrap();
                header.set_cksum();
                builder
                    .append_data(&mut header, entry.name.as_str(), std::io::empty())
                    .unwrap();
            }
        }
    }

    builder.into_inner().unwrap().finish().unwrap()
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builders_produce_readable_archives() {
        let entries = vec![
            ArchiveEntry::dir("app/"),
            ArchiveEntry::file("app/main.py", b"print(1)"),
        ];

        let zip = zip_bytes(&entries);
        let archive = zip::ZipArchive::new(Cursor::new(zip)).unwrap();
        assert_eq!(archive.len(), 2);

        let tgz = tar_gz_bytes(&entries);
        let mut tar = tar::Archive::new(flate2::read::GzDecoder::new(tgz.as_slice()));
        assert_eq!(tar.entries().unwrap().count(), 2);
    }

    #[test]
    fn sha256_of_known_input() {
        assert_eq!(
            sha256_hex(b"test"),
            "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08"
        );
    }
}
