//! Re-encoding of tar streams into uncompressed zip archives.

use crate::error::{Result, SearchError};
use crate::source::ProducerError;
use crate::store::filter::SearchableFilter;
use std::io::{ErrorKind, Read, Seek, Write};
use std::path::PathBuf;
use tar::EntryType;
use zip::write::SimpleFileOptions;

/// Only this prefix of a file is inspected for NUL bytes.
pub const BINARY_SNIFF_LEN: usize = 32 * 1024;

/// Counts gathered while converting one archive.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConvertStats {
    pub files: usize,
    pub ignored: usize,
    pub skipped_large: usize,
    pub skipped_binary: usize,
    pub symlinks: usize,
}

/// Copy every entry of `tar` into a zip written to `out`.
///
/// Ignored entries are dropped. Oversized (unless allow-listed) and binary
/// files keep their path with empty content. Symlinks are stored with their
/// target as content.
pub fn tar_to_zip<R: Read, W: Write + Seek>(
    tar: R,
    out: W,
    filter: &SearchableFilter,
) -> Result<ConvertStats> {
    let mut archive = tar::Archive::new(tar);
    let mut zip = zip::ZipWriter::new(out);
    let mut stats = ConvertStats::default();
    let mut content = Vec::new();

    for entry in archive.entries().map_err(classify_tar_error)? {
        let mut entry = entry.map_err(classify_tar_error)?;
        let header = entry.header();
        let entry_type = header.entry_type();
        if !matches!(
            entry_type,
            EntryType::Regular | EntryType::Continuous | EntryType::Symlink
        ) {
            continue;
        }

        let path = entry.path().map_err(classify_tar_error)?;
        let name = path.to_string_lossy().trim_start_matches("./").to_string();
        if name.is_empty() {
            continue;
        }
        if filter.ignore(&name) {
            stats.ignored += 1;
            continue;
        }

        let mode = header.mode().unwrap_or(0o644);
        let options = SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Stored)
            .unix_permissions(mode);

        if entry_type == EntryType::Symlink {
            let target = entry
                .link_name()
                .map_err(classify_tar_error)?
                .map(|t| t.to_string_lossy().into_owned())
                .unwrap_or_default();
            zip.add_symlink(name, target, options)?;
            stats.symlinks += 1;
            continue;
        }

        let size = entry.size();
        zip.start_file(name.as_str(), options)?;
        stats.files += 1;
        if filter.skip_content(&name, size) {
            stats.skipped_large += 1;
            continue;
        }

        content.clear();
        entry.read_to_end(&mut content).map_err(classify_tar_error)?;
        if (content.len() as u64) < size {
            return Err(SearchError::temporary(format!(
                "truncated tar stream: {} has {} of {} bytes",
                name,
                content.len(),
                size
            )));
        }
        if is_binary(&content) {
            stats.skipped_binary += 1;
            continue;
        }
        zip.write_all(&content)?;
    }

    zip.finish()?;
    Ok(stats)
}

/// NUL byte heuristic over the first [`BINARY_SNIFF_LEN`] bytes.
pub fn is_binary(content: &[u8]) -> bool {
    let sniff = &content[..content.len().min(BINARY_SNIFF_LEN)];
    memchr::memchr(0, sniff).is_some()
}

/// A stream that ended early is temporary. A failing producer keeps its I/O
/// error. Anything else means the stream itself is damaged.
fn classify_tar_error(err: std::io::Error) -> SearchError {
    if ProducerError::is_producer(&err) {
        return SearchError::Io(err);
    }
    let msg = err.to_string();
    if err.kind() == ErrorKind::UnexpectedEof
        || msg.contains("unexpected EOF")
        || msg.contains("entire block")
        || msg.contains("truncated")
    {
        SearchError::temporary(format!("truncated tar stream: {}", msg))
    } else {
        SearchError::Archive {
            path: PathBuf::from("<tar stream>"),
            reason: msg,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::store::zip_cache::ZipFile;
    use std::io::Cursor;

    /// Build a tar from (name, content) pairs.
    pub(crate) fn build_tar(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, content) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *content).unwrap();
        }
        builder.into_inner().unwrap()
    }

    fn convert(tar: Vec<u8>, filter: &SearchableFilter) -> (ZipFile, ConvertStats) {
        let mut out = Cursor::new(Vec::new());
        let stats = tar_to_zip(Cursor::new(tar), &mut out, filter).unwrap();
        (ZipFile::from_bytes(out.into_inner()).unwrap(), stats)
    }

    fn content<'a>(zf: &'a ZipFile, name: &str) -> &'a [u8] {
        let f = zf.files().iter().find(|f| f.name == name).unwrap();
        zf.data_for(f)
    }

    #[test]
    fn test_regular_files_round_trip() {
        let tar = build_tar(&[("README.md", b"# Hello"), ("src/main.go", b"package main")]);
        let filter = SearchableFilter::new(1024, &[]).unwrap();
        let (zf, stats) = convert(tar, &filter);
        assert_eq!(stats.files, 2);
        assert_eq!(content(&zf, "README.md"), b"# Hello");
        assert_eq!(content(&zf, "src/main.go"), b"package main");
    }

    #[test]
    fn test_policies() {
        let mut binary = b"PNG".to_vec();
        binary.push(0);
        binary.extend_from_slice(b"rest");
        let tar = build_tar(&[
            ("keep.txt", b"small"),
            ("big.txt", b"0123456789abcdef"),
            ("big.allowed", b"0123456789abcdef"),
            ("logo.png", &binary),
            ("vendor/dep.go", b"package dep"),
        ]);
        let filter = SearchableFilter::new(8, &["*.allowed".to_string()])
            .unwrap()
            .with_ignore_file(Some(b"vendor/\n"))
            .unwrap();
        let (zf, stats) = convert(tar, &filter);

        assert_eq!(stats.ignored, 1);
        assert_eq!(stats.skipped_large, 1);
        assert_eq!(stats.skipped_binary, 1);
        assert!(zf.files().iter().all(|f| f.name != "vendor/dep.go"));
        assert_eq!(content(&zf, "keep.txt"), b"small");
        assert_eq!(content(&zf, "big.txt"), b"");
        assert_eq!(content(&zf, "big.allowed"), b"0123456789abcdef");
        assert_eq!(content(&zf, "logo.png"), b"");
    }

    #[test]
    fn test_nul_after_sniff_window_is_text() {
        let mut text = vec![b'a'; BINARY_SNIFF_LEN];
        text.push(0);
        assert!(!is_binary(&text));
        assert!(is_binary(b"a\0b"));
    }

    #[test]
    fn test_symlink_stored_as_target() {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(EntryType::Symlink);
        header.set_size(0);
        header.set_mode(0o777);
        builder
            .append_link(&mut header, "link.go", "target/real.go")
            .unwrap();
        let tar = builder.into_inner().unwrap();

        let filter = SearchableFilter::new(1024, &[]).unwrap();
        let (zf, stats) = convert(tar, &filter);
        assert_eq!(stats.symlinks, 1);
        assert_eq!(content(&zf, "link.go"), b"target/real.go");
    }

    fn convert_err(tar: Vec<u8>) -> SearchError {
        let filter = SearchableFilter::new(1 << 20, &[]).unwrap();
        tar_to_zip(Cursor::new(tar), Cursor::new(Vec::new()), &filter).unwrap_err()
    }

    #[test]
    fn test_corrupt_header_is_archive_error() {
        let mut tar = build_tar(&[("a.txt", b"hello")]);
        // clobber the checksum field of the first header
        for b in &mut tar[148..156] {
            *b = b'x';
        }
        let err = convert_err(tar);
        assert!(matches!(err, SearchError::Archive { .. }), "{}", err);
        assert!(!err.is_temporary());
    }

    #[test]
    fn test_truncated_content_is_temporary() {
        let body = vec![b'a'; 2000];
        let mut tar = build_tar(&[("big.txt", &body)]);
        tar.truncate(512 + 1000);
        let err = convert_err(tar);
        assert!(err.is_temporary(), "{}", err);
    }

    #[test]
    fn test_truncated_padding_and_header_are_temporary() {
        // cut inside the padding after the first entry's data
        let mut tar = build_tar(&[("a.txt", b"hello"), ("b.txt", b"world")]);
        tar.truncate(512 + 100);
        let err = convert_err(tar);
        assert!(err.is_temporary(), "{}", err);

        // cut inside the second header
        let mut tar = build_tar(&[("a.txt", b"hello"), ("b.txt", b"world")]);
        tar.truncate(1024 + 100);
        let err = convert_err(tar);
        assert!(err.is_temporary(), "{}", err);
    }

    #[test]
    fn test_producer_failure_keeps_io_error() {
        struct Failing;
        impl Read for Failing {
            fn read(&mut self, _: &mut [u8]) -> std::io::Result<usize> {
                Err(ProducerError::io("git exited with 128"))
            }
        }
        let filter = SearchableFilter::new(1024, &[]).unwrap();
        let err = tar_to_zip(Failing, Cursor::new(Vec::new()), &filter).unwrap_err();
        assert!(matches!(err, SearchError::Io(_)), "{}", err);
        assert!(err.to_string().contains("git exited"));
    }
}
