use std::path::Path;

/// Files below this size are never judged complete when the expected size
/// is unknown.
const MIN_COMPLETE_BYTES: u64 = 1024;

/// Accepted deviation from the expected size, either direction.
const SIZE_TOLERANCE: f64 = 0.05;

/// Local-file-header signature shared by the ZIP container family.
const ZIP_MAGIC: [u8; 4] = [0x50, 0x4B, 0x03, 0x04];

const ZIP_EXTENSIONS: [&str; 5] = ["zip", "apk", "xapk", "jar", "aar"];

/// Verdict on a file found in the download directory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileCheck {
    Complete,
    /// Smaller than a complete file should be; a resume may finish it.
    Partial,
    /// Larger than expected, or an archive without its magic number.
    Corrupt,
}

/// Judge whether an on-disk file looks like a finished download.
///
/// With a known expected size the file is complete iff it falls within the
/// tolerance band around it. Without one this is a best-effort heuristic:
/// a minimum-size floor, a magic-number check for ZIP-family archives, and
/// otherwise the assumption that anything above the floor is complete. A
/// genuinely truncated large file can therefore still pass; callers must
/// not treat `Complete` as a correctness guarantee.
pub fn check_file(
    actual_size: u64,
    expected_size: Option<u64>,
    file_name: &str,
    head: &[u8],
) -> FileCheck {
    if let Some(expected) = expected_size {
        let actual = actual_size as f64;
        let expected = expected as f64;
        return if actual < expected * (1.0 - SIZE_TOLERANCE) {
            FileCheck::Partial
        } else if actual > expected * (1.0 + SIZE_TOLERANCE) {
            FileCheck::Corrupt
        } else {
            FileCheck::Complete
        };
    }

    if actual_size < MIN_COMPLETE_BYTES {
        return FileCheck::Partial;
    }
    if is_zip_family(file_name) && !head.starts_with(&ZIP_MAGIC) {
        return FileCheck::Corrupt;
    }
    FileCheck::Complete
}

fn is_zip_family(file_name: &str) -> bool {
    Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            ZIP_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
        .unwrap_or(false)
}
