//! Database file naming conventions.

use std::path::{Path, PathBuf};

/// File types in the database directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    /// Write-ahead log file.
    Log,
    /// Lock file to prevent concurrent access.
    Lock,
    /// SSTable data file.
    Table,
    /// Manifest file (version history).
    Manifest,
    /// Current file (points to current manifest).
    Current,
    /// Temporary file.
    Temp,
    /// Info log file.
    InfoLog,
}

/// Generate the lock file path.
pub fn lock_file_path(db_path: &Path) -> PathBuf {
    db_path.join("LOCK")
}

/// Generate the current file path.
pub fn current_file_path(db_path: &Path) -> PathBuf {
    db_path.join("CURRENT")
}

/// Generate a manifest file path.
pub fn manifest_file_path(db_path: &Path, number: u64) -> PathBuf {
    db_path.join(format!("MANIFEST-{:06}", number))
}

/// Generate a log (WAL) file path.
pub fn log_file_path(db_path: &Path, number: u64) -> PathBuf {
    db_path.join(format!("{:06}.log", number))
}

/// Generate an SSTable file path.
///
/// All newly written tables use this name.
pub fn table_file_path(db_path: &Path, number: u64) -> PathBuf {
    db_path.join(format!("{:06}.ldb", number))
}

/// Generate the legacy SSTable file path.
///
/// Tables written by older releases carry this extension; they are
/// opened but never produced.
pub fn legacy_table_file_path(db_path: &Path, number: u64) -> PathBuf {
    db_path.join(format!("{:06}.sst", number))
}

/// Generate a temporary file path.
pub fn temp_file_path(db_path: &Path, number: u64) -> PathBuf {
    db_path.join(format!("{:06}.dbtmp", number))
}

/// Generate the info log file path.
pub fn info_log_path(db_path: &Path) -> PathBuf {
    db_path.join("LOG")
}

/// Generate the old info log file path.
pub fn old_info_log_path(db_path: &Path) -> PathBuf {
    db_path.join("LOG.old")
}

/// Parse a file name and return its type and number.
///
/// Returns `None` if the file name doesn't match any known pattern.
pub fn parse_file_name(name: &str) -> Option<(FileType, u64)> {
    // Fixed-name files first
    if name == "CURRENT" {
        return Some((FileType::Current, 0));
    }
    if name == "LOCK" {
        return Some((FileType::Lock, 0));
    }
    if name == "LOG" || name == "LOG.old" {
        return Some((FileType::InfoLog, 0));
    }

    // MANIFEST-NNNNNN
    if let Some(suffix) = name.strip_prefix("MANIFEST-") {
        let number = parse_decimal(suffix)?;
        return Some((FileType::Manifest, number));
    }

    // NNNNNN.ext
    let dot_pos = name.rfind('.')?;
    let (num_str, ext) = name.split_at(dot_pos);
    let number = parse_decimal(num_str)?;

    let file_type = match &ext[1..] {
        "log" => FileType::Log,
        "ldb" | "sst" => FileType::Table,
        "dbtmp" => FileType::Temp,
        _ => return None,
    };
    Some((file_type, number))
}

/// Parse an all-digits decimal number.
fn parse_decimal(s: &str) -> Option<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse::<u64>().ok()
}

/// List all (type, number) entries in the database directory.
pub fn list_db_files(db_path: &Path) -> std::io::Result<Vec<(FileType, u64)>> {
    let mut result = Vec::new();
    for entry in std::fs::read_dir(db_path)? {
        let entry = entry?;
        if let Some(name) = entry.file_name().to_str() {
            if let Some(parsed) = parse_file_name(name) {
                result.push(parsed);
            }
        }
    }
    Ok(result)
}
