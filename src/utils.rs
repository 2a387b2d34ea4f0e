use crate::{errors::ContributeError, timeout::RemainingTime};

use fs_err::{create_dir_all, remove_file};
use once_cell::sync::Lazy;
use regex::Regex;
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

/// Extension of every circuit artifact.
pub const ARTIFACT_EXTENSION: &str = "zkey";

/// Extension of the local transcript of a computation.
pub const TRANSCRIPT_EXTENSION: &str = "log";

/// Matches the `Contribution Hash:` header followed by four indented lines of hex words.
static CONTRIBUTION_HASH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Contribution Hash:[ \t]*\r?\n((?:[ \t]+[0-9a-fA-F][0-9a-fA-F \t]*(?:\r?\n|$)){4})")
        .expect("the contribution hash pattern is valid")
});

pub fn remove_file_if_exists(file_path: &Path) -> Result<(), ContributeError> {
    if file_path.exists() {
        remove_file(file_path)?;
    }
    Ok(())
}

///
/// This function creates the `file_path`'s parent directories if it
/// does not already exists.
///
pub fn create_parent_directory(file_path: &Path) -> Result<(), ContributeError> {
    if let Some(parent) = file_path.parent() {
        if !parent.as_os_str().is_empty() {
            create_dir_all(parent)?;
        }
    }
    Ok(())
}

/// Returns the file name of an artifact, e.g. `circuit_00003.zkey`.
pub fn artifact_file_name(prefix: &str, suffix: &str) -> String {
    format!("{}_{}.{}", prefix, suffix, ARTIFACT_EXTENSION)
}

/// Returns the storage key of an artifact, e.g. `circuits/circuit/contributions/circuit_00003.zkey`.
pub fn artifact_storage_key(prefix: &str, suffix: &str) -> String {
    format!("circuits/{}/contributions/{}", prefix, artifact_file_name(prefix, suffix))
}

/// Returns the local path of the transcript written while computing an artifact.
pub fn transcript_path(directory: &Path, prefix: &str, suffix: &str) -> PathBuf {
    directory.join(format!("{}_{}.{}", prefix, suffix, TRANSCRIPT_EXTENSION))
}

///
/// Extracts the contribution hash from a computation transcript.
///
/// The hash is printed as four indented lines of hex words; the words are
/// joined into a single lowercase hex string.
///
pub fn extract_contribution_hash(transcript: &str) -> Option<String> {
    let captures = CONTRIBUTION_HASH.captures(transcript)?;
    let hash: String = captures
        .get(1)?
        .as_str()
        .chars()
        .filter(|c| c.is_ascii_hexdigit())
        .map(|c| c.to_ascii_lowercase())
        .collect();

    match hash.is_empty() {
        true => None,
        false => Some(hash),
    }
}

/// Formats a duration for display, e.g. `00d 00h 02m 05s`.
pub fn format_duration(duration: Duration) -> String {
    RemainingTime::from_duration(duration).to_string()
}
