//! Output filename derivation.

use std::path::{Path, PathBuf};

/// Reduce a job title to a filesystem-safe stem: alphanumerics, spaces,
/// `-` and `_` survive, everything else is dropped, and the result is
/// trimmed. An empty result means the caller should fall back to a
/// generated name.
pub fn sanitize_title(title: &str) -> String {
    title
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '-' | '_'))
        .collect::<String>()
        .trim()
        .to_string()
}

/// Fallback stem for jobs with unusable titles.
pub fn fallback_stem(job_id: &str) -> String {
    let prefix: String = job_id.chars().take(8).collect();
    format!("video_{prefix}")
}

/// Derive a collision-free `.mp4` output path: `<stem>.mp4`, then
/// `<stem> (1).mp4`, `<stem> (2).mp4`, ... with the smallest unused suffix.
pub fn derive_output_path(dir: &Path, title: &str, job_id: &str) -> PathBuf {
    let mut stem = sanitize_title(title);
    if stem.is_empty() {
        stem = fallback_stem(job_id);
    }

    let candidate = dir.join(format!("{stem}.mp4"));
    if !candidate.exists() {
        return candidate;
    }

    let mut counter = 1u32;
    loop {
        let candidate = dir.join(format!("{stem} ({counter}).mp4"));
        if !candidate.exists() {
            return candidate;
        }
        counter += 1;
    }
}
