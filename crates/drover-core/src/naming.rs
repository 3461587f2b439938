//! Filename normalization and similarity scoring.
//!
//! Inventory indexes and link repair both key on normalized filenames, so
//! every comparison in the crate goes through this module.

use regex::Regex;
use std::sync::LazyLock;

/// Extension families treated as interchangeable during matching.
///
/// A record pointing at `photo.jpeg` may be repaired against an object
/// named `photo.jpg`; the family name is the canonical member.
const EXTENSION_FAMILIES: &[(&str, &[&str])] = &[
    ("jpg", &["jpg", "jpeg", "jpe", "jfif"]),
    ("tif", &["tif", "tiff"]),
    ("heic", &["heic", "heif"]),
    ("mpg", &["mpg", "mpeg"]),
    ("mp4", &["mp4", "m4v"]),
    ("html", &["html", "htm"]),
    ("yaml", &["yaml", "yml"]),
];

/// Regex splitting a stem into comparable tokens.
static TOKEN_SPLIT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^a-z0-9]+").unwrap());

/// Normalize a filename for index keys: lowercase, trimmed, with the
/// extension mapped to its family canonical form.
///
/// # Examples
///
/// ```
/// use drover_core::naming::normalize_filename;
///
/// assert_eq!(normalize_filename("Holiday Photo.JPEG"), "holiday photo.jpg");
/// assert_eq!(normalize_filename("  report.PDF "), "report.pdf");
/// ```
pub fn normalize_filename(filename: &str) -> String {
    let trimmed = filename.trim().to_lowercase();
    match trimmed.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => {
            format!("{}.{}", stem, extension_family(ext))
        }
        _ => trimmed,
    }
}

/// The stem of a filename (everything before the final dot), lowercased.
pub fn file_stem(filename: &str) -> String {
    let trimmed = filename.trim().to_lowercase();
    match trimmed.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem.to_string(),
        _ => trimmed,
    }
}

/// The extension of a filename, lowercased, without the dot.
pub fn extension(filename: &str) -> Option<String> {
    let trimmed = filename.trim().to_lowercase();
    match trimmed.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => Some(ext.to_string()),
        _ => None,
    }
}

/// Map an extension to its family canonical form.
///
/// Unknown extensions are their own family.
pub fn extension_family(ext: &str) -> String {
    let lower = ext.to_lowercase();
    for (family, members) in EXTENSION_FAMILIES {
        if members.contains(&lower.as_str()) {
            return (*family).to_string();
        }
    }
    lower
}

/// Check whether two filenames belong to the same extension family.
pub fn same_extension_family(a: &str, b: &str) -> bool {
    match (extension(a), extension(b)) {
        (Some(ea), Some(eb)) => extension_family(&ea) == extension_family(&eb),
        (None, None) => true,
        _ => false,
    }
}

/// Score the similarity of two filenames in [0, 1].
///
/// Scoring ladder: identical normalized names score 1.0; one stem
/// containing the other scores 0.8; otherwise the Jaccard overlap of the
/// stem tokens. Extensions are deliberately excluded — family
/// compatibility is checked separately.
pub fn filename_similarity(a: &str, b: &str) -> f64 {
    let stem_a = file_stem(a);
    let stem_b = file_stem(b);

    if stem_a == stem_b {
        return 1.0;
    }

    if !stem_a.is_empty()
        && !stem_b.is_empty()
        && (stem_a.contains(&stem_b) || stem_b.contains(&stem_a))
    {
        return 0.8;
    }

    let tokens_a: std::collections::HashSet<&str> = TOKEN_SPLIT
        .split(&stem_a)
        .filter(|t| !t.is_empty())
        .collect();
    let tokens_b: std::collections::HashSet<&str> = TOKEN_SPLIT
        .split(&stem_b)
        .filter(|t| !t.is_empty())
        .collect();

    let union = tokens_a.union(&tokens_b).count();
    if union == 0 {
        return 0.0;
    }
    let intersection = tokens_a.intersection(&tokens_b).count();
    intersection as f64 / union as f64
}
