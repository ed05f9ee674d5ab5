//! Version string comparison for update detection.

use std::cmp::Ordering;

/// Strip cask build suffixes: `"4.35.131,abcdef"` -> `"4.35.131"`.
pub fn strip_build_suffix(version: &str) -> &str {
    version.split(',').next().unwrap_or(version).trim()
}

/// Compare two version strings semantically
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let parse = |v: &str| -> Vec<u64> {
        v.split(['.', '-', '_'])
            .map_while(|s| {
                let digits: String = s.chars().take_while(char::is_ascii_digit).collect();
                digits.parse::<u64>().ok()
            })
            .collect()
    };
    let a_parts = parse(a);
    let b_parts = parse(b);

    // Compare version parts numerically
    for i in 0..a_parts.len().max(b_parts.len()) {
        let a_part = a_parts.get(i).unwrap_or(&0);
        let b_part = b_parts.get(i).unwrap_or(&0);
        match a_part.cmp(b_part) {
            Ordering::Equal => continue,
            other => return other,
        }
    }

    // Fall back to lexicographic
    a.cmp(b)
}

/// Whether `latest` is strictly newer than `installed`.
///
/// Unknown versions on either side never count as newer, nor does the
/// `"latest"` marker used by auto-updating casks.
pub fn is_newer(installed: &str, latest: &str) -> bool {
    let latest = strip_build_suffix(latest);
    if latest.is_empty() || latest.eq_ignore_ascii_case("latest") {
        return false;
    }
    let installed = strip_build_suffix(installed);
    if installed.is_empty() {
        return false;
    }
    compare_versions(installed, latest) == Ordering::Less
}
