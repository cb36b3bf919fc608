//! Fork branch naming
//!
//! A save that cannot be merged lands on a new branch. Its name is the
//! sanitized base plus a suffix, numbered `_2`, `_3`, ... until it no
//! longer collides with an existing branch.

/// Replace characters that are awkward in branch names
#[must_use]
pub fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c == '-' || c.is_whitespace() { '_' } else { c })
        .collect()
}

/// First fork name for `base` that is not in `existing`
#[must_use]
pub fn fork_name_candidate<S: AsRef<str>>(base: &str, suffix: &str, existing: &[S]) -> String {
    let stem = sanitize(&format!("{base}{suffix}"));
    let taken = |name: &str| existing.iter().any(|b| b.as_ref() == name);

    if !taken(&stem) {
        return stem;
    }
    (2_u64..)
        .map(|n| format!("{stem}_{n}"))
        .find(|name| !taken(name))
        .unwrap_or(stem)
}
