//! Branch naming and input validation
//!
//! Every user-controlled string is validated or sanitized before it is
//! passed to git as a ref name.

use codehive_core::{CodehiveError, Result};

/// Turn a feature title into a branch-safe slug
///
/// Lowercase, whitespace becomes `-`, anything outside `[a-z0-9-]` is
/// dropped, hyphen runs collapse and leading/trailing hyphens are trimmed.
/// Applying it twice yields the same slug.
pub fn sanitize_slug(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut last_hyphen = false;

    for c in title.to_lowercase().chars() {
        let c = if c.is_whitespace() { '-' } else { c };
        match c {
            'a'..='z' | '0'..='9' => {
                slug.push(c);
                last_hyphen = false;
            }
            '-' if !last_hyphen => {
                slug.push('-');
                last_hyphen = true;
            }
            _ => {}
        }
    }

    slug.trim_matches('-').to_string()
}

/// `feature/cycle-{id}-{slug}`, or `feature/cycle-{id}` when the title has no usable characters
pub fn feature_branch_name(cycle_id: &str, title: &str) -> String {
    let slug = sanitize_slug(title);
    if slug.is_empty() {
        format!("feature/cycle-{}", cycle_id)
    } else {
        format!("feature/cycle-{}-{}", cycle_id, slug)
    }
}

/// `checkpoint/{tag}-phase-start`
pub fn checkpoint_branch_name(phase_tag: &str) -> String {
    format!("checkpoint/{}-phase-start", phase_tag)
}

/// Validate an identifier (cycle id, phase tag, holder name)
pub fn validate_identifier<'a>(input: &'a str, context: &str) -> Result<&'a str> {
    if input.is_empty() {
        return Err(CodehiveError::Validation(format!(
            "{} cannot be empty",
            context
        )));
    }
    if input
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    {
        Ok(input)
    } else {
        Err(CodehiveError::Validation(format!(
            "{} contains unsafe characters: '{}'. Only alphanumeric, '_', '-', '.' are allowed.",
            context, input
        )))
    }
}

/// Validate a branch name against the subset of git ref rules we rely on
pub fn validate_branch_name(name: &str) -> Result<&str> {
    let invalid = |reason: &str| {
        Err(CodehiveError::Validation(format!(
            "Invalid branch name '{}': {}",
            name, reason
        )))
    };

    if name.is_empty() {
        return invalid("empty");
    }
    if name.starts_with('-') || name.starts_with('/') || name.ends_with('/') {
        return invalid("bad leading or trailing character");
    }
    if name.ends_with(".lock") || name.ends_with('.') {
        return invalid("bad suffix");
    }
    if name.contains("..") || name.contains("//") || name.contains("@{") {
        return invalid("forbidden sequence");
    }
    if name
        .chars()
        .any(|c| c.is_control() || c.is_whitespace() || "~^:?*[\\".contains(c))
    {
        return invalid("forbidden character");
    }
    Ok(name)
}
