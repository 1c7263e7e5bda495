//! Ticket body parsing: turn the free-form Markdown issue body the host
//! adapter fetches into structured [`TicketMetadata`] plus flags, using the
//! same line-oriented scan the original implementation used for selecting a
//! task from a plan document.

use crate::types::{RepoKind, TicketFlags, TicketMetadata};

#[derive(Debug, Clone, Default)]
pub struct ParsedTicket {
    pub metadata: TicketMetadata,
    pub body: String,
}

/// Scan an issue body for the metadata block the host adapter expects:
///
/// ```text
/// Repo: backend
/// Severity: high
/// Source: user-report
/// Release: true
/// Allow-Parent-Changes: true
/// Allow-Script-Changes: false
/// Allow-Secrets: false
/// ```
///
/// Unrecognized lines are left in the body untouched. Keys are matched
/// case-insensitively; absent keys fall back to [`TicketMetadata::with_default_repo`].
pub fn parse_ticket_body(body: &str, default_repo: &str) -> ParsedTicket {
    let mut metadata = TicketMetadata::with_default_repo(default_repo);
    let mut remaining = Vec::new();

    for line in body.lines() {
        match split_key_value(line) {
            Some((key, value)) => match key.to_ascii_lowercase().as_str() {
                "repo" => metadata.repo = value.to_string(),
                "severity" => metadata.severity = Some(value.to_string()),
                "source" => metadata.source = Some(value.to_string()),
                "release" => metadata.release = parse_bool(value),
                "spec" | "spec-name" => metadata.spec_name = Some(value.to_string()),
                "task" | "task-line" => metadata.task_line = Some(value.to_string()),
                "allow-parent-changes" => metadata.flags.allow_parent_changes = parse_bool(value),
                "allow-script-changes" => metadata.flags.allow_script_changes = parse_bool(value),
                "allow-secrets" => metadata.flags.allow_secrets = parse_bool(value),
                "verify" => add_verify_command(&mut metadata, value),
                _ => remaining.push(line),
            },
            None => remaining.push(line),
        }
    }

    ParsedTicket {
        metadata,
        body: remaining.join("\n"),
    }
}

fn split_key_value(line: &str) -> Option<(&str, &str)> {
    let trimmed = line.trim_start_matches(['-', '*', ' ']).trim();
    let (key, value) = trimmed.split_once(':')?;
    let key = key.trim();
    if key.is_empty() || key.chars().any(char::is_whitespace) {
        return None;
    }
    Some((key, value.trim()))
}

fn parse_bool(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "true" | "yes" | "1")
}

fn add_verify_command(metadata: &mut TicketMetadata, value: &str) {
    let repo = metadata.repo.clone();
    metadata
        .verification
        .entry(repo)
        .or_default()
        .push(value.to_string());
}

/// Repo kind inferred from a ticket when the config does not list the
/// named repo at all: assume the parent repository.
pub fn default_repo_kind() -> RepoKind {
    RepoKind::Root
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_recognized_metadata_lines() {
        let body = "Repo: backend\nSeverity: high\nAllow-Secrets: true\n\nDo the thing.";
        let parsed = parse_ticket_body(body, "root");
        assert_eq!(parsed.metadata.repo, "backend");
        assert_eq!(parsed.metadata.severity.as_deref(), Some("high"));
        assert!(parsed.metadata.flags.allow_secrets);
        assert_eq!(parsed.body.trim(), "Do the thing.");
    }

    #[test]
    fn defaults_repo_when_absent() {
        let parsed = parse_ticket_body("Just fix the bug.", "root");
        assert_eq!(parsed.metadata.repo, "root");
        assert_eq!(parsed.metadata.flags, TicketFlags::default());
    }

    #[test]
    fn ignores_lines_that_are_not_key_value() {
        let body = "- Repo: backend\nThis: has: two colons\nplain text";
        let parsed = parse_ticket_body(body, "root");
        assert_eq!(parsed.metadata.repo, "backend");
        assert!(parsed.body.contains("plain text"));
    }

    #[test]
    fn captures_per_repo_verify_commands() {
        let body = "Repo: backend\nVerify: cargo build\nVerify: cargo test";
        let parsed = parse_ticket_body(body, "root");
        let verify = parsed.metadata.verification.get("backend").unwrap();
        assert_eq!(verify, &vec!["cargo build".to_string(), "cargo test".to_string()]);
    }
}
