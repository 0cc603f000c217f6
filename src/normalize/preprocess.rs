//! Shape fixes applied to raw notifications before normalization.

use crate::identity::{comment_id_from_url, commit_sha_from_url, issue_or_pull_request_number_from_url};
use serde_json::{json, Value};

/// Make a raw notification's subject resolvable.
///
/// Issue and pull request subjects get their `number` from the subject url;
/// commit subjects get their `sha` and carry the title as `message`. A
/// `latest_comment_url` that points at a comment becomes an embedded
/// `comment`; one that merely repeats the subject url is removed.
pub fn prepare_notification(mut raw: Value) -> Value {
    let Some(notification) = raw.as_object_mut() else {
        return raw;
    };
    let Some(subject) = notification.get_mut("subject").and_then(Value::as_object_mut) else {
        return raw;
    };

    let url = subject.get("url").and_then(Value::as_str).map(str::to_string);
    let subject_type = subject.get("type").and_then(Value::as_str).map(str::to_string);
    match subject_type.as_deref() {
        Some("Issue") | Some("PullRequest") => {
            if let Some(number) = url.as_deref().and_then(issue_or_pull_request_number_from_url) {
                subject.insert("number".into(), json!(number));
            }
        }
        Some("Commit") => {
            if let Some(title) = subject.remove("title") {
                subject.insert("message".into(), title);
            }
            if let Some(sha) = url.as_deref().and_then(commit_sha_from_url) {
                subject.insert("sha".into(), json!(sha));
            }
        }
        _ => {}
    }

    let latest_comment_url = subject
        .get("latest_comment_url")
        .and_then(Value::as_str)
        .map(str::to_string);
    let comment = match latest_comment_url {
        Some(comment_url) if url.as_deref() == Some(comment_url.as_str()) => {
            subject.remove("latest_comment_url");
            None
        }
        Some(comment_url) => comment_id_from_url(&comment_url)
            .map(|id| json!({"id": id, "url": comment_url})),
        None => None,
    };

    if let Some(comment) = comment {
        notification.insert("comment".into(), comment);
    }
    raw
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_subject_gets_number_and_comment() {
        let raw = json!({
            "id": "1",
            "subject": {
                "type": "Issue",
                "title": "Crash",
                "url": "https://api.github.com/repos/o/r/issues/42",
                "latest_comment_url": "https://api.github.com/repos/o/r/issues/comments/777",
            },
        });

        let prepared = prepare_notification(raw);
        assert_eq!(prepared["subject"]["number"], 42);
        assert_eq!(prepared["comment"]["id"], 777);
        assert_eq!(prepared["subject"]["title"], "Crash");
    }

    #[test]
    fn test_commit_subject() {
        let raw = json!({
            "id": "2",
            "subject": {
                "type": "Commit",
                "title": "Fix build",
                "url": "https://api.github.com/repos/o/r/commits/abc123",
                "latest_comment_url": "https://api.github.com/repos/o/r/commits/abc123",
            },
        });

        let prepared = prepare_notification(raw);
        assert_eq!(prepared["subject"]["sha"], "abc123");
        assert_eq!(prepared["subject"]["message"], "Fix build");
        assert!(prepared["subject"].get("title").is_none());
        assert!(prepared["subject"].get("latest_comment_url").is_none());
        assert!(prepared.get("comment").is_none());
    }

    #[test]
    fn test_without_subject_is_untouched() {
        let raw = json!({"id": "3"});
        assert_eq!(prepare_notification(raw.clone()), raw);
    }
}
