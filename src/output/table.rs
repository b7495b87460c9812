use chrono::{DateTime, Utc};
use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

use crate::gmail::Message;
use crate::output::{CredentialStatus, FetchReportItem};
use crate::pager::ListingPage;

const ID_WIDTH: usize = 16;
const FROM_WIDTH: usize = 24;
const SUBJECT_WIDTH: usize = 56;
const DATE_WIDTH: usize = 12;

pub fn format_status(status: &CredentialStatus) -> String {
    let mut out = String::new();
    out.push_str(&format!("Identity: {}\n", status.identity_key));
    out.push_str(&format!("State:    {}\n", colorize_state(&status.state)));
    if let Some(email) = &status.email {
        out.push_str(&format!("Email:    {email}\n"));
    }
    if let Some(expires_at) = &status.expires_at {
        out.push_str(&format!("Expires:  {expires_at}\n"));
    }
    out.push_str(&format!(
        "Refresh:  {}\n",
        if status.has_refresh_token { "yes" } else { "no" }
    ));
    if !status.scopes.is_empty() {
        out.push_str("Scopes:\n");
        for scope in &status.scopes {
            out.push_str(&format!("  {scope}\n"));
        }
    }
    out
}

pub fn format_listing(page: &ListingPage) -> String {
    if page.items.is_empty() && !page.has_continuation() {
        return "No messages found.".to_string();
    }

    let mut out = String::new();
    out.push_str(&format!("{:<id$}  Thread\n", "ID", id = ID_WIDTH));
    out.push_str(&format!("{}  {}\n", "-".repeat(ID_WIDTH), "-".repeat(ID_WIDTH)));
    for item in &page.items {
        out.push_str(&format!(
            "{:<id$}  {}\n",
            item.id,
            item.thread_id.as_deref().unwrap_or("-"),
            id = ID_WIDTH
        ));
    }
    if let Some(total) = page.estimated_total {
        out.push_str(&format!("\n~{total} matching messages\n"));
    }
    if page.has_continuation() {
        out.push_str("More pages available; pass --all to list every page\n");
    }
    out
}

pub fn format_fetch_results(items: &[FetchReportItem]) -> String {
    if items.is_empty() {
        return "No messages requested.".to_string();
    }

    let mut out = String::new();
    out.push_str(&format!(
        "{:<id$}  {:<from$}  {:<subject$}  {:<date$}\n",
        "ID",
        "From",
        "Subject",
        "Date",
        id = ID_WIDTH,
        from = FROM_WIDTH,
        subject = SUBJECT_WIDTH,
        date = DATE_WIDTH
    ));
    out.push_str(&format!(
        "{}  {}  {}  {}\n",
        "-".repeat(ID_WIDTH),
        "-".repeat(FROM_WIDTH),
        "-".repeat(SUBJECT_WIDTH),
        "-".repeat(DATE_WIDTH)
    ));

    for item in items {
        let id = pad_to_width(&truncate_for_width(&item.id, ID_WIDTH), ID_WIDTH);
        match (&item.message, &item.error) {
            (Some(message), _) => {
                let from = truncate_for_width(message.from().unwrap_or("(unknown)"), FROM_WIDTH);
                let subject =
                    truncate_for_width(message.subject().unwrap_or("(no subject)"), SUBJECT_WIDTH);
                let date = message
                    .received_at()
                    .or_else(|| message.date())
                    .map(|dt| relative_date(dt, Utc::now()))
                    .unwrap_or_else(|| "-".to_string());
                out.push_str(&format!(
                    "{id}  {}  {}  {date}\n",
                    pad_to_width(&from, FROM_WIDTH),
                    pad_to_width(&subject, SUBJECT_WIDTH),
                ));
            }
            (None, error) => {
                out.push_str(&format!(
                    "{id}  \u{1b}[31mERROR\u{1b}[0m {}\n",
                    error.as_deref().unwrap_or("unknown failure")
                ));
            }
        }
    }

    let failed = items.iter().filter(|item| item.message.is_none()).count();
    out.push_str(&format!(
        "\n{} fetched, {failed} failed\n",
        items.len() - failed
    ));
    out
}

pub fn format_message(message: &Message) -> String {
    let mut out = String::new();
    out.push_str(&format!("ID: {}\n", message.id));
    if let Some(thread_id) = &message.thread_id {
        out.push_str(&format!("Thread: {thread_id}\n"));
    }
    out.push_str(&format!(
        "Subject: {}\n",
        message.subject().unwrap_or("(no subject)")
    ));
    out.push_str(&format!("From: {}\n", message.from().unwrap_or("(unknown)")));
    if let Some(to) = message.to() {
        out.push_str(&format!("To: {to}\n"));
    }
    if let Some(date) = message.received_at().or_else(|| message.date()) {
        out.push_str(&format!(
            "Date: {} ({})\n",
            date.to_rfc3339(),
            relative_date(date, Utc::now())
        ));
    }
    if !message.label_ids.is_empty() {
        out.push_str(&format!("Labels: {}\n", message.label_ids.join(", ")));
    }
    if message.has_attachments() {
        out.push_str("Attachments: yes\n");
    }

    out.push('\n');
    out.push_str("Body\n");
    out.push_str("----\n");

    let body = message
        .body_text()
        .or_else(|| message.snippet_text())
        .unwrap_or_else(|| "(empty)".to_string());
    out.push_str(&body);
    out.push('\n');
    out
}

fn colorize_state(state: &str) -> String {
    match state {
        "authorized" => format!("\u{1b}[32m{state}\u{1b}[0m"),
        "expired" => format!("\u{1b}[33m{state}\u{1b}[0m"),
        _ => format!("\u{1b}[31m{state}\u{1b}[0m"),
    }
}

fn relative_date(at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let delta = now.signed_duration_since(at);
    if delta.num_seconds() < 0 {
        return "in future".to_string();
    }
    if delta.num_minutes() < 1 {
        return "just now".to_string();
    }
    if delta.num_hours() < 1 {
        return format!("{}m ago", delta.num_minutes());
    }
    if delta.num_hours() < 24 {
        return format!("{}h ago", delta.num_hours());
    }
    if delta.num_days() == 1 {
        return "yesterday".to_string();
    }
    if delta.num_days() < 7 {
        return format!("{}d ago", delta.num_days());
    }
    at.format("%Y-%m-%d").to_string()
}

/// `format!` pads by char count, which misaligns wide glyphs.
fn pad_to_width(value: &str, width: usize) -> String {
    let current = UnicodeWidthStr::width(value);
    if current >= width {
        return value.to_string();
    }
    format!("{value}{}", " ".repeat(width - current))
}

fn truncate_for_width(value: &str, max_width: usize) -> String {
    if UnicodeWidthStr::width(value) <= max_width {
        return value.to_string();
    }

    if max_width <= 1 {
        return "…".to_string();
    }

    let mut out = String::new();
    let mut width = 0usize;
    for c in value.chars() {
        let cw = UnicodeWidthChar::width(c).unwrap_or(0);
        if width + cw + 1 > max_width {
            break;
        }
        out.push(c);
        width += cw;
    }
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};
    use unicode_width::UnicodeWidthStr;

    use crate::credentials::CredentialState;
    use crate::gmail::{Message, MessageRef};
    use crate::output::{CredentialStatus, FetchReportItem};
    use crate::pager::ListingPage;

    use super::{
        format_fetch_results, format_listing, format_message, format_status, relative_date,
        truncate_for_width,
    };

    fn sample_message() -> Message {
        serde_json::from_value(serde_json::json!({
            "id": "18e1234abcd",
            "threadId": "18e1234abcd",
            "labelIds": ["INBOX"],
            "snippet": "Preview text",
            "payload": {
                "mimeType": "text/plain",
                "headers": [
                    { "name": "Subject", "value": "A very long subject line that should be truncated in table output because it exceeds width" },
                    { "name": "From", "value": "Sender Name <sender@example.com>" }
                ],
                "body": { "data": "SGVsbG8gdGVhbSE" }
            },
            "internalDate": (Utc::now() - Duration::hours(2)).timestamp_millis().to_string()
        }))
        .expect("message json")
    }

    #[test]
    fn fetch_table_has_headers_and_failures() {
        let items = vec![
            FetchReportItem {
                id: "18e1234abcd".to_string(),
                message: Some(sample_message()),
                error: None,
            },
            FetchReportItem {
                id: "gone".to_string(),
                message: None,
                error: Some("message gone: status=404 not found".to_string()),
            },
        ];
        let rendered = format_fetch_results(&items);
        assert!(rendered.contains("Subject"));
        assert!(rendered.contains("2h ago"));
        assert!(rendered.contains('…'));
        assert!(rendered.contains("status=404"));
        assert!(rendered.contains("1 fetched, 1 failed"));
    }

    #[test]
    fn full_message_output_contains_body() {
        let rendered = format_message(&sample_message());
        assert!(rendered.contains("Hello team!"));
        assert!(rendered.contains("Labels: INBOX"));
    }

    #[test]
    fn listing_hints_at_more_pages() {
        let page = ListingPage {
            items: vec![MessageRef::new("m1")],
            continuation_token: Some("tok-2".to_string()),
            estimated_total: Some(40),
        };
        let rendered = format_listing(&page);
        assert!(rendered.contains("m1"));
        assert!(rendered.contains("--all"));
        assert!(rendered.contains("~40 matching"));
        assert_eq!(format_listing(&ListingPage::default()), "No messages found.");
    }

    #[test]
    fn status_without_credential() {
        let status = CredentialStatus::new("user-1", CredentialState::NoCredential, None);
        let rendered = format_status(&status);
        assert!(rendered.contains("no_credential"));
        assert!(rendered.contains("Refresh:  no"));
    }

    #[test]
    fn wide_characters_are_truncated_by_display_width() {
        let truncated = truncate_for_width("日本語の件名がとても長い", 10);
        assert!(UnicodeWidthStr::width(truncated.as_str()) <= 10);
        assert!(truncated.ends_with('…'));
    }

    #[test]
    fn relative_dates() {
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap();
        assert_eq!(relative_date(now - Duration::minutes(5), now), "5m ago");
        assert_eq!(relative_date(now - Duration::days(1), now), "yesterday");
        assert_eq!(relative_date(now - Duration::days(30), now), "2026-02-08");
    }
}
