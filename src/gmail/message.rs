use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

const HTML_TEXT_WIDTH: usize = 120;

/// Id pair returned by `messages.list`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MessageRef {
    pub id: String,
    #[serde(default)]
    pub thread_id: Option<String>,
}

impl MessageRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            thread_id: None,
        }
    }
}

/// A fully hydrated message (`format=full`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub label_ids: Vec<String>,
    #[serde(default)]
    pub snippet: Option<String>,
    #[serde(default)]
    pub payload: Option<Payload>,
    #[serde(default)]
    pub internal_date: Option<String>,
    #[serde(default)]
    pub history_id: Option<String>,
    #[serde(default)]
    pub size_estimate: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Payload {
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub headers: Vec<Header>,
    #[serde(default)]
    pub body: Option<Body>,
    #[serde(default)]
    pub parts: Vec<Payload>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Body {
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub attachment_id: Option<String>,
}

impl Message {
    /// Case-insensitive lookup on the top-level headers.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.payload
            .as_ref()?
            .headers
            .iter()
            .find(|header| header.name.eq_ignore_ascii_case(name))
            .map(|header| header.value.as_str())
    }

    pub fn subject(&self) -> Option<&str> {
        self.header("Subject")
    }

    pub fn from(&self) -> Option<&str> {
        self.header("From")
    }

    pub fn to(&self) -> Option<&str> {
        self.header("To")
    }

    pub fn date(&self) -> Option<DateTime<Utc>> {
        self.header("Date").and_then(|raw| {
            DateTime::parse_from_rfc2822(raw.trim())
                .ok()
                .map(|dt| dt.with_timezone(&Utc))
        })
    }

    /// `internalDate` is milliseconds since the epoch, sent as a string.
    pub fn received_at(&self) -> Option<DateTime<Utc>> {
        self.internal_date
            .as_deref()
            .and_then(|ms| ms.parse::<i64>().ok())
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
    }

    pub fn snippet_text(&self) -> Option<String> {
        self.snippet.as_deref().map(html_entity_decode)
    }

    pub fn is_unread(&self) -> bool {
        self.label_ids.iter().any(|label| label == "UNREAD")
    }

    pub fn has_attachments(&self) -> bool {
        self.payload.as_ref().is_some_and(payload_has_attachments)
    }

    pub fn body_html(&self) -> Option<String> {
        let (_, html) = self.body_parts();
        html
    }

    /// First text/plain leaf, or a plain rendering of the HTML body.
    pub fn body_text(&self) -> Option<String> {
        let (text, html) = self.body_parts();
        text.or_else(|| {
            let html = html?;
            // html2text can panic on pathological markup.
            let rendered = std::panic::catch_unwind(|| {
                html2text::from_read(html.as_bytes(), HTML_TEXT_WIDTH)
                    .lines()
                    .map(str::trim_end)
                    .collect::<Vec<_>>()
                    .join("\n")
                    .trim()
                    .to_string()
            })
            .ok()?;
            (!rendered.is_empty()).then_some(rendered)
        })
    }

    fn body_parts(&self) -> (Option<String>, Option<String>) {
        let mut text = None;
        let mut html = None;
        if let Some(payload) = &self.payload {
            collect_body_parts(payload, &mut text, &mut html);
        }
        (text, html)
    }
}

fn collect_body_parts(payload: &Payload, text: &mut Option<String>, html: &mut Option<String>) {
    let mime_type = payload
        .mime_type
        .as_deref()
        .unwrap_or("")
        .to_ascii_lowercase();

    if let Some(data) = payload.body.as_ref().and_then(|body| body.data.as_deref()) {
        if !data.is_empty() {
            if let Some(decoded) = decode_body_data(data) {
                if mime_type == "text/plain" && text.is_none() {
                    *text = Some(decoded);
                } else if mime_type == "text/html" && html.is_none() {
                    *html = Some(decoded);
                }
            }
        }
    }

    for part in &payload.parts {
        collect_body_parts(part, text, html);
    }
}

/// Gmail sends base64url, usually unpadded.
fn decode_body_data(data: &str) -> Option<String> {
    let bytes = URL_SAFE_NO_PAD
        .decode(data.trim_end_matches('='))
        .or_else(|_| URL_SAFE.decode(data))
        .ok()?;
    String::from_utf8(bytes).ok()
}

fn payload_has_attachments(payload: &Payload) -> bool {
    if payload
        .filename
        .as_deref()
        .is_some_and(|name| !name.is_empty())
    {
        return true;
    }
    payload.parts.iter().any(payload_has_attachments)
}

fn html_entity_decode(s: &str) -> String {
    s.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&#x27;", "'")
        .replace("&nbsp;", " ")
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::Message;

    fn multipart_message() -> Message {
        serde_json::from_value(json!({
            "id": "18e1234abcd",
            "threadId": "18e1234abcd",
            "labelIds": ["INBOX", "UNREAD"],
            "snippet": "Hello &amp; welcome",
            "payload": {
                "mimeType": "multipart/mixed",
                "headers": [
                    { "name": "Subject", "value": "Quarterly Review" },
                    { "name": "From", "value": "Alex Smith <alex@example.com>" },
                    { "name": "to", "value": "team@example.com" },
                    { "name": "Date", "value": "Thu, 01 Jan 2026 12:00:00 +0000" }
                ],
                "body": { "size": 0 },
                "parts": [
                    {
                        "mimeType": "multipart/alternative",
                        "parts": [
                            { "mimeType": "text/plain", "body": { "size": 11, "data": "SGVsbG8gdGVhbSE" } },
                            { "mimeType": "text/html", "body": { "size": 30, "data": "PHA-SGVsbG8gPGI-dGVhbTwvYj4hPC9wPg" } }
                        ]
                    },
                    {
                        "mimeType": "application/pdf",
                        "filename": "report.pdf",
                        "body": { "size": 50000, "attachmentId": "att-1" }
                    }
                ]
            },
            "internalDate": "1735732800000",
            "historyId": "12345",
            "sizeEstimate": 5000
        }))
        .expect("deserialize message")
    }

    #[test]
    fn headers_are_case_insensitive() {
        let message = multipart_message();
        assert_eq!(message.subject(), Some("Quarterly Review"));
        assert_eq!(message.to(), Some("team@example.com"));
        assert_eq!(message.header("FROM"), Some("Alex Smith <alex@example.com>"));
        assert!(message.header("Cc").is_none());
    }

    #[test]
    fn nested_bodies_and_attachments_are_found() {
        let message = multipart_message();
        assert_eq!(message.body_text().as_deref(), Some("Hello team!"));
        assert!(message.body_html().expect("html body").contains("<b>team</b>"));
        assert!(message.has_attachments());
        assert!(message.is_unread());
        assert_eq!(message.snippet_text().as_deref(), Some("Hello & welcome"));
    }

    #[test]
    fn dates_are_parsed() {
        let message = multipart_message();
        assert_eq!(
            message.received_at().map(|dt| dt.timestamp()),
            Some(1_735_732_800)
        );
        assert_eq!(message.date().map(|dt| dt.timestamp()), Some(1_767_268_800));
    }

    #[test]
    fn html_only_message_renders_text() {
        let message: Message = serde_json::from_value(json!({
            "id": "html-only",
            "payload": {
                "mimeType": "text/html",
                "body": { "data": "PHA-SGVsbG8gPGI-dGVhbTwvYj4hPC9wPg" }
            }
        }))
        .expect("deserialize message");

        let text = message.body_text().expect("rendered text");
        assert!(text.contains("Hello"));
        assert!(!text.contains("<p>"));
        assert!(!message.has_attachments());
    }

    #[test]
    fn minimal_message_has_no_body() {
        let message: Message =
            serde_json::from_value(json!({ "id": "bare" })).expect("deserialize message");
        assert!(message.body_text().is_none());
        assert!(message.subject().is_none());
        assert!(message.received_at().is_none());
    }
}
