//! multipart/mixed encoding for the Gmail batch endpoint.

use serde::Deserialize;
use tracing::warn;

use super::message::Message;
use super::{redact_response_body, ApiError, BatchItem, ItemFailure};

const CONTENT_ID_RESPONSE_PREFIX: &str = "response-";

/// Builds the request body: one `GET messages/{id}?format=full` part per id,
/// tagged with the id as its Content-ID.
pub fn build_batch_body(ids: &[String], boundary: &str, api_path: &str) -> String {
    let mut body = String::new();
    for id in ids {
        body.push_str(&format!("--{boundary}\r\n"));
        body.push_str("Content-Type: application/http\r\n");
        body.push_str(&format!("Content-ID: <{id}>\r\n"));
        body.push_str("\r\n");
        body.push_str(&format!(
            "GET {api_path}/users/me/messages/{id}?format=full\r\n"
        ));
        body.push_str("\r\n");
    }
    body.push_str(&format!("--{boundary}--\r\n"));
    body
}

pub fn boundary_from_content_type(content_type: &str) -> Option<String> {
    content_type
        .split(';')
        .filter_map(|part| {
            part.trim()
                .strip_prefix("boundary=")
                .map(|value| value.trim_matches('"').to_string())
        })
        .find(|value| !value.is_empty())
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

/// Splits a batch response into one [`BatchItem`] per sent id, in send order.
///
/// Parts are matched by Content-ID and fall back to position. Ids with no
/// matching part come back as failures, so every sent id has an outcome.
pub fn parse_batch_response(
    body: &str,
    content_type: &str,
    sent_ids: &[String],
) -> Result<Vec<BatchItem>, ApiError> {
    let boundary = boundary_from_content_type(content_type).ok_or_else(|| {
        ApiError::MalformedBatch(format!("no boundary in content-type '{content_type}'"))
    })?;
    let separator = format!("--{boundary}");

    let mut slots: Vec<Option<Result<Message, ItemFailure>>> = vec![None; sent_ids.len()];
    let mut part_index = 0usize;

    for part in body.split(separator.as_str()) {
        let trimmed = part.trim();
        if trimmed.is_empty() || trimmed.starts_with("--") {
            continue;
        }
        let position = part_index;
        part_index += 1;

        let normalized = trimmed.replace("\r\n", "\n");
        let slot = match content_id(&normalized) {
            Some(id) => sent_ids
                .iter()
                .enumerate()
                .position(|(idx, sent)| *sent == id && slots[idx].is_none()),
            None => (position < sent_ids.len() && slots[position].is_none()).then_some(position),
        };
        let Some(slot) = slot else {
            warn!(part = position, "batch response part does not match any sent id");
            continue;
        };

        slots[slot] = Some(classify_part(&normalized));
    }

    Ok(sent_ids
        .iter()
        .zip(slots)
        .map(|(id, slot)| BatchItem {
            id: id.clone(),
            outcome: slot.unwrap_or_else(|| {
                Err(ItemFailure {
                    status: None,
                    detail: "no response part for this id".to_string(),
                })
            }),
        })
        .collect())
}

fn content_id(part: &str) -> Option<String> {
    let headers = part.split("\n\n").next().unwrap_or("");
    headers.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if !name.trim().eq_ignore_ascii_case("content-id") {
            return None;
        }
        let value = value.trim().trim_start_matches('<').trim_end_matches('>');
        let value = value
            .strip_prefix(CONTENT_ID_RESPONSE_PREFIX)
            .unwrap_or(value);
        (!value.is_empty()).then(|| value.to_string())
    })
}

fn classify_part(part: &str) -> Result<Message, ItemFailure> {
    let Some(http_pos) = part.find("HTTP/1.1 ") else {
        return Err(ItemFailure {
            status: None,
            detail: "batch part has no HTTP status line".to_string(),
        });
    };

    let status_region = &part[http_pos..];
    let status_line_end = status_region.find('\n').unwrap_or(status_region.len());
    let status = status_region[..status_line_end]
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok());

    let after_status = &status_region[status_line_end..];
    let json_body = after_status
        .find('{')
        .map(|start| {
            let region = &after_status[start..];
            match find_json_object_end(region) {
                Some(end) => &region[..end],
                None => region.trim(),
            }
        })
        .unwrap_or("");

    if status != Some(200) {
        return Err(ItemFailure {
            status,
            detail: error_detail(json_body),
        });
    }

    serde_json::from_str::<Message>(json_body).map_err(|error| ItemFailure {
        status,
        detail: format!(
            "decode message: {error} body={}",
            redact_response_body(json_body)
        ),
    })
}

fn error_detail(json_body: &str) -> String {
    match serde_json::from_str::<ErrorEnvelope>(json_body) {
        Ok(envelope) => match (envelope.error.status, envelope.error.message) {
            (Some(status), Some(message)) => format!("{status}: {message}"),
            (None, Some(message)) => message,
            (Some(status), None) => status,
            (None, None) => redact_response_body(json_body),
        },
        Err(_) if json_body.is_empty() => "empty error response".to_string(),
        Err(_) => redact_response_body(json_body),
    }
}

/// Index one past the closing brace of the first JSON object in `s`.
fn find_json_object_end(s: &str) -> Option<usize> {
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, ch) in s.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        if in_string {
            match ch {
                '\\' => escape_next = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}
