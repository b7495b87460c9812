use anyhow::Result;
use serde::Serialize;

use crate::gmail::Message;
use crate::output::{CredentialStatus, FetchReportItem};
use crate::pager::ListingPage;

#[derive(Serialize)]
struct ListingView<'a> {
    ids: Vec<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    next_page_token: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    estimated_total: Option<u64>,
}

pub fn format_status(status: &CredentialStatus) -> Result<String> {
    Ok(serde_json::to_string_pretty(status)?)
}

pub fn format_listing(page: &ListingPage) -> Result<String> {
    let view = ListingView {
        ids: page.items.iter().map(|item| item.id.as_str()).collect(),
        next_page_token: page
            .continuation_token
            .as_deref()
            .filter(|token| !token.is_empty()),
        estimated_total: page.estimated_total,
    };
    Ok(serde_json::to_string_pretty(&view)?)
}

pub fn format_fetch_results(items: &[FetchReportItem]) -> Result<String> {
    Ok(serde_json::to_string_pretty(items)?)
}

pub fn format_message(message: &Message) -> Result<String> {
    Ok(serde_json::to_string_pretty(message)?)
}

#[cfg(test)]
mod tests {
    use super::format_listing;
    use crate::gmail::MessageRef;
    use crate::pager::ListingPage;

    #[test]
    fn listing_json_omits_empty_token() {
        let page = ListingPage {
            items: vec![MessageRef::new("m1")],
            continuation_token: Some(String::new()),
            estimated_total: None,
        };
        let rendered = format_listing(&page).expect("render listing");
        let value: serde_json::Value = serde_json::from_str(&rendered).expect("valid json");
        assert_eq!(value["ids"], serde_json::json!(["m1"]));
        assert!(value.get("next_page_token").is_none());
    }
}
