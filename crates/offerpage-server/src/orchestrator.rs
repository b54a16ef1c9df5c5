use std::collections::HashMap;
use std::sync::Arc;

use offerpage_config::Config;
use offerpage_contracts::{MergedResult, OfferRequest};
use offerpage_kernel::{
    build_address, encoded_visitor_cookie_name, merge_offers, parse_cookies, resolve_visitor,
    SessionId, TARGET_COOKIE_NAME,
};
use thiserror::Error;
use tracing::{error, info};

use crate::target::{OfferCall, OfferProvider, TargetError};

pub const FIRST_CONSUMER: &str = "first";
pub const SECOND_CONSUMER: &str = "second";

#[derive(Debug, Error)]
pub enum PageError {
    #[error("personalization service failure: {source}")]
    Personalization {
        consumer_id: &'static str,
        #[source]
        source: TargetError,
    },
}

/// Per-deployment values the orchestrator needs for every page view.
#[derive(Debug, Clone)]
pub struct PageSettings {
    pub organization_id: String,
    pub shared_mbox: String,
    pub extra_mbox: String,
}

impl PageSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            organization_id: cfg.target.organization_id.clone(),
            shared_mbox: cfg.page.shared_mbox.clone(),
            extra_mbox: cfg.page.extra_mbox.clone(),
        }
    }
}

/// What the orchestrator reads from one inbound request.
#[derive(Debug, Clone, Default)]
pub struct PageInputs {
    pub host: String,
    pub original_url: String,
    pub cookies: HashMap<String, String>,
}

impl PageInputs {
    pub fn new<'a>(
        host: &str,
        original_url: &str,
        cookie_headers: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        Self {
            host: host.to_string(),
            original_url: original_url.to_string(),
            cookies: parse_cookies(cookie_headers),
        }
    }
}

/// Issues the first (shared mbox) and second (shared + extra mbox) offer
/// calls concurrently under one session and one visitor, then merges them.
/// Either call failing fails the page; with two failures the first call's
/// error is returned.
pub async fn handle_page(
    provider: &dyn OfferProvider,
    settings: &PageSettings,
    inputs: &PageInputs,
) -> Result<MergedResult, PageError> {
    let visitor_cookie = inputs
        .cookies
        .get(&encoded_visitor_cookie_name(&settings.organization_id))
        .map(String::as_str);
    let target_cookie = inputs.cookies.get(TARGET_COOKIE_NAME).cloned();

    let visitor = Arc::new(resolve_visitor(visitor_cookie, &settings.organization_id));
    let session_id = SessionId::new();
    let address = build_address(&inputs.host, &inputs.original_url);

    let first_request = OfferRequest::for_mboxes(&address, &[settings.shared_mbox.as_str()]);
    let second_request = OfferRequest::for_mboxes(
        &address,
        &[settings.shared_mbox.as_str(), settings.extra_mbox.as_str()],
    );

    info!(
        session_id = %session_id,
        visitor_assigned = visitor.is_assigned(),
        url = %address.url,
        "fetching page offers"
    );

    let first = provider.get_offers(OfferCall {
        request: first_request,
        target_cookie: target_cookie.clone(),
        session_id,
        visitor: Arc::clone(&visitor),
        consumer_id: FIRST_CONSUMER,
    });
    let second = provider.get_offers(OfferCall {
        request: second_request,
        target_cookie,
        session_id,
        visitor,
        consumer_id: SECOND_CONSUMER,
    });
    let (first, second) = tokio::join!(first, second);

    let first = first.map_err(|source| failed(FIRST_CONSUMER, &session_id, source));
    let second = second.map_err(|source| failed(SECOND_CONSUMER, &session_id, source));
    Ok(merge_offers(first?, second?))
}

fn failed(consumer_id: &'static str, session_id: &SessionId, source: TargetError) -> PageError {
    error!(
        consumer_id,
        session_id = %session_id,
        error = %source,
        "offer call failed"
    );
    PageError::Personalization {
        consumer_id,
        source,
    }
}
