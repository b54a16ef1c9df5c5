use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use offerpage_contracts::{
    Address, MergedResult, OfferResponse, OrgVisitorState, SupplementalDataIds, TargetCookie,
    VisitorState,
};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::Serialize;
use uuid::Uuid;

pub const TARGET_COOKIE_NAME: &str = "mbox";
pub const SESSION_ENTRY: &str = "session";
pub const PROFILE_ENTRY: &str = "PC";
pub const SESSION_LIFETIME_SECS: i64 = 1860;
pub const PROFILE_LIFETIME_SECS: i64 = 63_244_800;

pub const ORGANIZATION_ID_PLACEHOLDER: &str = "${organizationId}";
pub const VISITOR_STATE_PLACEHOLDER: &str = "${visitorState}";
pub const CONTENT_PLACEHOLDER: &str = "${content}";

// Same characters `encodeURIComponent` leaves untouched.
const URI_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// Per-request token correlating the calls of one page view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Supplemental data id shared by every call made under this session.
    pub fn supplemental_data_id(&self) -> String {
        let hex = self.0.simple().to_string().to_uppercase();
        format!("{}-{}", &hex[..16], &hex[16..])
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

/// Durable visitor identity for one browser. Built once per request and
/// never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisitorHandle {
    organization_id: String,
    marketing_cloud_visitor_id: Option<String>,
}

impl VisitorHandle {
    pub fn organization_id(&self) -> &str {
        &self.organization_id
    }

    pub fn marketing_cloud_visitor_id(&self) -> Option<&str> {
        self.marketing_cloud_visitor_id.as_deref()
    }

    /// False until the remote service has handed this browser an id.
    pub fn is_assigned(&self) -> bool {
        self.marketing_cloud_visitor_id.is_some()
    }
}

/// Builds the visitor handle from the identity cookie value, if any.
/// Missing or unreadable cookies yield an unassigned handle.
pub fn resolve_visitor(cookie_value: Option<&str>, organization_id: &str) -> VisitorHandle {
    VisitorHandle {
        organization_id: organization_id.to_string(),
        marketing_cloud_visitor_id: cookie_value.and_then(parse_identity_cookie),
    }
}

// `<flags>|MCIDTS|18000|MCMID|<id>|...`
fn parse_identity_cookie(value: &str) -> Option<String> {
    let tokens: Vec<&str> = value.split('|').collect();
    tokens
        .windows(2)
        .find(|pair| pair[0] == "MCMID")
        .map(|pair| pair[1].trim())
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

pub fn visitor_cookie_name(organization_id: &str) -> String {
    format!("AMCV_{organization_id}")
}

/// Name the identity cookie is stored under in the browser's cookie jar.
pub fn encoded_visitor_cookie_name(organization_id: &str) -> String {
    encode_uri_component(&visitor_cookie_name(organization_id))
}

pub fn encode_uri_component(input: &str) -> String {
    utf8_percent_encode(input, URI_COMPONENT).to_string()
}

/// Parses `Cookie` header values into name/value pairs. The first occurrence
/// of a name wins; values are percent-decoded when they decode cleanly.
pub fn parse_cookies<'a>(headers: impl IntoIterator<Item = &'a str>) -> HashMap<String, String> {
    let mut jar = HashMap::new();
    for header in headers {
        for pair in header.split(';') {
            let Some((name, value)) = pair.split_once('=') else {
                continue;
            };
            let name = name.trim();
            if name.is_empty() || jar.contains_key(name) {
                continue;
            }
            let mut value = value.trim();
            if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
                value = &value[1..value.len() - 1];
            }
            let decoded = percent_decode_str(value)
                .decode_utf8()
                .map(|v| v.into_owned())
                .unwrap_or_else(|_| value.to_string());
            jar.insert(name.to_string(), decoded);
        }
    }
    jar
}

pub fn build_address(host: &str, original_path: &str) -> Address {
    Address {
        url: format!("{host}{original_path}"),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetCookieEntry {
    pub name: String,
    pub value: String,
    pub expires: i64,
}

/// Decodes `name#value#expiry|...`, dropping malformed and expired entries.
pub fn parse_target_cookie(value: &str, now: i64) -> Vec<TargetCookieEntry> {
    value
        .split('|')
        .filter_map(|raw| {
            let mut parts = raw.splitn(3, '#');
            let name = parts.next()?.trim();
            let value = parts.next()?.trim();
            let expires = parts.next()?.trim().parse::<i64>().ok()?;
            if name.is_empty() || value.is_empty() || expires <= now {
                return None;
            }
            Some(TargetCookieEntry {
                name: name.to_string(),
                value: value.to_string(),
                expires,
            })
        })
        .collect()
}

pub fn tnt_id_from_target_cookie(value: Option<&str>, now: i64) -> Option<String> {
    parse_target_cookie(value?, now)
        .into_iter()
        .find(|e| e.name == PROFILE_ENTRY)
        .map(|e| e.value)
}

pub fn build_target_cookie(session: &SessionId, tnt_id: Option<&str>, now: i64) -> TargetCookie {
    let mut entries = vec![TargetCookieEntry {
        name: SESSION_ENTRY.to_string(),
        value: session.to_string(),
        expires: now + SESSION_LIFETIME_SECS,
    }];
    if let Some(tnt_id) = tnt_id.filter(|v| !v.is_empty()) {
        entries.push(TargetCookieEntry {
            name: PROFILE_ENTRY.to_string(),
            value: tnt_id.to_string(),
            expires: now + PROFILE_LIFETIME_SECS,
        });
    }
    let max_expires = entries.iter().map(|e| e.expires).max().unwrap_or(now);
    TargetCookie {
        name: TARGET_COOKIE_NAME.to_string(),
        value: entries
            .iter()
            .map(|e| format!("{}#{}#{}", e.name, e.value, e.expires))
            .collect::<Vec<_>>()
            .join("|"),
        max_age: (max_expires - now).max(0) as u64,
    }
}

/// Visitor state reported back by one call, keyed by organization id.
pub fn visitor_state_for(
    visitor: &VisitorHandle,
    session: &SessionId,
    consumer_id: &str,
    assigned_visitor_id: Option<&str>,
) -> VisitorState {
    let mut consumed = BTreeMap::new();
    consumed.insert(consumer_id.to_string(), true);
    let mut state = VisitorState::new();
    state.insert(
        visitor.organization_id().to_string(),
        OrgVisitorState {
            sdid: SupplementalDataIds {
                current: session.supplemental_data_id(),
                current_consumed: consumed,
                last_consumed: BTreeMap::new(),
            },
            marketing_cloud_visitor_id: assigned_visitor_id
                .or(visitor.marketing_cloud_visitor_id())
                .map(str::to_string),
        },
    );
    state
}

/// Combines both responses. Cookie and visitor state always come from the
/// declared-second call, whichever finished last.
pub fn merge_offers(first: OfferResponse, second: OfferResponse) -> MergedResult {
    MergedResult {
        target_cookie: second.target_cookie.clone(),
        visitor_state: second.visitor_state.clone(),
        first_offer: first,
        second_offer: second,
    }
}

/// Replaces the first occurrence of `token`; a missing token is a no-op.
pub fn substitute_first(template: &str, token: &str, value: &str) -> String {
    template.replacen(token, value, 1)
}

pub fn render_page(
    template: &str,
    organization_id: &str,
    merged: &MergedResult,
) -> Result<String, String> {
    let visitor_state = serde_json::to_string(&merged.visitor_state)
        .map_err(|e| format!("serialize visitor state: {e}"))?;
    let content = to_pretty_json(merged).map_err(|e| format!("serialize content: {e}"))?;

    let page = substitute_first(template, ORGANIZATION_ID_PLACEHOLDER, organization_id);
    let page = substitute_first(&page, VISITOR_STATE_PLACEHOLDER, &visitor_state);
    Ok(substitute_first(&page, CONTENT_PLACEHOLDER, &content))
}

fn to_pretty_json<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let mut out = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b" ");
    let mut ser = serde_json::Serializer::with_formatter(&mut out, formatter);
    value.serialize(&mut ser)?;
    Ok(String::from_utf8_lossy(&out).into_owned())
}

pub fn http_date(at: DateTime<Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

pub fn set_cookie_header(cookie: &TargetCookie, now: DateTime<Utc>) -> String {
    let expires = now + Duration::seconds(cookie.max_age as i64);
    format!(
        "{}={}; Max-Age={}; Path=/; Expires={}",
        cookie.name,
        encode_uri_component(&cookie.value),
        cookie.max_age,
        http_date(expires)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use offerpage_contracts::{DeliveryResponse, OfferRequest, VisitorIds};
    use serde_json::Value;

    const ORG: &str = "B8A054D958807F770A495DD6@AdobeOrg";

    fn offer(consumer: &str, session: &SessionId, cookie_value: &str) -> OfferResponse {
        let visitor = resolve_visitor(None, ORG);
        OfferResponse {
            request: OfferRequest::for_mboxes(&build_address("h", "/"), &["a1-serverside-ab"]),
            response: DeliveryResponse {
                status: 200,
                request_id: format!("req-{consumer}"),
                client: "demo".to_string(),
                id: VisitorIds::default(),
                edge_host: None,
                execute: Default::default(),
            },
            target_cookie: Some(TargetCookie {
                name: TARGET_COOKIE_NAME.to_string(),
                value: cookie_value.to_string(),
                max_age: 1860,
            }),
            visitor_state: visitor_state_for(&visitor, session, consumer, None),
        }
    }

    #[test]
    fn missing_identity_cookie_yields_unassigned_handle() {
        let fresh = resolve_visitor(None, ORG);
        assert!(!fresh.is_assigned());
        assert_eq!(fresh.organization_id(), ORG);

        let known = resolve_visitor(
            Some("-1124106680|MCIDTS|17990|MCMID|19790381390519219062131231|vVersion|4.0.0"),
            ORG,
        );
        assert!(known.is_assigned());
        assert_eq!(
            known.marketing_cloud_visitor_id(),
            Some("19790381390519219062131231")
        );
        assert_ne!(fresh, known);
    }

    #[test]
    fn garbage_identity_cookie_degrades_to_new_visitor() {
        assert!(!resolve_visitor(Some(""), ORG).is_assigned());
        assert!(!resolve_visitor(Some("not|a|cookie"), ORG).is_assigned());
        assert!(!resolve_visitor(Some("x|MCMID|"), ORG).is_assigned());
    }

    #[test]
    fn visitor_cookie_name_is_uri_encoded() {
        assert_eq!(visitor_cookie_name(ORG), format!("AMCV_{ORG}"));
        assert_eq!(
            encoded_visitor_cookie_name(ORG),
            "AMCV_B8A054D958807F770A495DD6%40AdobeOrg"
        );
    }

    #[test]
    fn parses_cookie_headers_first_wins_and_decodes() {
        let jar = parse_cookies([
            "mbox=session%23abc%231700000000; AMCV_X%40AdobeOrg=\"1|MCMID|42\"",
            "mbox=ignored; broken; =novalue; bad=%E0%A4%A",
        ]);
        assert_eq!(jar.get("mbox").unwrap(), "session#abc#1700000000");
        assert_eq!(jar.get("AMCV_X%40AdobeOrg").unwrap(), "1|MCMID|42");
        assert_eq!(jar.get("bad").unwrap(), "%E0%A4%A");
        assert!(!jar.contains_key("broken"));
        assert_eq!(jar.len(), 3);
    }

    #[test]
    fn address_concatenates_host_and_original_path() {
        assert_eq!(
            build_address("localhost:3000", "/?utm=1").url,
            "localhost:3000/?utm=1"
        );
        assert_eq!(build_address("", "").url, "");
    }

    #[test]
    fn session_ids_are_unique_and_share_sdid_format() {
        let a = SessionId::new();
        let b = SessionId::new();
        assert_ne!(a, b);
        let sdid = a.supplemental_data_id();
        assert_eq!(sdid.len(), 33);
        assert_eq!(sdid.as_bytes()[16], b'-');
        assert_eq!(sdid, a.supplemental_data_id());
    }

    #[test]
    fn target_cookie_carries_session_and_profile() {
        let session = SessionId::new();
        let cookie = build_target_cookie(&session, Some("tnt-1.28_0"), 1_000);
        assert_eq!(cookie.name, "mbox");
        assert_eq!(cookie.max_age, PROFILE_LIFETIME_SECS as u64);
        assert_eq!(
            cookie.value,
            format!(
                "session#{session}#{}|PC#tnt-1.28_0#{}",
                1_000 + SESSION_LIFETIME_SECS,
                1_000 + PROFILE_LIFETIME_SECS
            )
        );
        assert_eq!(
            tnt_id_from_target_cookie(Some(&cookie.value), 2_000).as_deref(),
            Some("tnt-1.28_0")
        );

        let session_only = build_target_cookie(&session, None, 1_000);
        assert_eq!(session_only.max_age, SESSION_LIFETIME_SECS as u64);
        assert!(tnt_id_from_target_cookie(Some(&session_only.value), 2_000).is_none());
    }

    #[test]
    fn expired_and_malformed_cookie_entries_are_dropped() {
        let entries = parse_target_cookie("session#a#100|PC#b#5000|junk|PC##9000|x#y#z", 1_000);
        assert_eq!(
            entries,
            vec![TargetCookieEntry {
                name: "PC".to_string(),
                value: "b".to_string(),
                expires: 5000,
            }]
        );
    }

    #[test]
    fn merge_takes_cookie_and_state_from_second() {
        let session = SessionId::new();
        let first = offer("first", &session, "first-cookie");
        let second = offer("second", &session, "second-cookie");
        let merged = merge_offers(first.clone(), second.clone());
        assert_eq!(merged.target_cookie.unwrap().value, "second-cookie");
        assert_eq!(merged.visitor_state, second.visitor_state);
        assert_ne!(merged.visitor_state, first.visitor_state);
        assert_eq!(merged.first_offer, first);
    }

    #[test]
    fn visitor_state_prefers_remote_assigned_id() {
        let session = SessionId::new();
        let known = resolve_visitor(Some("1|MCMID|cookie-id"), ORG);
        let state = visitor_state_for(&known, &session, "first", Some("remote-id"));
        assert_eq!(
            state[ORG].marketing_cloud_visitor_id.as_deref(),
            Some("remote-id")
        );
        let state = visitor_state_for(&known, &session, "first", None);
        assert_eq!(
            state[ORG].marketing_cloud_visitor_id.as_deref(),
            Some("cookie-id")
        );
        assert_eq!(state[ORG].sdid.current, session.supplemental_data_id());
        assert_eq!(state[ORG].sdid.current_consumed.get("first"), Some(&true));
    }

    #[test]
    fn substitution_replaces_only_first_occurrence_and_ignores_missing_tokens() {
        assert_eq!(substitute_first("a ${x} b ${x}", "${x}", "1"), "a 1 b ${x}");
        assert_eq!(substitute_first("no tokens", "${x}", "1"), "no tokens");
    }

    #[test]
    fn rendered_regions_round_trip() {
        let session = SessionId::new();
        let merged = merge_offers(
            offer("first", &session, "c1"),
            offer("second", &session, "c2"),
        );
        let template = "<org>${organizationId}</org><state>${visitorState}</state><content>${content}</content>";
        let page = render_page(template, ORG, &merged).unwrap();

        let region = |tag: &str| {
            let open = format!("<{tag}>");
            let close = format!("</{tag}>");
            let start = page.find(&open).unwrap() + open.len();
            let end = page.find(&close).unwrap();
            page[start..end].to_string()
        };
        assert_eq!(region("org"), ORG);
        let state: VisitorState = serde_json::from_str(&region("state")).unwrap();
        assert_eq!(state, merged.visitor_state);
        let content: MergedResult = serde_json::from_str(&region("content")).unwrap();
        assert_eq!(content, merged);

        let raw: Value = serde_json::from_str(&region("content")).unwrap();
        assert!(raw.get("firstOffer").is_some());
        assert!(region("content").contains("\n \"firstOffer\""));
    }

    #[test]
    fn set_cookie_header_uses_seconds_and_http_dates() {
        let now = Utc.with_ymd_and_hms(2019, 4, 1, 12, 0, 0).unwrap();
        assert_eq!(http_date(now), "Mon, 01 Apr 2019 12:00:00 GMT");
        let header = set_cookie_header(
            &TargetCookie {
                name: "mbox".to_string(),
                value: "session#abc#1|PC#t#2".to_string(),
                max_age: 1860,
            },
            now,
        );
        assert_eq!(
            header,
            "mbox=session%23abc%231%7CPC%23t%232; Max-Age=1860; Path=/; Expires=Mon, 01 Apr 2019 12:31:00 GMT"
        );
    }
}
