use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

pub const DELIVERY_CHANNEL: &str = "web";
pub const ANALYTICS_LOGGING_SERVER_SIDE: &str = "server_side";

/// Page address a personalization decision is scoped to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Address {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MboxRequest {
    pub address: Address,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecuteRequest {
    pub mboxes: Vec<MboxRequest>,
}

/// Local request shape handed to the personalization adapter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OfferRequest {
    pub execute: ExecuteRequest,
}

impl OfferRequest {
    pub fn for_mboxes(address: &Address, names: &[&str]) -> Self {
        Self {
            execute: ExecuteRequest {
                mboxes: names
                    .iter()
                    .map(|name| MboxRequest {
                        address: address.clone(),
                        name: (*name).to_string(),
                    })
                    .collect(),
            },
        }
    }

    pub fn mbox_names(&self) -> Vec<&str> {
        self.execute
            .mboxes
            .iter()
            .map(|m| m.name.as_str())
            .collect()
    }
}

pub fn validate_offer_request(request: &OfferRequest) -> Result<(), String> {
    if request.execute.mboxes.is_empty() {
        return Err("execute.mboxes must declare at least one mbox".to_string());
    }
    if let Some(pos) = request
        .execute
        .mboxes
        .iter()
        .position(|m| m.name.trim().is_empty())
    {
        return Err(format!("execute.mboxes[{pos}].name is empty"));
    }
    Ok(())
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VisitorIds {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tnt_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub marketing_cloud_visitor_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeliveryContext {
    pub channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<Address>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsRequest {
    pub supplemental_data_id: String,
    pub logging: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExperienceCloud {
    pub analytics: AnalyticsRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MboxDeliveryRequest {
    pub index: u32,
    pub name: String,
    pub address: Address,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeliveryExecute {
    pub mboxes: Vec<MboxDeliveryRequest>,
}

/// Body of `POST /rest/v1/delivery`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryRequest {
    pub request_id: String,
    pub context: DeliveryContext,
    pub id: VisitorIds,
    pub experience_cloud: ExperienceCloud,
    pub execute: DeliveryExecute,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OfferOption {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default)]
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_tokens: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MboxResponse {
    pub index: u32,
    pub name: String,
    #[serde(default)]
    pub options: Vec<OfferOption>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analytics: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExecuteResponse {
    #[serde(default)]
    pub mboxes: Vec<MboxResponse>,
}

/// Decoded delivery API response. Unknown fields are tolerated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryResponse {
    pub status: u16,
    pub request_id: String,
    pub client: String,
    #[serde(default)]
    pub id: VisitorIds,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edge_host: Option<String>,
    #[serde(default)]
    pub execute: ExecuteResponse,
}

pub fn validate_delivery_response(
    request: &DeliveryRequest,
    response: &DeliveryResponse,
) -> Result<(), String> {
    if !(200..300).contains(&response.status) {
        return Err(format!("delivery status {} is not a success", response.status));
    }
    if response.request_id != request.request_id {
        return Err(format!(
            "requestId mismatch: sent {}, received {}",
            request.request_id, response.request_id
        ));
    }
    let requested: BTreeSet<&str> = request
        .execute
        .mboxes
        .iter()
        .map(|m| m.name.as_str())
        .collect();
    for mbox in &response.execute.mboxes {
        if !requested.contains(mbox.name.as_str()) {
            return Err(format!("unrequested mbox in response: {}", mbox.name));
        }
    }
    Ok(())
}

/// Cookie directive handed back to the browser. `max_age` is in seconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TargetCookie {
    pub name: String,
    pub value: String,
    pub max_age: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SupplementalDataIds {
    #[serde(rename = "supplementalDataIDCurrent")]
    pub current: String,
    #[serde(rename = "supplementalDataIDCurrentConsumed", default)]
    pub current_consumed: BTreeMap<String, bool>,
    #[serde(rename = "supplementalDataIDLastConsumed", default)]
    pub last_consumed: BTreeMap<String, bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OrgVisitorState {
    pub sdid: SupplementalDataIds,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub marketing_cloud_visitor_id: Option<String>,
}

/// Visitor state blob for the client-side library, keyed by organization id.
pub type VisitorState = BTreeMap<String, OrgVisitorState>;

/// Result of one personalization call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OfferResponse {
    pub request: OfferRequest,
    pub response: DeliveryResponse,
    pub target_cookie: Option<TargetCookie>,
    pub visitor_state: VisitorState,
}

impl OfferResponse {
    /// Content of the first option resolved for `mbox`, if any.
    pub fn content_for(&self, mbox: &str) -> Option<&Value> {
        self.response
            .execute
            .mboxes
            .iter()
            .find(|m| m.name == mbox)
            .and_then(|m| m.options.first())
            .map(|o| &o.content)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MergedResult {
    pub first_offer: OfferResponse,
    pub second_offer: OfferResponse,
    pub target_cookie: Option<TargetCookie>,
    pub visitor_state: VisitorState,
}
