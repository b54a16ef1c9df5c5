use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use offerpage_config::Target;
use offerpage_contracts::{
    validate_delivery_response, validate_offer_request, AnalyticsRequest, DeliveryContext,
    DeliveryExecute, DeliveryRequest, DeliveryResponse, ExperienceCloud, MboxDeliveryRequest,
    OfferRequest, OfferResponse, VisitorIds, ANALYTICS_LOGGING_SERVER_SIDE, DELIVERY_CHANNEL,
};
use offerpage_kernel::{
    build_target_cookie, tnt_id_from_target_cookie, visitor_state_for, SessionId, VisitorHandle,
};
use reqwest::Client;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum TargetError {
    #[error("invalid offer request: {0}")]
    InvalidRequest(String),
    #[error("target request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("target transport error: {0}")]
    Transport(String),
    #[error("target responded with HTTP {0}")]
    Status(u16),
    #[error("malformed target response: {0}")]
    Malformed(String),
}

/// One `get_offers` invocation. Calls made for the same page view share
/// `session_id` and the same `visitor` instance.
#[derive(Debug, Clone)]
pub struct OfferCall {
    pub request: OfferRequest,
    pub target_cookie: Option<String>,
    pub session_id: SessionId,
    pub visitor: Arc<VisitorHandle>,
    pub consumer_id: &'static str,
}

/// Remote personalization service. Implementations hold no per-call state and
/// are invoked concurrently.
#[async_trait]
pub trait OfferProvider: Send + Sync {
    async fn get_offers(&self, call: OfferCall) -> Result<OfferResponse, TargetError>;
}

pub struct TargetClient {
    client: Client,
    client_code: String,
    endpoint: String,
    timeout_ms: u64,
}

impl TargetClient {
    pub fn new(cfg: &Target) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .build()
            .map_err(|e| e.to_string())?;
        let endpoint = cfg
            .endpoint
            .clone()
            .unwrap_or_else(|| format!("https://{}.tt.omtrdc.net", cfg.client));
        Ok(Self {
            client,
            client_code: cfg.client.clone(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            timeout_ms: cfg.timeout_ms,
        })
    }

    fn delivery_url(&self) -> String {
        format!("{}/rest/v1/delivery", self.endpoint)
    }

    fn transport_error(&self, err: reqwest::Error) -> TargetError {
        if err.is_timeout() {
            TargetError::Timeout {
                timeout_ms: self.timeout_ms,
            }
        } else {
            TargetError::Transport(err.to_string())
        }
    }
}

fn delivery_request(call: &OfferCall, tnt_id: Option<String>) -> DeliveryRequest {
    let mboxes = &call.request.execute.mboxes;
    DeliveryRequest {
        request_id: uuid::Uuid::new_v4().to_string(),
        context: DeliveryContext {
            channel: DELIVERY_CHANNEL.to_string(),
            address: mboxes.first().map(|m| m.address.clone()),
        },
        id: VisitorIds {
            tnt_id,
            marketing_cloud_visitor_id: call
                .visitor
                .marketing_cloud_visitor_id()
                .map(str::to_string),
        },
        experience_cloud: ExperienceCloud {
            analytics: AnalyticsRequest {
                supplemental_data_id: call.session_id.supplemental_data_id(),
                logging: ANALYTICS_LOGGING_SERVER_SIDE.to_string(),
            },
        },
        execute: DeliveryExecute {
            mboxes: mboxes
                .iter()
                .enumerate()
                .map(|(index, m)| MboxDeliveryRequest {
                    index: index as u32,
                    name: m.name.clone(),
                    address: m.address.clone(),
                })
                .collect(),
        },
    }
}

#[async_trait]
impl OfferProvider for TargetClient {
    async fn get_offers(&self, call: OfferCall) -> Result<OfferResponse, TargetError> {
        validate_offer_request(&call.request).map_err(TargetError::InvalidRequest)?;

        let now = Utc::now().timestamp();
        let inbound_tnt_id = tnt_id_from_target_cookie(call.target_cookie.as_deref(), now);
        let request = delivery_request(&call, inbound_tnt_id.clone());
        let session_id = call.session_id.to_string();
        debug!(
            consumer_id = call.consumer_id,
            session_id = %session_id,
            request_id = %request.request_id,
            mboxes = ?call.request.mbox_names(),
            "requesting offers"
        );

        let response = self
            .client
            .post(self.delivery_url())
            .query(&[
                ("client", self.client_code.as_str()),
                ("sessionId", session_id.as_str()),
            ])
            .json(&request)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        if !response.status().is_success() {
            return Err(TargetError::Status(response.status().as_u16()));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| self.transport_error(e))?;
        let delivery: DeliveryResponse =
            serde_json::from_slice(&body).map_err(|e| TargetError::Malformed(e.to_string()))?;
        validate_delivery_response(&request, &delivery).map_err(TargetError::Malformed)?;

        let tnt_id = delivery.id.tnt_id.clone().or(inbound_tnt_id);
        let target_cookie = build_target_cookie(&call.session_id, tnt_id.as_deref(), now);
        let visitor_state = visitor_state_for(
            &call.visitor,
            &call.session_id,
            call.consumer_id,
            delivery.id.marketing_cloud_visitor_id.as_deref(),
        );
        debug!(
            consumer_id = call.consumer_id,
            request_id = %delivery.request_id,
            edge_host = delivery.edge_host.as_deref().unwrap_or(""),
            "offers received"
        );
        Ok(OfferResponse {
            request: call.request,
            response: delivery,
            target_cookie: Some(target_cookie),
            visitor_state,
        })
    }
}
