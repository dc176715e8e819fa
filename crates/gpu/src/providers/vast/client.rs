//! Vast.ai API client implementation.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use reqwest::{Client, StatusCode};
use serde_json::json;
use tracing::{debug, info, warn};

use super::models::{
    AttachSshKeyBody, CreateInstanceBody, CreateInstanceResponse, InstanceListResponse,
    InstanceResource, InstanceResponse, OfferResource, OfferSearchResponse,
};
use crate::providers::traits::{
    GpuProviderError, InstanceProvider, Offer, OfferQuery, ProviderInstance, ProviderStatus,
    ProvisionRequest, ProvisionedInstance,
};

/// Base URL for the Vast.ai API.
const API_BASE_URL: &str = "https://console.vast.ai/api/v0";

/// Default timeout for API requests.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Error codes the rent endpoint uses when an offer was taken.
const UNAVAILABLE_MARKERS: [&str; 3] = ["no_such_ask", "not available", "no longer available"];

/// Vast.ai spot GPU provider.
#[derive(Clone)]
pub struct VastAi {
    /// HTTP client.
    client: Client,
    /// API key for authentication.
    api_key: String,
    /// API base URL (overridable for tests).
    base_url: String,
}

impl VastAi {
    /// Create a new Vast.ai provider.
    ///
    /// # Errors
    /// Returns error if the API key is empty or the HTTP client cannot be created.
    pub fn new(api_key: impl Into<String>) -> Result<Self, GpuProviderError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(GpuProviderError::Config("Vast.ai API key is empty".into()));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            api_key,
            base_url: API_BASE_URL.to_string(),
        })
    }

    /// Point the client at a different API root.
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Make an authenticated GET request.
    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, GpuProviderError> {
        let url = format!("{}{path}", self.base_url);
        debug!(url = %url, "GET request");

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .query(query)
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Make an authenticated request with a JSON body.
    async fn send_json<B>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: &B,
    ) -> Result<(StatusCode, String), GpuProviderError>
    where
        B: serde::Serialize,
    {
        let url = format!("{}{path}", self.base_url);
        debug!(url = %url, method = %method, "JSON request");

        let response = self
            .client
            .request(method, &url)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        Ok((status, text))
    }

    /// Handle API response, parsing JSON or error.
    async fn handle_response<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, GpuProviderError> {
        let status = response.status();
        let text = response.text().await?;

        if status.is_success() {
            serde_json::from_str(&text).map_err(|e| {
                warn!(error = %e, body = %text, "Failed to parse response");
                GpuProviderError::Serialization(e)
            })
        } else if status == StatusCode::NOT_FOUND {
            Err(GpuProviderError::NotFound(text))
        } else {
            Err(GpuProviderError::Api {
                status: status.as_u16(),
                message: text,
            })
        }
    }

    /// Build the search filter document the bundles endpoint expects.
    fn search_filter(query: &OfferQuery) -> serde_json::Value {
        let mut filter = json!({
            "rentable": { "eq": true },
            "rented": { "eq": false },
            "type": "on-demand",
            "order": [["dph_total", "asc"]],
        });

        if let Some(gpu_name) = &query.gpu_name {
            filter["gpu_name"] = json!({ "eq": gpu_name });
        }
        if let Some(count) = query.gpu_count {
            filter["num_gpus"] = json!({ "eq": count });
        }
        if let Some(max_rate) = query.max_hourly_rate {
            filter["dph_total"] = json!({ "lte": max_rate });
        }
        if let Some(reliability) = query.min_reliability {
            filter["reliability2"] = json!({ "gte": reliability });
        }
        if let Some(disk) = query.min_disk_gb {
            filter["disk_space"] = json!({ "gte": disk });
        }

        filter
    }

    /// Convert an API offer to our `Offer` type.
    fn to_offer(resource: &OfferResource) -> Offer {
        Offer {
            id: resource.id.to_string(),
            gpu_name: resource
                .gpu_name
                .clone()
                .unwrap_or_else(|| "Unknown".to_string()),
            gpu_count: resource.num_gpus.unwrap_or(1),
            gpu_memory_gb: resource.gpu_ram.map(|mb| mb / 1024.0),
            hourly_rate: resource.dph_total.unwrap_or(0.0),
            reliability: resource.reliability2,
            disk_gb: resource.disk_space,
            location: resource.geolocation.clone(),
        }
    }

    /// Map the provider's free-form status strings.
    fn to_status(raw: Option<&str>) -> ProviderStatus {
        match raw.map(str::to_ascii_lowercase).as_deref() {
            Some("loading" | "scheduling") => ProviderStatus::Loading,
            Some("created") => ProviderStatus::Created,
            Some("running") => ProviderStatus::Running,
            Some("stopped" | "offline") => ProviderStatus::Stopped,
            Some("exited" | "destroying") => ProviderStatus::Exited,
            _ => ProviderStatus::Unknown,
        }
    }

    /// Convert an API instance to our `ProviderInstance` type.
    #[allow(clippy::cast_possible_truncation)]
    fn to_instance(resource: &InstanceResource) -> ProviderInstance {
        ProviderInstance {
            id: resource.id.to_string(),
            status: Self::to_status(resource.actual_status.as_deref()),
            label: resource.label.clone().filter(|l| !l.is_empty()),
            ssh_host: resource.ssh_host.clone(),
            ssh_port: resource.ssh_port,
            public_ip: resource.public_ipaddr.clone(),
            gpu_type: resource.gpu_name.clone(),
            hourly_rate: resource.dph_total,
            created_at: resource
                .start_date
                .and_then(|ts| Utc.timestamp_opt(ts as i64, 0).single()),
        }
    }

    /// Whether a failed rent response means the offer is gone.
    fn is_unavailable_response(status: StatusCode, body: &str) -> bool {
        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            return true;
        }
        let lower = body.to_ascii_lowercase();
        UNAVAILABLE_MARKERS.iter().any(|m| lower.contains(m))
    }
}

#[async_trait]
impl InstanceProvider for VastAi {
    async fn search_offers(&self, query: &OfferQuery) -> Result<Vec<Offer>, GpuProviderError> {
        let filter = Self::search_filter(query);
        let response: OfferSearchResponse =
            self.get("/bundles/", &[("q", filter.to_string())]).await?;

        let mut offers: Vec<Offer> = response.offers.iter().map(Self::to_offer).collect();
        offers.sort_by(|a, b| a.hourly_rate.total_cmp(&b.hourly_rate));
        debug!(count = offers.len(), "Offer search complete");
        Ok(offers)
    }

    async fn provision_instance(
        &self,
        req: ProvisionRequest,
    ) -> Result<ProvisionedInstance, GpuProviderError> {
        info!(offer_id = %req.offer_id, label = %req.label, "Provisioning instance");

        let body = CreateInstanceBody {
            client_id: "me".to_string(),
            image: req.image,
            disk: req.disk_gb,
            label: req.label,
            runtype: "ssh".to_string(),
        };

        let (status, text) = self
            .send_json(
                reqwest::Method::PUT,
                &format!("/asks/{}/", req.offer_id),
                &body,
            )
            .await?;

        if !status.is_success() {
            if Self::is_unavailable_response(status, &text) {
                return Err(GpuProviderError::OfferUnavailable(req.offer_id));
            }
            return Err(GpuProviderError::Api {
                status: status.as_u16(),
                message: text,
            });
        }

        let parsed: CreateInstanceResponse = serde_json::from_str(&text)?;
        match parsed.new_contract {
            Some(id) if parsed.success => {
                info!(instance_id = id, "Instance provisioned");
                Ok(ProvisionedInstance {
                    instance_id: id.to_string(),
                    status: ProviderStatus::Loading,
                })
            }
            _ => {
                let message = parsed
                    .msg
                    .or(parsed.error)
                    .unwrap_or_else(|| "rent request rejected".to_string());
                if Self::is_unavailable_response(status, &message) {
                    Err(GpuProviderError::OfferUnavailable(req.offer_id))
                } else {
                    Err(GpuProviderError::Api {
                        status: status.as_u16(),
                        message,
                    })
                }
            }
        }
    }

    async fn get_instance_status(&self, id: &str) -> Result<ProviderInstance, GpuProviderError> {
        let response: InstanceResponse = self.get(&format!("/instances/{id}/"), &[]).await?;
        response
            .instances
            .as_ref()
            .map(Self::to_instance)
            .ok_or_else(|| GpuProviderError::NotFound(format!("instance {id}")))
    }

    async fn attach_access_credentials(
        &self,
        id: &str,
        public_key: &str,
    ) -> Result<(), GpuProviderError> {
        info!(instance_id = %id, "Attaching SSH key");

        let body = AttachSshKeyBody {
            ssh_key: public_key.trim().to_string(),
        };
        let (status, text) = self
            .send_json(
                reqwest::Method::POST,
                &format!("/instances/{id}/ssh/"),
                &body,
            )
            .await?;

        if status.is_success() {
            Ok(())
        } else if status == StatusCode::NOT_FOUND {
            Err(GpuProviderError::NotFound(format!("instance {id}")))
        } else {
            Err(GpuProviderError::Api {
                status: status.as_u16(),
                message: text,
            })
        }
    }

    async fn terminate_instance(&self, id: &str) -> Result<(), GpuProviderError> {
        info!(instance_id = %id, "Terminating instance");

        let url = format!("{}/instances/{id}/", self.base_url);
        let response = self
            .client
            .delete(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            info!(instance_id = %id, "Instance terminated");
            Ok(())
        } else {
            let text = response.text().await.unwrap_or_default();
            Err(GpuProviderError::Api {
                status: status.as_u16(),
                message: text,
            })
        }
    }

    async fn list_instances(&self) -> Result<Vec<ProviderInstance>, GpuProviderError> {
        let response: InstanceListResponse = self.get("/instances/", &[]).await?;
        Ok(response.instances.iter().map(Self::to_instance).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(server: &MockServer) -> VastAi {
        VastAi::new("test-key")
            .unwrap()
            .with_base_url(server.uri())
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(VastAi::to_status(Some("running")), ProviderStatus::Running);
        assert_eq!(VastAi::to_status(Some("Loading")), ProviderStatus::Loading);
        assert_eq!(VastAi::to_status(Some("exited")), ProviderStatus::Exited);
        assert_eq!(VastAi::to_status(None), ProviderStatus::Unknown);
    }

    #[test]
    fn test_search_filter_includes_criteria() {
        let filter = VastAi::search_filter(&OfferQuery {
            gpu_name: Some("RTX_4090".into()),
            gpu_count: Some(2),
            max_hourly_rate: Some(0.8),
            min_reliability: None,
            min_disk_gb: Some(60),
        });
        assert_eq!(filter["gpu_name"]["eq"], "RTX_4090");
        assert_eq!(filter["num_gpus"]["eq"], 2);
        assert_eq!(filter["dph_total"]["lte"], 0.8);
        assert_eq!(filter["disk_space"]["gte"], 60);
        assert!(filter.get("reliability2").is_none());
    }

    #[test]
    fn test_empty_api_key_rejected() {
        assert!(matches!(
            VastAi::new("  "),
            Err(GpuProviderError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_search_offers_sorted_by_price() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/bundles/"))
            .and(header("authorization", "Bearer test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "offers": [
                    { "id": 2, "gpu_name": "RTX_4090", "num_gpus": 1, "dph_total": 0.55 },
                    { "id": 1, "gpu_name": "RTX_4090", "num_gpus": 1, "dph_total": 0.31,
                      "gpu_ram": 24564.0, "reliability2": 0.99 }
                ]
            })))
            .mount(&server)
            .await;

        let offers = provider(&server)
            .search_offers(&OfferQuery::default())
            .await
            .unwrap();
        assert_eq!(offers.len(), 2);
        assert_eq!(offers[0].id, "1");
        assert!((offers[0].hourly_rate - 0.31).abs() < f64::EPSILON);
        assert_eq!(offers[1].id, "2");
    }

    #[tokio::test]
    async fn test_provision_returns_new_contract() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/asks/42/"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "success": true, "new_contract": 9001 })),
            )
            .mount(&server)
            .await;

        let provisioned = provider(&server)
            .provision_instance(ProvisionRequest {
                offer_id: "42".into(),
                image: "pytorch/pytorch:latest".into(),
                disk_gb: 40,
                label: "fleet-train".into(),
            })
            .await
            .unwrap();
        assert_eq!(provisioned.instance_id, "9001");
    }

    #[tokio::test]
    async fn test_provision_taken_offer_is_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/asks/42/"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "success": false,
                "error": "invalid_args",
                "msg": "error 404/3603: no_such_ask  Instance type by id 42 is not available."
            })))
            .mount(&server)
            .await;

        let err = provider(&server)
            .provision_instance(ProvisionRequest {
                offer_id: "42".into(),
                image: "img".into(),
                disk_gb: 10,
                label: "l".into(),
            })
            .await
            .unwrap_err();
        assert!(err.is_offer_unavailable());
    }

    #[tokio::test]
    async fn test_get_instance_maps_fields() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/instances/77/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "instances": {
                    "id": 77,
                    "actual_status": "running",
                    "label": "fleet-infer",
                    "ssh_host": "ssh5.vast.ai",
                    "ssh_port": 31077,
                    "public_ipaddr": "203.0.113.9",
                    "gpu_name": "RTX_4090",
                    "dph_total": 0.42,
                    "start_date": 1_700_000_000.5
                }
            })))
            .mount(&server)
            .await;

        let instance = provider(&server).get_instance_status("77").await.unwrap();
        assert_eq!(instance.status, ProviderStatus::Running);
        assert_eq!(instance.ssh_address(), Some(("ssh5.vast.ai", 31077)));
        assert_eq!(instance.label.as_deref(), Some("fleet-infer"));
        assert_eq!(instance.created_at.unwrap().timestamp(), 1_700_000_000);
    }

    #[tokio::test]
    async fn test_terminate_missing_instance_is_ok() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/instances/5/"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        provider(&server).terminate_instance("5").await.unwrap();
    }
}
