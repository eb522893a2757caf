//! HTTPS backend.
//!
//! Direct-mode transport to a function exposed behind an HTTP endpoint. The
//! request body is the JSON-encoded [`Call`]; a 2xx response body is the
//! JSON-encoded [`Return`]. Transport-level status codes are mapped onto the
//! error taxonomy so throttling and gateway failures are retried.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::{Backend, CleanupOptions, CostBreakdown, Mode, Pricing, Provider};
use crate::invoke::{Call, FunctionStats, Return};
use crate::types::{Error, InstanceId, Result, RuntimeOptions};

/// Header carrying the runtime instance id on every request.
pub const INSTANCE_HEADER: &str = "x-faast-instance";

/// Where a function lives and what it costs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpsEndpoint {
    pub url: String,
    #[serde(default = "default_pricing")]
    pub pricing: Pricing,
}

fn default_pricing() -> Pricing {
    Pricing::default()
}

impl HttpsEndpoint {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            pricing: Pricing::default(),
        }
    }

    pub fn with_pricing(mut self, pricing: Pricing) -> Self {
        self.pricing = pricing;
        self
    }
}

/// Map a non-success HTTP status onto the error taxonomy.
pub(crate) fn status_error(status: StatusCode, body: &str) -> Error {
    let message = if body.is_empty() {
        format!("endpoint returned {status}")
    } else {
        format!("endpoint returned {status}: {body}")
    };
    match status {
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => Error::timeout(message),
        StatusCode::TOO_MANY_REQUESTS => Error::delivery(message),
        status if status.is_server_error() => Error::delivery(message),
        StatusCode::NOT_FOUND => Error::not_found(message),
        _ => Error::infrastructure(message),
    }
}

/// Backend posting calls to an HTTPS endpoint.
#[derive(Debug)]
pub struct HttpsBackend {
    instance_id: InstanceId,
    endpoint: HttpsEndpoint,
    client: reqwest::Client,
    memory_size_mb: u32,
}

impl HttpsBackend {
    pub fn new(
        endpoint: HttpsEndpoint,
        instance_id: InstanceId,
        options: &RuntimeOptions,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(options.timeout + options.response_grace)
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            instance_id,
            endpoint,
            client,
            memory_size_mb: options.memory_size_mb,
        })
    }

    pub fn endpoint(&self) -> &HttpsEndpoint {
        &self.endpoint
    }

    async fn post(&self, call: &Call) -> Result<Return> {
        let response = self
            .client
            .post(&self.endpoint.url)
            .header(INSTANCE_HEADER, self.instance_id.as_str())
            .json(call)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, body.trim()));
        }
        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }
}

#[async_trait]
impl Backend for HttpsBackend {
    fn name(&self) -> &str {
        "https"
    }

    fn mode(&self) -> Mode {
        Mode::Direct
    }

    async fn invoke(&self, call: &Call, cancel: &CancellationToken) -> Result<Option<Return>> {
        tokio::select! {
            _ = cancel.cancelled() => Ok(None),
            ret = self.post(call) => {
                let ret = ret.map_err(|err| err.with_function(call.function_name.clone()))?;
                Ok(Some(ret))
            }
        }
    }

    async fn cleanup(&self, _options: CleanupOptions) -> Result<()> {
        Ok(())
    }

    fn cost_snapshot(&self, stats: &FunctionStats) -> CostBreakdown {
        self.endpoint.pricing.breakdown(stats, self.memory_size_mb)
    }
}

/// Provider for [`HttpsBackend`]. Endpoints are created out of band, so
/// there is nothing to provision.
#[derive(Debug, Clone, Default)]
pub struct HttpsProvider;

#[async_trait]
impl Provider for HttpsProvider {
    type Module = HttpsEndpoint;
    type Backend = HttpsBackend;

    fn name(&self) -> &str {
        "https"
    }

    async fn initialize(
        &self,
        module: HttpsEndpoint,
        instance_id: &InstanceId,
        options: &RuntimeOptions,
    ) -> Result<HttpsBackend> {
        let url = reqwest::Url::parse(&module.url)
            .map_err(|err| Error::validation(format!("invalid endpoint {}: {}", module.url, err)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::validation(format!(
                "unsupported endpoint scheme: {}",
                url.scheme()
            )));
        }
        HttpsBackend::new(module, instance_id.clone(), options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ErrorKind;

    #[test]
    fn test_status_mapping() {
        let kind = |status: StatusCode| status_error(status, "").kind();
        assert_eq!(kind(StatusCode::GATEWAY_TIMEOUT), ErrorKind::Timeout);
        assert_eq!(kind(StatusCode::REQUEST_TIMEOUT), ErrorKind::Timeout);
        assert_eq!(kind(StatusCode::TOO_MANY_REQUESTS), ErrorKind::Delivery);
        assert_eq!(kind(StatusCode::SERVICE_UNAVAILABLE), ErrorKind::Delivery);
        assert_eq!(kind(StatusCode::NOT_FOUND), ErrorKind::NotFound);
        assert_eq!(kind(StatusCode::FORBIDDEN), ErrorKind::Infrastructure);
        assert!(status_error(StatusCode::BAD_GATEWAY, "upstream").message().ends_with("upstream"));
    }

    #[tokio::test]
    async fn test_provider_rejects_bad_urls() {
        let options = RuntimeOptions::default();
        let id = InstanceId::new();
        let err = HttpsProvider
            .initialize(HttpsEndpoint::new("not a url"), &id, &options)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        let err = HttpsProvider
            .initialize(HttpsEndpoint::new("ftp://example.com/f"), &id, &options)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(HttpsProvider
            .initialize(HttpsEndpoint::new("http://127.0.0.1:9/f"), &id, &options)
            .await
            .is_ok());
    }
}
