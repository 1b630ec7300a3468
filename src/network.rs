//! Transport abstraction. The SDK core only talks to the outside world through a
//! [`NetworkAdapter`]; [`ReqwestNetworkAdapter`] is used when the host doesn't supply one.
use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;

use crate::{
    metadata::{SDK_TYPE, SDK_VERSION},
    observability::{metrics, OpsStats},
    Result, StatsigError,
};

pub(crate) const HEADER_API_KEY: &str = "STATSIG-API-KEY";
pub(crate) const HEADER_SDK_TYPE: &str = "STATSIG-SDK-TYPE";
pub(crate) const HEADER_SDK_VERSION: &str = "STATSIG-SDK-VERSION";
pub(crate) const HEADER_CLIENT_TIME: &str = "STATSIG-CLIENT-TIME";
pub(crate) const HEADER_EVENT_COUNT: &str = "STATSIG-EVENT-COUNT";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

/// A single outgoing request.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: Option<Vec<u8>>,
}

/// Response to a [`NetworkRequest`].
///
/// Transport failures are reported through `error` with a zero `status`. The SDK treats a
/// transport error and a non-2xx status the same way.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NetworkResponse {
    pub status: u16,
    pub data: Option<Vec<u8>>,
    pub error: Option<String>,
    pub headers: HashMap<String, String>,
}

impl NetworkResponse {
    pub fn ok(data: impl Into<Vec<u8>>) -> NetworkResponse {
        NetworkResponse {
            status: 200,
            data: Some(data.into()),
            ..Default::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none() && (200..300).contains(&self.status)
    }
}

/// Capability to send HTTP requests.
///
/// Any `Fn(NetworkRequest) -> NetworkResponse` can be used as an adapter.
#[async_trait]
pub trait NetworkAdapter: Send + Sync {
    async fn send(&self, request: NetworkRequest) -> NetworkResponse;
}

#[async_trait]
impl<F> NetworkAdapter for F
where
    F: Fn(NetworkRequest) -> NetworkResponse + Send + Sync,
{
    async fn send(&self, request: NetworkRequest) -> NetworkResponse {
        self(request)
    }
}

/// Default adapter backed by [`reqwest`].
#[derive(Debug, Clone)]
pub struct ReqwestNetworkAdapter {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    client: reqwest::Client,
}

impl ReqwestNetworkAdapter {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

    pub fn new() -> ReqwestNetworkAdapter {
        let client = reqwest::Client::builder()
            .timeout(ReqwestNetworkAdapter::DEFAULT_TIMEOUT)
            .build()
            .unwrap_or_default();
        ReqwestNetworkAdapter { client }
    }

    async fn try_send(
        &self,
        request: NetworkRequest,
    ) -> std::result::Result<NetworkResponse, reqwest::Error> {
        let mut builder = match request.method {
            HttpMethod::Get => self.client.get(&request.url),
            HttpMethod::Post => self.client.post(&request.url),
        };
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| Some((name.to_string(), value.to_str().ok()?.to_owned())))
            .collect();
        let data = response.bytes().await?.to_vec();

        Ok(NetworkResponse {
            status,
            data: Some(data),
            error: None,
            headers,
        })
    }
}

impl Default for ReqwestNetworkAdapter {
    fn default() -> ReqwestNetworkAdapter {
        ReqwestNetworkAdapter::new()
    }
}

#[async_trait]
impl NetworkAdapter for ReqwestNetworkAdapter {
    async fn send(&self, request: NetworkRequest) -> NetworkResponse {
        match self.try_send(request).await {
            Ok(response) => response,
            Err(err) => NetworkResponse {
                status: err.status().map(|s| s.as_u16()).unwrap_or(0),
                error: Some(err.without_url().to_string()),
                ..Default::default()
            },
        }
    }
}

/// SDK-side client: adds standard headers, honors `disable_network` and converts failed
/// responses into errors.
#[derive(Clone)]
pub(crate) struct NetworkClient {
    adapter: Arc<dyn NetworkAdapter>,
    disabled: bool,
    base_headers: HashMap<String, String>,
    ops: OpsStats,
}

impl NetworkClient {
    pub(crate) fn new(
        sdk_key: &str,
        adapter: Arc<dyn NetworkAdapter>,
        disabled: bool,
        ops: OpsStats,
    ) -> NetworkClient {
        let base_headers = HashMap::from([
            (HEADER_API_KEY.to_owned(), sdk_key.to_owned()),
            (HEADER_SDK_TYPE.to_owned(), SDK_TYPE.to_owned()),
            (HEADER_SDK_VERSION.to_owned(), SDK_VERSION.to_owned()),
        ]);
        NetworkClient {
            adapter,
            disabled,
            base_headers,
            ops,
        }
    }

    pub(crate) async fn get(
        &self,
        url: &str,
        headers: HashMap<String, String>,
    ) -> Result<NetworkResponse> {
        self.send(HttpMethod::Get, url, headers, None).await
    }

    pub(crate) async fn post(
        &self,
        url: &str,
        headers: HashMap<String, String>,
        body: Vec<u8>,
    ) -> Result<NetworkResponse> {
        self.send(HttpMethod::Post, url, headers, Some(body)).await
    }

    async fn send(
        &self,
        method: HttpMethod,
        url: &str,
        headers: HashMap<String, String>,
        body: Option<Vec<u8>>,
    ) -> Result<NetworkResponse> {
        if self.disabled {
            return Err(StatsigError::NetworkDisabled);
        }

        let mut all_headers = self.base_headers.clone();
        all_headers.insert(
            HEADER_CLIENT_TIME.to_owned(),
            chrono::Utc::now().timestamp_millis().to_string(),
        );
        all_headers.extend(headers);

        let request = NetworkRequest {
            method,
            url: url.to_owned(),
            headers: all_headers,
            body,
        };

        let started = std::time::Instant::now();
        let response = self.adapter.send(request).await;
        self.ops.dist(
            metrics::NETWORK_REQUEST_LATENCY,
            started.elapsed().as_millis() as f64,
            &[
                ("status_code", response.status.to_string()),
                ("success", response.is_success().to_string()),
            ],
        );

        if response.is_success() {
            return Ok(response);
        }

        let status = (response.status != 0).then_some(response.status);
        let message = response
            .error
            .unwrap_or_else(|| format!("received non-2xx response: {}", response.status));
        log::debug!(target: "statsig", url, status; "request failed: {message}");
        Err(StatsigError::network(status, message))
    }
}
