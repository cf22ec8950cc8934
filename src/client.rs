use async_trait::async_trait;
use indexmap::IndexMap;
use reqwest::{IntoUrl, Response, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;
use url::Url;

/// Parameters of a vendor action, already encoded as strings.
pub type Params = IndexMap<String, String>;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unexpected response: {0}")]
    Response(StatusCode),
    #[error("[{code}] {message}")]
    Service { code: String, message: String },
}

impl ClientError {
    pub fn service<C: Into<String>, M: Into<String>>(code: C, message: M) -> Self {
        Self::Service {
            code: code.into(),
            message: message.into(),
        }
    }

    /// The vendor error code, if the vendor answered with one.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Service { code, .. } => Some(code),
            Self::Response(StatusCode::TOO_MANY_REQUESTS) => Some("Throttling"),
            _ => None,
        }
    }

    pub fn is_any_of(&self, codes: &[&str]) -> bool {
        self.code().map(|c| codes.contains(&c)).unwrap_or(false)
    }
}

/// A vendor management API: executes a named action with parameters.
#[async_trait]
pub trait VendorClient: Send + Sync {
    async fn call(&self, action: &str, params: &Params) -> Result<Value, ClientError>;

    /// Region the client operates in.
    fn region(&self) -> &str;
}

#[async_trait]
impl<C> VendorClient for Arc<C>
where
    C: VendorClient + ?Sized,
{
    async fn call(&self, action: &str, params: &Params) -> Result<Value, ClientError> {
        self.as_ref().call(action, params).await
    }

    fn region(&self) -> &str {
        self.as_ref().region()
    }
}

#[derive(Clone, Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    pub url: Url,
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
    #[serde(default, with = "humantime_serde")]
    pub request_timeout: Option<Duration>,
}

#[derive(Clone, Debug)]
pub struct HttpVendorClientBuilder {
    api: Url,
    region: String,
    credentials: Option<(String, String)>,
    timeout: Option<Duration>,
}

impl HttpVendorClientBuilder {
    #[allow(unused)]
    pub fn new<U>(api: U, region: impl Into<String>) -> Result<Self, reqwest::Error>
    where
        U: IntoUrl,
    {
        Ok(Self::from_url(api.into_url()?, region))
    }

    pub fn from_url(api: Url, region: impl Into<String>) -> Self {
        Self {
            api,
            region: region.into(),
            credentials: None,
            timeout: None,
        }
    }

    pub fn credentials(mut self, access_key: String, secret_key: String) -> Self {
        self.credentials = Some((access_key, secret_key));
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn build(self) -> anyhow::Result<HttpVendorClient> {
        let mut client = reqwest::Client::builder();
        if let Some(timeout) = self.timeout {
            client = client.timeout(timeout);
        }
        Ok(HttpVendorClient {
            client: client.build()?,
            api: self.api,
            region: self.region,
            credentials: self.credentials,
        })
    }
}

impl From<&ClientConfig> for HttpVendorClientBuilder {
    fn from(config: &ClientConfig) -> Self {
        Self::from_url(config.url.clone(), config.region.clone())
            .credentials(config.access_key.clone(), config.secret_key.clone())
            .timeout(config.request_timeout)
    }
}

/// JSON-over-HTTP rendition of the vendor RPC.
#[derive(Clone)]
pub struct HttpVendorClient {
    client: reqwest::Client,
    api: Url,
    region: String,
    credentials: Option<(String, String)>,
}

impl std::fmt::Debug for HttpVendorClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpVendorClient")
            .field("api", &self.api)
            .field("region", &self.region)
            .field("credentials", &self.credentials.as_ref().map(|(key, _)| key))
            .finish()
    }
}

impl HttpVendorClient {
    fn url(&self, action: &str) -> Result<Url, ClientError> {
        let mut url = self.api.clone();
        url.path_segments_mut()
            .map_err(|()| ClientError::Request("Failed to build path".to_string()))?
            .pop_if_empty()
            .push(action);
        Ok(url)
    }

    fn body(&self, params: &Params) -> Params {
        let mut body = Params::with_capacity(params.len() + 1);
        body.insert("RegionId".to_string(), self.region.clone());
        body.extend(params.iter().map(|(k, v)| (k.clone(), v.clone())));
        body
    }
}

#[async_trait]
impl VendorClient for HttpVendorClient {
    #[instrument(skip_all, err, fields(action = action, region = self.region.as_str()))]
    async fn call(&self, action: &str, params: &Params) -> Result<Value, ClientError> {
        let mut request = self.client.post(self.url(action)?).json(&self.body(params));
        if let Some((key, secret)) = &self.credentials {
            request = request.basic_auth(key, Some(secret));
        }

        let response = request.send().await?;
        action_response(response).await
    }

    fn region(&self) -> &str {
        &self.region
    }
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ErrorInformation {
    code: String,
    #[serde(default)]
    message: String,
}

async fn action_response(response: Response) -> Result<Value, ClientError> {
    log::debug!("Eval action response: {:#?}", response);
    match response.status() {
        StatusCode::NO_CONTENT => Ok(Value::Object(Default::default())),
        code if code.is_success() => Ok(response.json().await?),
        _ => default_response(response).await,
    }
}

async fn default_response<T>(response: Response) -> Result<T, ClientError> {
    let code = response.status();
    match response.json::<ErrorInformation>().await {
        Ok(info) => Err(ClientError::service(info.code, info.message)),
        Err(_) => Err(ClientError::Response(code)),
    }
}
