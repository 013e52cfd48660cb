//! Kubernetes API surface the agent consumes, and its kube-rs implementation.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream::BoxStream, StreamExt, TryStreamExt};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{APIGroupList, APIResourceList};
use kube::{
    api::{GetParams, ListParams, WatchParams},
    core::Request,
    Client,
};
use serde_json::Value;
use tracing::debug;

/// Raw watch body; decoded by [`crate::stream::decode_frames`].
pub type ByteStream = BoxStream<'static, Result<Bytes, KubeError>>;

#[derive(Debug, thiserror::Error)]
pub enum KubeError {
    #[error("api returned {code}: {message}")]
    Status { code: u16, message: String },
    #[error("transport: {0}")]
    Transport(String),
    #[error("decode: {0}")]
    Decode(String),
    #[error("request: {0}")]
    Request(String),
}

impl KubeError {
    /// HTTP status when the server answered with a non-2xx.
    pub fn status(&self) -> Option<u16> {
        match self {
            KubeError::Status { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<kube::Error> for KubeError {
    fn from(e: kube::Error) -> Self {
        match e {
            kube::Error::Api(resp) => KubeError::Status { code: resp.code, message: resp.message },
            kube::Error::SerdeError(e) => KubeError::Decode(e.to_string()),
            other => KubeError::Transport(other.to_string()),
        }
    }
}

/// Query string for list and watch calls.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ListQuery {
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
    pub limit: Option<u32>,
    pub continue_token: Option<String>,
}

impl ListQuery {
    pub fn labels(mut self, selector: impl Into<String>) -> Self {
        self.label_selector = Some(selector.into());
        self
    }

    pub fn fields(mut self, selector: impl Into<String>) -> Self {
        self.field_selector = Some(selector.into());
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn continue_from(mut self, token: Option<String>) -> Self {
        self.continue_token = token;
        self
    }

    fn list_params(&self) -> ListParams {
        let mut lp = ListParams::default();
        lp.label_selector = self.label_selector.clone();
        lp.field_selector = self.field_selector.clone();
        lp.limit = self.limit;
        lp.continue_token = self.continue_token.clone();
        lp
    }

    fn watch_params(&self) -> WatchParams {
        let mut wp = WatchParams::default();
        wp.label_selector = self.label_selector.clone();
        wp.field_selector = self.field_selector.clone();
        wp
    }
}

/// Everything the agent needs from the API server.
#[async_trait]
pub trait KubeApi: Send + Sync {
    /// `GET /api/{version}`
    async fn core_resources(&self, version: &str) -> Result<APIResourceList, KubeError>;

    /// `GET /apis`
    async fn api_groups(&self) -> Result<APIGroupList, KubeError>;

    /// `GET /apis/{group}/{version}`
    async fn group_resources(&self, group_version: &str) -> Result<APIResourceList, KubeError>;

    /// Paged list of a collection path such as `/apis/apps/v1/deployments`.
    async fn list(&self, path: &str, query: &ListQuery) -> Result<Value, KubeError>;

    /// Single object `GET {collection}/{name}`.
    async fn get(&self, collection: &str, name: &str) -> Result<Value, KubeError>;

    /// `GET /version`
    async fn server_version(&self) -> Result<Value, KubeError>;

    /// Long-lived watch stream; dropping it aborts the connection.
    async fn watch(&self, path: &str, query: &ListQuery) -> Result<ByteStream, KubeError>;
}

/// [`KubeApi`] backed by a kube-rs client (in-cluster or kubeconfig).
#[derive(Clone)]
pub struct KubeClient {
    client: Client,
}

impl KubeClient {
    pub fn new(client: Client) -> Self { Self { client } }

    pub async fn try_default() -> anyhow::Result<Self> {
        let client = Client::try_default().await?;
        Ok(Self { client })
    }
}

fn request_err(e: impl std::fmt::Display) -> KubeError { KubeError::Request(e.to_string()) }

#[async_trait]
impl KubeApi for KubeClient {
    async fn core_resources(&self, version: &str) -> Result<APIResourceList, KubeError> {
        Ok(self.client.list_core_api_resources(version).await?)
    }

    async fn api_groups(&self) -> Result<APIGroupList, KubeError> {
        Ok(self.client.list_api_groups().await?)
    }

    async fn group_resources(&self, group_version: &str) -> Result<APIResourceList, KubeError> {
        Ok(self.client.list_api_group_resources(group_version).await?)
    }

    async fn list(&self, path: &str, query: &ListQuery) -> Result<Value, KubeError> {
        let req = Request::new(path).list(&query.list_params()).map_err(request_err)?;
        let text = self.client.request_text(req).await?;
        serde_json::from_str(&text).map_err(|e| KubeError::Decode(e.to_string()))
    }

    async fn get(&self, collection: &str, name: &str) -> Result<Value, KubeError> {
        let req = Request::new(collection).get(name, &GetParams::default()).map_err(request_err)?;
        let text = self.client.request_text(req).await?;
        serde_json::from_str(&text).map_err(|e| KubeError::Decode(e.to_string()))
    }

    async fn server_version(&self) -> Result<Value, KubeError> {
        let info = self.client.apiserver_version().await?;
        serde_json::to_value(info).map_err(|e| KubeError::Decode(e.to_string()))
    }

    async fn watch(&self, path: &str, query: &ListQuery) -> Result<ByteStream, KubeError> {
        use tokio_util::{compat::FuturesAsyncReadCompatExt, io::ReaderStream};

        let req = Request::new(path).watch(&query.watch_params(), "0").map_err(request_err)?;
        debug!(path = %path, selector = ?query.label_selector, "opening watch stream");
        let reader = self.client.request_stream(req).await?;
        let stream = ReaderStream::new(reader.compat()).map_err(|e| KubeError::Transport(e.to_string()));
        Ok(stream.boxed())
    }
}
