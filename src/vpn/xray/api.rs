//! Client for the running Xray instance's management API

use async_trait::async_trait;
use std::time::Duration;
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Status};
use tracing::debug;

use super::proto::{AlterInboundRequest, AlterInboundResponse, ALTER_INBOUND_PATH};
use crate::error::{ProvisionError, ProvisionResult};

/// User mutation on a live inbound
#[async_trait]
pub trait XrayApi: Send + Sync {
    async fn add_client(&self, inbound_tag: &str, uuid: &str, email: &str, flow: &str) -> ProvisionResult<()>;

    async fn remove_client(&self, inbound_tag: &str, email: &str) -> ProvisionResult<()>;
}

/// Opens an [`XrayApi`] session
///
/// Connection failure is reported as [`ProvisionError::XrayUnavailable`].
#[async_trait]
pub trait XrayConnector: Send + Sync {
    async fn connect(&self) -> ProvisionResult<Box<dyn XrayApi>>;
}

/// gRPC connector for `XRAY_API_HOST:XRAY_API_PORT`
#[derive(Debug, Clone)]
pub struct GrpcConnector {
    host: String,
    port: u16,
    timeout: Duration,
}

impl GrpcConnector {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl XrayConnector for GrpcConnector {
    async fn connect(&self) -> ProvisionResult<Box<dyn XrayApi>> {
        let address = format!("http://{}:{}", self.host, self.port);
        let endpoint = Endpoint::from_shared(address.clone())
            .map_err(|e| ProvisionError::Config(format!("Invalid Xray API address {}: {}", address, e)))?
            .connect_timeout(self.timeout)
            .timeout(self.timeout);

        let channel = endpoint.connect().await.map_err(|e| {
            ProvisionError::XrayUnavailable(format!("Error connecting to Xray API on {}: {}", address, e))
        })?;

        debug!("Connected to Xray API on {}", address);
        Ok(Box::new(GrpcXray { channel }))
    }
}

/// Connected gRPC session
pub struct GrpcXray {
    channel: Channel,
}

fn status_error(status: Status) -> ProvisionError {
    match status.code() {
        Code::Unavailable | Code::DeadlineExceeded | Code::Cancelled => {
            ProvisionError::XrayUnavailable(status.message().to_string())
        }
        _ => ProvisionError::XrayRejected(status.message().to_string()),
    }
}

impl GrpcXray {
    async fn alter_inbound(&self, request: AlterInboundRequest) -> ProvisionResult<()> {
        let mut grpc = tonic::client::Grpc::new(self.channel.clone());
        grpc.ready()
            .await
            .map_err(|e| ProvisionError::XrayUnavailable(format!("Xray API not ready: {}", e)))?;

        let codec: ProstCodec<AlterInboundRequest, AlterInboundResponse> = ProstCodec::default();
        grpc.unary(
            tonic::Request::new(request),
            PathAndQuery::from_static(ALTER_INBOUND_PATH),
            codec,
        )
        .await
        .map_err(status_error)?;
        Ok(())
    }
}

#[async_trait]
impl XrayApi for GrpcXray {
    async fn add_client(&self, inbound_tag: &str, uuid: &str, email: &str, flow: &str) -> ProvisionResult<()> {
        self.alter_inbound(AlterInboundRequest::add_vless_user(inbound_tag, uuid, email, flow))
            .await
    }

    async fn remove_client(&self, inbound_tag: &str, email: &str) -> ProvisionResult<()> {
        self.alter_inbound(AlterInboundRequest::remove_user(inbound_tag, email))
            .await
    }
}
