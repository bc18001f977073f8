//! gRPC-backed control handles for fleet nodes
//!
//! Channels are created lazily at registration time, so a node whose control
//! service is not reachable yet still registers; the first outbound call
//! establishes the connection. Every call inherits the per-call deadline the
//! scheduler applies when flushing its outbox, plus the channel-level timeout
//! set here.

use async_trait::async_trait;
use fleet_core::{BackendControl, FrontendControl, ModelInstanceConfig, ModelRoute};
use fleet_proto::{
    BackendCtrlClient, FrontendCtrlClient, ModelInstanceConfigProto, ModelRouteProto, RpcReply,
    Status, UnloadModelRequest, UpdateModelThroughputRequest,
};
use std::time::Duration;
use tonic::transport::{Channel, Endpoint};

fn lazy_channel(address: &str, deadline: Duration) -> fleet_core::Result<Channel> {
    let endpoint = Endpoint::from_shared(format!("http://{}", address))
        .map_err(|e| fleet_core::Error::transport(format!("bad address {}: {}", address, e)))?
        .timeout(deadline)
        .connect_timeout(deadline);
    Ok(endpoint.connect_lazy())
}

fn check_reply(reply: RpcReply) -> fleet_core::Result<()> {
    if reply.status() == Status::Ok {
        Ok(())
    } else {
        Err(fleet_core::Error::transport(format!(
            "peer replied {:?}",
            reply.status()
        )))
    }
}

/// Backend control surface over gRPC
pub struct GrpcBackendControl {
    client: BackendCtrlClient<Channel>,
}

impl GrpcBackendControl {
    pub fn connect_lazy(address: &str, deadline: Duration) -> fleet_core::Result<Self> {
        Ok(Self {
            client: BackendCtrlClient::new(lazy_channel(address, deadline)?),
        })
    }
}

#[async_trait]
impl BackendControl for GrpcBackendControl {
    async fn load_model(&self, config: &ModelInstanceConfig) -> fleet_core::Result<()> {
        let mut client = self.client.clone();
        let reply = client
            .load_model(ModelInstanceConfigProto::from(config))
            .await
            .map_err(|e| fleet_core::Error::transport(e.to_string()))?;
        check_reply(reply.into_inner())
    }

    async fn unload_model(&self, model_session_id: &str) -> fleet_core::Result<()> {
        let mut client = self.client.clone();
        let reply = client
            .unload_model(UnloadModelRequest {
                model_session_id: model_session_id.to_string(),
            })
            .await
            .map_err(|e| fleet_core::Error::transport(e.to_string()))?;
        check_reply(reply.into_inner())
    }

    async fn update_model_throughput(
        &self,
        model_session_id: &str,
        rps: f64,
    ) -> fleet_core::Result<()> {
        let mut client = self.client.clone();
        let reply = client
            .update_model_throughput(UpdateModelThroughputRequest {
                model_session_id: model_session_id.to_string(),
                rps,
            })
            .await
            .map_err(|e| fleet_core::Error::transport(e.to_string()))?;
        check_reply(reply.into_inner())
    }
}

/// Frontend control surface over gRPC
pub struct GrpcFrontendControl {
    client: FrontendCtrlClient<Channel>,
}

impl GrpcFrontendControl {
    pub fn connect_lazy(address: &str, deadline: Duration) -> fleet_core::Result<Self> {
        Ok(Self {
            client: FrontendCtrlClient::new(lazy_channel(address, deadline)?),
        })
    }
}

#[async_trait]
impl FrontendControl for GrpcFrontendControl {
    async fn update_model_route(&self, route: &ModelRoute) -> fleet_core::Result<()> {
        let mut client = self.client.clone();
        let reply = client
            .update_model_route(ModelRouteProto::from(route))
            .await
            .map_err(|e| fleet_core::Error::transport(e.to_string()))?;
        check_reply(reply.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_lazy_accepts_valid_address() {
        assert!(GrpcBackendControl::connect_lazy("10.0.0.1:8001", Duration::from_secs(5)).is_ok());
        assert!(GrpcFrontendControl::connect_lazy("10.0.1.1:9001", Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn test_connect_lazy_rejects_malformed_address() {
        assert!(GrpcBackendControl::connect_lazy("not a uri", Duration::from_secs(5)).is_err());
    }

    #[test]
    fn test_check_reply_maps_status() {
        assert!(check_reply(RpcReply {
            status: Status::Ok as i32
        })
        .is_ok());
        assert!(check_reply(RpcReply {
            status: Status::InvalidRequest as i32
        })
        .is_err());
    }
}
