//! SchedulerCtrl service implementation
//!
//! The gRPC surface is a thin parsing and status-mapping layer over the
//! registry. Handlers never hold the registry mutex across I/O: each registry
//! call returns an outbox, and the handler spawns its flush so replies are
//! not delayed by slow peers. Client-visible failures travel in the reply
//! `status` field; transport-level errors are reserved for malformed calls.

use crate::clients::{GrpcBackendControl, GrpcFrontendControl};
use crate::delegate::BackendSpec;
use crate::dispatch::Outbox;
use crate::registry::{LoadModelOutcome, Registry};
use fleet_core::{ModelSession, NodeId};
use fleet_proto::{
    BackendStatsRequest, KeepAliveRequest, LoadModelReply, LoadModelRequest, ModelRouteProto,
    NodeRole, RegisterReply, RegisterRequest, RpcReply, SchedulerCtrl, Status, UnregisterRequest,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tonic::{Request, Response};
use tracing::{debug, warn};

/// SchedulerCtrl service implementation
pub struct SchedulerCtrlService {
    registry: Arc<Registry>,
    rpc_deadline: Duration,
}

impl SchedulerCtrlService {
    pub fn new(registry: Arc<Registry>, rpc_deadline: Duration) -> Self {
        Self {
            registry,
            rpc_deadline,
        }
    }

    /// Flush outbound work without blocking the reply path
    fn spawn_flush(&self, outbox: Outbox) {
        if outbox.is_empty() {
            return;
        }
        let deadline = self.rpc_deadline;
        tokio::spawn(async move {
            outbox.flush(deadline).await;
        });
    }

    fn register_reply(&self, status: Status, node_id: u32) -> RegisterReply {
        let params = self.registry.params();
        RegisterReply {
            status: status as i32,
            node_id,
            beacon_interval_sec: params.beacon_interval.as_secs() as u32,
            epoch_interval_sec: params.epoch_interval.as_secs() as u32,
        }
    }
}

fn status_for_error(error: &fleet_core::Error) -> Status {
    match error {
        fleet_core::Error::UnknownNode(_) => Status::UnknownNode,
        fleet_core::Error::InvalidModelSession(_) => Status::InvalidRequest,
        _ => Status::InvalidRequest,
    }
}

#[tonic::async_trait]
impl SchedulerCtrl for SchedulerCtrlService {
    async fn register(
        &self,
        request: Request<RegisterRequest>,
    ) -> std::result::Result<Response<RegisterReply>, tonic::Status> {
        let req = request.into_inner();
        debug!(role = ?req.role(), address = %req.address, "received Register request");

        if req.address.is_empty() {
            return Ok(Response::new(
                self.register_reply(Status::InvalidRequest, 0),
            ));
        }

        let reply = match req.role() {
            NodeRole::Backend => {
                if req.capacity_rps <= 0.0 || req.gpu_device.is_empty() {
                    self.register_reply(Status::InvalidRequest, 0)
                } else {
                    match GrpcBackendControl::connect_lazy(&req.address, self.rpc_deadline) {
                        Ok(ctrl) => {
                            let spec = BackendSpec {
                                address: req.address,
                                gpu_device: req.gpu_device,
                                capacity_rps: req.capacity_rps,
                                gpu_memory_mb: req.gpu_memory_mb,
                            };
                            let (node_id, outbox) =
                                self.registry.register_backend(spec, Arc::new(ctrl));
                            self.spawn_flush(outbox);
                            self.register_reply(Status::Ok, node_id.as_u32())
                        }
                        Err(e) => {
                            warn!(error = %e, "backend registration with bad address");
                            self.register_reply(Status::InvalidRequest, 0)
                        }
                    }
                }
            }
            NodeRole::Frontend => {
                match GrpcFrontendControl::connect_lazy(&req.address, self.rpc_deadline) {
                    Ok(ctrl) => {
                        let node_id = self.registry.register_frontend(req.address, Arc::new(ctrl));
                        self.register_reply(Status::Ok, node_id.as_u32())
                    }
                    Err(e) => {
                        warn!(error = %e, "frontend registration with bad address");
                        self.register_reply(Status::InvalidRequest, 0)
                    }
                }
            }
            NodeRole::Unspecified => self.register_reply(Status::InvalidRequest, 0),
        };
        Ok(Response::new(reply))
    }

    async fn unregister(
        &self,
        request: Request<UnregisterRequest>,
    ) -> std::result::Result<Response<RpcReply>, tonic::Status> {
        let req = request.into_inner();
        debug!(node = req.node_id, "received Unregister request");

        let status = match self.registry.unregister(NodeId::new(req.node_id)) {
            Ok(outbox) => {
                self.spawn_flush(outbox);
                Status::Ok
            }
            Err(e) => status_for_error(&e),
        };
        Ok(Response::new(RpcReply {
            status: status as i32,
        }))
    }

    async fn load_model(
        &self,
        request: Request<LoadModelRequest>,
    ) -> std::result::Result<Response<LoadModelReply>, tonic::Status> {
        let req = request.into_inner();

        let session: ModelSession = match req.model_session.as_ref().map(ModelSession::try_from) {
            Some(Ok(session)) => session,
            _ => {
                return Ok(Response::new(LoadModelReply {
                    status: Status::InvalidRequest as i32,
                    model_route: None,
                }));
            }
        };
        debug!(frontend = req.frontend_id, session = %session.id(),
               rps = req.estimated_rps, "received LoadModel request");

        let reply = match self.registry.load_model(
            NodeId::new(req.frontend_id),
            session,
            req.estimated_rps,
        ) {
            Ok((outcome, route, outbox)) => {
                self.spawn_flush(outbox);
                let status = match outcome {
                    LoadModelOutcome::Satisfied => Status::Ok,
                    LoadModelOutcome::NotEnoughBackends => Status::NotEnoughBackends,
                };
                LoadModelReply {
                    status: status as i32,
                    model_route: Some(ModelRouteProto::from(&route)),
                }
            }
            Err(e) => LoadModelReply {
                status: status_for_error(&e) as i32,
                model_route: None,
            },
        };
        Ok(Response::new(reply))
    }

    async fn update_backend_stats(
        &self,
        request: Request<BackendStatsRequest>,
    ) -> std::result::Result<Response<RpcReply>, tonic::Status> {
        let req = request.into_inner();
        let samples: Vec<(String, f64)> = req
            .samples
            .iter()
            .map(|s| (s.model_session_id.clone(), s.rps))
            .collect();

        let status = match self
            .registry
            .update_backend_stats(NodeId::new(req.backend_id), &samples)
        {
            Ok(true) => Status::Ok,
            // Every reported session is gone from the model table
            Ok(false) if !samples.is_empty() => Status::ModelSessionNotLoaded,
            Ok(false) => Status::Ok,
            Err(e) => status_for_error(&e),
        };
        Ok(Response::new(RpcReply {
            status: status as i32,
        }))
    }

    async fn keep_alive(
        &self,
        request: Request<KeepAliveRequest>,
    ) -> std::result::Result<Response<RpcReply>, tonic::Status> {
        let req = request.into_inner();
        let status = match self
            .registry
            .keep_alive(NodeId::new(req.node_id), Instant::now())
        {
            Ok(()) => Status::Ok,
            Err(e) => status_for_error(&e),
        };
        Ok(Response::new(RpcReply {
            status: status as i32,
        }))
    }
}
