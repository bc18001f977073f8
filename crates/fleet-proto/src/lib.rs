//! # fleet-proto
//!
//! Protocol buffer definitions and generated gRPC bindings for inferfleet.
//!
//! This crate provides the API definitions for the scheduler surface:
//! - `SchedulerCtrl`: registration, liveness, model loading and stats,
//!   called by frontends and backends
//! - `BackendCtrl`: instance load/unload/update, hosted by backends
//! - `FrontendCtrl`: route pushes, hosted by frontends
//!
//! Conversions between wire messages and `fleet-core` types live in
//! [`conversions`].

pub mod conversions;

// Generated protobuf code
pub mod scheduler {
    pub mod v1 {
        tonic::include_proto!("inferfleet.scheduler.v1");
    }
}

// Re-export commonly used types for convenience (both server and client)
pub use scheduler::v1::{
    backend_ctrl_client::BackendCtrlClient,
    backend_ctrl_server::{BackendCtrl, BackendCtrlServer},
    frontend_ctrl_client::FrontendCtrlClient,
    frontend_ctrl_server::{FrontendCtrl, FrontendCtrlServer},
    scheduler_ctrl_client::SchedulerCtrlClient,
    scheduler_ctrl_server::{SchedulerCtrl, SchedulerCtrlServer},
    BackendStatsRequest, KeepAliveRequest, LoadModelReply, LoadModelRequest,
    ModelInstanceConfigProto, ModelRouteProto, ModelSessionProto, NodeRole, RegisterReply,
    RegisterRequest, RouteEntryProto, RpcReply, RpsSample, Status, UnloadModelRequest,
    UnregisterRequest, UpdateModelThroughputRequest,
};

/// Common error type for proto operations
#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::Status),

    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("Invalid data: {0}")]
    InvalidData(String),
}

pub type Result<T> = std::result::Result<T, ProtoError>;
