//! Conversions between wire messages and fleet-core types

use crate::{
    ModelInstanceConfigProto, ModelRouteProto, ModelSessionProto, ProtoError, RouteEntryProto,
};
use fleet_core::{ModelInstanceConfig, ModelRoute, ModelSession, NodeId, RouteEntry};

impl From<&ModelSession> for ModelSessionProto {
    fn from(session: &ModelSession) -> Self {
        Self {
            framework: session.framework.clone(),
            model_name: session.model_name.clone(),
            version: session.version,
            latency_sla_ms: session.latency_sla_ms,
        }
    }
}

impl TryFrom<&ModelSessionProto> for ModelSession {
    type Error = ProtoError;

    fn try_from(proto: &ModelSessionProto) -> Result<Self, Self::Error> {
        if proto.framework.is_empty() || proto.model_name.is_empty() {
            return Err(ProtoError::InvalidData(
                "model session requires framework and model_name".to_string(),
            ));
        }
        Ok(ModelSession::new(
            proto.framework.clone(),
            proto.model_name.clone(),
            proto.version,
            proto.latency_sla_ms,
        ))
    }
}

impl From<&ModelInstanceConfig> for ModelInstanceConfigProto {
    fn from(config: &ModelInstanceConfig) -> Self {
        Self {
            session: Some((&config.session).into()),
            batch_size: config.batch_size,
            reserved_rps: config.reserved_rps,
            memory_mb: config.memory_mb,
            latency_sla_ms: config.latency_sla_ms,
        }
    }
}

impl TryFrom<&ModelInstanceConfigProto> for ModelInstanceConfig {
    type Error = ProtoError;

    fn try_from(proto: &ModelInstanceConfigProto) -> Result<Self, Self::Error> {
        let session = proto
            .session
            .as_ref()
            .ok_or_else(|| ProtoError::InvalidData("instance config missing session".to_string()))?;
        Ok(ModelInstanceConfig {
            session: session.try_into()?,
            batch_size: proto.batch_size,
            reserved_rps: proto.reserved_rps,
            memory_mb: proto.memory_mb,
            latency_sla_ms: proto.latency_sla_ms,
        })
    }
}

impl From<&RouteEntry> for RouteEntryProto {
    fn from(entry: &RouteEntry) -> Self {
        Self {
            node_id: entry.node_id.as_u32(),
            address: entry.address.clone(),
            rps: entry.rps,
        }
    }
}

impl From<&RouteEntryProto> for RouteEntry {
    fn from(proto: &RouteEntryProto) -> Self {
        Self {
            node_id: NodeId::new(proto.node_id),
            address: proto.address.clone(),
            rps: proto.rps,
        }
    }
}

impl From<&ModelRoute> for ModelRouteProto {
    fn from(route: &ModelRoute) -> Self {
        Self {
            model_session_id: route.model_session_id.clone(),
            backends: route.backends.iter().map(Into::into).collect(),
        }
    }
}

impl From<&ModelRouteProto> for ModelRoute {
    fn from(proto: &ModelRouteProto) -> Self {
        // Re-sorting on ingest keeps the sorted-by-node-id invariant even for
        // routes produced by foreign senders.
        ModelRoute::new(
            proto.model_session_id.clone(),
            proto.backends.iter().map(Into::into).collect(),
        )
    }
}
