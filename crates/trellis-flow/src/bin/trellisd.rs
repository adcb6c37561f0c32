//! Development daemon: the flow service wired against in-memory
//! implementations of every collaborator.
//!
//! The switch-agent transport is a loopback that acknowledges every
//! command, and the path resolver picks a direct link (or a parallel one
//! when diversity is required), so the whole saga machinery can be
//! exercised without a network. Runs a small demonstration, then serves
//! until ctrl-c.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;

use trellis_core::{init_logging, FlowId, LogFormat};
use trellis_flow::dispatch::{SpeakerCommand, SpeakerResponse, SwitchAgent};
use trellis_flow::history::InMemoryHistory;
use trellis_flow::model::{Flow, FlowEndpoint, FlowSpec, Path, PathPair, PathSegment};
use trellis_flow::resolver::{PathConstraints, PathResolver, PathStrategy, ResolveError, ResolvedPath};
use trellis_flow::saga::RequestPayload;
use trellis_flow::store::memory::InMemoryFlowStore;
use trellis_flow::store::FlowStore;
use trellis_flow::{FlowRequest, FlowService, FlowServiceConfig, ResponseHandle};

/// Port used for the direct link between two switches.
const PRIMARY_PORT: u32 = 100;
/// Port used for the diverse parallel link.
const PROTECTED_PORT: u32 = 200;

/// Resolver that connects any two switches with a direct link.
struct DirectLinkResolver;

fn direct_pair(flow: &Flow, port: u32) -> PathPair {
    if flow.is_single_switch() {
        return PathPair::new(Path::default(), Path::default());
    }
    let src = flow.source.switch_id.clone();
    let dst = flow.destination.switch_id.clone();
    PathPair::new(
        Path::new(vec![PathSegment::new(src.clone(), port, dst.clone(), port)]),
        Path::new(vec![PathSegment::new(dst, port, src, port)]),
    )
}

#[async_trait]
impl PathResolver for DirectLinkResolver {
    async fn resolve(
        &self,
        flow: &Flow,
        constraints: &PathConstraints,
        _strategies: &[PathStrategy],
    ) -> Result<ResolvedPath, ResolveError> {
        let primary = direct_pair(flow, PRIMARY_PORT);
        let paths = if constraints.avoid.contains(&primary) {
            direct_pair(flow, PROTECTED_PORT)
        } else {
            primary
        };
        Ok(ResolvedPath {
            paths,
            strategy: PathStrategy::Cost,
        })
    }
}

/// Loopback transport: acknowledges every command asynchronously.
#[derive(Default)]
struct LoopbackAgent {
    handle: OnceLock<ResponseHandle>,
}

#[async_trait]
impl SwitchAgent for LoopbackAgent {
    async fn send(&self, command: SpeakerCommand) -> trellis_flow::Result<()> {
        if let Some(handle) = self.handle.get() {
            let handle = handle.clone();
            let response = SpeakerResponse::success(&command);
            tokio::spawn(async move {
                handle.deliver(response).await;
            });
        }
        Ok(())
    }
}

async fn seed_topology(store: &InMemoryFlowStore, switches: &[&str]) -> trellis_flow::Result<()> {
    for a in switches {
        for b in switches {
            if a == b {
                continue;
            }
            for port in [PRIMARY_PORT, PROTECTED_PORT] {
                store
                    .put_segment(&PathSegment::new(*a, port, *b, port), 10_000)
                    .await?;
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> trellis_flow::Result<()> {
    init_logging(LogFormat::Pretty);

    let store = Arc::new(InMemoryFlowStore::new());
    seed_topology(&store, &["sw-a", "sw-b", "sw-c"]).await?;

    let agent = Arc::new(LoopbackAgent::default());
    let history = Arc::new(InMemoryHistory::new());
    let service = FlowService::start(
        store,
        Arc::new(DirectLinkResolver),
        agent.clone(),
        history.clone(),
        FlowServiceConfig::default(),
    )?;
    let _ = agent.handle.set(service.response_handle());

    let response = service
        .submit(FlowRequest {
            flow_id: FlowId::new("demo-flow"),
            payload: RequestPayload::Create(FlowSpec {
                source: FlowEndpoint::new("sw-a", 1),
                destination: FlowEndpoint::new("sw-b", 1),
                bandwidth: 500,
                ignore_bandwidth: false,
                protected_path: true,
            }),
        })
        .await?;
    tracing::info!(
        flow_id = %response.flow_id,
        status = ?response.status,
        "demo flow provisioned"
    );
    for entry in history.entries_for(&FlowId::new("demo-flow")) {
        tracing::info!(action = %entry.action, description = %entry.description, "history");
    }

    tracing::info!("trellisd serving, press ctrl-c to stop");
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
    service.shutdown().await;
    Ok(())
}
