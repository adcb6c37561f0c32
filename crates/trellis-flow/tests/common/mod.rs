//! Shared harness for the lifecycle integration tests: an in-memory
//! service wired against a scriptable resolver and switch-agent.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use async_trait::async_trait;

use trellis_core::FlowId;
use trellis_flow::dispatch::{
    ResponseOutcome, SpeakerCommand, SpeakerResponse, SwitchAgent,
};
use trellis_flow::history::InMemoryHistory;
use trellis_flow::model::{Flow, FlowEndpoint, FlowSpec, Path, PathPair, PathSegment};
use trellis_flow::resolver::{
    PathConstraints, PathResolver, PathStrategy, ResolveError, ResolvedPath,
};
use trellis_flow::saga::RequestPayload;
use trellis_flow::store::memory::InMemoryFlowStore;
use trellis_flow::store::FlowStore;
use trellis_flow::{FlowRequest, FlowService, FlowServiceConfig, ResponseHandle};

pub const LINK_CAPACITY: u64 = 1000;
pub const PRIMARY_PORT: u32 = 100;
pub const PROTECTED_PORT: u32 = 200;

/// Direct path pair between the two test switches on the given link port.
pub fn direct_pair(port: u32) -> PathPair {
    PathPair::new(
        Path::new(vec![PathSegment::new("sw-a", port, "sw-b", port)]),
        Path::new(vec![PathSegment::new("sw-b", port, "sw-a", port)]),
    )
}

/// Resolver returning the direct link, with an optional scripted queue of
/// results that take precedence.
pub struct ScriptedResolver {
    script: Mutex<VecDeque<Result<ResolvedPath, ResolveError>>>,
}

impl ScriptedResolver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
        })
    }

    /// Queues one result; consumed before the default behavior applies.
    pub fn push(&self, result: Result<ResolvedPath, ResolveError>) {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(result);
    }

    pub fn push_path(&self, port: u32) {
        self.push(Ok(ResolvedPath {
            paths: direct_pair(port),
            strategy: PathStrategy::Cost,
        }));
    }
}

#[async_trait]
impl PathResolver for ScriptedResolver {
    async fn resolve(
        &self,
        flow: &Flow,
        constraints: &PathConstraints,
        _strategies: &[PathStrategy],
    ) -> Result<ResolvedPath, ResolveError> {
        if let Some(result) = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
        {
            return result;
        }
        if flow.is_single_switch() {
            return Ok(ResolvedPath {
                paths: PathPair::new(Path::default(), Path::default()),
                strategy: PathStrategy::Cost,
            });
        }
        let primary = direct_pair(PRIMARY_PORT);
        let paths = if constraints.avoid.contains(&primary) {
            direct_pair(PROTECTED_PORT)
        } else {
            primary
        };
        Ok(ResolvedPath {
            paths,
            strategy: PathStrategy::Cost,
        })
    }
}

type Responder = Box<dyn Fn(&SpeakerCommand) -> Option<ResponseOutcome> + Send + Sync>;

/// Agent that records every sent command and answers per a closure.
///
/// Returning `None` from the closure swallows the command, which is how
/// tests exercise the timeout ladder.
pub struct ScriptedAgent {
    handle: OnceLock<ResponseHandle>,
    sent: Mutex<Vec<SpeakerCommand>>,
    respond: Responder,
}

impl ScriptedAgent {
    pub fn new(
        respond: impl Fn(&SpeakerCommand) -> Option<ResponseOutcome> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            handle: OnceLock::new(),
            sent: Mutex::new(Vec::new()),
            respond: Box::new(respond),
        })
    }

    /// Agent that acknowledges everything.
    pub fn echo() -> Arc<Self> {
        Self::new(|_| Some(ResponseOutcome::Success))
    }

    pub fn connect(&self, handle: ResponseHandle) {
        let _ = self.handle.set(handle);
    }

    pub fn sent(&self) -> Vec<SpeakerCommand> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of sends recorded for one logical command id.
    pub fn sends_of(&self, command_id: trellis_core::CommandId) -> usize {
        self.sent()
            .iter()
            .filter(|c| c.command_id == command_id)
            .count()
    }
}

#[async_trait]
impl SwitchAgent for ScriptedAgent {
    async fn send(&self, command: SpeakerCommand) -> trellis_flow::Result<()> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(command.clone());
        let outcome = (self.respond)(&command);
        if let (Some(outcome), Some(handle)) = (outcome, self.handle.get()) {
            let handle = handle.clone();
            let response = SpeakerResponse {
                outcome,
                ..SpeakerResponse::success(&command)
            };
            tokio::spawn(async move {
                handle.deliver(response).await;
            });
        }
        Ok(())
    }
}

pub struct Harness {
    pub service: Arc<FlowService>,
    pub store: Arc<InMemoryFlowStore>,
    pub history: Arc<InMemoryHistory>,
    pub agent: Arc<ScriptedAgent>,
    pub resolver: Arc<ScriptedResolver>,
}

/// Config tuned so timeout-path tests finish quickly.
pub fn fast_config() -> FlowServiceConfig {
    FlowServiceConfig {
        workers: 2,
        command_retry_limit: 2,
        command_timeout_ms: 100,
        tick_interval_ms: 20,
        ..FlowServiceConfig::default()
    }
}

/// Starts a service over a two-switch topology with the given agent.
pub async fn start_harness(agent: Arc<ScriptedAgent>, config: FlowServiceConfig) -> Harness {
    let store = Arc::new(InMemoryFlowStore::new());
    for port in [PRIMARY_PORT, PROTECTED_PORT] {
        for segment in direct_pair(port).segments() {
            store
                .put_segment(&segment, LINK_CAPACITY)
                .await
                .expect("seed segment");
        }
    }

    let resolver = ScriptedResolver::new();
    let history = Arc::new(InMemoryHistory::new());
    let service = FlowService::start(
        store.clone(),
        resolver.clone(),
        agent.clone(),
        history.clone(),
        config,
    )
    .expect("service start");
    agent.connect(service.response_handle());

    Harness {
        service: Arc::new(service),
        store,
        history,
        agent,
        resolver,
    }
}

pub fn create_request(flow_id: &str, bandwidth: u64, protected: bool) -> FlowRequest {
    FlowRequest {
        flow_id: FlowId::new(flow_id),
        payload: RequestPayload::Create(FlowSpec {
            source: FlowEndpoint::new("sw-a", 1),
            destination: FlowEndpoint::new("sw-b", 1),
            bandwidth,
            ignore_bandwidth: false,
            protected_path: protected,
        }),
    }
}

pub fn delete_request(flow_id: &str) -> FlowRequest {
    FlowRequest {
        flow_id: FlowId::new(flow_id),
        payload: RequestPayload::Delete,
    }
}

pub fn reroute_request(flow_id: &str, force_recreate: bool) -> FlowRequest {
    FlowRequest {
        flow_id: FlowId::new(flow_id),
        payload: RequestPayload::Reroute { force_recreate },
    }
}

/// Total used bandwidth across every seeded segment.
pub fn total_used(store: &InMemoryFlowStore) -> u64 {
    let mut used = 0;
    for port in [PRIMARY_PORT, PROTECTED_PORT] {
        for segment in direct_pair(port).segments() {
            if let Ok(Some(capacity)) = store.capacity_of(&segment) {
                used += capacity.used_bandwidth;
            }
        }
    }
    used
}
