/// Errors from validating a [`crate::manifest::PartitionConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("stage_to_rank_map is empty")]
    EmptyStages,
    #[error("stage {stage} has no ranks assigned")]
    EmptyStageRanks { stage: usize },
    #[error("module_to_stage_map references stage {stage}, which has no entry in stage_to_rank_map")]
    UnknownStage { stage: usize },
    #[error("rank {rank} appears in more than one stage")]
    DuplicateRank { rank: usize },
    #[error("ranks are not densely packed in [0, world_size): missing rank {missing}")]
    NonDenseRanks { missing: usize },
    #[error("mp_size must be nonzero")]
    ZeroMpSize,
    #[error("rank {rank} is not present in any stage")]
    RankNotFound { rank: usize },
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors from the edge registry and deterministic transport-group construction (§4.2).
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error(
        "connection count mismatch for rank {rank}: local connection list has {expected} \
         entries but {actual} edges were incident to this rank after group construction"
    )]
    ConnectionCountMismatch {
        rank: usize,
        expected: usize,
        actual: usize,
    },
    #[error("tag collision on edge ({lo}, {hi}): tag {first} first, then {second}")]
    TagCollision {
        lo: usize,
        hi: usize,
        first: u32,
        second: u32,
    },
    #[error("self-edge: rank {rank} registered a connection to itself")]
    SelfEdge { rank: usize },
    #[error("no tag registered for tensor {0:?}")]
    UnknownTensor(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Errors from the messaging schedule (§4.3).
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("num_ranks_in_stage must be nonzero")]
    ZeroRanksInStage,
    #[error("messaging schedule is empty but a cursor advance was requested")]
    EmptySchedule,
}

/// Errors from the collective transport primitive (external collaborator, §4.6).
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("peer rank {rank} is unreachable: {reason}")]
    Unreachable { rank: usize, reason: String },
    #[error("group construction failed: {0}")]
    GroupConstruction(String),
    #[error("broadcast failed: {0}")]
    Broadcast(String),
    #[error("all_gather failed: {0}")]
    AllGather(String),
    #[error("rank {rank} is not a member of this group")]
    NotInGroup { rank: usize },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("transport handle closed")]
    Closed,
}

/// Errors from a pipeline stage's forward/backward execution (§4.5).
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("executor init failed: {0}")]
    InitFailed(String),
    #[error("forward pass failed for minibatch {minibatch}: {reason}")]
    ForwardFailed { minibatch: u64, reason: String },
    #[error("backward pass failed for minibatch {minibatch}: {reason}")]
    BackwardFailed { minibatch: u64, reason: String },
    #[error("shape/dtype mismatch for tensor {name:?}: expected {expected}, got {got}")]
    ShapeMismatch {
        name: String,
        expected: String,
        got: String,
    },
    #[error("missing required tensor {0:?} for this minibatch")]
    MissingTensor(String),
    #[error("the communication queue for {0:?} was closed while a recv was in flight")]
    QueueClosed(String),
}

/// Top-level pipeline error.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("schedule error: {0}")]
    Schedule(#[from] ScheduleError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("stage error: {0}")]
    Stage(#[from] StageError),
    #[error("pipeline shutting down")]
    Shutdown,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, PipelineError>;
