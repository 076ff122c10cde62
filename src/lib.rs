pub mod comm;
pub mod control;
pub mod error;
pub mod executor;
pub mod local_transport;
pub mod manifest;
pub mod queue;
pub mod registry;
pub mod schedule;
pub mod stage;
pub mod tensor;
pub mod transport;
#[cfg(feature = "tcp")]
pub mod tcp_transport;

pub use comm::{scale_iterations, CommEndpoints};
pub use control::{is_log_point, ControlRecord, CONTROL_RECORD_LEN};
pub use error::{
    ConfigError, PipelineError, RegistryError, Result, ScheduleError, StageError, TransportError,
};
pub use executor::{
    BackwardInput, BackwardOutput, ForwardInput, ForwardOutput, MinibatchId, StageExecutor,
};
pub use local_transport::{LocalGroup, LocalTransport, LocalWorld};
pub use manifest::{DType, ModuleSpec, PartitionConfig, RankTopology};
pub use queue::{Counter, Queue, QueueHandle};
pub use registry::{build_process_groups, EdgeRegistry, GroupPair, StageWiring, TensorTags};
pub use schedule::MessagingSchedule;
pub use stage::StageRuntime;
pub use tensor::{ShapeEncodeError, Tensor, MAX_SHAPE_DIMS};
pub use transport::{CollectiveTransport, Group};
