use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::StageError;
use crate::manifest::ModuleSpec;
use crate::tensor::Tensor;

/// Identifies a minibatch as it flows through `forward`/`backward`.
pub type MinibatchId = u64;

/// Input to one stage's forward pass: the activation tensors received from
/// the previous stage (or the data loader, for the first stage), keyed by
/// name so the executor can match them against its `ModuleSpec`s.
pub struct ForwardInput {
    pub minibatch: MinibatchId,
    pub tensors: BTreeMap<String, Tensor>,
}

/// Output of one stage's forward pass: the activations to send to the next
/// stage (or the final model output, for the last stage).
pub struct ForwardOutput {
    pub tensors: BTreeMap<String, Tensor>,
}

/// Input to one stage's backward pass: the output tensors produced by the
/// matching forward call and the gradients received from the next stage.
pub struct BackwardInput {
    pub minibatch: MinibatchId,
    pub output_tensors: BTreeMap<String, Tensor>,
    pub output_gradients: BTreeMap<String, Tensor>,
    /// Token count for sequence models whose loss should be averaged per
    /// token rather than per example; when present the executor divides the
    /// incoming gradients by this count before applying them.
    pub token_count: Option<u64>,
}

/// Output of one stage's backward pass: gradients with respect to this
/// stage's inputs, to send to the previous stage.
pub struct BackwardOutput {
    pub input_gradients: BTreeMap<String, Tensor>,
}

/// The numeric-kernel collaborator that owns the actual model compute this
/// crate schedules. Out of scope to implement tensor math, autograd, or
/// weight storage here (§1 Non-goals): this trait is the seam a real
/// tensor/autograd library plugs into.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    /// The modules this executor hosts, in topological order, used by the
    /// registry to derive tensor names and stage wiring.
    fn modules(&self) -> &[ModuleSpec];

    /// Run a forward pass for one minibatch.
    async fn forward(&self, input: ForwardInput) -> Result<ForwardOutput, StageError>;

    /// Run a backward pass for one minibatch, given the recorded forward
    /// outputs and the gradients received from the next stage.
    async fn backward(&self, input: BackwardInput) -> Result<BackwardOutput, StageError>;

    /// Serialize executor state (weights, optimizer state, …) for
    /// checkpointing. The core neither interprets nor persists the bytes; it
    /// only exposes the hook (§1.2).
    fn state_dict(&self) -> BTreeMap<String, Bytes> {
        BTreeMap::new()
    }

    /// Restore executor state from a previously captured [`state_dict`](Self::state_dict).
    fn load_state_dict(&mut self, _state: BTreeMap<String, Bytes>) -> Result<(), StageError> {
        Ok(())
    }
}
