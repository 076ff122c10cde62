//! Shared fixtures for the integration tests: a pass-through executor and a
//! couple of small [`PartitionConfig`]s matching the scenarios spec.md §8
//! calls out.

use std::collections::BTreeMap as Map;

use async_trait::async_trait;
use bytes::Bytes;
use pipeline_stage_runtime::{
    BackwardInput, BackwardOutput, ForwardInput, ForwardOutput, ModuleSpec, PartitionConfig,
    StageError, StageExecutor, Tensor,
};

/// Passes activations/gradients through unchanged; stands in for the
/// externally-owned numeric-kernel collaborator this core schedules but
/// never implements.
pub struct IdentityExecutor {
    pub modules: Vec<ModuleSpec>,
}

#[async_trait]
impl StageExecutor for IdentityExecutor {
    fn modules(&self) -> &[ModuleSpec] {
        &self.modules
    }

    async fn forward(&self, input: ForwardInput) -> Result<ForwardOutput, StageError> {
        Ok(ForwardOutput {
            tensors: input.tensors,
        })
    }

    async fn backward(&self, input: BackwardInput) -> Result<BackwardOutput, StageError> {
        Ok(BackwardOutput {
            input_gradients: input.output_gradients,
        })
    }
}

/// Stands in for a criterion stage: passes activations through on the
/// forward path like [`IdentityExecutor`], but on the backward path
/// synthesizes a zero gradient for every received (non-target) tensor,
/// since this core has no loss/autograd implementation of its own.
pub struct CriterionExecutor {
    pub modules: Vec<ModuleSpec>,
}

#[async_trait]
impl StageExecutor for CriterionExecutor {
    fn modules(&self) -> &[ModuleSpec] {
        &self.modules
    }

    async fn forward(&self, input: ForwardInput) -> Result<ForwardOutput, StageError> {
        Ok(ForwardOutput {
            tensors: input.tensors,
        })
    }

    async fn backward(&self, input: BackwardInput) -> Result<BackwardOutput, StageError> {
        let mut grads = Map::new();
        for (name, tensor) in &input.output_tensors {
            if name == "target" {
                continue;
            }
            grads.insert(
                name.clone(),
                Tensor::new(
                    name.clone(),
                    tensor.dtype,
                    tensor.shape.clone(),
                    Bytes::from(vec![0u8; tensor.data.len()]),
                ),
            );
        }
        Ok(BackwardOutput {
            input_gradients: grads,
        })
    }
}

/// Two stages, one rank each: `0 -> hidden -> 1`, with a `target` tensor
/// piggybacked alongside and no skip connections.
pub fn two_stage_config() -> PartitionConfig {
    PartitionConfig {
        modules: vec![
            ModuleSpec {
                input_names: vec![],
                output_names: vec!["hidden".into()],
            },
            ModuleSpec {
                input_names: vec!["hidden".into()],
                output_names: vec!["loss".into()],
            },
        ],
        module_to_stage_map: vec![0, 1],
        stage_to_rank_map: Map::from([(0, vec![0]), (1, vec![1])]),
        stage_to_depth_map: None,
        mp_size: 1,
        target_tensor_names: vec!["target".into()],
    }
}

/// Two stages, one rank each, with no target tensor — for tests that drive
/// `CommEndpoints` directly and only want the one "hidden" edge wired.
pub fn bare_two_stage_config() -> PartitionConfig {
    PartitionConfig {
        modules: vec![
            ModuleSpec {
                input_names: vec![],
                output_names: vec!["hidden".into()],
            },
            ModuleSpec {
                input_names: vec!["hidden".into()],
                output_names: vec!["loss".into()],
            },
        ],
        module_to_stage_map: vec![0, 1],
        stage_to_rank_map: Map::from([(0, vec![0]), (1, vec![1])]),
        stage_to_depth_map: None,
        mp_size: 1,
        target_tensor_names: vec![],
    }
}

/// Three stages with uneven widths `[2, 1, 2]`, matching Scenario 3's
/// round-robin send-cursor setup. Every module passes the same `"hidden"`
/// name through so a plain [`IdentityExecutor`] can sit at any stage without
/// needing to rename tensors across a module boundary.
pub fn uneven_widths_config() -> PartitionConfig {
    PartitionConfig {
        modules: vec![
            ModuleSpec {
                input_names: vec![],
                output_names: vec!["hidden".into()],
            },
            ModuleSpec {
                input_names: vec!["hidden".into()],
                output_names: vec!["hidden".into()],
            },
            ModuleSpec {
                input_names: vec!["hidden".into()],
                output_names: vec!["loss".into()],
            },
        ],
        module_to_stage_map: vec![0, 1, 2],
        stage_to_rank_map: Map::from([(0, vec![0, 1]), (1, vec![2]), (2, vec![3, 4])]),
        stage_to_depth_map: None,
        mp_size: 1,
        target_tensor_names: vec![],
    }
}

/// Three stages, one rank each, no targets — used for the forward-only/ack
/// scenario where there is nothing to piggyback but activations and control.
pub fn three_stage_config() -> PartitionConfig {
    PartitionConfig {
        modules: vec![
            ModuleSpec {
                input_names: vec![],
                output_names: vec!["hidden".into()],
            },
            ModuleSpec {
                input_names: vec!["hidden".into()],
                output_names: vec!["hidden".into()],
            },
            ModuleSpec {
                input_names: vec!["hidden".into()],
                output_names: vec!["loss".into()],
            },
        ],
        module_to_stage_map: vec![0, 1, 2],
        stage_to_rank_map: Map::from([(0, vec![0]), (1, vec![1]), (2, vec![2])]),
        stage_to_depth_map: None,
        mp_size: 1,
        target_tensor_names: vec![],
    }
}
