use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// One module (layer/block) of the partitioned model, named by the tensors it
/// consumes and produces. The callable body lives in the externally-owned
/// [`crate::executor::StageExecutor`]; this struct only carries the topology
/// the registry needs to derive edges.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleSpec {
    pub input_names: Vec<String>,
    pub output_names: Vec<String>,
}

/// Output of the model-partitioning compiler (external collaborator, out of
/// scope for this core): which modules exist, which stage each lives on, and
/// which ranks back each stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionConfig {
    /// Modules in topological order.
    pub modules: Vec<ModuleSpec>,
    /// `module_to_stage_map[i]` is the stage index hosting `modules[i]`.
    pub module_to_stage_map: Vec<usize>,
    /// Stage index -> ordered list of ranks backing that stage (data-parallel replicas).
    pub stage_to_rank_map: BTreeMap<usize, Vec<usize>>,
    /// Optional externally-supplied pipeline warm-up depth per stage.
    pub stage_to_depth_map: Option<BTreeMap<usize, usize>>,
    /// Model-parallel group size; ranks `[k*mp_size, (k+1)*mp_size)` form one replica.
    pub mp_size: usize,
    /// Names received from the previous stage and sent to the next (e.g. `"target"`).
    pub target_tensor_names: Vec<String>,
}

impl PartitionConfig {
    /// Validate internal consistency: dense rank coverage, no duplicate ranks,
    /// every module's stage has ranks assigned, `mp_size` nonzero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stage_to_rank_map.is_empty() {
            return Err(ConfigError::EmptyStages);
        }
        if self.mp_size == 0 {
            return Err(ConfigError::ZeroMpSize);
        }

        let mut seen_ranks = BTreeSet::new();
        for (&stage, ranks) in &self.stage_to_rank_map {
            if ranks.is_empty() {
                return Err(ConfigError::EmptyStageRanks { stage });
            }
            for &rank in ranks {
                if !seen_ranks.insert(rank) {
                    return Err(ConfigError::DuplicateRank { rank });
                }
            }
        }

        let world_size = seen_ranks.len();
        for expected in 0..world_size {
            if !seen_ranks.contains(&expected) {
                return Err(ConfigError::NonDenseRanks { missing: expected });
            }
        }

        for &stage in &self.module_to_stage_map {
            if !self.stage_to_rank_map.contains_key(&stage) {
                return Err(ConfigError::UnknownStage { stage });
            }
        }

        Ok(())
    }

    /// Number of pipeline stages.
    pub fn num_stages(&self) -> usize {
        self.stage_to_rank_map.len()
    }

    /// Total number of ranks across all stages.
    pub fn world_size(&self) -> usize {
        self.stage_to_rank_map.values().map(|v| v.len()).sum()
    }

    /// The stage index hosting `rank`, if any.
    pub fn stage_of_rank(&self, rank: usize) -> Option<usize> {
        self.stage_to_rank_map
            .iter()
            .find(|(_, ranks)| ranks.contains(&rank))
            .map(|(&stage, _)| stage)
    }

    /// `rank`'s index within its stage's rank list.
    pub fn rank_in_stage(&self, rank: usize) -> Result<usize, ConfigError> {
        let stage = self
            .stage_of_rank(rank)
            .ok_or(ConfigError::RankNotFound { rank })?;
        Ok(self.stage_to_rank_map[&stage]
            .iter()
            .position(|&r| r == rank)
            .expect("stage_of_rank already confirmed membership"))
    }

    /// Ranks of the stage preceding `stage`, empty if `stage == 0`.
    pub fn ranks_in_previous_stage(&self, stage: usize) -> &[usize] {
        if stage == 0 {
            &[]
        } else {
            self.stage_to_rank_map
                .get(&(stage - 1))
                .map(|v| v.as_slice())
                .unwrap_or(&[])
        }
    }

    /// Ranks of the stage following `stage`, empty if `stage` is the last stage.
    pub fn ranks_in_next_stage(&self, stage: usize) -> &[usize] {
        self.stage_to_rank_map
            .get(&(stage + 1))
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Externally-supplied warm-up depth for `stage`, if the decision engine provided one.
    pub fn warmup_depth(&self, stage: usize) -> Option<usize> {
        self.stage_to_depth_map.as_ref()?.get(&stage).copied()
    }
}

/// Element type of a tensor exchanged across stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DType {
    F32,
    F16,
    BF16,
    I64,
    I32,
    /// Mapped to 8-bit signed on the wire (§6) and restored at the receiver.
    Bool,
}

impl DType {
    /// Size of one element in bytes, as it travels on the wire.
    pub const fn wire_element_size(self) -> usize {
        match self {
            DType::F32 | DType::I32 => 4,
            DType::F16 | DType::BF16 => 2,
            DType::I64 => 8,
            DType::Bool => 1,
        }
    }
}

/// This process's position in the global rank space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RankTopology {
    pub rank: usize,
    pub world_size: usize,
    pub local_rank: usize,
}
