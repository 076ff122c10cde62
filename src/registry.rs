use std::collections::BTreeMap;

use crate::error::RegistryError;
use crate::manifest::PartitionConfig;
use crate::transport::{CollectiveTransport, Direction, Group};

/// Assigns a stable tag to every tensor name that crosses a stage boundary,
/// in the same deterministic order on every rank: module inputs/outputs in
/// topological order, then sorted target tensor names, then `"ack"`, then
/// `"control"` (§4.2).
#[derive(Debug, Clone)]
pub struct TensorTags(BTreeMap<String, u32>);

impl TensorTags {
    pub fn assign(config: &PartitionConfig) -> Self {
        let mut tags = BTreeMap::new();
        let mut next = 1u32;
        let mut intern = |tags: &mut BTreeMap<String, u32>, name: &str| {
            if !tags.contains_key(name) {
                tags.insert(name.to_string(), next);
                next += 1;
            }
        };

        for module in &config.modules {
            for name in &module.input_names {
                intern(&mut tags, name);
            }
            for name in &module.output_names {
                intern(&mut tags, name);
            }
        }

        let mut target_names: Vec<&String> = config.target_tensor_names.iter().collect();
        target_names.sort();
        for name in target_names {
            intern(&mut tags, name);
        }

        intern(&mut tags, "ack");
        intern(&mut tags, "control");

        Self(tags)
    }

    pub fn get(&self, name: &str) -> Option<u32> {
        self.0.get(name).copied()
    }
}

/// Which ranks this stage receives each named tensor from, and which ranks
/// it sends each named tensor to, derived from the module adjacency and
/// target-tensor/control wiring (§4.2).
#[derive(Debug, Clone, Default)]
pub struct StageWiring {
    pub receive_ranks: BTreeMap<String, Vec<usize>>,
    pub send_ranks: BTreeMap<String, Vec<usize>>,
}

impl StageWiring {
    pub fn derive(config: &PartitionConfig, stage: usize) -> Self {
        let mut receive_ranks = BTreeMap::new();
        let mut send_ranks = BTreeMap::new();

        for i in 0..config.modules.len().saturating_sub(1) {
            let producer_stage = config.module_to_stage_map[i];
            let consumer_stage = config.module_to_stage_map[i + 1];
            if producer_stage == consumer_stage {
                continue;
            }
            for tensor_name in &config.modules[i].output_names {
                if !config.modules[i + 1].input_names.contains(tensor_name) {
                    continue;
                }
                if consumer_stage == stage {
                    receive_ranks.insert(
                        tensor_name.clone(),
                        config.stage_to_rank_map[&producer_stage].clone(),
                    );
                }
                if producer_stage == stage {
                    send_ranks.insert(
                        tensor_name.clone(),
                        config.stage_to_rank_map[&consumer_stage].clone(),
                    );
                }
            }
        }

        for target_name in &config.target_tensor_names {
            let prev = config.ranks_in_previous_stage(stage);
            if !prev.is_empty() {
                receive_ranks.insert(target_name.clone(), prev.to_vec());
            }
            let next = config.ranks_in_next_stage(stage);
            if !next.is_empty() {
                send_ranks.insert(target_name.clone(), next.to_vec());
            }
        }

        if stage > 0 {
            receive_ranks.insert(
                "control".to_string(),
                config.ranks_in_previous_stage(stage).to_vec(),
            );
        }
        if stage + 1 < config.num_stages() {
            send_ranks.insert(
                "control".to_string(),
                config.ranks_in_next_stage(stage).to_vec(),
            );
        }

        Self {
            receive_ranks,
            send_ranks,
        }
    }
}

/// This rank's local list of GPU-to-GPU connections: `(tag, connected_rank)`
/// pairs, fed to [`build_process_groups`] to construct identical process
/// groups on every rank (§4.2).
#[derive(Debug, Clone, Default)]
pub struct EdgeRegistry {
    rank: usize,
    connections: Vec<(u32, usize)>,
}

impl EdgeRegistry {
    pub fn new(rank: usize) -> Self {
        Self {
            rank,
            connections: Vec::new(),
        }
    }

    /// Record a connection to `connected_rank` tagged `tag`. Rejects
    /// self-edges and a rank being registered twice under two different tags
    /// (which would make the two passes over `connection_list` disagree).
    pub fn register(&mut self, connected_rank: usize, tag: u32) -> Result<(), RegistryError> {
        if connected_rank == self.rank {
            return Err(RegistryError::SelfEdge { rank: self.rank });
        }
        if let Some(&(existing_tag, _)) = self
            .connections
            .iter()
            .find(|(_, rank)| *rank == connected_rank)
        {
            if existing_tag != tag {
                let lo = self.rank.min(connected_rank);
                let hi = self.rank.max(connected_rank);
                return Err(RegistryError::TagCollision {
                    lo,
                    hi,
                    first: existing_tag,
                    second: tag,
                });
            }
        }
        self.connections.push((tag, connected_rank));
        Ok(())
    }

    pub fn connections(&self) -> &[(u32, usize)] {
        &self.connections
    }
}

/// The forward- and backward-direction process groups formed for one edge.
pub struct GroupPair {
    pub forward: Box<dyn Group>,
    pub backward: Box<dyn Group>,
}

/// Construct identical process groups on every rank (§4.2).
///
/// Every rank gathers the connection lists of every other rank via two
/// rounds of `all_gather` (sizes, then padded `(tag, rank)` rows), then walks
/// the resulting `world_size x max_len` matrix in the same order, creating a
/// forward and backward group the first time a `(lo, hi, tag)` triple is
/// seen. Ranks not involved in a given edge still walk the full matrix so
/// every rank calls `new_group` the same number of times in the same order.
pub async fn build_process_groups(
    transport: &dyn CollectiveTransport,
    local: &EdgeRegistry,
) -> Result<BTreeMap<(usize, usize, u32), GroupPair>, RegistryError> {
    let local_len = local.connections().len() as u32;
    let sizes = transport.all_gather_u32(local_len).await?;
    let max_len = *sizes.iter().max().unwrap_or(&0) as usize;

    let mut groups: BTreeMap<(usize, usize, u32), GroupPair> = BTreeMap::new();
    if max_len == 0 {
        return Ok(groups);
    }

    let mut row = vec![-1i64; max_len * 2];
    for (i, &(tag, rank)) in local.connections().iter().enumerate() {
        row[i * 2] = tag as i64;
        row[i * 2 + 1] = rank as i64;
    }
    let gathered = transport.all_gather_rows(&row).await?;

    let mut local_rank_connections = 0usize;
    for (src_rank, cols) in gathered.into_iter().enumerate() {
        for pair in cols.chunks(2) {
            let (tag, dst_rank) = (pair[0], pair[1]);
            if tag == -1 {
                continue;
            }
            let tag = tag as u32;
            let dst_rank = dst_rank as usize;
            if src_rank == dst_rank {
                return Err(RegistryError::SelfEdge { rank: src_rank });
            }
            let lo = src_rank.min(dst_rank);
            let hi = src_rank.max(dst_rank);
            let key = (lo, hi, tag);
            if groups.contains_key(&key) {
                continue;
            }
            let forward = transport.new_group(lo, hi, tag, Direction::Forward)?;
            let backward = transport.new_group(lo, hi, tag, Direction::Backward)?;
            groups.insert(key, GroupPair { forward, backward });
            if lo == transport.rank() || hi == transport.rank() {
                local_rank_connections += 1;
            }
        }
    }

    if local_rank_connections != local.connections().len() {
        return Err(RegistryError::ConnectionCountMismatch {
            rank: transport.rank(),
            expected: local.connections().len(),
            actual: local_rank_connections,
        });
    }

    Ok(groups)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local_transport::LocalWorld;
    use crate::manifest::ModuleSpec;
    use std::collections::BTreeMap as Map;

    fn two_stage_config() -> PartitionConfig {
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

    #[test]
    fn tensor_tags_assigned_in_deterministic_order() {
        let cfg = two_stage_config();
        let tags = TensorTags::assign(&cfg);
        assert_eq!(tags.get("hidden"), Some(1));
        assert_eq!(tags.get("loss"), Some(2));
        assert_eq!(tags.get("target"), Some(3));
        assert_eq!(tags.get("ack"), Some(4));
        assert_eq!(tags.get("control"), Some(5));
    }

    #[test]
    fn stage_wiring_derives_adjacent_tensor_and_control_edges() {
        let cfg = two_stage_config();
        let stage0 = StageWiring::derive(&cfg, 0);
        assert_eq!(stage0.send_ranks["hidden"], vec![1]);
        assert_eq!(stage0.send_ranks["target"], vec![1]);
        assert_eq!(stage0.send_ranks["control"], vec![1]);
        assert!(!stage0.receive_ranks.contains_key("control"));

        let stage1 = StageWiring::derive(&cfg, 1);
        assert_eq!(stage1.receive_ranks["hidden"], vec![0]);
        assert_eq!(stage1.receive_ranks["target"], vec![0]);
        assert_eq!(stage1.receive_ranks["control"], vec![0]);
        assert!(!stage1.receive_ranks.contains_key("loss"));
    }

    #[test]
    fn self_edge_rejected() {
        let mut reg = EdgeRegistry::new(3);
        assert!(matches!(
            reg.register(3, 1),
            Err(RegistryError::SelfEdge { rank: 3 })
        ));
    }

    #[test]
    fn tag_collision_rejected() {
        let mut reg = EdgeRegistry::new(0);
        reg.register(1, 5).unwrap();
        assert!(matches!(
            reg.register(1, 6),
            Err(RegistryError::TagCollision {
                lo: 0,
                hi: 1,
                first: 5,
                second: 6
            })
        ));
    }

    #[tokio::test]
    async fn build_process_groups_matches_across_ranks() {
        let world = LocalWorld::new(2);
        let t0 = world.transport(0);
        let t1 = world.transport(1);

        let mut reg0 = EdgeRegistry::new(0);
        reg0.register(1, 7).unwrap();
        let mut reg1 = EdgeRegistry::new(1);
        reg1.register(0, 7).unwrap();

        let h0 = tokio::spawn(async move { build_process_groups(&t0, &reg0).await });
        let h1 = tokio::spawn(async move { build_process_groups(&t1, &reg1).await });

        let groups0 = h0.await.unwrap().unwrap();
        let groups1 = h1.await.unwrap().unwrap();
        assert_eq!(groups0.len(), 1);
        assert_eq!(groups1.len(), 1);
        assert!(groups0.contains_key(&(0, 1, 7)));
        assert!(groups1.contains_key(&(0, 1, 7)));
    }

    #[tokio::test]
    async fn build_process_groups_detects_connection_count_mismatch() {
        // rank 0 thinks it has one connection but never registers it,
        // while rank 1 registers a matching edge — rank 0's local count (0)
        // won't match the edges actually incident to it after gathering.
        let world = LocalWorld::new(2);
        let t0 = world.transport(0);
        let t1 = world.transport(1);

        let reg0 = EdgeRegistry::new(0);
        let mut reg1 = EdgeRegistry::new(1);
        reg1.register(0, 7).unwrap();

        let h0 = tokio::spawn(async move { build_process_groups(&t0, &reg0).await });
        let h1 = tokio::spawn(async move { build_process_groups(&t1, &reg1).await });

        let err0 = h0.await.unwrap().unwrap_err();
        assert!(matches!(
            err0,
            RegistryError::ConnectionCountMismatch {
                rank: 0,
                expected: 0,
                actual: 1,
            }
        ));
        h1.await.unwrap().unwrap();
    }
}
