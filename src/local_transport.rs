use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{Barrier, Mutex as AsyncMutex};

use crate::error::TransportError;
use crate::transport::{CollectiveTransport, Direction, Group};

/// Shared state for an in-process simulation of `world_size` ranks, each
/// represented by its own [`LocalTransport`] handle. Exists so integration
/// tests can exercise the deterministic transport-group construction
/// protocol (§4.2) and the rest of the pipeline without a real network
/// collaborator (feature `mock`).
pub struct LocalWorld {
    world_size: usize,
    u32_round: AsyncMutex<Vec<Option<u32>>>,
    u32_barrier: Barrier,
    rows_round: AsyncMutex<Vec<Option<Vec<i64>>>>,
    rows_barrier: Barrier,
    groups: std::sync::Mutex<HashMap<(usize, usize, u32, Direction), Arc<ChannelPair>>>,
}

struct ChannelPair {
    lo_to_hi_tx: UnboundedSender<Vec<u8>>,
    hi_to_lo_tx: UnboundedSender<Vec<u8>>,
    lo_to_hi_rx: AsyncMutex<UnboundedReceiver<Vec<u8>>>,
    hi_to_lo_rx: AsyncMutex<UnboundedReceiver<Vec<u8>>>,
}

impl LocalWorld {
    pub fn new(world_size: usize) -> Arc<Self> {
        Arc::new(Self {
            world_size,
            u32_round: AsyncMutex::new(vec![None; world_size]),
            u32_barrier: Barrier::new(world_size),
            rows_round: AsyncMutex::new(vec![None; world_size]),
            rows_barrier: Barrier::new(world_size),
            groups: std::sync::Mutex::new(HashMap::new()),
        })
    }

    /// A handle for rank `rank` into this shared world.
    pub fn transport(self: &Arc<Self>, rank: usize) -> LocalTransport {
        assert!(rank < self.world_size);
        LocalTransport {
            world: Arc::clone(self),
            rank,
        }
    }
}

/// This rank's view of a [`LocalWorld`].
#[derive(Clone)]
pub struct LocalTransport {
    world: Arc<LocalWorld>,
    rank: usize,
}

#[derive(Debug)]
pub struct LocalGroup {
    lo: usize,
    hi: usize,
    tag: u32,
    direction: Direction,
}

impl Group for LocalGroup {
    fn members(&self) -> (usize, usize) {
        (self.lo, self.hi)
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[async_trait]
impl CollectiveTransport for LocalTransport {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world.world_size
    }

    async fn all_gather_u32(&self, value: u32) -> Result<Vec<u32>, TransportError> {
        {
            let mut round = self.world.u32_round.lock().await;
            round[self.rank] = Some(value);
        }
        self.world.u32_barrier.wait().await;
        let result = {
            let round = self.world.u32_round.lock().await;
            round
                .iter()
                .map(|v| v.expect("every rank wrote this round"))
                .collect()
        };
        self.world.u32_barrier.wait().await;
        Ok(result)
    }

    async fn all_gather_rows(&self, row: &[i64]) -> Result<Vec<Vec<i64>>, TransportError> {
        {
            let mut round = self.world.rows_round.lock().await;
            round[self.rank] = Some(row.to_vec());
        }
        self.world.rows_barrier.wait().await;
        let result = {
            let round = self.world.rows_round.lock().await;
            round
                .iter()
                .map(|v| v.clone().expect("every rank wrote this round"))
                .collect()
        };
        self.world.rows_barrier.wait().await;
        Ok(result)
    }

    fn new_group(
        &self,
        lo: usize,
        hi: usize,
        tag: u32,
        direction: Direction,
    ) -> Result<Box<dyn Group>, TransportError> {
        if lo >= hi {
            return Err(TransportError::GroupConstruction(format!(
                "expected lo < hi, got ({lo}, {hi})"
            )));
        }
        let mut groups = self
            .world
            .groups
            .lock()
            .expect("groups map mutex poisoned");
        groups.entry((lo, hi, tag, direction)).or_insert_with(|| {
            let (lo_to_hi_tx, lo_to_hi_rx) = mpsc::unbounded_channel();
            let (hi_to_lo_tx, hi_to_lo_rx) = mpsc::unbounded_channel();
            Arc::new(ChannelPair {
                lo_to_hi_tx,
                hi_to_lo_tx,
                lo_to_hi_rx: AsyncMutex::new(lo_to_hi_rx),
                hi_to_lo_rx: AsyncMutex::new(hi_to_lo_rx),
            })
        });
        Ok(Box::new(LocalGroup { lo, hi, tag, direction }))
    }

    async fn broadcast(
        &self,
        group: &dyn Group,
        root: usize,
        payload: Option<Vec<u8>>,
    ) -> Result<Vec<u8>, TransportError> {
        let local = group
            .as_any()
            .downcast_ref::<LocalGroup>()
            .expect("broadcast() called with a Group from a different transport backend");
        let (lo, hi) = (local.lo, local.hi);
        if root != lo && root != hi {
            return Err(TransportError::NotInGroup { rank: root });
        }
        if self.rank != lo && self.rank != hi {
            return Err(TransportError::NotInGroup { rank: self.rank });
        }

        let pair = {
            let groups = self.world.groups.lock().expect("groups map mutex poisoned");
            Arc::clone(
                groups
                    .get(&(lo, hi, local.tag, local.direction))
                    .expect("new_group must be called before broadcast"),
            )
        };

        if self.rank == root {
            let payload = payload.ok_or_else(|| {
                TransportError::Broadcast("root must supply a payload".to_string())
            })?;
            let tx = if root == lo {
                &pair.lo_to_hi_tx
            } else {
                &pair.hi_to_lo_tx
            };
            tx.send(payload.clone())
                .map_err(|_| TransportError::Closed)?;
            Ok(payload)
        } else {
            let mut rx = if root == lo {
                pair.lo_to_hi_rx.lock().await
            } else {
                pair.hi_to_lo_rx.lock().await
            };
            rx.recv().await.ok_or(TransportError::Closed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn all_gather_u32_collects_every_rank_in_order() {
        let world = LocalWorld::new(3);
        let handles: Vec<_> = (0..3)
            .map(|rank| {
                let t = world.transport(rank);
                tokio::spawn(async move { t.all_gather_u32(rank as u32 * 10).await.unwrap() })
            })
            .collect();
        for h in handles {
            assert_eq!(h.await.unwrap(), vec![0, 10, 20]);
        }
    }

    #[tokio::test]
    async fn broadcast_delivers_root_payload_to_peer() {
        let world = LocalWorld::new(2);
        let t0 = world.transport(0);
        let t1 = world.transport(1);
        let g0 = t0.new_group(0, 1, 7, Direction::Forward).unwrap();
        let g1 = t1.new_group(0, 1, 7, Direction::Forward).unwrap();

        let sender = tokio::spawn(async move {
            t0.broadcast(g0.as_ref(), 0, Some(vec![1, 2, 3]))
                .await
                .unwrap()
        });
        let receiver = tokio::spawn(async move { t1.broadcast(g1.as_ref(), 0, None).await.unwrap() });

        assert_eq!(sender.await.unwrap(), vec![1, 2, 3]);
        assert_eq!(receiver.await.unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn broadcast_rejects_non_member_root() {
        let world = LocalWorld::new(3);
        let t0 = world.transport(0);
        let g0 = t0.new_group(0, 1, 7, Direction::Forward).unwrap();
        let err = t0.broadcast(g0.as_ref(), 2, Some(vec![])).await.unwrap_err();
        assert!(matches!(err, TransportError::NotInGroup { rank: 2 }));
    }

    #[tokio::test]
    async fn new_group_rejects_unordered_ranks() {
        let world = LocalWorld::new(2);
        let t0 = world.transport(0);
        assert!(matches!(
            t0.new_group(1, 0, 7, Direction::Forward),
            Err(TransportError::GroupConstruction(_))
        ));
    }
}
