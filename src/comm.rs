use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{PipelineError, StageError, TransportError};
use crate::manifest::{DType, PartitionConfig};
use crate::queue::{Counter, Queue, QueueHandle};
use crate::registry::{self, EdgeRegistry, GroupPair, StageWiring, TensorTags};
use crate::schedule::MessagingSchedule;
use crate::tensor::Tensor;
use crate::transport::{CollectiveTransport, Group};

/// Reserved tensor names that get special-cased queue wiring instead of the
/// ordinary module-adjacency derivation (§1.2, `communication.py: setup_queues`).
pub const ACK_TENSOR: &str = "ack";
pub const CONTROL_TENSOR: &str = "control";

/// Scale a requested iteration count by the width of the adjacent stage, the
/// way one helper task per adjacent rank divides up the total work
/// (`communication.py: num_iterations_for_helper_threads`). Returns
/// `(forward_iterations, backward_iterations)`.
pub fn scale_iterations(
    num_iterations: u64,
    num_ranks_in_next_stage: usize,
    num_ranks_in_previous_stage: usize,
) -> (u64, u64) {
    let forward = if num_ranks_in_next_stage > 0 {
        num_iterations / num_ranks_in_next_stage as u64
    } else {
        0
    };
    let backward = if num_ranks_in_previous_stage > 0 {
        num_iterations / num_ranks_in_previous_stage as u64
    } else {
        0
    };
    (forward, backward)
}

/// One rank's queues for a single tensor name: the end the stage runtime
/// reads/writes, plus the end a background I/O worker consumes/fills.
struct QueuePair<T> {
    /// Given to the stage runtime. Stays in the map for the lifetime of this
    /// `CommEndpoints` so `send`/`recv` keep working after helper threads
    /// start.
    runtime_handle: RuntimeHandle<T>,
    /// Taken out and given to the helper worker when `start_helper_threads`
    /// spawns it; `None` afterwards.
    worker_handle: Option<WorkerHandle<T>>,
    peer_rank: usize,
}

enum RuntimeHandle<T> {
    Recv(Queue<T>),
    Send(QueueHandle<T>),
}

enum WorkerHandle<T> {
    Recv(QueueHandle<T>),
    Send(Queue<T>),
}

fn select_group<'a>(pair: &'a GroupPair, peer_rank: usize, self_rank: usize, receiving: bool) -> &'a dyn Group {
    let use_forward = if receiving {
        peer_rank <= self_rank
    } else {
        peer_rank > self_rank
    };
    if use_forward {
        pair.forward.as_ref()
    } else {
        pair.backward.as_ref()
    }
}

/// Owns per-tensor send/receive queues, the messaging schedule, and the
/// transport groups formed for this stage's edges; exposes `send`/`recv` to
/// the stage runtime and spawns the background I/O workers that actually
/// move bytes (§4.4).
pub struct CommEndpoints {
    transport: Arc<dyn CollectiveTransport>,
    rank: usize,
    rank_in_stage: usize,
    num_ranks_in_stage: usize,
    ranks_in_previous_stage: Vec<usize>,
    ranks_in_next_stage: Vec<usize>,

    receive_ranks: BTreeMap<String, Vec<usize>>,
    send_ranks: BTreeMap<String, Vec<usize>>,
    tensor_tags: TensorTags,
    target_tensor_names: Vec<String>,
    dtypes: BTreeMap<String, DType>,

    forward_receive: BTreeMap<String, Vec<Option<QueuePair<Tensor>>>>,
    backward_send: BTreeMap<String, Vec<Option<QueuePair<Tensor>>>>,
    forward_send: BTreeMap<String, Vec<Option<QueuePair<Tensor>>>>,
    backward_receive: BTreeMap<String, Vec<Option<QueuePair<Tensor>>>>,

    num_forward_threads: usize,
    num_backward_threads: usize,
    num_ack_threads: usize,

    groups: BTreeMap<(usize, usize, u32), Arc<GroupPair>>,
    messaging_schedule: MessagingSchedule,

    counter: Option<Arc<Counter>>,
    workers: Vec<tokio::task::JoinHandle<()>>,
}

impl CommEndpoints {
    /// Build queues, the messaging schedule, and transport groups for this
    /// stage, given its position in the partition (§4.4 `initialize`).
    pub async fn build(
        transport: Arc<dyn CollectiveTransport>,
        config: &PartitionConfig,
        stage: usize,
        dtypes: BTreeMap<String, DType>,
    ) -> Result<Self, PipelineError> {
        let rank = transport.rank();
        let rank_in_stage = config.rank_in_stage(rank)?;
        let num_ranks_in_stage = config.stage_to_rank_map[&stage].len();
        let ranks_in_previous_stage = config.ranks_in_previous_stage(stage).to_vec();
        let ranks_in_next_stage = config.ranks_in_next_stage(stage).to_vec();

        let wiring = StageWiring::derive(config, stage);
        let tensor_tags = TensorTags::assign(config);

        let mut this = Self {
            transport,
            rank,
            rank_in_stage,
            num_ranks_in_stage,
            ranks_in_previous_stage: ranks_in_previous_stage.clone(),
            ranks_in_next_stage: ranks_in_next_stage.clone(),
            receive_ranks: wiring.receive_ranks,
            send_ranks: wiring.send_ranks,
            tensor_tags,
            target_tensor_names: config.target_tensor_names.clone(),
            dtypes,
            forward_receive: BTreeMap::new(),
            backward_send: BTreeMap::new(),
            forward_send: BTreeMap::new(),
            backward_receive: BTreeMap::new(),
            num_forward_threads: 0,
            num_backward_threads: 0,
            num_ack_threads: 0,
            groups: BTreeMap::new(),
            messaging_schedule: MessagingSchedule::new(
                num_ranks_in_stage,
                rank_in_stage,
                ranks_in_previous_stage.len(),
            )?,
            counter: None,
            workers: Vec::new(),
        };

        let mut registry = EdgeRegistry::new(rank);
        this.setup_queues(&mut registry)?;

        let groups = registry::build_process_groups(this.transport.as_ref(), &registry).await?;
        this.groups = groups.into_iter().map(|(k, v)| (k, Arc::new(v))).collect();

        info!(
            rank,
            stage,
            num_forward_threads = this.num_forward_threads,
            num_backward_threads = this.num_backward_threads,
            "communication endpoints initialized"
        );

        Ok(this)
    }

    fn setup_queues(&mut self, registry: &mut EdgeRegistry) -> Result<(), PipelineError> {
        let receive_ranks = self.receive_ranks.clone();
        for (name, ranks) in &receive_ranks {
            let tag = self
                .tensor_tags
                .get(name)
                .ok_or_else(|| crate::error::RegistryError::UnknownTensor(name.clone()))?;
            let mut fwd_recv = Vec::new();
            let mut bwd_send = Vec::new();
            for &peer in ranks {
                registry.register(peer, tag)?;
                let (tx, rx) = Queue::new();
                fwd_recv.push(Some(QueuePair {
                    runtime_handle: RuntimeHandle::Recv(rx),
                    worker_handle: Some(WorkerHandle::Recv(tx)),
                    peer_rank: peer,
                }));
                let (tx, rx) = Queue::new();
                bwd_send.push(Some(QueuePair {
                    runtime_handle: RuntimeHandle::Send(tx),
                    worker_handle: Some(WorkerHandle::Send(rx)),
                    peer_rank: peer,
                }));
                self.num_forward_threads += 1;
                self.num_backward_threads += 1;
            }
            self.forward_receive.insert(name.clone(), fwd_recv);
            self.backward_send.insert(name.clone(), bwd_send);
        }

        let send_ranks = self.send_ranks.clone();
        for (name, ranks) in &send_ranks {
            let tag = self
                .tensor_tags
                .get(name)
                .ok_or_else(|| crate::error::RegistryError::UnknownTensor(name.clone()))?;
            let mut bwd_recv = Vec::new();
            let mut fwd_send = Vec::new();
            for &peer in ranks {
                registry.register(peer, tag)?;
                let (tx, rx) = Queue::new();
                bwd_recv.push(Some(QueuePair {
                    runtime_handle: RuntimeHandle::Recv(rx),
                    worker_handle: Some(WorkerHandle::Recv(tx)),
                    peer_rank: peer,
                }));
                let (tx, rx) = Queue::new();
                fwd_send.push(Some(QueuePair {
                    runtime_handle: RuntimeHandle::Send(tx),
                    worker_handle: Some(WorkerHandle::Send(rx)),
                    peer_rank: peer,
                }));
                self.num_forward_threads += 1;
                self.num_backward_threads += 1;
            }
            self.backward_receive.insert(name.clone(), bwd_recv);
            self.forward_send.insert(name.clone(), fwd_send);
        }

        // Target tensors: forward-only queues, wired to whichever adjacent
        // stage exists (§1.2, `register_reserved`).
        for target_name in self.target_tensor_names.clone() {
            let tag = self
                .tensor_tags
                .get(&target_name)
                .ok_or_else(|| crate::error::RegistryError::UnknownTensor(target_name.clone()))?;

            if !self.ranks_in_previous_stage.is_empty() {
                self.receive_ranks
                    .insert(target_name.clone(), self.ranks_in_previous_stage.clone());
                let mut fwd_recv = Vec::new();
                for &peer in &self.ranks_in_previous_stage.clone() {
                    registry.register(peer, tag)?;
                    let (tx, rx) = Queue::new();
                    fwd_recv.push(Some(QueuePair {
                        runtime_handle: RuntimeHandle::Recv(rx),
                        worker_handle: Some(WorkerHandle::Recv(tx)),
                        peer_rank: peer,
                    }));
                    self.num_forward_threads += 1;
                }
                self.forward_receive.insert(target_name.clone(), fwd_recv);
            }

            if !self.ranks_in_next_stage.is_empty() {
                self.send_ranks
                    .insert(target_name.clone(), self.ranks_in_next_stage.clone());
                let mut fwd_send = Vec::new();
                for &peer in &self.ranks_in_next_stage.clone() {
                    registry.register(peer, tag)?;
                    let (tx, rx) = Queue::new();
                    fwd_send.push(Some(QueuePair {
                        runtime_handle: RuntimeHandle::Send(tx),
                        worker_handle: Some(WorkerHandle::Send(rx)),
                        peer_rank: peer,
                    }));
                    self.num_forward_threads += 1;
                }
                self.forward_send.insert(target_name.clone(), fwd_send);
            }
        }

        // Ack edges for forward-only clocking (§1.2, §4.6 glossary "Ack").
        if let Some(tag) = self.tensor_tags.get(ACK_TENSOR) {
            let mut bwd_send = Vec::new();
            for &peer in &self.ranks_in_previous_stage.clone() {
                registry.register(peer, tag)?;
                let (tx, rx) = Queue::new();
                bwd_send.push(Some(QueuePair {
                    runtime_handle: RuntimeHandle::Send(tx),
                    worker_handle: Some(WorkerHandle::Send(rx)),
                    peer_rank: peer,
                }));
                self.num_ack_threads += 1;
            }
            self.backward_send.insert(ACK_TENSOR.to_string(), bwd_send);

            let mut bwd_recv = Vec::new();
            for &peer in &self.ranks_in_next_stage.clone() {
                registry.register(peer, tag)?;
                let (tx, rx) = Queue::new();
                bwd_recv.push(Some(QueuePair {
                    runtime_handle: RuntimeHandle::Recv(rx),
                    worker_handle: Some(WorkerHandle::Recv(tx)),
                    peer_rank: peer,
                }));
                self.num_ack_threads += 1;
            }
            self.backward_receive.insert(ACK_TENSOR.to_string(), bwd_recv);
        }

        Ok(())
    }

    fn group_for(&self, peer_rank: usize, tag: u32) -> Result<Arc<GroupPair>, TransportError> {
        let lo = self.rank.min(peer_rank);
        let hi = self.rank.max(peer_rank);
        self.groups
            .get(&(lo, hi, tag))
            .cloned()
            .ok_or(TransportError::NotInGroup { rank: peer_rank })
    }

    /// Spawn one background worker per queue, configure the shared counter,
    /// and return it so callers can `wait()` on pipeline drain (§4.4).
    pub fn start_helper_threads(&mut self, num_iterations: u64, forward_only: bool) {
        let total = if forward_only {
            self.num_forward_threads + self.num_ack_threads
        } else {
            self.num_forward_threads + self.num_backward_threads
        };
        let counter = Counter::new(total);
        self.counter = Some(Arc::clone(&counter));

        let (fwd_iters, bwd_iters) = scale_iterations(
            num_iterations,
            self.ranks_in_next_stage.len(),
            self.ranks_in_previous_stage.len(),
        );

        // Every forward-receive/forward-send queue gets its own worker
        // (ordinary adjacency-derived tensors, "control", and targets
        // alike) — the backward-direction counterpart of an adjacency edge
        // uses the same peer-stage-scaled iteration count, since both
        // directions of one edge talk to the same adjacent stage.
        let forward_receive_names: Vec<String> = self.forward_receive.keys().cloned().collect();
        for name in forward_receive_names {
            self.spawn_recv_workers(&name, bwd_iters, Arc::clone(&counter), false);
        }
        let forward_send_names: Vec<String> = self.forward_send.keys().cloned().collect();
        for name in forward_send_names {
            self.spawn_send_workers(&name, fwd_iters, Arc::clone(&counter), false);
        }
        if !forward_only {
            let backward_send_names: Vec<String> = self
                .backward_send
                .keys()
                .filter(|n| n.as_str() != ACK_TENSOR)
                .cloned()
                .collect();
            for name in backward_send_names {
                self.spawn_send_workers(&name, bwd_iters, Arc::clone(&counter), true);
            }
            let backward_receive_names: Vec<String> = self
                .backward_receive
                .keys()
                .filter(|n| n.as_str() != ACK_TENSOR)
                .cloned()
                .collect();
            for name in backward_receive_names {
                self.spawn_recv_workers(&name, fwd_iters, Arc::clone(&counter), true);
            }
        }

        if forward_only {
            self.spawn_send_workers(ACK_TENSOR, bwd_iters, Arc::clone(&counter), true);
            self.spawn_recv_workers(ACK_TENSOR, fwd_iters, Arc::clone(&counter), true);
        }
    }

    /// Take the worker half out of every slot registered for `name` in
    /// `map`, leaving the runtime half (and an emptied `worker_handle`)
    /// behind so `send`/`recv` keep working after the workers are spawned.
    fn take_worker_handles(
        map: &mut BTreeMap<String, Vec<Option<QueuePair<Tensor>>>>,
        name: &str,
    ) -> Vec<(usize, WorkerHandle<Tensor>)> {
        map.get_mut(name)
            .into_iter()
            .flatten()
            .flatten()
            .filter_map(|slot| slot.worker_handle.take().map(|h| (slot.peer_rank, h)))
            .collect()
    }

    fn spawn_recv_workers(&mut self, name: &str, iterations: u64, counter: Arc<Counter>, backward: bool) {
        let tag = self.tensor_tags.get(name).expect("tag registered at setup_queues");
        let dtype = *self.dtypes.get(name).unwrap_or(&DType::F32);
        let map = if backward {
            &mut self.backward_receive
        } else {
            &mut self.forward_receive
        };
        let handles = Self::take_worker_handles(map, name);
        for (peer, worker_handle) in handles {
            let Ok(pair) = self.group_for(peer, tag) else {
                counter.decrement();
                continue;
            };
            let tx = match worker_handle {
                WorkerHandle::Recv(tx) => tx,
                WorkerHandle::Send(_) => unreachable!("recv slot always carries a producer handle"),
            };
            let transport = Arc::clone(&self.transport);
            let name = name.to_string();
            let self_rank = self.rank;
            let counter = Arc::clone(&counter);
            let handle = tokio::spawn(async move {
                let group = select_group(&pair, peer, self_rank, true);
                for _ in 0..iterations {
                    match recv_tensor(transport.as_ref(), group, peer, &name, dtype).await {
                        Ok(tensor) => {
                            if tx.push(tensor).is_err() {
                                break;
                            }
                        }
                        Err(err) => {
                            tracing::warn!(peer, name = %name, backward, error = %err, "recv worker failed");
                            break;
                        }
                    }
                }
                counter.decrement();
            });
            self.workers.push(handle);
        }
    }

    fn spawn_send_workers(&mut self, name: &str, iterations: u64, counter: Arc<Counter>, backward: bool) {
        let tag = self.tensor_tags.get(name).expect("tag registered at setup_queues");
        let map = if backward {
            &mut self.backward_send
        } else {
            &mut self.forward_send
        };
        let handles = Self::take_worker_handles(map, name);
        for (peer, worker_handle) in handles {
            let Ok(pair) = self.group_for(peer, tag) else {
                counter.decrement();
                continue;
            };
            let mut rx = match worker_handle {
                WorkerHandle::Send(rx) => rx,
                WorkerHandle::Recv(_) => unreachable!("send slot always carries a consumer handle"),
            };
            let transport = Arc::clone(&self.transport);
            let name = name.to_string();
            let self_rank = self.rank;
            let counter = Arc::clone(&counter);
            let handle = tokio::spawn(async move {
                let group = select_group(&pair, peer, self_rank, false);
                for _ in 0..iterations {
                    let Some(tensor) = rx.recv().await else {
                        break;
                    };
                    if let Err(err) = send_tensor(transport.as_ref(), group, self_rank, &tensor).await {
                        tracing::warn!(peer, name = %name, backward, error = %err, "send worker failed");
                        break;
                    }
                }
                counter.decrement();
            });
            self.workers.push(handle);
        }
    }

    /// Enqueue `tensor` for sending. Non-blocking (§4.4).
    pub fn send(
        &mut self,
        name: &str,
        tensor: Tensor,
        forward_minibatch_id: u64,
        backward_minibatch_id: u64,
        backward: bool,
    ) -> Result<(), StageError> {
        let slots = if backward {
            self.backward_send.get_mut(name)
        } else {
            self.forward_send.get_mut(name)
        }
        .ok_or_else(|| StageError::MissingTensor(name.to_string()))?;

        let index = if backward {
            self.messaging_schedule
                .current_index(true)
                .map_err(|_| StageError::MissingTensor(name.to_string()))?
        } else {
            (forward_minibatch_id as usize + self.rank_in_stage) % slots.len()
        };
        let _ = backward_minibatch_id;

        let slot = slots
            .get_mut(index)
            .and_then(|s| s.as_mut())
            .ok_or_else(|| StageError::MissingTensor(name.to_string()))?;
        match &slot.runtime_handle {
            RuntimeHandle::Send(tx) => tx
                .push(tensor)
                .map_err(|_| StageError::QueueClosed(name.to_string())),
            RuntimeHandle::Recv(_) => unreachable!("send() only operates on send-direction queues"),
        }
    }

    /// Dequeue a received tensor, blocking until one is available (§4.4).
    pub async fn recv(
        &mut self,
        name: &str,
        forward_minibatch_id: u64,
        backward_minibatch_id: u64,
        backward: bool,
    ) -> Result<Tensor, StageError> {
        let slots = if backward {
            self.backward_receive.get_mut(name)
        } else {
            self.forward_receive.get_mut(name)
        }
        .ok_or_else(|| StageError::MissingTensor(name.to_string()))?;

        let index = if backward {
            (backward_minibatch_id as usize + self.rank_in_stage) % slots.len()
        } else {
            self.messaging_schedule
                .current_index(false)
                .map_err(|_| StageError::MissingTensor(name.to_string()))?
        };
        let _ = forward_minibatch_id;

        let slot = slots
            .get_mut(index)
            .and_then(|s| s.as_mut())
            .ok_or_else(|| StageError::MissingTensor(name.to_string()))?;
        match &mut slot.runtime_handle {
            RuntimeHandle::Recv(rx) => rx
                .recv()
                .await
                .ok_or_else(|| StageError::QueueClosed(name.to_string())),
            RuntimeHandle::Send(_) => unreachable!("recv() only operates on receive-direction queues"),
        }
    }

    /// Advance the forward-receive messaging cursor; call once per minibatch
    /// after every forward tensor has been received (§4.3).
    pub fn advance_forward_receive_cursor(&mut self) -> Result<(), StageError> {
        self.messaging_schedule
            .advance(false)
            .map_err(|_| StageError::MissingTensor("<forward receive cursor>".to_string()))
    }

    /// Advance the backward-send messaging cursor; call once per minibatch
    /// after every backward gradient has been sent (§4.3).
    pub fn advance_backward_send_cursor(&mut self) -> Result<(), StageError> {
        self.messaging_schedule
            .advance(true)
            .map_err(|_| StageError::MissingTensor("<backward send cursor>".to_string()))
    }

    /// Block until every background worker has decremented the shared
    /// counter to zero (§4.4).
    pub async fn wait(&self) {
        if let Some(counter) = &self.counter {
            counter.wait().await;
        }
    }

    /// The set of tensor names this stage receives in the forward direction,
    /// in the insertion-stable order used for compute-path iteration (§5).
    pub fn forward_receive_names(&self) -> impl Iterator<Item = &String> {
        self.receive_ranks.keys()
    }

    /// The set of tensor names this stage sends in the forward direction.
    pub fn forward_send_names(&self) -> impl Iterator<Item = &String> {
        self.send_ranks.keys()
    }
}

async fn recv_tensor(
    transport: &dyn CollectiveTransport,
    group: &dyn Group,
    src_rank: usize,
    name: &str,
    dtype: DType,
) -> Result<Tensor, TransportError> {
    let shape_bytes = transport.broadcast(group, src_rank, None).await?;
    let shape = decode_shape_bytes(&shape_bytes)?;
    let payload = transport.broadcast(group, src_rank, None).await?;
    debug!(name, src_rank, bytes = payload.len(), "received tensor");
    Ok(Tensor::new(name.to_string(), dtype, shape, payload.into()))
}

async fn send_tensor(
    transport: &dyn CollectiveTransport,
    group: &dyn Group,
    self_rank: usize,
    tensor: &Tensor,
) -> Result<(), TransportError> {
    let wire_shape = Tensor::encode_shape(&tensor.shape)
        .map_err(|e| TransportError::Broadcast(e.to_string()))?;
    let shape_bytes: Vec<u8> = wire_shape.iter().flat_map(|d| d.to_le_bytes()).collect();
    transport
        .broadcast(group, self_rank, Some(shape_bytes))
        .await?;
    transport
        .broadcast(group, self_rank, Some(tensor.data.to_vec()))
        .await?;
    debug!(name = %tensor.name, self_rank, bytes = tensor.data.len(), "sent tensor");
    Ok(())
}

fn decode_shape_bytes(bytes: &[u8]) -> Result<Vec<usize>, TransportError> {
    if bytes.len() != crate::tensor::MAX_SHAPE_DIMS * 4 {
        return Err(TransportError::Broadcast(format!(
            "expected {} shape bytes, got {}",
            crate::tensor::MAX_SHAPE_DIMS * 4,
            bytes.len()
        )));
    }
    let mut wire = [0i32; 10];
    for (i, chunk) in bytes.chunks_exact(4).enumerate() {
        wire[i] = i32::from_le_bytes(chunk.try_into().unwrap());
    }
    Ok(Tensor::decode_shape(&wire))
}
