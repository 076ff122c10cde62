use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::info;

use crate::comm::{CommEndpoints, ACK_TENSOR, CONTROL_TENSOR};
use crate::control::{is_log_point, ControlRecord, CONTROL_RECORD_LEN};
use crate::error::StageError;
use crate::executor::{BackwardInput, ForwardInput, ForwardOutput, StageExecutor};
use crate::manifest::DType;
use crate::tensor::Tensor;

/// How many in-flight forward outputs a stage keeps waiting for their
/// matching backward pass, beyond which the oldest is evicted (§4.5 step 1).
const FORWARD_HISTORY_CAP: usize = 5;

/// Drives one stage's per-minibatch forward/backward/ack passes: pulls
/// activations off the wire via [`CommEndpoints`], calls into the
/// externally-owned [`StageExecutor`], and threads the piggybacked control
/// record along the forward path (§4.5).
pub struct StageRuntime<E: StageExecutor> {
    executor: E,
    comm: CommEndpoints,
    stage: usize,
    num_stages: usize,
    target_tensor_names: Vec<String>,
    sync_hook: Option<Box<dyn Fn() + Send + Sync>>,

    forward_minibatch_id: u64,
    backward_minibatch_id: u64,
    forward_history: VecDeque<ForwardOutput>,
    last_backward_duration: Duration,
}

impl<E: StageExecutor> StageRuntime<E> {
    pub fn new(
        executor: E,
        comm: CommEndpoints,
        stage: usize,
        num_stages: usize,
        target_tensor_names: Vec<String>,
    ) -> Self {
        Self {
            executor,
            comm,
            stage,
            num_stages,
            target_tensor_names,
            sync_hook: None,
            forward_minibatch_id: 0,
            backward_minibatch_id: 0,
            forward_history: VecDeque::new(),
            last_backward_duration: Duration::ZERO,
        }
    }

    /// Inject a device-synchronization hook, a stand-in for
    /// `torch.cuda.synchronize()`, called immediately before and after each
    /// compute call so timed durations reflect the real compute cost (§4.5
    /// step 3).
    pub fn with_sync_hook(mut self, hook: Box<dyn Fn() + Send + Sync>) -> Self {
        self.sync_hook = Some(hook);
        self
    }

    pub fn is_criterion(&self) -> bool {
        self.stage + 1 == self.num_stages
    }

    fn sync(&self) {
        if let Some(hook) = &self.sync_hook {
            hook();
        }
    }

    fn is_target_or_input(&self, name: &str) -> bool {
        self.target_tensor_names.iter().any(|t| t == name) || name.contains("input")
    }

    /// Run one forward pass. `loader_batch` supplies the initial tensors for
    /// stage 0; every other stage receives its inputs from the previous
    /// stage over the wire (§4.5 step 2).
    pub async fn run_forward(
        &mut self,
        loader_batch: Option<BTreeMap<String, Tensor>>,
    ) -> Result<(), StageError> {
        let mut inputs = BTreeMap::new();
        let mut incoming_control = None;

        if let Some(batch) = loader_batch {
            inputs = batch;
        } else {
            let names: Vec<String> = self.comm.forward_receive_names().cloned().collect();
            for name in names {
                let tensor = self
                    .comm
                    .recv(
                        &name,
                        self.forward_minibatch_id,
                        self.backward_minibatch_id,
                        false,
                    )
                    .await?;
                if name == CONTROL_TENSOR {
                    incoming_control = Some(tensor_to_control(&tensor)?);
                } else {
                    inputs.insert(name, tensor);
                }
            }
            self.comm.advance_forward_receive_cursor()?;
        }

        self.sync();
        let start = Instant::now();
        let output = self
            .executor
            .forward(ForwardInput {
                minibatch: self.forward_minibatch_id,
                tensors: inputs,
            })
            .await?;
        self.sync();
        let forward_duration = start.elapsed();

        let outgoing_control = match incoming_control {
            Some(record) => record.append(forward_duration, self.last_backward_duration),
            None => ControlRecord::new().append(forward_duration, self.last_backward_duration),
        };
        if self.is_criterion() && is_log_point(self.forward_minibatch_id) {
            outgoing_control.log_stats(self.forward_minibatch_id);
        }

        let send_names: Vec<String> = self.comm.forward_send_names().cloned().collect();
        for name in send_names {
            if name == CONTROL_TENSOR {
                self.comm.send(
                    &name,
                    control_to_tensor(&outgoing_control),
                    self.forward_minibatch_id,
                    self.backward_minibatch_id,
                    false,
                )?;
                continue;
            }
            let tensor = output
                .tensors
                .get(&name)
                .cloned()
                .ok_or_else(|| StageError::MissingTensor(name.clone()))?;
            self.comm.send(
                &name,
                tensor,
                self.forward_minibatch_id,
                self.backward_minibatch_id,
                false,
            )?;
        }

        self.forward_history.push_back(output);
        while self.forward_history.len() > FORWARD_HISTORY_CAP {
            self.forward_history.pop_front();
        }

        self.forward_minibatch_id += 1;
        Ok(())
    }

    /// Run one backward pass, matched FIFO against the oldest still-pending
    /// forward output. `token_count` triggers per-token gradient rescaling
    /// for sequence models (§1.2, §4.5 step 3).
    pub async fn run_backward(&mut self, token_count: Option<u64>) -> Result<(), StageError> {
        let mut gradients = BTreeMap::new();
        let recv_names: Vec<String> = self.comm.forward_send_names().cloned().collect();
        for name in recv_names {
            if name != CONTROL_TENSOR && self.is_target_or_input(&name) {
                continue;
            }
            let tensor = self
                .comm
                .recv(
                    &name,
                    self.forward_minibatch_id,
                    self.backward_minibatch_id,
                    true,
                )
                .await?;
            if name != CONTROL_TENSOR {
                gradients.insert(name, tensor);
            }
            // Backward control is received to keep the edge's FIFO flowing
            // but carries no telemetry (§4.5 step 4); it is discarded.
        }

        let forward_output = self.forward_history.pop_front().ok_or_else(|| {
            StageError::MissingTensor("<pending forward output for this backward pass>".into())
        })?;

        self.sync();
        let start = Instant::now();
        let mut backward_out = self
            .executor
            .backward(BackwardInput {
                minibatch: self.backward_minibatch_id,
                output_tensors: forward_output.tensors,
                output_gradients: gradients,
                token_count,
            })
            .await?;
        self.sync();
        self.last_backward_duration = start.elapsed();

        if let Some(denom) = token_count {
            backward_out.input_gradients = rescale_gradients(backward_out.input_gradients, denom);
        }

        let outgoing_control = ControlRecord::new();
        let send_names: Vec<String> = self.comm.forward_receive_names().cloned().collect();
        for name in send_names {
            if name == CONTROL_TENSOR {
                self.comm.send(
                    &name,
                    control_to_tensor(&outgoing_control),
                    self.forward_minibatch_id,
                    self.backward_minibatch_id,
                    true,
                )?;
                continue;
            }
            if self.is_target_or_input(&name) {
                continue;
            }
            let grad = backward_out
                .input_gradients
                .get(&name)
                .cloned()
                .ok_or_else(|| StageError::MissingTensor(name.clone()))?;
            self.comm.send(
                &name,
                grad,
                self.forward_minibatch_id,
                self.backward_minibatch_id,
                true,
            )?;
        }
        if self.stage > 0 {
            self.comm.advance_backward_send_cursor()?;
        }

        self.backward_minibatch_id += 1;
        Ok(())
    }

    /// Forward-only eval clocking: receive the downstream ack (if any) and
    /// forward a fresh zero ack upstream (if any), reusing the backward
    /// cursor so eval gets the same pairing structure as training (§4.5).
    pub async fn run_ack(&mut self) -> Result<(), StageError> {
        if self.stage + 1 < self.num_stages {
            self.comm
                .recv(
                    ACK_TENSOR,
                    self.forward_minibatch_id,
                    self.backward_minibatch_id,
                    true,
                )
                .await?;
        }
        if self.stage > 0 {
            let ack = Tensor::new(ACK_TENSOR, DType::I64, vec![1], Bytes::from(0i64.to_le_bytes().to_vec()));
            self.comm.send(
                ACK_TENSOR,
                ack,
                self.forward_minibatch_id,
                self.backward_minibatch_id,
                true,
            )?;
            self.comm.advance_backward_send_cursor()?;
        }
        self.backward_minibatch_id += 1;
        Ok(())
    }

    /// Block until every background I/O worker has drained (§4.4 `wait`).
    pub async fn wait(&self) {
        self.comm.wait().await;
    }

    pub fn start_helper_threads(&mut self, num_iterations: u64, forward_only: bool) {
        self.comm.start_helper_threads(num_iterations, forward_only);
    }
}

fn control_to_tensor(record: &ControlRecord) -> Tensor {
    let bytes: Vec<u8> = record
        .as_wire()
        .iter()
        .flat_map(|v| v.to_le_bytes())
        .collect();
    Tensor::new(CONTROL_TENSOR, DType::I32, vec![CONTROL_RECORD_LEN], Bytes::from(bytes))
}

fn tensor_to_control(tensor: &Tensor) -> Result<ControlRecord, StageError> {
    if tensor.data.len() != CONTROL_RECORD_LEN * 4 {
        return Err(StageError::ShapeMismatch {
            name: CONTROL_TENSOR.to_string(),
            expected: format!("{} bytes", CONTROL_RECORD_LEN * 4),
            got: format!("{} bytes", tensor.data.len()),
        });
    }
    let mut wire = [0i32; CONTROL_RECORD_LEN];
    for (i, chunk) in tensor.data.chunks_exact(4).enumerate() {
        wire[i] = i32::from_le_bytes(chunk.try_into().unwrap());
    }
    Ok(ControlRecord::from_wire(wire))
}

/// Divide every F32 gradient tensor by `denom`, the way `_rescale` divides
/// accumulated gradients by token count for sequence models (§1.2). Other
/// dtypes pass through unscaled: this core has no numeric-kernel of its own
/// to interpret their bit layout.
fn rescale_gradients(
    gradients: BTreeMap<String, Tensor>,
    denom: u64,
) -> BTreeMap<String, Tensor> {
    let denom = denom as f32;
    gradients
        .into_iter()
        .map(|(name, tensor)| {
            if tensor.dtype != DType::F32 || denom == 0.0 {
                return (name, tensor);
            }
            let scaled: Vec<u8> = tensor
                .data
                .chunks_exact(4)
                .flat_map(|chunk| {
                    let value = f32::from_le_bytes(chunk.try_into().unwrap());
                    (value / denom).to_le_bytes()
                })
                .collect();
            (name.clone(), Tensor::new(name, tensor.dtype, tensor.shape, Bytes::from(scaled)))
        })
        .collect()
}
