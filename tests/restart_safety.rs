//! Scenario 6 (spec.md §8): restart safety. A training epoch (forward +
//! backward, counters ticking) is followed by an evaluation epoch
//! (forward-only + ack) over fresh `CommEndpoints`/`StageRuntime` built on
//! the same transport — nothing from the first epoch's minibatch counters
//! or queues should leak into the second.

mod common;

use std::collections::BTreeMap as Map;
use std::sync::Arc;

use bytes::Bytes;
use pipeline_stage_runtime::{CommEndpoints, DType, LocalWorld, StageRuntime, Tensor};

use common::{two_stage_config, CriterionExecutor, IdentityExecutor};

const MINIBATCHES: u64 = 2;

fn loader_batch() -> Map<String, Tensor> {
    let mut batch = Map::new();
    batch.insert(
        "hidden".to_string(),
        Tensor::new("hidden", DType::F32, vec![2], Bytes::from(vec![0u8; 8])),
    );
    batch.insert(
        "target".to_string(),
        Tensor::new("target", DType::I64, vec![1], Bytes::from(1i64.to_le_bytes().to_vec())),
    );
    batch
}

async fn run_train_epoch(world: &Arc<LocalWorld>, cfg: &pipeline_stage_runtime::PartitionConfig) {
    let cfg0 = cfg.clone();
    let world0 = Arc::clone(world);
    let rank0 = tokio::spawn(async move {
        let transport = Arc::new(world0.transport(0));
        let comm = CommEndpoints::build(transport, &cfg0, 0, Map::new())
            .await
            .unwrap();
        let executor = IdentityExecutor {
            modules: cfg0.modules.clone(),
        };
        let mut stage = StageRuntime::new(executor, comm, 0, 2, cfg0.target_tensor_names.clone());
        stage.start_helper_threads(MINIBATCHES, false);
        for _ in 0..MINIBATCHES {
            stage.run_forward(Some(loader_batch())).await.unwrap();
        }
        for _ in 0..MINIBATCHES {
            stage.run_backward(None).await.unwrap();
        }
        stage.wait().await;
    });

    let cfg1 = cfg.clone();
    let world1 = Arc::clone(world);
    let rank1 = tokio::spawn(async move {
        let transport = Arc::new(world1.transport(1));
        let comm = CommEndpoints::build(transport, &cfg1, 1, Map::new())
            .await
            .unwrap();
        let executor = CriterionExecutor {
            modules: cfg1.modules.clone(),
        };
        let mut stage = StageRuntime::new(executor, comm, 1, 2, cfg1.target_tensor_names.clone());
        stage.start_helper_threads(MINIBATCHES, false);
        for _ in 0..MINIBATCHES {
            stage.run_forward(None).await.unwrap();
        }
        for _ in 0..MINIBATCHES {
            stage.run_backward(None).await.unwrap();
        }
        stage.wait().await;
    });

    rank0.await.unwrap();
    rank1.await.unwrap();
}

async fn run_eval_epoch(world: &Arc<LocalWorld>, cfg: &pipeline_stage_runtime::PartitionConfig) {
    let cfg0 = cfg.clone();
    let world0 = Arc::clone(world);
    let rank0 = tokio::spawn(async move {
        let transport = Arc::new(world0.transport(0));
        let comm = CommEndpoints::build(transport, &cfg0, 0, Map::new())
            .await
            .unwrap();
        let executor = IdentityExecutor {
            modules: cfg0.modules.clone(),
        };
        let mut stage = StageRuntime::new(executor, comm, 0, 2, cfg0.target_tensor_names.clone());
        stage.start_helper_threads(MINIBATCHES, true);
        for _ in 0..MINIBATCHES {
            stage.run_forward(Some(loader_batch())).await.unwrap();
            stage.run_ack().await.unwrap();
        }
        stage.wait().await;
        assert_eq!(stage.is_criterion(), false);
    });

    let cfg1 = cfg.clone();
    let world1 = Arc::clone(world);
    let rank1 = tokio::spawn(async move {
        let transport = Arc::new(world1.transport(1));
        let comm = CommEndpoints::build(transport, &cfg1, 1, Map::new())
            .await
            .unwrap();
        let executor = IdentityExecutor {
            modules: cfg1.modules.clone(),
        };
        let mut stage = StageRuntime::new(executor, comm, 1, 2, cfg1.target_tensor_names.clone());
        stage.start_helper_threads(MINIBATCHES, true);
        for _ in 0..MINIBATCHES {
            stage.run_forward(None).await.unwrap();
            stage.run_ack().await.unwrap();
        }
        stage.wait().await;
        assert!(stage.is_criterion());
    });

    rank0.await.unwrap();
    rank1.await.unwrap();
}

#[tokio::test]
async fn train_epoch_followed_by_eval_epoch_both_drain_cleanly() {
    let world = LocalWorld::new(2);
    let cfg = two_stage_config();

    run_train_epoch(&world, &cfg).await;
    run_eval_epoch(&world, &cfg).await;
}
