//! Scenario 5 / round-trip law (spec.md §8): tensors of varying shape and a
//! `Bool`-typed tensor cross the wire bit-exactly. Drives `CommEndpoints`
//! directly (bypassing `StageRuntime`) so the shape-then-payload handshake
//! can be checked against the exact bytes sent.

mod common;

use std::collections::BTreeMap as Map;
use std::sync::Arc;

use bytes::Bytes;
use pipeline_stage_runtime::{CommEndpoints, DType, LocalWorld, Tensor};

use common::bare_two_stage_config;

#[tokio::test]
async fn varying_shapes_and_bool_dtype_round_trip_bit_exactly() {
    let world = LocalWorld::new(2);
    let cfg = bare_two_stage_config();

    let shapes: Vec<Vec<usize>> = vec![vec![1], vec![3, 2], vec![5], vec![2, 2, 2]];
    let payloads: Vec<Vec<u8>> = shapes
        .iter()
        .map(|shape| {
            let n: usize = shape.iter().product();
            (0..n).map(|i| (i % 2 == 0) as u8).collect()
        })
        .collect();

    let sender = {
        let cfg = cfg.clone();
        let world = Arc::clone(&world);
        let shapes = shapes.clone();
        let payloads = payloads.clone();
        tokio::spawn(async move {
            let transport = Arc::new(world.transport(0));
            let dtypes = Map::from([("hidden".to_string(), DType::Bool)]);
            let mut comm = CommEndpoints::build(transport, &cfg, 0, dtypes)
                .await
                .unwrap();
            comm.start_helper_threads(shapes.len() as u64, true);
            for (shape, payload) in shapes.into_iter().zip(payloads) {
                let tensor = Tensor::new("hidden", DType::Bool, shape, Bytes::from(payload));
                comm.send("hidden", tensor, 0, 0, false).unwrap();
                let control = Tensor::new("control", DType::I32, vec![1], Bytes::from(vec![0u8; 4]));
                comm.send("control", control, 0, 0, false).unwrap();
            }
            comm.wait().await;
        })
    };

    let receiver = {
        let cfg = cfg.clone();
        let world = Arc::clone(&world);
        let count = shapes.len() as u64;
        tokio::spawn(async move {
            let transport = Arc::new(world.transport(1));
            let dtypes = Map::from([("hidden".to_string(), DType::Bool)]);
            let mut comm = CommEndpoints::build(transport, &cfg, 1, dtypes)
                .await
                .unwrap();
            comm.start_helper_threads(count, true);
            let mut received = Vec::new();
            for _ in 0..count {
                let tensor = comm.recv("hidden", 0, 0, false).await.unwrap();
                received.push(tensor);
                comm.recv("control", 0, 0, false).await.unwrap();
            }
            comm.wait().await;
            received
        })
    };

    sender.await.unwrap();
    let received = receiver.await.unwrap();

    assert_eq!(received.len(), shapes.len());
    for (tensor, (shape, payload)) in received.iter().zip(shapes.iter().zip(payloads.iter())) {
        assert_eq!(&tensor.shape, shape);
        assert_eq!(tensor.dtype, DType::Bool);
        assert_eq!(tensor.data.as_ref(), payload.as_slice());
    }
}
