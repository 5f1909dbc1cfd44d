#![allow(missing_docs)]
#![cfg(not(feature = "loom"))]

use ccp::{
    cancel::CancellationToken,
    config::PoolConfig,
    fan_in::{FanIn, FanInState},
    future::Future,
    key_registry::KeyRegistry,
    pipeline::{Pipeline, PipelineError},
    stream::{self, bounded},
    task::TaskError,
    worker_pool::WorkerPool,
};
use std::{
    sync::atomic::{AtomicUsize, Ordering},
    thread,
};

#[test_log::test]
fn fan_in_feeds_a_pipeline() {
    let fan_in = FanIn::new();
    let mut producers = Vec::new();
    for base in [0_u64, 100, 200] {
        let (sender, receiver) = bounded(0);
        fan_in.add_input_channel(receiver);
        producers.push(thread::spawn(move || {
            for i in 0..10 {
                sender.send(base + i).unwrap();
            }
        }));
    }
    let merged = fan_in.merged_channel().unwrap();
    let composed = Pipeline::new().stage(|x: u64| x * 2).stage(|x| x + 1).build();

    let mut output: Vec<_> = composed.run(merged).iter().map(Result::unwrap).collect();
    for producer in producers {
        producer.join().unwrap();
    }

    output.sort_unstable();
    let mut expected: Vec<_> = [0_u64, 100, 200]
        .into_iter()
        .flat_map(|base| (0..10).map(move |i| (base + i) * 2 + 1))
        .collect();
    expected.sort_unstable();
    assert_eq!(output, expected);
    assert_eq!(fan_in.state(), FanInState::Running);
    fan_in.close();
    assert_eq!(fan_in.state(), FanInState::Stopped);
}

#[test_log::test]
fn pool_tasks_serialise_on_registry_keys() {
    let registry = KeyRegistry::new();
    let holders: Vec<_> = (0..4).map(|_| AtomicUsize::new(0)).collect();
    let tasks: Vec<_> = (0..32_u32)
        .map(|i| {
            let registry = &registry;
            let holders = &holders;
            move || {
                let key = i % 4;
                let guard = loop {
                    if let Some(guard) = registry.lock_guard(key) {
                        break guard;
                    }
                    thread::yield_now();
                };
                let slot = &holders[key as usize];
                let concurrent = slot.fetch_add(1, Ordering::SeqCst) + 1;
                thread::yield_now();
                slot.fetch_sub(1, Ordering::SeqCst);
                drop(guard);
                concurrent
            }
        })
        .collect();

    let config: PoolConfig =
        serde_json::from_str(r#"{ "workers": 8, "thread_name": "keyed" }"#).unwrap();
    let results = WorkerPool::new(config).process(tasks).unwrap();

    assert_eq!(results.len(), 32);
    assert!(results.into_iter().all(|r| r == Ok(1)));
    assert!(registry.is_empty());
}

#[test_log::test]
fn futures_resolve_independently_of_their_siblings() {
    let futures: Vec<_> = (0..4_i32)
        .map(|i| {
            Future::new(move || {
                assert!(i != 2, "no luck with {i}");
                i * 10
            })
        })
        .collect();
    for future in &futures {
        future.submit().unwrap();
    }
    let outcomes: Vec<_> = futures.iter().map(|f| f.get().map_err(|e| e.to_string())).collect();
    assert_eq!(
        outcomes,
        vec![
            Ok(0),
            Ok(10),
            Err("task panicked: no luck with 2".to_owned()),
            Ok(30),
        ]
    );
}

#[test_log::test]
fn one_token_cancels_a_pipeline_and_a_pool() {
    let token = CancellationToken::new();
    token.cancel();

    let composed = Pipeline::new().stage(|x: i32| x + 1).build();
    let output: Vec<_> = composed
        .run_with(stream::from_iter([1, 2, 3]), &token)
        .iter()
        .collect();
    assert_eq!(output, vec![Err(PipelineError::Cancelled)]);

    let tasks: Vec<fn() -> i32> = vec![|| 1, || 2];
    let results = WorkerPool::default().process_with(tasks, &token).unwrap();
    assert_eq!(results, vec![Err(TaskError::Cancelled), Err(TaskError::Cancelled)]);
}
