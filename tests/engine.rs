//! Engine Integration Tests
//!
//! Ordering of dynamically spawned subgraphs, promise reads, failure
//! propagation and termination.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use proptest::prelude::*;
use serde_json::{json, Value};
use strata::core::{
    Engine, FnBody, MemoryArtifactStore, Promise, PromiseError, RunContext, RunError, TaskBody, TaskContext,
    TaskGraph, TaskSpec,
};
use strata::domain::{EventType, TaskId, TaskState};

fn engine(max_cores: u32) -> Engine {
    Engine::new(RunContext::offline(Arc::new(MemoryArtifactStore::new())).with_max_cores(max_cores))
}

fn constant(value: Value) -> FnBody<impl Fn(&mut TaskContext) -> Result<Value> + Send + Sync> {
    FnBody::new(move |_| Ok(value.clone()))
}

struct Sleep {
    ms: u64,
    value: Value,
}

#[async_trait]
impl TaskBody for Sleep {
    async fn run(&self, _ctx: &mut TaskContext) -> Result<Value> {
        tokio::time::sleep(Duration::from_millis(self.ms)).await;
        Ok(self.value.clone())
    }
}

/// Spawns one child per delay; every child also spawns a follow-on of its own
struct FanOut {
    delays: Vec<u64>,
}

#[async_trait]
impl TaskBody for FanOut {
    async fn run(&self, ctx: &mut TaskContext) -> Result<Value> {
        let mut children = Vec::new();
        for (i, &ms) in self.delays.iter().enumerate() {
            let child = ctx.add_child(TaskSpec::new(format!("child:{}", i), Nested { ms, index: i }));
            children.push(child.to_value());
        }
        Ok(Value::Array(children))
    }
}

struct Nested {
    ms: u64,
    index: usize,
}

#[async_trait]
impl TaskBody for Nested {
    async fn run(&self, ctx: &mut TaskContext) -> Result<Value> {
        tokio::time::sleep(Duration::from_millis(self.ms)).await;
        ctx.add_follow_on(TaskSpec::new(
            format!("tail:{}", self.index),
            Sleep {
                ms: self.ms / 2,
                value: json!(null),
            },
        ));
        Ok(json!(self.index))
    }
}

fn run_fan_out(delays: Vec<u64>) -> Result<(), TestCaseError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .unwrap();

    runtime.block_on(async move {
        let width = delays.len();
        let mut graph = TaskGraph::new();
        let fan = graph.add_root(TaskSpec::new("fan", FanOut { delays }));
        graph.encapsulate(&fan).unwrap();
        let after = graph
            .add_follow_on(&fan, TaskSpec::new("after", constant(json!("done"))).input("fanned", &fan))
            .unwrap();

        let outcome = engine(4).run(graph).await.unwrap();

        // fan + after + a child and a tail per delay
        prop_assert_eq!(outcome.run.tasks.len(), 2 + 2 * width);
        prop_assert_eq!(outcome.run.count_in_state(TaskState::Completed), 2 + 2 * width);

        let (after_started, after_event) = outcome.event_for(after.id(), EventType::TaskStarted).unwrap();
        for (id, record) in &outcome.run.tasks {
            if !(record.name.starts_with("child:") || record.name.starts_with("tail:")) {
                continue;
            }
            let (completed, event) = outcome.event_for(*id, EventType::TaskCompleted).unwrap();
            prop_assert!(completed < after_started, "{} completed after the follow-on started", record.name);
            prop_assert!(event.timestamp <= after_event.timestamp);
        }

        // the follow-on reads the whole group: every child's value, in spawn order
        let expected: Vec<Value> = (0..width).map(|i| json!(i)).collect();
        let fanned = outcome.resolved_output(fan.id()).unwrap();
        prop_assert_eq!(fanned, Value::Array(expected));
        Ok(())
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn test_group_follow_on_starts_after_every_descendant(
        delays in proptest::collection::vec(0u64..20, 0..8)
    ) {
        run_fan_out(delays)?;
    }
}

#[tokio::test]
async fn test_children_and_follow_ons_order() {
    let mut graph = TaskGraph::new();
    let root = graph.add_root(TaskSpec::new("root", constant(json!(1))));
    let child = graph
        .add_child(&root, TaskSpec::new("child", Sleep { ms: 30, value: json!(2) }))
        .unwrap();
    let follow_on = graph
        .add_follow_on(&root, TaskSpec::new("follow_on", constant(json!(3))))
        .unwrap();

    let outcome = engine(4).run(graph).await.unwrap();

    let (root_done, _) = outcome.event_for(root.id(), EventType::TaskCompleted).unwrap();
    let (child_started, _) = outcome.event_for(child.id(), EventType::TaskStarted).unwrap();
    let (child_done, _) = outcome.event_for(child.id(), EventType::TaskCompleted).unwrap();
    let (follow_started, _) = outcome.event_for(follow_on.id(), EventType::TaskStarted).unwrap();
    assert!(root_done < child_started);
    assert!(child_done < follow_started);
}

/// Checks the promise is unreadable, then blocks on it
struct EarlyReader {
    promise: Promise,
}

#[async_trait]
impl TaskBody for EarlyReader {
    async fn run(&self, _ctx: &mut TaskContext) -> Result<Value> {
        let early = matches!(self.promise.try_get(), Err(PromiseError::Unresolved(_)));
        let value = self.promise.wait().await?;
        Ok(json!({ "early_read_refused": early, "value": *value }))
    }
}

#[tokio::test]
async fn test_promise_is_never_read_early() {
    let mut graph = TaskGraph::new();
    let producer = graph.add_root(TaskSpec::new("producer", Sleep { ms: 100, value: json!(42) }));
    // Not a dependent: runs alongside the producer and holds a bare promise
    let reader = graph.add_root(TaskSpec::new(
        "reader",
        EarlyReader {
            promise: producer.promise(),
        },
    ));
    let consumer = graph.add_root(
        TaskSpec::new("consumer", FnBody::new(|ctx| Ok(ctx.require("answer")?.clone()))).input("answer", &producer),
    );

    let outcome = engine(2).run(graph).await.unwrap();

    assert_eq!(
        outcome.output(reader.id()),
        Some(&json!({ "early_read_refused": true, "value": 42 }))
    );
    assert_eq!(outcome.output(consumer.id()), Some(&json!(42)));

    let (produced, _) = outcome.event_for(producer.id(), EventType::TaskCompleted).unwrap();
    let (consumed, _) = outcome.event_for(consumer.id(), EventType::TaskStarted).unwrap();
    assert!(produced < consumed);
}

#[derive(Debug, thiserror::Error)]
#[error("disk full")]
struct DiskFull;

#[tokio::test]
async fn test_failure_cancels_dependents_and_drains_running() {
    let mut graph = TaskGraph::new();
    let boom = graph.add_root(
        TaskSpec::new(
            "boom",
            FnBody::new(|_| {
                std::thread::sleep(Duration::from_millis(20));
                Err(DiskFull.into())
            }),
        )
        .unit("u1"),
    );
    let never = graph
        .add_child(&boom, TaskSpec::new("never", constant(json!(null))))
        .unwrap();
    let slow = graph.add_root(TaskSpec::new("slow", Sleep { ms: 200, value: json!("late") }));
    let after_slow = graph
        .add_follow_on(&slow, TaskSpec::new("after_slow", constant(json!(null))))
        .unwrap();
    let reader = graph.add_root(
        TaskSpec::new("reader", constant(json!(null))).input("late", &slow),
    );

    let outcome = engine(4).execute(graph).await;
    assert!(!outcome.is_success());

    let err = outcome.error().unwrap();
    assert_eq!(err.failed_task(), Some(boom.id()));
    assert_eq!(err.unit(), Some("u1"));
    assert!(err.task_error().unwrap().downcast_ref::<DiskFull>().is_some());
    match err {
        RunError::TaskFailed { task_name, .. } => assert_eq!(task_name, "boom"),
        other => panic!("unexpected error: {other}"),
    }

    let run = &outcome.run;
    assert_eq!(run.task_state(boom.id()), Some(TaskState::Failed));
    assert_eq!(run.task_state(never.id()), Some(TaskState::Cancelled));
    assert_eq!(run.task_state(after_slow.id()), Some(TaskState::Cancelled));
    assert_eq!(run.task_state(reader.id()), Some(TaskState::Cancelled));

    // already running when the failure arrived: allowed to finish, result dropped
    assert_eq!(run.task_state(slow.id()), Some(TaskState::Completed));
    assert!(outcome.output(slow.id()).is_none());
    assert!(outcome.event_for(never.id(), EventType::TaskStarted).is_none());
    assert_eq!(outcome.events.last().unwrap().event_type, EventType::RunFailed);
}

#[tokio::test]
async fn test_dynamic_back_edge_fails_the_spawning_task() {
    let mut graph = TaskGraph::new();
    let slow = graph.add_root(TaskSpec::new("slow", Sleep { ms: 300, value: json!(1) }));
    let promise = slow.promise();
    let spawner = graph.add_root(TaskSpec::new(
        "spawner",
        FnBody::new(move |ctx| {
            // depends on a task that is neither finished, the spawner, nor in this batch
            ctx.add_child(TaskSpec::new("reads_slow", FnBody::new(|_| Ok(json!(null)))).input("x", promise.clone()));
            Ok(json!(null))
        }),
    ));

    let err = engine(2).run(graph).await.unwrap_err();
    assert_eq!(err.failed_task(), Some(spawner.id()));
    assert!(err.to_string().contains("spawner"));
}

#[tokio::test]
async fn test_run_terminates_with_deep_dynamic_chain() {
    struct Chain(u32);

    #[async_trait]
    impl TaskBody for Chain {
        async fn run(&self, ctx: &mut TaskContext) -> Result<Value> {
            if self.0 > 0 {
                ctx.add_follow_on(TaskSpec::new(format!("link:{}", self.0 - 1), Chain(self.0 - 1)));
            }
            Ok(json!(self.0))
        }
    }

    let mut graph = TaskGraph::new();
    graph.add_root(TaskSpec::new("link:50", Chain(50)));

    let outcome = engine(1).run(graph).await.unwrap();
    assert_eq!(outcome.run.tasks.len(), 51);
    assert_eq!(outcome.run.task_state(TaskId(51)), Some(TaskState::Completed));
}

/// Spawns `width` sleeping grandchildren
struct Grow {
    width: usize,
}

#[async_trait]
impl TaskBody for Grow {
    async fn run(&self, ctx: &mut TaskContext) -> Result<Value> {
        for i in 0..self.width {
            ctx.add_child(TaskSpec::new(
                format!("grandchild:{}", i),
                Sleep {
                    ms: 10 * (i as u64 + 1),
                    value: json!(i),
                },
            ));
        }
        Ok(json!(self.width))
    }
}

fn first_named(outcome: &strata::core::RunOutcome, name: &str) -> TaskId {
    outcome.run.tasks_named(name).next().map(|(id, _)| *id).unwrap()
}

#[tokio::test]
async fn test_group_encapsulated_at_runtime_holds_its_external_follow_on() {
    let mut graph = TaskGraph::new();
    graph.add_root(TaskSpec::new(
        "planner",
        FnBody::new(|ctx| {
            let group = ctx.add_child(TaskSpec::new("group", Grow { width: 3 }));
            ctx.add_child_of(&group, TaskSpec::new("inner", Sleep { ms: 5, value: json!("inner") }))?;
            ctx.encapsulate(&group)?;
            ctx.add_follow_on_to(&group, TaskSpec::new("after", constant(json!("after"))).input("grown", &group))?;
            Ok(json!(null))
        }),
    ));

    let outcome = engine(4).run(graph).await.unwrap();
    assert_eq!(outcome.run.tasks.len(), 1 + 3 + 3);

    let (after_started, _) = outcome
        .event_for(first_named(&outcome, "after"), EventType::TaskStarted)
        .unwrap();
    for name in ["group", "inner", "grandchild:0", "grandchild:1", "grandchild:2"] {
        let (done, _) = outcome
            .event_for(first_named(&outcome, name), EventType::TaskCompleted)
            .unwrap();
        assert!(done < after_started, "{} completed after the follow-on started", name);
    }
}

#[tokio::test]
async fn test_reading_an_enclosing_group_from_inside_fails_the_spawner() {
    let mut graph = TaskGraph::new();
    let outer = graph.add_root(TaskSpec::new("outer", constant(json!("outer"))));
    let promise = outer.promise();
    let inside = graph
        .add_child(
            &outer,
            TaskSpec::new(
                "inside",
                FnBody::new(move |ctx| {
                    // waits for the whole group, which cannot finish before this child
                    ctx.add_child(TaskSpec::new("deadlocked", constant(json!(null))).input("outer", promise.clone()));
                    Ok(json!(null))
                }),
            ),
        )
        .unwrap();
    graph.encapsulate(&outer).unwrap();

    let err = engine(2).run(graph).await.unwrap_err();
    assert_eq!(err.failed_task(), Some(inside.id()));
}

#[tokio::test]
async fn test_wide_fan_out_spawns_in_linear_time() {
    const WIDTH: usize = 3000;

    struct Wide;

    #[async_trait]
    impl TaskBody for Wide {
        async fn run(&self, ctx: &mut TaskContext) -> Result<Value> {
            for i in 0..WIDTH {
                ctx.add_child(TaskSpec::new(
                    format!("child:{}", i),
                    FnBody::new(move |ctx| {
                        ctx.add_follow_on(TaskSpec::new(format!("tail:{}", i), constant(json!(null))));
                        Ok(json!(i))
                    }),
                ));
            }
            Ok(json!(WIDTH))
        }
    }

    let mut graph = TaskGraph::new();
    graph.add_root(TaskSpec::new("wide", Wide));

    let started = std::time::Instant::now();
    let outcome = tokio::time::timeout(Duration::from_secs(60), engine(64).run(graph))
        .await
        .expect("spawning should not slow down as the graph grows")
        .unwrap();

    assert_eq!(outcome.run.tasks.len(), 1 + 2 * WIDTH);
    assert_eq!(outcome.run.count_in_state(TaskState::Completed), 1 + 2 * WIDTH);
    assert!(started.elapsed() < Duration::from_secs(60));
}
