//! Pipeline End-to-End Tests
//!
//! Several units, each with a runtime fan-out of different width, built from
//! one configuration and run on a single engine.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use strata::core::{
    ArtifactStore, FnBody, InputSlot, MemoryArtifactStore, Orchestrator, PipelineError, RunContext, Stage, TaskBody, TaskContext, TaskSpec,
    Toolkit,
};
use strata::domain::TaskState;
use tempfile::TempDir;

/// Counts lines per shard: `reads` is a file, `width` how many shards to run
struct LineCount;

impl Toolkit for LineCount {
    fn input_slots(&self) -> Vec<InputSlot> {
        vec![InputSlot::required("reads"), InputSlot::required("width").literal()]
    }

    fn body(&self, stage: &Stage) -> Arc<dyn TaskBody> {
        match stage {
            Stage::Prepare { .. } => Arc::new(Prepare),
            Stage::FanOut => Arc::new(Scatter),
            Stage::Merge => Arc::new(Sum),
            Stage::Aggregate => Arc::new(Report),
        }
    }
}

struct Prepare;

#[async_trait]
impl TaskBody for Prepare {
    async fn run(&self, ctx: &mut TaskContext) -> Result<Value> {
        match ctx.require("category")?.as_str() {
            Some("reads") => {
                let handle = ctx.artifact("input")?;
                let bytes = ctx.run_context().store().get(&handle).await?;
                Ok(json!(bytes.iter().filter(|b| **b == b'\n').count()))
            }
            Some("width") => {
                let raw = ctx.require("input")?.as_str().unwrap_or_default();
                let width: u64 = raw.parse().with_context(|| format!("width '{}' is not a number", raw))?;
                Ok(json!(width))
            }
            other => bail!("unexpected category {:?}", other),
        }
    }
}

struct Scatter;

#[async_trait]
impl TaskBody for Scatter {
    async fn run(&self, ctx: &mut TaskContext) -> Result<Value> {
        let width = ctx.require("prepared:width")?.as_u64().unwrap_or_default();
        let lines = ctx.require("prepared:reads")?.clone();
        let mut shards = Vec::new();
        for i in 0..width {
            let lines = lines.clone();
            let shard = ctx.add_child(TaskSpec::new(
                format!("shard:{}", i),
                FnBody::new(move |_| Ok(lines.clone())),
            ));
            shards.push(shard.to_value());
        }
        Ok(Value::Array(shards))
    }
}

struct Sum;

#[async_trait]
impl TaskBody for Sum {
    async fn run(&self, ctx: &mut TaskContext) -> Result<Value> {
        let fanned = ctx.require("fanned")?.as_array().cloned().unwrap_or_default();
        let total: u64 = fanned.iter().filter_map(Value::as_u64).sum();
        Ok(json!({ "shards": fanned.len(), "total": total }))
    }
}

struct Report;

#[async_trait]
impl TaskBody for Report {
    async fn run(&self, ctx: &mut TaskContext) -> Result<Value> {
        Ok(json!({ "unit": ctx.require("unit")?, "merged": ctx.require("merged")? }))
    }
}

fn orchestrator() -> Orchestrator {
    let context = RunContext::offline(Arc::new(MemoryArtifactStore::new()));
    Orchestrator::new(Arc::new(LineCount), context)
}

/// Writes one reads file per unit and returns the configuration text
fn config(temp: &TempDir, units: &[(&str, usize, &str)]) -> String {
    let mut yaml = String::from("units:\n");
    for (id, lines, width) in units {
        let path = temp.path().join(format!("{}.txt", id));
        std::fs::write(&path, "ACGT\n".repeat(*lines)).unwrap();
        yaml.push_str(&format!(
            "  {}:\n    reads: {}\n    width: \"{}\"\n",
            id,
            path.display(),
            width
        ));
    }
    yaml.push_str("shared:\n  storage_location: Local\n  output_folder: /out\n  max_cores: 4\n");
    yaml
}

#[tokio::test]
async fn test_units_with_different_fan_out_widths() {
    let temp = TempDir::new().unwrap();
    let yaml = config(&temp, &[("u1", 4, "0"), ("u2", 1, "2"), ("u3", 3, "5")]);

    let report = orchestrator().run_str(&yaml).await.unwrap();

    assert_eq!(report.units.len(), 3);
    let expect = [("u1", 0, 0), ("u2", 2, 2), ("u3", 5, 15)];
    for (id, shards, total) in expect {
        let result = report.unit(id).unwrap();
        assert_eq!(
            result.output,
            json!({ "unit": id, "merged": { "shards": shards, "total": total } }),
            "unit {}",
            id
        );
    }

    let run = &report.outcome.run;
    let shard_tasks = run.tasks.values().filter(|t| t.name.starts_with("shard:")).count();
    assert_eq!(shard_tasks, 7);
    // root, two prepares, fan_out, merge, aggregate per unit
    assert_eq!(run.tasks.len(), 3 * 6 + shard_tasks);
    assert_eq!(run.count_in_state(TaskState::Completed), run.tasks.len());
}

#[tokio::test]
async fn test_failing_unit_fails_the_run() {
    let temp = TempDir::new().unwrap();
    let yaml = config(&temp, &[("good", 2, "1"), ("bad", 2, "many")]);

    let err = orchestrator().run_str(&yaml).await.unwrap_err();

    assert_eq!(err.unit(), Some("bad"));
    assert!(err.task().is_some());
    match err {
        PipelineError::Run(run) => {
            assert!(run.to_string().contains("width 'many' is not a number"), "{run}");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_missing_input_file_fails_while_building() {
    let temp = TempDir::new().unwrap();
    let yaml = config(&temp, &[("u1", 1, "1")]);
    std::fs::remove_file(temp.path().join("u1.txt")).unwrap();

    let err = orchestrator().run_str(&yaml).await.unwrap_err();
    assert!(matches!(err, PipelineError::Build { ref unit, .. } if unit == "u1"));
}

#[tokio::test]
async fn test_unknown_input_category_is_rejected() {
    let temp = TempDir::new().unwrap();
    let yaml = config(&temp, &[("u1", 1, "1")]).replace("    width:", "    depth: x\n    width:");

    let err = orchestrator().run_str(&yaml).await.unwrap_err();
    assert_eq!(err.unit(), Some("u1"));
    assert!(err.to_string().contains("unrecognised input category 'depth'"), "{err}");
}
