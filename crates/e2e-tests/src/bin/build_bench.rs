use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use clap::{Parser, ValueEnum};
use serde::Serialize;

use catalog_indexing::{metrics, BuildReport};
use catalog_types::{IndexNotification, IndexType, PipelineSettings};
use e2e_tests::TestHarness;

const DEFAULT_ITERATIONS: usize = 3;

#[derive(Parser, Debug)]
#[command(name = "build_bench", about = "Catalog index build benchmark harness")]
struct Args {
    #[arg(long, value_enum, default_value = "small")]
    tier: DatasetTier,
    #[arg(long, default_value_t = DEFAULT_ITERATIONS)]
    iterations: usize,
    #[arg(long, default_value_t = 100)]
    group_size: usize,
    #[arg(long, default_value_t = 4)]
    workers: usize,
    /// Share of entities touched by the incremental step, in percent
    #[arg(long, default_value_t = 10)]
    update_percent: u64,
    #[arg(long)]
    out_dir: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, Serialize, ValueEnum, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
enum DatasetTier {
    Small,
    Medium,
    Large,
}

impl DatasetTier {
    fn entity_count(&self) -> u64 {
        match self {
            DatasetTier::Small => 500,
            DatasetTier::Medium => 5_000,
            DatasetTier::Large => 50_000,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
struct StepMetrics {
    p50_ms: f64,
    p90_ms: f64,
    p99_ms: f64,
    samples: usize,
    p50_docs_per_sec: f64,
}

#[derive(Debug, Serialize)]
struct BenchmarkOutput {
    tier: DatasetTier,
    entities: u64,
    group_size: usize,
    workers: usize,
    iterations: usize,
    steps: BTreeMap<String, StepMetrics>,
    /// Stage timings of the last iteration, per step
    stage_timings_ms: BTreeMap<String, BTreeMap<String, u64>>,
}

#[derive(Default)]
struct SampleCollector {
    durations: BTreeMap<String, Vec<f64>>,
    throughput: BTreeMap<String, Vec<f64>>,
    stage_timings: BTreeMap<String, BTreeMap<String, u64>>,
}

impl SampleCollector {
    fn record(&mut self, step: &str, duration_ms: f64, report: &BuildReport) {
        let documents = report.performance.counter(metrics::DOCUMENTS_ADDED)
            + report.performance.counter(metrics::DOCUMENTS_DELETED);
        self.durations
            .entry(step.to_string())
            .or_default()
            .push(duration_ms);
        self.throughput
            .entry(step.to_string())
            .or_default()
            .push(docs_per_second(documents, duration_ms));
        self.stage_timings
            .insert(step.to_string(), report.performance.timings_ms.clone());
    }
}

#[tokio::main]
async fn main() -> Result<(), String> {
    let args = Args::parse();
    let settings = PipelineSettings {
        group_size: args.group_size,
        worker_count: args.workers,
        ..Default::default()
    };
    settings.validate().map_err(|e| e.to_string())?;

    let entities = args.tier.entity_count();
    let mut collector = SampleCollector::default();

    for iteration in 0..args.iterations {
        run_iteration(entities, &args, &settings, &mut collector)
            .await
            .map_err(|e| format!("iteration {iteration} failed: {e}"))?;
    }

    let output = BenchmarkOutput {
        tier: args.tier,
        entities,
        group_size: args.group_size,
        workers: args.workers,
        iterations: args.iterations,
        steps: build_metrics(&collector),
        stage_timings_ms: collector.stage_timings,
    };

    let json = serde_json::to_string_pretty(&output).map_err(|e| e.to_string())?;
    let table = render_table(&output);
    if let Some(out_dir) = &args.out_dir {
        fs::create_dir_all(out_dir).map_err(|e| format!("Failed to create out dir: {e}"))?;
        write_outputs(out_dir, &json, &table)?;
    }

    println!("{}", table);
    println!("\n{}", json);
    Ok(())
}

/// Full rebuild, incremental update, then a delete pass over a fresh harness.
async fn run_iteration(
    entities: u64,
    args: &Args,
    settings: &PipelineSettings,
    collector: &mut SampleCollector,
) -> Result<(), String> {
    let harness = TestHarness::new();
    harness.seed_entities(IndexType::Product, 1..=entities);
    let service = harness.service(settings.clone());

    let start = Instant::now();
    let report = service
        .rebuild_index("product")
        .await
        .map_err(|e| e.to_string())?;
    collector.record("rebuild", elapsed_ms(start), &report);

    let touched = (entities * args.update_percent.min(100) / 100).max(1);
    harness.seed_entities(IndexType::Product, 1..=touched);
    harness.notify(IndexNotification::update_many(
        IndexType::Product,
        (1..=touched).collect(),
    ));
    let start = Instant::now();
    let report = service
        .build_index(IndexType::Product)
        .await
        .map_err(|e| e.to_string())?;
    collector.record("incremental_update", elapsed_ms(start), &report);

    harness.notify(IndexNotification::delete_many(
        IndexType::Product,
        (1..=touched).collect(),
    ));
    let start = Instant::now();
    let report = service
        .build_index(IndexType::Product)
        .await
        .map_err(|e| e.to_string())?;
    collector.record("incremental_delete", elapsed_ms(start), &report);

    Ok(())
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

fn docs_per_second(count: u64, duration_ms: f64) -> f64 {
    if duration_ms <= 0.0 {
        return 0.0;
    }
    count as f64 / (duration_ms / 1000.0)
}

fn build_metrics(collector: &SampleCollector) -> BTreeMap<String, StepMetrics> {
    let mut steps = BTreeMap::new();
    for (step, durations) in &collector.durations {
        let sorted = sorted_values(durations);
        let throughput = collector
            .throughput
            .get(step)
            .map(|values| percentile(&sorted_values(values), 50.0))
            .unwrap_or_default();

        steps.insert(
            step.clone(),
            StepMetrics {
                p50_ms: percentile(&sorted, 50.0),
                p90_ms: percentile(&sorted, 90.0),
                p99_ms: percentile(&sorted, 99.0),
                samples: durations.len(),
                p50_docs_per_sec: throughput,
            },
        );
    }
    steps
}

fn sorted_values(values: &[f64]) -> Vec<f64> {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    sorted
}

fn percentile(values: &[f64], percentile: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let rank = (percentile / 100.0) * (values.len() as f64 - 1.0);
    let low = rank.floor() as usize;
    let high = rank.ceil() as usize;
    if low == high {
        values[low]
    } else {
        let weight = rank - low as f64;
        values[low] + (values[high] - values[low]) * weight
    }
}

fn render_table(output: &BenchmarkOutput) -> String {
    let mut lines = Vec::new();
    lines.push(format!(
        "Build Benchmark (entities={}, group_size={}, workers={}, iterations={})",
        output.entities, output.group_size, output.workers, output.iterations
    ));
    lines.push("step\tp50_ms\tp90_ms\tp99_ms\tdocs_per_sec".to_string());

    for (step, metrics) in &output.steps {
        lines.push(format!(
            "{}\t{:.2}\t{:.2}\t{:.2}\t{:.2}",
            step, metrics.p50_ms, metrics.p90_ms, metrics.p99_ms, metrics.p50_docs_per_sec
        ));
    }
    lines.join("\n")
}

fn write_outputs(out_dir: &Path, json: &str, table: &str) -> Result<(), String> {
    fs::write(out_dir.join("latest.json"), json).map_err(|e| e.to_string())?;
    fs::write(out_dir.join("latest.txt"), table).map_err(|e| e.to_string())?;
    Ok(())
}
