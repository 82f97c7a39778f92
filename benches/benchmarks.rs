// benches/benchmarks.rs — Performance benchmarks (criterion)
//
// Hot paths of the Analyzing phase and the store:
//   1. Front extraction over growing result histories
//   2. Stratification and top-K ranking
//   3. SQLite append and query throughput

use std::collections::BTreeMap;

use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use sciloop::core::pareto::{self, Objective, RankingRule};
use sciloop::core::types::{Configuration, ExperimentResult, ParamValue};
use sciloop::memory::{self, ObjectiveStore, ResultFilter, SqliteStore};

// ─── Helpers ────────────────────────────────────────────────────────────────

fn objectives() -> Vec<Objective> {
    vec![
        Objective::maximize("psnr"),
        Objective::minimize("latency"),
        Objective::minimize("memory"),
    ]
}

/// N succeeded results spread over three compression ratios, with a
/// quality/latency trade-off so fronts are non-trivial.
fn synthetic_results(n: usize) -> Vec<ExperimentResult> {
    (0..n)
        .map(|i| {
            let cr = [8, 16, 24][i % 3];
            let width = (i % 37) as f64;
            let config = Configuration::from_pairs([
                ("compression_ratio", ParamValue::Int(cr)),
                ("index", ParamValue::Int(i as i64)),
            ])
            .expect("valid configuration");
            let objectives: BTreeMap<String, f64> = [
                ("psnr".to_string(), 20.0 + width * 0.3 - cr as f64 * 0.1),
                ("latency".to_string(), 5.0 + width * 1.7 + (i % 7) as f64),
                ("memory".to_string(), 0.5 + ((i * 13) % 29) as f64 / 10.0),
            ]
            .into_iter()
            .collect();
            ExperimentResult::succeeded(1, config, objectives, Utc::now())
        })
        .collect()
}

fn setup_store() -> SqliteStore {
    memory::open_in_memory().expect("open in-memory db")
}

// ─── Benchmark: Front extraction ────────────────────────────────────────────

fn bench_compute_front(c: &mut Criterion) {
    let objs = objectives();
    let mut group = c.benchmark_group("compute_front");
    for n in [50, 200, 800] {
        let results = synthetic_results(n);
        group.bench_with_input(BenchmarkId::from_parameter(n), &results, |b, results| {
            b.iter(|| pareto::compute_front(black_box(results), &objs).expect("front"))
        });
    }
    group.finish();
}

// ─── Benchmark: Stratify + rank ─────────────────────────────────────────────

fn bench_ranking(c: &mut Criterion) {
    let objs = objectives();
    let results = synthetic_results(400);
    let global = pareto::compute_front(&results, &objs).expect("front");

    let mut group = c.benchmark_group("ranking");

    group.bench_function("stratify_400", |b| {
        b.iter(|| pareto::stratify(black_box(&results), &objs, "compression_ratio").expect("strata"))
    });

    group.bench_function("top_k_crowding", |b| {
        b.iter(|| {
            pareto::retain_top_k(black_box(&global), 10, &objs, &RankingRule::CrowdingDistance)
                .expect("rank")
        })
    });

    let weighted = RankingRule::WeightedSum {
        weights: [
            ("psnr".to_string(), 0.6),
            ("latency".to_string(), 0.3),
            ("memory".to_string(), 0.1),
        ]
        .into_iter()
        .collect(),
    };
    group.bench_function("top_k_weighted", |b| {
        b.iter(|| pareto::retain_top_k(black_box(&global), 10, &objs, &weighted).expect("rank"))
    });

    group.finish();
}

// ─── Benchmark: Store operations ────────────────────────────────────────────

fn bench_store(c: &mut Criterion) {
    let mut group = c.benchmark_group("store");

    group.bench_function("startup_schema_init", |b| b.iter(setup_store));

    group.bench_function("append_result", |b| {
        let store = setup_store();
        let mut pool = synthetic_results(100_000).into_iter();
        b.iter(|| {
            if let Some(r) = pool.next() {
                store.append_result(black_box(&r)).expect("append");
            }
        })
    });

    group.bench_function("query_results_by_cycle", |b| {
        let store = setup_store();
        for r in synthetic_results(500) {
            store.append_result(&r).expect("append");
        }
        b.iter(|| {
            store
                .query_results(black_box(&ResultFilter::all().cycle(1).limit(50)))
                .expect("query")
        })
    });

    group.finish();
}

// ─── Main ───────────────────────────────────────────────────────────────────

criterion_group!(benches, bench_compute_front, bench_ranking, bench_store);
criterion_main!(benches);
