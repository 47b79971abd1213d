use credence_core::engine::models;
use credence_core::*;
use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use std::sync::Arc;

fn bench_posterior_step(c: &mut Criterion) {
    let params = ModelParams::BetaBinomial {
        alpha: 12.0,
        beta: 5.0,
    };
    let evidence = Evidence::Binary {
        successes: 3,
        failures: 1,
    };

    c.bench_function("posterior_and_step", |b| {
        b.iter(|| {
            let target = models::posterior(black_box(&params), black_box(&evidence)).unwrap();
            models::apply_step(&params, &target, 0.7, Some(4.0))
        })
    });
}

fn bench_repository_update(c: &mut Criterion) {
    let repo = BeliefRepository::new();
    let profile = LearningProfile::default();
    let id = repo
        .create(
            &Observation::new("bench/update", Evidence::success()),
            None,
            &profile,
        )
        .unwrap()
        .id;
    let obs = Observation::for_belief(id, Evidence::success());

    c.bench_function("repository_update", |b| {
        b.iter(|| repo.update(black_box(id), black_box(&obs), &profile).unwrap())
    });
}

fn bench_route_fast_path(c: &mut Criterion) {
    let repo = Arc::new(BeliefRepository::new());
    let events = Arc::new(EventLog::new());
    let profile = LearningProfile::default();
    repo.create(
        &Observation::new(
            "bench/route",
            Evidence::Binary {
                successes: 60,
                failures: 28,
            },
        ),
        None,
        &profile,
    )
    .unwrap();
    let sched = TieredScheduler::new(SchedulerConfig::default(), Arc::clone(&events)).unwrap();
    let router = EscalationRouter::new(
        Arc::clone(&repo),
        sched.budget(),
        events,
        RouterConfig::default(),
    );
    let fp = SituationFingerprint::new("bench/route")
        .with_vote(HeuristicVote::new("recency", "proceed"));

    c.bench_function("route_fast_path", |b| {
        b.iter(|| router.route(black_box(&fp), &profile))
    });
}

fn bench_snapshot_all(c: &mut Criterion) {
    let repo = BeliefRepository::new();
    let profile = LearningProfile::default();
    for i in 0..500 {
        repo.create(
            &Observation::new(
                format!("bench/snap-{}", i),
                Evidence::Binary {
                    successes: 5,
                    failures: 2,
                },
            ),
            None,
            &profile,
        )
        .unwrap();
    }

    c.bench_function("snapshot_all_500", |b| {
        b.iter(|| black_box(repo.snapshot_all()))
    });
}

criterion_group!(
    benches,
    bench_posterior_step,
    bench_repository_update,
    bench_route_fast_path,
    bench_snapshot_all
);
criterion_main!(benches);
