use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use std::time::Duration;
use tether::{RunPolicy, State};

fn bench_policy(c: &mut Criterion) {
    c.bench_function("backoff_attempt_cycle", |b| {
        b.iter(|| {
            let mut policy = RunPolicy::limit_attempts(10)
                .exponential_backoff_with(Duration::from_millis(100), Duration::from_millis(400))
                .build();
            for _ in 0..9 {
                policy.on_attempt_started();
                black_box(policy.on_attempt_failed());
                policy.schedule_now();
            }
        })
    });

    c.bench_function("validate_requested_state", |b| {
        let mut policy = RunPolicy::limit_attempts(10).build();
        b.iter(|| black_box(policy.validate_requested_state(State::Ready)));
    });

    c.bench_function("build_upon", |b| {
        let policy = RunPolicy::limit_attempts(10)
            .retry_delay(Duration::from_secs(5))
            .build();
        b.iter(|| black_box(policy.build_upon().build()));
    });
}

criterion_group!(benches, bench_policy);
criterion_main!(benches);
