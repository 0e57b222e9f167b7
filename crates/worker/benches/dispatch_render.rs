use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use chrono::Utc;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde_json::{Map, Value, json};

use herald_core::payload::build_push;
use herald_core::{AppId, Job, Service, Template, User};
use herald_worker::messages::{compress_users, decompress_users};

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn audience(n: usize) -> Vec<User> {
    (0..n)
        .map(|i| {
            User::new(format!("user{i:07}"), format!("{i:064x}"))
                .with_locale(if i % 3 == 0 { "de" } else { "en" })
                .with_tz("+0100")
                .with_seq_id(i as i64 + 1)
        })
        .collect()
}

fn bench_render(c: &mut Criterion) {
    let mut group = c.benchmark_group("render");

    let template = Template::new(
        "welcome",
        "en",
        object(json!({
            "alert": { "title": "{{title}}", "body": "Hi {{name}}, {{offer}} is waiting" },
            "sound": "default",
        })),
    )
    .with_defaults(object(json!({ "title": "Welcome back", "offer": "a bonus" })));

    let mut job = Job::new(AppId::new(), "game", Service::Apns, "welcome").with_filters(
        [("locale".to_string(), "en".to_string())].into_iter().collect(),
    );
    job.context = object(json!({ "name": "player", "offer": "500 coins" }));

    group.bench_function("template", |b| {
        b.iter(|| black_box(template.render(black_box(&job.context))))
    });

    let users = audience(1_000);
    let now = Utc::now();
    group.throughput(Throughput::Elements(users.len() as u64));
    group.bench_function("build_push_batch", |b| {
        let mut rng = StdRng::seed_from_u64(7);
        b.iter(|| {
            for user in &users {
                let message = template.render(&job.context).unwrap_or_default();
                black_box(build_push(&job, user, "welcome", message, now, &mut rng));
            }
        })
    });

    group.finish();
}

fn bench_compression(c: &mut Criterion) {
    let mut group = c.benchmark_group("compress_users");

    for size in [100usize, 1_000, 10_000] {
        let users = audience(size);
        let encoded = compress_users(&users).unwrap_or_default();

        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("compress", size), &users, |b, users| {
            b.iter(|| black_box(compress_users(black_box(users))))
        });
        group.bench_with_input(BenchmarkId::new("decompress", size), &encoded, |b, encoded| {
            b.iter(|| black_box(decompress_users(black_box(encoded))))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_render, bench_compression);
criterion_main!(benches);
