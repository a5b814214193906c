use criterion::{Criterion, criterion_group, criterion_main};
use http::{HeaderMap, HeaderValue, StatusCode};
use hurdle_lib::ChallengeDetector;
use hurdle_lib::challenge::{Bindings, interpreter, prepare_script};
use hurdle_lib::ratelimit::{Algorithm, RateLimitConfig, RateLimiter};
use std::hint::black_box;

fn fixture(name: &str) -> String {
    std::fs::read_to_string(format!("../fixtures/challenges/{name}")).unwrap()
}

fn edge_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("cf-ray", HeaderValue::from_static("8a1b2c3d4e5f6a7b-AMS"));
    headers.insert("server", HeaderValue::from_static("cloudflare"));
    headers
}

fn benchmark_detection(c: &mut Criterion) {
    let detector = ChallengeDetector::new();
    let headers = edge_headers();
    let unprotected = HeaderMap::new();
    let pages = [
        ("javascript", fixture("javascript.html"), StatusCode::SERVICE_UNAVAILABLE),
        ("turnstile", fixture("turnstile.html"), StatusCode::FORBIDDEN),
        ("firewall", fixture("firewall.html"), StatusCode::FORBIDDEN),
    ];
    // A large unprotected page only hits the fast-reject path
    let plain = fixture("plain.html").repeat(500);

    for (name, body, status) in &pages {
        c.bench_function(&format!("classify {name}"), |b| {
            b.iter(|| detector.classify(black_box(body), &headers, *status));
        });
    }
    c.bench_function("classify unprotected", |b| {
        b.iter(|| detector.classify(black_box(&plain), &unprotected, StatusCode::OK));
    });
}

fn benchmark_interpreter(c: &mut Criterion) {
    let script = prepare_script(&fixture("javascript.html"));
    let bindings = Bindings::from([("t".to_string(), "example.com".to_string())]);
    c.bench_function("evaluate challenge script", |b| {
        b.iter(|| interpreter::evaluate(black_box(&script), &bindings));
    });
}

fn benchmark_rate_limiter(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap();
    let _guard = runtime.enter();

    for algorithm in [
        Algorithm::TokenBucket,
        Algorithm::LeakyBucket,
        Algorithm::SlidingWindow,
        Algorithm::Adaptive,
    ] {
        let limiter = RateLimiter::new(
            "bench",
            RateLimitConfig {
                algorithm,
                max_rate: 2_000_000.0,
                ..RateLimitConfig::per_second(1_000_000.0)
            },
        )
        .unwrap();
        c.bench_function(&format!("try_acquire {algorithm}"), |b| {
            b.iter(|| {
                if limiter.try_acquire(black_box(1)) {
                    limiter.release(1);
                }
            });
        });
    }
}

criterion_group!(
    name = benches;
    config = Criterion::default().sample_size(10);
    targets = benchmark_detection, benchmark_interpreter, benchmark_rate_limiter
);
criterion_main!(benches);
