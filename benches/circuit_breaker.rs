use criterion::{black_box, criterion_group, criterion_main, Criterion};
use batchwire::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerLayer};

use futures::future::Ready;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tower::{Service, ServiceBuilder};

// Returns its input; the cheapest possible inner service.
#[derive(Clone)]
struct EchoService;

impl Service<&'static str> for EchoService {
    type Response = &'static str;
    type Error = std::io::Error;
    type Future = Ready<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut std::task::Context<'_>) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: &'static str) -> Self::Future {
        futures::future::ready(Ok(req))
    }
}

fn config(threshold: usize) -> CircuitBreakerConfig {
    CircuitBreakerConfig::builder()
        .failure_threshold(threshold)
        .reset_timeout(Duration::from_secs(30))
        .build()
        .unwrap()
}

fn execute_closed(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let breaker = CircuitBreaker::new("bench", config(10));

    c.bench_function("execute_closed_success", |b| {
        b.to_async(&rt).iter(|| async {
            let _ = black_box(
                breaker.execute(|| async { Ok::<_, std::io::Error>(black_box(1u64)) }).await,
            );
        });
    });
}

fn execute_open_rejection(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let breaker = CircuitBreaker::new("bench", config(1));
    let calls = Arc::new(AtomicUsize::new(0));
    rt.block_on(async {
        let _ = breaker
            .execute(|| async { Err::<(), _>(std::io::Error::new(std::io::ErrorKind::Other, "boom")) })
            .await;
    });

    c.bench_function("execute_open_fail_fast", |b| {
        b.to_async(&rt).iter(|| async {
            let calls = calls.clone();
            let _ = black_box(
                breaker
                    .execute(move || async move {
                        calls.fetch_add(1, Ordering::Relaxed);
                        Ok::<_, std::io::Error>(())
                    })
                    .await,
            );
        });
    });
    assert_eq!(calls.load(Ordering::Relaxed), 0, "open breaker must not invoke the operation");
}

fn tower_layer_success(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let layer = CircuitBreakerLayer::new(CircuitBreaker::new("bench", config(10)));
    let svc = ServiceBuilder::new().layer(layer).service(EchoService);

    c.bench_function("tower_layer_success", |b| {
        b.to_async(&rt).iter(|| async {
            let mut local_svc = svc.clone();
            let _ = black_box(local_svc.call(black_box("request"))).await;
        });
    });
}

criterion_group!(benches, execute_closed, execute_open_rejection, tower_layer_success);
criterion_main!(benches);
