use core::{hint::black_box, time::Duration};
use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use futures::stream::{FuturesUnordered, StreamExt};
use std::time::Instant;
use tokio::runtime::Builder;
use tonic::transport::Endpoint;
use tonic_health::pb::{HealthCheckRequest, health_client::HealthClient};
use tower::{Layer, Service, ServiceExt, service_fn};
use turnstile_core::BoxError;
use turnstile_server::server::{
    Server, ServerConfig, ServerOption, middleware::AdmissionLayer, registry,
};

type Request = http::Request<String>;
type Response = http::Response<String>;

const CONCURRENCY_CASES: [usize; 4] = [1, 4, 16, 64];
const POOL_SIZE: usize = 64;

fn echo() -> impl Service<Request, Response = Response, Error = BoxError, Future: Send + 'static>
+ Clone
+ Send
+ 'static {
    service_fn(|req: Request| async move { Ok::<_, BoxError>(http::Response::new(req.into_body())) })
}

async fn fan_out<S>(service: &S, concurrency: usize)
where
    S: Service<Request, Response = Response, Error = BoxError> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    let mut calls: FuturesUnordered<_> = (0..concurrency)
        .map(|_| {
            let req = http::Request::builder()
                .uri("/bench.Echo/Say")
                .body(String::from("ping"))
                .unwrap();
            tokio::spawn(service.clone().oneshot(req))
        })
        .collect();

    while let Some(res) = calls.next().await {
        black_box(res.unwrap().unwrap());
    }
}

fn admission_bench(c: &mut Criterion) {
    let rt = Builder::new_multi_thread().enable_all().build().unwrap();
    let layer = rt
        .block_on(async { AdmissionLayer::spawn(POOL_SIZE, Duration::from_secs(1)) })
        .unwrap();
    let pooled = layer.layer(echo());
    let direct = echo();

    for concurrency in CONCURRENCY_CASES {
        let mut group = c.benchmark_group("admission");
        group.throughput(Throughput::Elements(concurrency as u64));

        group.bench_function(format!("direct/conc/{concurrency}"), |b| {
            b.to_async(&rt).iter(|| fan_out(&direct, concurrency));
        });
        group.bench_function(format!("pooled/conc/{concurrency}"), |b| {
            b.to_async(&rt).iter(|| fan_out(&pooled, concurrency));
        });

        group.finish();
    }

    rt.block_on(layer.pool().stop()).unwrap();
}

fn grpc_bench(c: &mut Criterion) {
    let rt = Builder::new_multi_thread().enable_all().build().unwrap();
    let mut server = Server::new(ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        ..ServerConfig::default()
    });
    let addr = rt.block_on(async {
        let (_reporter, health) = tonic_health::server::health_reporter();
        server
            .configure([ServerOption::WorkerPool {
                max_workers: POOL_SIZE,
            }])
            .unwrap();
        server.start(vec![registry::service(health)]).await.unwrap();
        server.local_addr().unwrap()
    });

    let mut group = c.benchmark_group("grpc/health_check");
    for concurrency in CONCURRENCY_CASES {
        group.throughput(Throughput::Elements(concurrency as u64));
        group.bench_function(format!("conc/{concurrency}"), |b| {
            b.to_async(&rt).iter_custom(|iters| async move {
                let channel = Endpoint::from_shared(format!("http://{addr}"))
                    .unwrap()
                    .connect()
                    .await
                    .expect("Failed to connect to server");

                let start = Instant::now();
                for _ in 0..iters {
                    let mut calls: FuturesUnordered<_> = (0..concurrency)
                        .map(|_| {
                            let mut client = HealthClient::new(channel.clone());
                            tokio::spawn(async move {
                                client.check(HealthCheckRequest::default()).await
                            })
                        })
                        .collect();
                    while let Some(res) = calls.next().await {
                        black_box(res.unwrap().expect("check failed"));
                    }
                }
                start.elapsed()
            });
        });
    }
    group.finish();

    rt.block_on(server.stop()).unwrap();
}

criterion_group!(benches, admission_bench, grpc_bench);
criterion_main!(benches);
