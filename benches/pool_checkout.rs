//! Criterion benchmark for checkout throughput: raw exclusive pool borrows
//! under contention, and full round trips through thread workers.

use std::sync::LazyLock;
use std::time::{Duration, Instant};

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use sql_bridge::dsn::ConnectParams;
use sql_bridge::flow::FlowId;
use sql_bridge::pool::{BoundedPool, ResourceFactory, factory_fn};
use sql_bridge::worker::{SqliteSyncDriver, ThreadWorkerFactory, WorkerConnection, WorkerPool};
use sql_bridge::{BridgeOptions, SqlBridgeError};
use tokio::runtime::Runtime;
use tokio::task::JoinSet;

const POOL_LIMIT: usize = 8;
const CHECKOUTS: usize = 256;

static TOKIO_RUNTIME: LazyLock<Runtime> =
    LazyLock::new(|| Runtime::new().expect("create tokio runtime"));

async fn contended_checkout<F>(pool: BoundedPool<F>, tasks: usize)
where
    F: ResourceFactory<Resource = u64>,
{
    let mut set = JoinSet::new();
    for _ in 0..tasks {
        let pool = pool.clone();
        set.spawn(async move {
            for _ in 0..CHECKOUTS / tasks {
                let conn = pool.acquire().await.expect("checkout");
                std::hint::black_box(*conn);
            }
        });
    }
    while let Some(joined) = set.join_next().await {
        joined.expect("checkout task panicked");
    }
}

fn benchmark_bounded_pool(group: &mut criterion::BenchmarkGroup<'_, criterion::measurement::WallTime>) {
    let runtime = &*TOKIO_RUNTIME;
    for tasks in [1, POOL_LIMIT, POOL_LIMIT * 4] {
        group.bench_function(BenchmarkId::new("bounded_pool_checkout", tasks), |b| {
            let pool = runtime.block_on(async {
                BoundedPool::new(factory_fn(|_cancel| async { Ok::<u64, SqlBridgeError>(1) }), POOL_LIMIT)
                    .expect("pool")
            });
            b.to_async(runtime).iter_custom(|iters| {
                let pool = pool.clone();
                async move {
                    let mut total = Duration::default();
                    for _ in 0..iters {
                        let start = Instant::now();
                        contended_checkout(pool.clone(), tasks).await;
                        total += start.elapsed();
                    }
                    total
                }
            });
        });
    }
}

fn benchmark_thread_worker_round_trip(
    group: &mut criterion::BenchmarkGroup<'_, criterion::measurement::WallTime>,
) {
    let runtime = &*TOKIO_RUNTIME;
    let options = BridgeOptions::builder()
        .worker_limit(2)
        .pool_limit(POOL_LIMIT)
        .finish();
    let workers = WorkerPool::new(ThreadWorkerFactory::new(SqliteSyncDriver, &options), options.worker_limit)
        .expect("worker pool");
    let conn = WorkerConnection::new(ConnectParams::with_dsn("sqlite::memory:"), workers, &options)
        .expect("worker connection");
    let flow = FlowId::next();

    group.bench_function(BenchmarkId::new("thread_worker_select", 1), |b| {
        b.to_async(runtime).iter(|| async {
            let stmt = conn.execute(flow, "SELECT 1").await.expect("select");
            std::hint::black_box(stmt.fetch_column(0).await.expect("fetch"));
        });
    });
}

fn pool_checkout(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool_checkout");
    group.throughput(Throughput::Elements(CHECKOUTS as u64));
    benchmark_bounded_pool(&mut group);
    group.finish();

    let mut group = c.benchmark_group("worker_round_trip");
    benchmark_thread_worker_round_trip(&mut group);
    group.finish();
}

criterion_group!(benches, pool_checkout);
criterion_main!(benches);
