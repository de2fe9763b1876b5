use criterion::{black_box, criterion_group, criterion_main, Criterion};
use drtm_core::demo::DemoKernel;
use drtm_core::{Architecture, Engine, EngineConfig, ThreadState};

fn crowded_engine() -> Engine {
    let mut kernel = DemoKernel::new();
    for i in 0..64 {
        kernel.spawn(&format!("worker{i}"), ThreadState::Ready, i % 8);
    }
    kernel.set_current(17);
    let image = kernel.build().expect("demo kernel");
    Engine::initialize(Box::new(image), Architecture::CortexM4.core_id(), EngineConfig::default())
        .expect("engine")
}

fn bench_refresh(c: &mut Criterion) {
    let mut engine = crowded_engine();
    c.bench_function("refresh_64_threads", |b| {
        b.iter(|| {
            engine.refresh().expect("refresh");
            black_box(engine.thread_count());
        })
    });
}

fn bench_register_file(c: &mut Criterion) {
    let mut engine = crowded_engine();
    engine.refresh().expect("refresh");
    let id = engine.thread_id_at(40).expect("thread");
    c.bench_function("register_file", |b| {
        b.iter(|| {
            let _ = black_box(engine.get_register_file(id));
        })
    });
}

criterion_group!(benches, bench_refresh, bench_register_file);
criterion_main!(benches);
