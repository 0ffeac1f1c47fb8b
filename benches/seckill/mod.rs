mod admission;
mod queue;

use criterion::Criterion;

/// Register every seckill benchmark.
pub fn register_benchmarks(c: &mut Criterion) {
    admission::register_benchmarks(c);
    queue::register_benchmarks(c);
}
