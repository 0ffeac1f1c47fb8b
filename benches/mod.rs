use criterion::{criterion_group, criterion_main};

mod seckill;

use seckill::register_benchmarks as register_seckill_benchmarks;

criterion_group!(benches, register_seckill_benchmarks);

criterion_main!(benches);
