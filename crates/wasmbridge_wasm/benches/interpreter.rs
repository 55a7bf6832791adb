use criterion::{Criterion, black_box, criterion_group, criterion_main};
use wasmbridge_wasm::{Imports, InvokeOptions, Value, instantiate, load};

const LOOP: &str = r#"(module
    (func (export "sum") (param $n i32) (result i32) (local $acc i32)
      (block $done
        (loop $next
          (br_if $done (i32.eqz (local.get $n)))
          (local.set $acc (i32.add (local.get $acc) (local.get $n)))
          (local.set $n (i32.sub (local.get $n) (i32.const 1)))
          (br $next)))
      (local.get $acc))
    (func $fib (export "fib") (param i32) (result i32)
      (if (result i32) (i32.lt_u (local.get 0) (i32.const 2))
        (then (local.get 0))
        (else (i32.add
          (call $fib (i32.sub (local.get 0) (i32.const 1)))
          (call $fib (i32.sub (local.get 0) (i32.const 2))))))))"#;

fn bench_interpreter(c: &mut Criterion) {
    let bytes = wat::parse_str(LOOP).expect("parse wat");

    c.bench_function("load_and_validate", |b| {
        b.iter(|| load(black_box(&bytes)).expect("load"));
    });

    let module = load(&bytes).expect("load");
    let mut instance = instantiate(module, &Imports::new()).expect("instantiate");

    c.bench_function("loop_sum_10k", |b| {
        b.iter(|| instance.invoke("sum", &[Value::I32(black_box(10_000))]).expect("sum"));
    });

    c.bench_function("fib_20", |b| {
        b.iter(|| instance.invoke("fib", &[Value::I32(black_box(20))]).expect("fib"));
    });

    let metered = InvokeOptions::new().with_fuel(u64::MAX);
    c.bench_function("loop_sum_10k_metered", |b| {
        b.iter(|| {
            instance
                .invoke_with("sum", &[Value::I32(black_box(10_000))], &metered)
                .expect("sum")
        });
    });
}

criterion_group!(benches, bench_interpreter);
criterion_main!(benches);
