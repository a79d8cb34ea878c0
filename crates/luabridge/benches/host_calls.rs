use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use luabridge::{expose_fields, LuaError, State, StateOptions};
use std::sync::Arc;

#[derive(Default)]
struct Counter {
    value: i64,
}

expose_fields!(Counter { value });

fn new_state() -> State {
    let state = State::with_options(StateOptions::default()).unwrap();
    state.register(
        "add",
        Arc::new(|s: &State| -> Result<i32, LuaError> {
            let a = s.check_integer(1)?;
            let b = s.check_integer(2)?;
            s.push_integer(a + b);
            Ok(1)
        }),
    );
    state
}

fn bench_host_call(c: &mut Criterion) {
    let state = new_state();
    state
        .do_string("function loop(n) local x = 0 for i = 1, n do x = add(x, 1) end return x end")
        .unwrap();

    let mut group = c.benchmark_group("host_call");
    for n in [1i64, 100, 10_000] {
        group.bench_with_input(BenchmarkId::new("script_to_host", n), &n, |b, &n| {
            b.iter(|| {
                state.get_global("loop").unwrap();
                state.push_integer(black_box(n));
                state.call(1, 1).unwrap();
                state.pop(1);
            });
        });
    }
    group.finish();
    state.close().unwrap();
}

fn bench_do_string(c: &mut Criterion) {
    let state = new_state();

    c.bench_function("do_string", |b| {
        b.iter(|| {
            state.do_string(black_box("local y = add(20, 22)")).unwrap();
        });
    });
    state.close().unwrap();
}

fn bench_field_access(c: &mut Criterion) {
    let state = new_state();
    state.push_struct(Counter::default());
    state.set_global("counter").unwrap();
    state
        .do_string("function bump(n) for i = 1, n do counter.value = counter.value + 1 end end")
        .unwrap();

    c.bench_function("struct_field_rw_1000", |b| {
        b.iter(|| {
            state.get_global("bump").unwrap();
            state.push_integer(1000);
            state.call(1, 0).unwrap();
        });
    });
    state.close().unwrap();
}

fn bench_error_roundtrip(c: &mut Criterion) {
    let state = new_state();
    state.register(
        "fail",
        Arc::new(|s: &State| -> Result<i32, LuaError> { s.raise_error("bench") }),
    );

    c.bench_function("raised_error", |b| {
        b.iter(|| {
            let err = state.do_string("fail()").unwrap_err();
            black_box(err);
        });
    });
    state.close().unwrap();
}

criterion_group!(
    benches,
    bench_host_call,
    bench_do_string,
    bench_field_access,
    bench_error_roundtrip
);
criterion_main!(benches);
