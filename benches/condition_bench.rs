//! Benchmarks for the primary-key condition: construction and range
//! evaluation, the two hot paths of query planning.

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use mergetree::{DataType, Expr, Field, FunctionRegistry, KeyCondition};

fn build_condition(registry: &FunctionRegistry) -> KeyCondition {
    // date = D AND (user_id > 100 OR user_id IN (1, 2, 3)) AND url LIKE 'https://e%'
    let predicate = Expr::and(
        Expr::equals(Expr::col("date"), Expr::lit(19_797u64)),
        Expr::and(
            Expr::or(
                Expr::greater(Expr::col("user_id"), Expr::lit(100u64)),
                Expr::in_set(
                    Expr::col("user_id"),
                    vec![Field::UInt64(1), Field::UInt64(2), Field::UInt64(3)],
                ),
            ),
            Expr::func("like", vec![Expr::col("url"), Expr::lit("https://e%")]),
        ),
    );
    KeyCondition::new(
        Some(&predicate),
        &["date".to_string(), "user_id".to_string(), "url".to_string()],
        &[DataType::Date, DataType::UInt64, DataType::String],
        registry,
    )
}

fn bench_construction(c: &mut Criterion) {
    let registry = FunctionRegistry::with_builtins();
    c.bench_function("key_condition_build", |b| {
        b.iter(|| black_box(build_condition(&registry)));
    });
}

fn bench_evaluation(c: &mut Criterion) {
    let registry = FunctionRegistry::with_builtins();
    let condition = build_condition(&registry);

    let tuples: Vec<(Vec<Field>, Vec<Field>)> = (0..64u64)
        .map(|i| {
            (
                vec![
                    Field::UInt64(19_790 + i % 10),
                    Field::UInt64(i * 31 % 1000),
                    Field::from("https://a"),
                ],
                vec![
                    Field::UInt64(19_790 + i % 10 + 1),
                    Field::UInt64(i * 37 % 1000 + 500),
                    Field::from("https://z"),
                ],
            )
        })
        .collect();

    c.bench_function("key_condition_eval_64_ranges", |b| {
        b.iter(|| {
            let mut matched = 0;
            for (left, right) in &tuples {
                if condition.may_be_true_in_range(black_box(left), black_box(right)) {
                    matched += 1;
                }
            }
            black_box(matched)
        });
    });
}

criterion_group!(benches, bench_construction, bench_evaluation);
criterion_main!(benches);
