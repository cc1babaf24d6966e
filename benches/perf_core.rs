use codeloom::analysis::{CodeMetadata, DependencyAnalyzer, Language};
use codeloom::fuzzy::find_best_match;
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn synthetic_source(functions: usize) -> String {
    let mut out = String::with_capacity(functions * 120);
    for i in 0..functions {
        out.push_str(&format!(
            "function handler_{i}(req, res) {{\n    const value = compute_{i}(req.body);\n    res.send(value + {i});\n}}\n\n"
        ));
    }
    out
}

fn bench_fuzzy_match(c: &mut Criterion) {
    let content = synthetic_source(2_000);
    let exact = "    const value = compute_1500(req.body);\n    res.send(value + 1500);";
    // Drifted whitespace and a renamed call force the fuzzy path.
    let drifted = "  const value = computeX_1500(req.body);\n  res.send(value + 1500);";
    let hint_line = Some(1500 * 5 + 2);

    c.bench_function("fuzzy_exact_large_file", |b| {
        b.iter(|| {
            let found = find_best_match(black_box(&content), black_box(exact), None)
                .expect("non-empty target");
            black_box(found.is_some());
        });
    });

    c.bench_function("fuzzy_drifted_with_hint", |b| {
        b.iter(|| {
            let found = find_best_match(black_box(&content), black_box(drifted), hint_line)
                .expect("non-empty target");
            black_box(found.is_some());
        });
    });
}

fn bench_matrix_rebuild(c: &mut Criterion) {
    let root = std::env::temp_dir().join("codeloom-perf-synthetic");
    let metadata: Vec<CodeMetadata> = (0..2_000)
        .map(|i| CodeMetadata {
            file_path: format!("src/feature_{:03}/file_{:05}.js", i % 120, i),
            language: Language::JavaScript,
            imports: vec![format!("../feature_{:03}/file_{:05}", (i + 1) % 120, (i + 1) % 2_000)],
            exports: vec![format!("handler_{i}")],
            functions: vec![format!("handler_{i}")],
            classes: Vec::new(),
        })
        .collect();

    c.bench_function("matrix_rebuild_2k_files", |b| {
        b.iter(|| {
            let analyzer = DependencyAnalyzer::new();
            analyzer.update_many(&root, black_box(metadata.clone()));
            black_box(analyzer.matrix(&root).dependencies.len());
        });
    });
}

criterion_group!(perf_core, bench_fuzzy_match, bench_matrix_rebuild);
criterion_main!(perf_core);
