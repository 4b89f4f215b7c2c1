use criterion::{BatchSize, Criterion, black_box, criterion_group, criterion_main};
use editor_core_textmate::{
    CancellationToken, Grammar, GrammarTokenizer, HighlightConfig, HighlightScheduler, TextEdit,
    TextSnapshot,
};
use std::sync::Arc;

fn demo_tokenizer() -> Arc<GrammarTokenizer> {
    let grammar = Grammar::from_json(include_str!("../tests/fixtures/demo.tmLanguage.json"))
        .expect("demo grammar");
    GrammarTokenizer::new(Arc::new(grammar))
}

fn large_text(line_count: usize) -> String {
    let mut out = String::with_capacity(line_count * 48);
    for i in 0..line_count {
        match i % 4 {
            0 => out.push_str(&format!("let value{i} = {i} // line {i}\n")),
            1 => out.push_str("fn step { return \"escaped \\\" quote\" }\n"),
            2 => out.push_str("/* block comment\n"),
            _ => out.push_str("   closed here */ if ready { value }\n"),
        }
    }
    out
}

fn bench_full_highlight(c: &mut Criterion) {
    let tokenizer = demo_tokenizer();
    let snapshot = TextSnapshot::new(large_text(10_000));
    let never = CancellationToken::never();

    c.bench_function("full_highlight/10k_lines/sequential", |b| {
        b.iter(|| black_box(tokenizer.tokenize_document(&snapshot, &never, false)))
    });
    c.bench_function("full_highlight/10k_lines/parallel", |b| {
        b.iter(|| black_box(tokenizer.tokenize_document(&snapshot, &never, true)))
    });

    // Every line opens a comment inside one long comment.
    let nested = TextSnapshot::new(format!("/*\n{}*/\n", "see a /* b\n".repeat(10_000)));
    c.bench_function("full_highlight/10k_open_regions/parallel", |b| {
        b.iter(|| black_box(tokenizer.tokenize_document(&nested, &never, true)))
    });
}

fn bench_incremental_edit(c: &mut Criterion) {
    let tokenizer = demo_tokenizer();
    let mut text = large_text(10_000);
    let initial = TextSnapshot::new(text.as_str());
    let at = text.len() / 2;
    text.insert(at, 'x');
    let edited = TextSnapshot::new(text.as_str());

    c.bench_function("incremental_edit/10k_lines/single_insert", |b| {
        b.iter_batched(
            || {
                let mut scheduler = HighlightScheduler::new(tokenizer.clone())
                    .with_config(HighlightConfig::default().with_parallel(false));
                scheduler.highlight_all(&initial);
                scheduler
            },
            |mut scheduler| {
                black_box(scheduler.edit_sync(&edited, TextEdit::insert(at, 1)));
            },
            BatchSize::LargeInput,
        )
    });
}

criterion_group!(benches, bench_full_highlight, bench_incremental_edit);
criterion_main!(benches);
