use editor_core_textmate::{
    Grammar, GrammarTokenizer, HighlightConfig, HighlightScheduler, SyntaxNode, TextEdit,
    TextSnapshot,
};
use pretty_assertions::assert_eq;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

const DEMO_JSON: &str = include_str!("fixtures/demo.tmLanguage.json");
const SAMPLE: &str = include_str!("fixtures/sample.demo");

fn demo_tokenizer() -> Arc<GrammarTokenizer> {
    GrammarTokenizer::new(Arc::new(Grammar::from_json(DEMO_JSON).expect("demo grammar")))
}

/// A document being edited, with the scheduler tracking it.
struct Document {
    text: String,
    scheduler: HighlightScheduler,
}

impl Document {
    fn new(text: &str, scheduler: HighlightScheduler) -> Self {
        let mut doc = Self {
            text: text.to_string(),
            scheduler,
        };
        doc.scheduler.highlight_all(&TextSnapshot::new(doc.text.as_str()));
        doc
    }

    fn splice(&mut self, range: Range<usize>, inserted: &str) -> (TextSnapshot, TextEdit) {
        let edit = TextEdit::replace(range.clone(), inserted.len());
        self.text.replace_range(range, inserted);
        (TextSnapshot::new(self.text.as_str()), edit)
    }

    fn edit_sync(&mut self, range: Range<usize>, inserted: &str) -> Range<usize> {
        let (snapshot, edit) = self.splice(range, inserted);
        self.scheduler.edit_sync(&snapshot, edit)
    }

    fn edit(&mut self, range: Range<usize>, inserted: &str) -> Range<usize> {
        let (snapshot, edit) = self.splice(range, inserted);
        self.scheduler.edit(&snapshot, edit)
    }

    fn nodes(&self) -> Vec<SyntaxNode> {
        self.scheduler
            .tree()
            .expect("highlighted")
            .nodes()
            .to_vec()
    }

    fn full(&self) -> Vec<SyntaxNode> {
        self.scheduler.tokenizer().tokenize_str(&self.text)
    }
}

#[test]
fn test_insert_between_tokens_matches_full_highlight() {
    let tokenizer = GrammarTokenizer::new(Arc::new(
        Grammar::from_json(
            r#"{ "scopeName": "source.t", "patterns": [{ "match": "[a-zA-Z]", "name": "letter" }] }"#,
        )
        .expect("grammar"),
    ));
    let mut doc = Document::new("ab", HighlightScheduler::new(tokenizer));
    assert_eq!(
        doc.nodes(),
        vec![SyntaxNode::leaf(0..1, "letter"), SyntaxNode::leaf(1..2, "letter")]
    );

    let (snapshot, edit) = doc.splice(1..1, "X");
    let dirty = doc.scheduler.edit(&snapshot, edit);
    assert_eq!(dirty, 0..3);
    assert!(doc.scheduler.is_pending());

    assert_eq!(doc.scheduler.wait(Duration::from_secs(10)), Some(0..3));
    assert!(!doc.scheduler.is_pending());
    assert_eq!(doc.nodes(), doc.full());
    assert_eq!(doc.nodes().len(), 3);
}

#[test]
fn test_incremental_edits_match_full_highlight() {
    let mut doc = Document::new(SAMPLE, HighlightScheduler::new(demo_tokenizer()));
    assert_eq!(doc.nodes(), doc.full());

    let edits: &[(&str, &str)] = &[
        // Rename a variable.
        ("greeting", "message"),
        // Open a block comment that swallows the rest of the document.
        ("// Entry point.", "/* Entry point."),
        // Close it again further down.
        ("if ready", "*/ if ready"),
        // Break a string across the escape.
        ("\\\"world", "\"world"),
        // Delete a closing brace.
        ("  }\n", ""),
        // Insert a new line at the very start.
        ("#!", "let x = 1\n#!"),
    ];

    for (find, replace) in edits {
        let start = doc.text.find(find).expect("edit target");
        doc.edit_sync(start..start + find.len(), replace);
        assert_eq!(doc.nodes(), doc.full(), "after replacing {find:?} with {replace:?}");
    }
}

#[test]
fn test_edit_inside_multiline_comment_resyncs() {
    let text = "a\n/* one\ntwo\nthree */\nb 1\n";
    let mut doc = Document::new(text, HighlightScheduler::new(demo_tokenizer()));

    let at = doc.text.find("two").expect("two");
    let updated = doc.edit_sync(at..at + 3, "*/ 2");
    assert_eq!(doc.nodes(), doc.full());
    // Re-tokenization starts at the comment and runs until the text settles.
    assert_eq!(updated.start, 2);

    let end = doc.text.len();
    doc.edit_sync(end..end, "/* tail");
    assert_eq!(doc.nodes(), doc.full());
}

#[test]
fn test_inserted_line_break_retokenizes_the_new_line() {
    // `1x` has no tokens: neither `\b\d+\b` nor a word matches inside it.
    let mut doc = Document::new("1x", HighlightScheduler::new(demo_tokenizer()));
    assert!(doc.nodes().is_empty());

    let updated = doc.edit_sync(1..1, "\n");
    assert_eq!(updated, 0..3);
    assert_eq!(
        doc.nodes(),
        vec![
            SyntaxNode::leaf(0..1, "constant.numeric.demo"),
            SyntaxNode::leaf(2..3, "variable.other.demo"),
        ]
    );
    assert_eq!(doc.nodes(), doc.full());
}

#[test]
fn test_edit_extending_while_region_retokenizes_it() {
    let tokenizer = GrammarTokenizer::new(Arc::new(
        Grammar::from_json(
            r#"{
                "scopeName": "source.t",
                "patterns": [
                    {
                        "begin": "^\\s*>",
                        "while": "^\\s*>",
                        "name": "markup.quote",
                        "patterns": [{ "match": "\\w+", "name": "word" }]
                    },
                    { "match": "\\w+", "name": "word" }
                ]
            }"#,
        )
        .expect("grammar"),
    ));
    let mut doc = Document::new(">a\n  c", HighlightScheduler::new(tokenizer));
    assert_eq!(
        doc.nodes(),
        vec![
            SyntaxNode::new(
                0..3,
                Some("markup.quote".into()),
                vec![SyntaxNode::leaf(1..2, "word")]
            ),
            SyntaxNode::leaf(5..6, "word"),
        ]
    );

    // The quote ended because of the second line; editing that line reopens it.
    doc.edit_sync(5..5, ">");
    assert_eq!(
        doc.nodes(),
        vec![SyntaxNode::new(
            0..7,
            Some("markup.quote".into()),
            vec![SyntaxNode::leaf(1..2, "word"), SyntaxNode::leaf(6..7, "word")]
        )]
    );
    assert_eq!(doc.nodes(), doc.full());
}

fn char_boundary(text: &str, at: usize) -> usize {
    (at..=text.len())
        .find(|&i| text.is_char_boundary(i))
        .unwrap_or(text.len())
}

#[test]
fn test_random_edits_match_full_highlight() {
    const SNIPPETS: &[&str] = &[
        "\n", "x", "1", " ", "/*", "*/", "//", "\"", "\\", "{", "}", "let ", "fn ",
    ];

    for seed in 0..64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut doc = Document::new(SAMPLE, HighlightScheduler::new(demo_tokenizer()));
        for step in 0..8 {
            let start = char_boundary(&doc.text, rng.gen_range(0..=doc.text.len()));
            let end = char_boundary(&doc.text, (start + rng.gen_range(0..4)).min(doc.text.len()));
            let inserted = if rng.gen_bool(0.3) {
                ""
            } else {
                SNIPPETS[rng.gen_range(0..SNIPPETS.len())]
            };
            doc.edit_sync(start..end, inserted);
            assert_eq!(
                doc.nodes(),
                doc.full(),
                "seed {seed}, step {step}: {start}..{end} -> {inserted:?}"
            );
        }
    }
}

#[test]
fn test_rapid_edits_apply_only_latest_result() {
    let text = SAMPLE.repeat(30);
    let mut doc = Document::new(&text, HighlightScheduler::new(demo_tokenizer()));
    let before = doc.scheduler.generation();

    for i in 0..20 {
        let at = doc.text.len() / 2 + i;
        let at = (at..doc.text.len())
            .find(|&i| doc.text.is_char_boundary(i))
            .unwrap_or(doc.text.len());
        doc.edit(at..at, if i % 2 == 0 { "/*" } else { "*/" });
    }
    assert_eq!(doc.scheduler.generation(), before + 20);

    let applied = doc.scheduler.wait(Duration::from_secs(30));
    assert!(applied.is_some());
    assert!(!doc.scheduler.is_pending());
    assert_eq!(doc.nodes(), doc.full());

    // Nothing newer is outstanding.
    assert_eq!(doc.scheduler.poll(), None);
    assert_eq!(doc.scheduler.wait(Duration::from_millis(10)), None);
}

#[test]
fn test_completion_callback_wakes_owner() {
    let (tx, rx) = crossbeam_channel::unbounded();
    let scheduler = HighlightScheduler::new(demo_tokenizer()).with_completion_callback(Arc::new(
        move || {
            let _ = tx.send(());
        },
    ));
    let mut doc = Document::new("let a = 1\n", scheduler);

    doc.edit(4..5, "bee");
    rx.recv_timeout(Duration::from_secs(10))
        .expect("completion callback");
    assert_eq!(doc.scheduler.poll(), Some(0..12));
    assert_eq!(doc.nodes(), doc.full());
}

#[test]
fn test_parallel_full_highlight_matches_sequential() {
    let text = SAMPLE.repeat(40);
    let snapshot = TextSnapshot::new(text.as_str());

    let mut parallel = HighlightScheduler::new(demo_tokenizer())
        .with_config(HighlightConfig::default().with_parallel_min_lines(1));
    let mut sequential = HighlightScheduler::new(demo_tokenizer())
        .with_config(HighlightConfig::default().with_parallel(false));
    assert!(parallel.config().parallel());
    assert_eq!(parallel.config().parallel_min_lines(), 1);

    let a = parallel.highlight_all(&snapshot).clone();
    let b = sequential.highlight_all(&snapshot).clone();
    assert_eq!(a, b);

    // Highlighting again yields the same tree.
    assert_eq!(parallel.highlight_all(&snapshot).clone(), a);
}

#[test]
fn test_edit_before_first_highlight_tokenizes_everything() {
    let mut scheduler = HighlightScheduler::new(demo_tokenizer());
    assert!(scheduler.tree().is_none());

    let snapshot = TextSnapshot::new("let a = 1");
    let updated = scheduler.edit_sync(&snapshot, TextEdit::insert(0, 9));
    assert_eq!(updated, 0..9);
    assert_eq!(
        scheduler.tree().expect("tree").nodes(),
        scheduler.tokenizer().tokenize_str("let a = 1").as_slice()
    );
    assert_eq!(scheduler.scoped_ranges(0..3).len(), 1);
}
