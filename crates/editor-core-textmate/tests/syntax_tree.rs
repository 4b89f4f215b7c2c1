use editor_core_textmate::{
    ScopeStyleMap, ScopedRange, SyntaxNode, SyntaxScope, SyntaxTree, TextEdit,
};
use pretty_assertions::assert_eq;

fn leaf(range: std::ops::Range<usize>, scope: &str) -> SyntaxNode {
    SyntaxNode::leaf(range, scope)
}

fn flat_tree() -> SyntaxTree {
    SyntaxTree::new(vec![leaf(0..2, "a"), leaf(4..6, "b"), leaf(8..10, "c")])
}

fn nested_tree() -> SyntaxTree {
    SyntaxTree::new(vec![
        SyntaxNode::new(
            0..10,
            Some("a".into()),
            vec![SyntaxNode::new(2..6, Some("b".into()), vec![leaf(3..4, "c")])],
        ),
        SyntaxNode::new(12..14, None, vec![leaf(12..13, "d")]),
    ])
}

fn ranges(tree: &SyntaxTree) -> Vec<std::ops::Range<usize>> {
    tree.nodes().iter().map(|n| n.range.clone()).collect()
}

#[test]
fn test_search_finds_overlapping_siblings() {
    let tree = flat_tree();
    assert_eq!(tree.search(1..5), 0..2);
    assert_eq!(tree.search(2..4), 1..1);
    assert_eq!(tree.search(5..5), 1..2);
    assert_eq!(tree.search(0..20), 0..3);
    assert_eq!(tree.search(20..30), 3..3);

    assert_eq!(tree.search_touching(2..4), 0..2);
    assert_eq!(tree.search_touching(10..10), 2..3);
}

#[test]
fn test_replace_splices_in_order() {
    let mut tree = flat_tree();
    tree.replace(2..4, vec![leaf(2..4, "gap")]);
    assert_eq!(ranges(&tree), vec![0..2, 2..4, 4..6, 8..10]);

    tree.replace(3..9, vec![leaf(3..9, "wide")]);
    assert_eq!(ranges(&tree), vec![0..2, 3..9]);
    assert_eq!(tree.len(), 2);

    tree.replace(0..20, Vec::new());
    assert!(tree.is_empty());
}

#[test]
fn test_apply_edit_discards_touched_and_shifts_later_nodes() {
    let mut tree = flat_tree();
    let dirty = tree.apply_edit(&TextEdit::insert(5, 3));
    assert_eq!(dirty, 4..9);
    assert_eq!(ranges(&tree), vec![0..2, 11..13]);

    let mut tree = SyntaxTree::new(vec![leaf(0..2, "a"), leaf(4..6, "b")]);
    let dirty = tree.apply_edit(&TextEdit::delete(0..1));
    assert_eq!(dirty, 0..1);
    assert_eq!(ranges(&tree), vec![3..5]);

    // An edit in a gap only touches its neighbours when adjacent.
    let mut tree = flat_tree();
    let dirty = tree.apply_edit(&TextEdit::with_length_delta(3..3, 1));
    assert_eq!(dirty, 3..4);
    assert_eq!(ranges(&tree), vec![0..2, 5..7, 9..11]);
}

#[test]
fn test_nested_node_shift_moves_children() {
    let mut tree = nested_tree();
    tree.apply_edit(&TextEdit::insert(11, 2));
    assert_eq!(
        tree.nodes()[1],
        SyntaxNode::new(14..16, None, vec![leaf(14..15, "d")])
    );
}

#[test]
fn test_region_queries() {
    let mut tree = flat_tree();
    assert_eq!(tree.spans_from(3), vec![4..6, 8..10]);

    assert_eq!(tree.remove_overlapping(5..9), Some(4..10));
    assert_eq!(ranges(&tree), vec![0..2]);
    assert_eq!(tree.remove_overlapping(3..4), None);
}

#[test]
fn test_scoped_ranges_skip_unscoped_wrappers() {
    let tree = nested_tree();
    let scoped = |range: std::ops::Range<usize>, scope: &str, depth| ScopedRange {
        range,
        scope: SyntaxScope::from(scope),
        depth,
    };

    assert_eq!(
        tree.scoped_ranges(),
        vec![
            scoped(0..10, "a", 0),
            scoped(2..6, "b", 1),
            scoped(3..4, "c", 2),
            scoped(12..13, "d", 0),
        ]
    );
    assert_eq!(
        tree.scoped_ranges_in(5..7),
        vec![scoped(0..10, "a", 0), scoped(2..6, "b", 1)]
    );
    assert_eq!(tree.scoped_ranges_in(11..20), vec![scoped(12..13, "d", 0)]);
}

#[test]
fn test_scopes_at_offset_feed_style_lookup() {
    let tree = nested_tree();
    let names = |offset| -> Vec<String> {
        tree.scopes_at(offset)
            .iter()
            .map(|s| s.as_str().to_string())
            .collect()
    };
    assert_eq!(names(3), vec!["a", "b", "c"]);
    assert_eq!(names(6), vec!["a"]);
    assert_eq!(names(12), vec!["d"]);
    assert!(names(11).is_empty());

    let mut styles = ScopeStyleMap::new();
    styles.insert("a", 1);
    styles.insert("b", 2);
    assert_eq!(styles.resolve_stack(tree.scopes_at(3).iter()), Some(&2));
    assert_eq!(styles.resolve_stack(tree.scopes_at(7).iter()), Some(&1));
}

#[test]
fn test_display_prints_indented_ranges() {
    assert_eq!(
        nested_tree().to_string(),
        "0..10 a\n  2..6 b\n    3..4 c\n12..14 -\n  12..13 d\n"
    );
}
