use crate::textmate::scope::SyntaxScope;
use crate::textmate::text::TextEdit;
use std::fmt;
use std::ops::Range;
use tracing::trace;

/// A scoped byte range with nested children.
///
/// Children are sorted by start, pairwise non-overlapping, and contained in the
/// parent's range. A node without a scope groups the nodes of one top-level match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntaxNode {
    /// Byte range in the document.
    pub range: Range<usize>,
    /// Scope assigned to the range, if any.
    pub scope: Option<SyntaxScope>,
    /// Nested nodes.
    pub children: Vec<SyntaxNode>,
}

impl SyntaxNode {
    /// Create a node.
    pub fn new(range: Range<usize>, scope: Option<SyntaxScope>, children: Vec<SyntaxNode>) -> Self {
        Self {
            range,
            scope,
            children,
        }
    }

    /// Create a scoped node without children.
    pub fn leaf(range: Range<usize>, scope: impl Into<SyntaxScope>) -> Self {
        Self::new(range, Some(scope.into()), Vec::new())
    }

    /// Visit this node and its descendants in pre-order, with their depth.
    pub fn visit<'a>(&'a self, f: &mut impl FnMut(&'a SyntaxNode, usize)) {
        self.visit_at(0, f);
    }

    fn visit_at<'a>(&'a self, depth: usize, f: &mut impl FnMut(&'a SyntaxNode, usize)) {
        f(self, depth);
        for child in &self.children {
            child.visit_at(depth + 1, f);
        }
    }

    fn shift(&mut self, delta: isize) {
        self.range = self.range.start.saturating_add_signed(delta)
            ..self.range.end.saturating_add_signed(delta);
        for child in &mut self.children {
            child.shift(delta);
        }
    }
}

/// Insert `node` into a sorted forest, nesting it inside a containing node or around
/// the nodes it contains. A node that partially overlaps a sibling is dropped.
pub(crate) fn nest(forest: &mut Vec<SyntaxNode>, mut node: SyntaxNode) {
    let range = node.range.clone();
    let lo = forest.partition_point(|n| n.range.end <= range.start);
    let hi = forest.partition_point(|n| n.range.start < range.end).max(lo);

    if lo == hi {
        forest.insert(lo, node);
        return;
    }

    let first = &forest[lo].range;
    if hi - lo == 1 && first.start <= range.start && range.end <= first.end {
        nest(&mut forest[lo].children, node);
        return;
    }

    if range.start <= first.start && forest[hi - 1].range.end <= range.end {
        for inner in forest.drain(lo..hi) {
            nest(&mut node.children, inner);
        }
        forest.insert(lo, node);
        return;
    }

    trace!(?range, "dropping node that partially overlaps a sibling");
}

fn collect_scoped(
    nodes: &[SyntaxNode],
    depth: usize,
    keep: &impl Fn(&Range<usize>) -> bool,
    out: &mut Vec<ScopedRange>,
) {
    for node in nodes.iter().filter(|n| keep(&n.range)) {
        let child_depth = match &node.scope {
            Some(scope) => {
                out.push(ScopedRange {
                    range: node.range.clone(),
                    scope: scope.clone(),
                    depth,
                });
                depth + 1
            }
            None => depth,
        };
        collect_scoped(&node.children, child_depth, keep, out);
    }
}

/// A `(range, scope)` pair handed to the render collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopedRange {
    /// Byte range.
    pub range: Range<usize>,
    /// Scope of the range.
    pub scope: SyntaxScope,
    /// Nesting depth (0 for an outermost scope).
    pub depth: usize,
}

/// Per-document cache of top-level nodes, sorted and non-overlapping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyntaxTree {
    nodes: Vec<SyntaxNode>,
}

impl SyntaxTree {
    /// Create a tree from a sorted, non-overlapping forest.
    pub fn new(nodes: Vec<SyntaxNode>) -> Self {
        Self { nodes }
    }

    /// Top-level nodes.
    pub fn nodes(&self) -> &[SyntaxNode] {
        &self.nodes
    }

    /// Number of top-level nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns `true` if the tree has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Index range of the top-level nodes overlapping `subrange`.
    ///
    /// An empty `subrange` selects the node strictly containing its offset, if any.
    pub fn search(&self, subrange: Range<usize>) -> Range<usize> {
        let lo = self.nodes.partition_point(|n| n.range.end <= subrange.start);
        let hi = self.nodes.partition_point(|n| n.range.start < subrange.end);
        lo..hi.max(lo)
    }

    /// Index range of the top-level nodes overlapping or touching `subrange`.
    pub fn search_touching(&self, subrange: Range<usize>) -> Range<usize> {
        let lo = self.nodes.partition_point(|n| n.range.end < subrange.start);
        let hi = self.nodes.partition_point(|n| n.range.start <= subrange.end);
        lo..hi.max(lo)
    }

    /// Replace the nodes overlapping `subrange` with `nodes`.
    pub fn replace(&mut self, subrange: Range<usize>, nodes: Vec<SyntaxNode>) {
        let found = self.search(subrange.clone());
        // An empty subrange at a node boundary selects nothing; keep the splice sorted.
        let at = if found.is_empty() {
            self.nodes.partition_point(|n| n.range.start < subrange.start)
        } else {
            found.start
        };
        self.nodes.splice(at..found.end.max(at), nodes);
    }

    /// Apply a text edit to the cached ranges.
    ///
    /// Nodes overlapping or touching the replaced range are discarded, nodes after it are
    /// shifted by the length delta, and nodes before it are untouched. Returns the dirty
    /// span in new-text offsets: the inserted range widened to the discarded nodes.
    pub fn apply_edit(&mut self, edit: &TextEdit) -> Range<usize> {
        let touched = self.search_touching(edit.old_range());
        let mut dirty = edit.new_range();
        if !touched.is_empty() {
            let first = &self.nodes[touched.start];
            let last = &self.nodes[touched.end - 1];
            dirty.start = dirty.start.min(first.range.start);
            dirty.end = dirty.end.max(edit.map_position(last.range.end));
        }
        let at = touched.start;
        self.nodes.drain(touched);

        let delta = edit.length_delta();
        if delta != 0 {
            for node in &mut self.nodes[at..] {
                node.shift(delta);
            }
        }
        dirty
    }

    /// Remove the nodes overlapping `range`; returns the span they covered.
    pub fn remove_overlapping(&mut self, range: Range<usize>) -> Option<Range<usize>> {
        let found = self.search(range);
        if found.is_empty() {
            return None;
        }
        let span = self.nodes[found.start].range.start..self.nodes[found.end - 1].range.end;
        self.nodes.drain(found);
        Some(span)
    }

    /// Ranges of the top-level nodes starting at or after `offset`.
    pub fn spans_from(&self, offset: usize) -> Vec<Range<usize>> {
        let index = self.nodes.partition_point(|n| n.range.start < offset);
        self.nodes[index..].iter().map(|n| n.range.clone()).collect()
    }

    /// Every scoped range, in pre-order.
    pub fn scoped_ranges(&self) -> Vec<ScopedRange> {
        let mut out = Vec::new();
        collect_scoped(&self.nodes, 0, &|_| true, &mut out);
        out
    }

    /// Scoped ranges overlapping `range`, in pre-order.
    pub fn scoped_ranges_in(&self, range: Range<usize>) -> Vec<ScopedRange> {
        let found = self.search(range.clone());
        let mut out = Vec::new();
        collect_scoped(
            &self.nodes[found],
            0,
            &|r| r.start < range.end && range.start < r.end,
            &mut out,
        );
        out
    }

    /// Scopes covering `offset`, outermost first.
    pub fn scopes_at(&self, offset: usize) -> Vec<SyntaxScope> {
        let mut scopes = Vec::new();
        let mut level = self.nodes.as_slice();
        loop {
            let index = level.partition_point(|n| n.range.end <= offset);
            let Some(node) = level.get(index).filter(|n| n.range.start <= offset) else {
                break;
            };
            scopes.extend(node.scope.clone());
            level = &node.children;
        }
        scopes
    }
}

impl fmt::Display for SyntaxTree {
    /// One line per node, indented by depth: `start..end scope`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut result = Ok(());
        for node in &self.nodes {
            node.visit(&mut |n, depth| {
                if result.is_err() {
                    return;
                }
                let scope = n.scope.as_ref().map_or("-", SyntaxScope::as_str);
                result = writeln!(
                    f,
                    "{:indent$}{}..{} {}",
                    "",
                    n.range.start,
                    n.range.end,
                    scope,
                    indent = depth * 2
                );
            });
        }
        result
    }
}
