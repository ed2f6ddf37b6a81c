//! Newick format parser and writer for unrooted trees.
//!
//! Supports the standard Newick grammar:
//! ```text
//! tree     = subtree ';'
//! subtree  = '(' children ')' label | label
//! children = subtree (',' subtree)*
//! label    = name? (':' length)?
//! ```
//!
//! The writer emits the standard unrooted form: a trifurcation at the
//! internal node adjacent to the entry leaf, with the entry leaf written
//! first. The parser suppresses a bifurcating outer node (a rooted input),
//! summing the two root edges, and designates the leftmost leaf as the
//! entry, so write-then-parse is the identity on (topology, branch lengths).

use std::path::Path;

use physalia_core::{PhysaliaError, Result};

use crate::tree::{NodeId, Tree};

/// Parse a Newick string into an unrooted [`Tree`].
pub fn parse(input: &str) -> Result<Tree> {
    let mut parser = Parser::new(input.as_bytes());
    let nodes = parser.parse_tree()?;
    assemble(nodes)
}

/// Parse a Newick file.
pub fn parse_file(path: &Path) -> Result<Tree> {
    let text = std::fs::read_to_string(path)?;
    parse(text.trim())
}

/// Serialize a tree to a Newick string.
pub fn write(tree: &Tree) -> String {
    let mut buf = String::new();
    let Some(entry) = tree.entry() else {
        buf.push(';');
        return buf;
    };
    let hub = tree.node(entry).neighbors[0].peer();
    let entry_len = tree.branch_length(entry, hub);
    buf.push('(');
    write_label(tree, entry, entry_len, &mut buf);
    if tree.is_leaf(hub) {
        // Two-leaf tree: put the whole length on the entry side.
        buf.push(',');
        write_label(tree, hub, 0.0, &mut buf);
    } else {
        for peer in tree.adjacent(hub, Some(entry)) {
            buf.push(',');
            write_subtree(tree, peer, hub, &mut buf);
        }
    }
    buf.push(')');
    buf.push(';');
    buf
}

/// Write a tree to a file, newline-terminated.
pub fn write_to_file(tree: &Tree, path: &Path) -> Result<()> {
    let mut text = write(tree);
    text.push('\n');
    std::fs::write(path, text)?;
    Ok(())
}

fn write_subtree(tree: &Tree, node: NodeId, dad: NodeId, buf: &mut String) {
    let len = tree.branch_length(dad, node);
    if tree.is_leaf(node) {
        write_label(tree, node, len, buf);
        return;
    }
    buf.push('(');
    for (i, peer) in tree.adjacent(node, Some(dad)).into_iter().enumerate() {
        if i > 0 {
            buf.push(',');
        }
        write_subtree(tree, peer, node, buf);
    }
    buf.push(')');
    write_label(tree, node, len, buf);
}

fn write_label(tree: &Tree, node: NodeId, len: f64, buf: &mut String) {
    if let Some(name) = &tree.node(node).name {
        buf.push_str(name);
    }
    buf.push(':');
    buf.push_str(&format_length(len));
}

// Shortest decimal form that parses back to the identical f64, so a
// write/parse round trip preserves branch lengths bit for bit.
fn format_length(len: f64) -> String {
    format!("{}", len)
}

/// Intermediate rooted node produced by the parser.
struct TmpNode {
    parent: Option<usize>,
    children: Vec<usize>,
    branch_length: Option<f64>,
    name: Option<String>,
}

/// Convert the parsed rooted node list into the unrooted store.
fn assemble(nodes: Vec<TmpNode>) -> Result<Tree> {
    if nodes.is_empty() {
        return Err(PhysaliaError::Parse("empty Newick string".into()));
    }
    let suppress_root = nodes[0].children.len() == 2;

    let mut tree = Tree::new();
    let mut map: Vec<Option<NodeId>> = vec![None; nodes.len()];
    for (i, tmp) in nodes.iter().enumerate() {
        if suppress_root && i == 0 {
            continue;
        }
        map[i] = Some(tree.add_node(tmp.name.clone()));
    }

    for (i, tmp) in nodes.iter().enumerate() {
        let Some(parent) = tmp.parent else { continue };
        if suppress_root && parent == 0 {
            continue;
        }
        tree.connect(
            map[parent].unwrap(),
            map[i].unwrap(),
            tmp.branch_length.unwrap_or(1.0),
        );
    }
    if suppress_root {
        let c1 = nodes[0].children[0];
        let c2 = nodes[0].children[1];
        let len = nodes[c1].branch_length.unwrap_or(1.0) + nodes[c2].branch_length.unwrap_or(1.0);
        tree.connect(map[c1].unwrap(), map[c2].unwrap(), len);
    }

    // Entry: leftmost leaf (first parsed node without children).
    let leftmost = nodes
        .iter()
        .enumerate()
        .find(|(_, n)| n.children.is_empty())
        .map(|(i, _)| i)
        .ok_or_else(|| PhysaliaError::Parse("tree has no leaves".into()))?;
    tree.set_entry(map[leftmost].unwrap());
    Ok(tree)
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
    nodes: Vec<TmpNode>,
}

impl<'a> Parser<'a> {
    fn new(input: &'a [u8]) -> Self {
        Self {
            input,
            pos: 0,
            nodes: Vec::new(),
        }
    }

    fn parse_tree(&mut self) -> Result<Vec<TmpNode>> {
        self.skip_whitespace();
        self.parse_subtree(None)?;
        self.skip_whitespace();
        if self.pos >= self.input.len() || self.input[self.pos] != b';' {
            return Err(PhysaliaError::Parse(
                "expected ';' at end of Newick string".into(),
            ));
        }
        self.pos += 1;
        Ok(std::mem::take(&mut self.nodes))
    }

    fn parse_subtree(&mut self, parent: Option<usize>) -> Result<usize> {
        self.skip_whitespace();
        let id = self.alloc_node(parent);

        if self.peek() == Some(b'(') {
            self.pos += 1;
            let first_child = self.parse_subtree(Some(id))?;
            self.nodes[id].children.push(first_child);
            loop {
                self.skip_whitespace();
                if self.peek() == Some(b',') {
                    self.pos += 1;
                    let child = self.parse_subtree(Some(id))?;
                    self.nodes[id].children.push(child);
                } else {
                    break;
                }
            }
            self.skip_whitespace();
            if self.peek() != Some(b')') {
                return Err(PhysaliaError::Parse("expected ')' in Newick string".into()));
            }
            self.pos += 1;
        }

        self.parse_label(id)?;
        Ok(id)
    }

    fn parse_label(&mut self, id: usize) -> Result<()> {
        self.skip_whitespace();
        let name = self.parse_name();
        if !name.is_empty() {
            self.nodes[id].name = Some(name);
        }
        self.skip_whitespace();
        if self.peek() == Some(b':') {
            self.pos += 1;
            self.skip_whitespace();
            let len_str = self.parse_float_str();
            if len_str.is_empty() {
                return Err(PhysaliaError::Parse("expected number after ':'".into()));
            }
            let len: f64 = len_str
                .parse()
                .map_err(|_| PhysaliaError::Parse(format!("invalid branch length: '{}'", len_str)))?;
            self.nodes[id].branch_length = Some(len);
        }
        Ok(())
    }

    fn parse_name(&mut self) -> String {
        let start = self.pos;
        while self.pos < self.input.len() {
            match self.input[self.pos] {
                b':' | b',' | b')' | b'(' | b';' => break,
                b' ' | b'\t' | b'\n' | b'\r' => break,
                _ => self.pos += 1,
            }
        }
        String::from_utf8_lossy(&self.input[start..self.pos]).into_owned()
    }

    fn parse_float_str(&mut self) -> String {
        let start = self.pos;
        while self.pos < self.input.len() {
            match self.input[self.pos] {
                b'0'..=b'9' | b'.' | b'-' | b'+' | b'e' | b'E' => self.pos += 1,
                _ => break,
            }
        }
        String::from_utf8_lossy(&self.input[start..self.pos]).into_owned()
    }

    fn alloc_node(&mut self, parent: Option<usize>) -> usize {
        let id = self.nodes.len();
        self.nodes.push(TmpNode {
            parent,
            children: Vec::new(),
            branch_length: None,
            name: None,
        });
        id
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn skip_whitespace(&mut self) {
        while self.pos < self.input.len() {
            match self.input[self.pos] {
                b' ' | b'\t' | b'\n' | b'\r' => self.pos += 1,
                _ => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_quartet_counts() {
        let tree = parse("((A:0.1,B:0.2):0.3,(C:0.4,D:0.5):0.6);").unwrap();
        assert_eq!(tree.leaf_count(), 4);
        // Rooted input: the outer bifurcation is suppressed into one edge.
        assert_eq!(tree.node_count(), 6);
        tree.check_binary().unwrap();
    }

    #[test]
    fn parse_suppressed_root_sums_lengths() {
        let tree = parse("((A:0.1,B:0.2):0.3,(C:0.4,D:0.5):0.6);").unwrap();
        // The AB and CD hubs are joined by a 0.3 + 0.6 edge.
        let internal = tree.internal_nodes();
        assert_eq!(internal.len(), 2);
        let len = tree.branch_length(internal[0], internal[1]);
        assert!((len - 0.9).abs() < 1e-12);
    }

    #[test]
    fn parse_trifurcation_directly() {
        let tree = parse("(A:0.1,B:0.2,(C:0.3,D:0.4):0.5);").unwrap();
        assert_eq!(tree.leaf_count(), 4);
        assert_eq!(tree.node_count(), 6);
        tree.check_binary().unwrap();
    }

    #[test]
    fn entry_is_leftmost_leaf() {
        let tree = parse("(A:0.1,B:0.2,(C:0.3,D:0.4):0.5);").unwrap();
        let entry = tree.entry().unwrap();
        assert_eq!(tree.node(entry).name.as_deref(), Some("A"));
    }

    #[test]
    fn parse_error_unbalanced() {
        assert!(parse("((A,B);").is_err());
    }

    #[test]
    fn parse_error_missing_semicolon() {
        assert!(parse("(A,B,C)").is_err());
    }

    #[test]
    fn parse_error_bad_float() {
        assert!(parse("(A:abc,B,C);").is_err());
    }

    #[test]
    fn parse_whitespace_tolerated() {
        let tree = parse("  ( A : 0.1 , B : 0.2 , C : 0.3 ) ; ").unwrap();
        assert_eq!(tree.leaf_count(), 3);
    }

    #[test]
    fn write_then_parse_identity() {
        let tree = parse("((A:0.1,B:0.2):0.3,(C:0.4,D:0.5):0.6);").unwrap();
        let text = write(&tree);
        let back = parse(&text).unwrap();
        assert_eq!(tree.splits(), back.splits());
        // Second round trip is byte-stable.
        assert_eq!(text, write(&back));
    }

    #[test]
    fn round_trip_five_taxa_with_internal_label() {
        let input = "(A:0.1,(B:0.2,(C:0.3,D:0.4)90:0.5)75:0.6,E:0.7);";
        let tree = parse(input).unwrap();
        let text = write(&tree);
        let back = parse(&text).unwrap();
        assert_eq!(tree.splits(), back.splits());
        assert!(text.contains("90") && text.contains("75"));
    }

    #[test]
    fn two_leaf_round_trip() {
        let mut t = Tree::new();
        let a = t.add_node(Some("A".into()));
        let b = t.add_node(Some("B".into()));
        t.connect(a, b, 0.42);
        t.set_entry(a);
        let text = write(&t);
        let back = parse(&text).unwrap();
        assert_eq!(back.leaf_count(), 2);
        let ba = back.entry().unwrap();
        let bb = back.node(ba).neighbors[0].peer();
        assert!((back.branch_length(ba, bb) - 0.42).abs() < 1e-12);
    }

    #[test]
    fn file_round_trip() {
        let tree = parse("(A:0.1,B:0.2,(C:0.3,D:0.4):0.5);").unwrap();
        let path = std::env::temp_dir().join("physalia_newick_roundtrip.treefile");
        write_to_file(&tree, &path).unwrap();
        let back = parse_file(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(tree.splits(), back.splits());
    }
}
