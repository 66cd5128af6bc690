//! Suffix set over domain names.
//!
//! A label-wise trie keyed right to left: inserting `google.com` covers
//! `google.com`, `mail.google.com`, and `a.b.google.com`, but not
//! `play-google.com` or `github.com`. Inserting the apex `.` covers every
//! domain.

use rustc_hash::FxHashMap;

#[derive(Debug, Default, PartialEq)]
struct Node {
    children: FxHashMap<String, Node>,
    terminal: bool,
}

/// A set of domain suffixes. Built once at startup, then read-only.
#[derive(Debug, Default, PartialEq)]
pub struct DomainSet {
    root: Node,
    len: usize,
}

impl DomainSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert one domain. Surrounding whitespace and dots are stripped;
    /// empty entries are ignored. Inserting `.` collapses the set to
    /// "contains everything".
    pub fn insert(&mut self, domain: &str) {
        let domain = domain.trim();
        if domain.is_empty() {
            return;
        }

        let domain = domain.trim_matches('.');
        if domain.is_empty() {
            if !self.root.terminal {
                self.root.terminal = true;
                self.root.children.clear();
                self.len += 1;
            }
            return;
        }

        let mut node = &mut self.root;
        for label in domain.rsplit('.') {
            // A terminal node already covers everything below it.
            if node.terminal {
                return;
            }
            node = node
                .children
                .entry(label.to_ascii_lowercase())
                .or_default();
        }
        if !node.terminal {
            node.terminal = true;
            // More specific suffixes are now redundant.
            node.children.clear();
            self.len += 1;
        }
    }

    /// True when `domain` equals an inserted entry or is a subdomain of one.
    pub fn contains(&self, domain: &str) -> bool {
        let mut node = &self.root;
        if node.terminal {
            return true;
        }
        let domain = domain.trim_matches('.');
        for label in domain.rsplit('.') {
            match lookup_child(node, label) {
                Some(child) => node = child,
                None => return false,
            }
            if node.terminal {
                return true;
            }
        }
        false
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of entries inserted (covered duplicates excluded).
    pub fn len(&self) -> usize {
        self.len
    }
}

fn lookup_child<'a>(node: &'a Node, label: &str) -> Option<&'a Node> {
    if label.bytes().any(|b| b.is_ascii_uppercase()) {
        node.children.get(&label.to_ascii_lowercase())
    } else {
        node.children.get(label)
    }
}
