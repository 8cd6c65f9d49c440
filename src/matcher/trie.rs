//! Binary radix trie keyed by bit strings.
//!
//! Each node has one outgoing edge per bit value. Edge labels always start
//! with the bit they hang off, and a node may carry a payload when some
//! inserted key ends exactly there. Lookup returns the payload of the
//! longest inserted prefix of the query.

use super::bitstr::BitStr;

#[derive(Debug)]
struct Edge<T> {
    label: BitStr,
    child: Option<Box<Node<T>>>,
}

impl<T> Default for Edge<T> {
    fn default() -> Self {
        Edge {
            label: BitStr::empty(),
            child: None,
        }
    }
}

#[derive(Debug)]
struct Node<T> {
    edges: [Edge<T>; 2],
    data: Option<T>,
}

impl<T> Default for Node<T> {
    fn default() -> Self {
        Node {
            edges: [Edge::default(), Edge::default()],
            data: None,
        }
    }
}

/// A binary radix trie mapping bit-string prefixes to payloads.
#[derive(Debug)]
pub struct BinRadixTrie<T> {
    root: Node<T>,
}

impl<T> Default for BinRadixTrie<T> {
    fn default() -> Self {
        BinRadixTrie {
            root: Node::default(),
        }
    }
}

impl<T> BinRadixTrie<T> {
    /// Create an empty trie.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a prefix with its payload.
    ///
    /// Panics on a duplicate exact key; the rule set is built once at
    /// startup and a duplicate is a configuration programming error.
    pub fn insert(&mut self, key: BitStr, data: T) {
        assert!(!key.is_empty(), "duplicated key found: {key}");
        insert_at(&mut self.root, &key, key.clone(), data);
    }

    /// Find the payload of the longest inserted prefix of `query`.
    pub fn find_prefix(&self, query: &BitStr) -> Option<&T> {
        let mut cur: Option<&Node<T>> = Some(&self.root);
        let mut q = query.clone();
        let mut last_with_data: Option<&T> = None;

        loop {
            if q.is_empty() {
                break;
            }
            let node = match cur {
                Some(n) => n,
                None => break,
            };
            if let Some(d) = &node.data {
                last_with_data = Some(d);
            }
            let edge = &node.edges[q.bit(0) as usize];
            let l = edge.label.len();
            if edge.label.common_prefix_len(&q) != l {
                // diverged inside the edge
                return node.data.as_ref().or(last_with_data);
            }
            cur = edge.child.as_deref();
            q = q.substr(l, q.len() - l);
        }

        match cur {
            Some(node) if node.data.is_some() => node.data.as_ref(),
            _ => last_with_data,
        }
    }
}

fn insert_at<T>(node: &mut Node<T>, full_key: &BitStr, suffix: BitStr, data: T) {
    let edge = &mut node.edges[suffix.bit(0) as usize];

    if edge.child.is_none() {
        edge.label = suffix;
        edge.child = Some(Box::new(Node {
            data: Some(data),
            ..Node::default()
        }));
        return;
    }

    let l = edge.label.len();
    let cpl = edge.label.common_prefix_len(&suffix);

    if cpl == l {
        // the whole edge matched, descend
        let rest = suffix.substr(l, suffix.len() - l);
        let child = edge.child.as_mut().expect("checked above");
        if rest.is_empty() {
            panic!("duplicated key found: {full_key}");
        }
        insert_at(child, full_key, rest, data);
    } else {
        // split the edge at the divergence point
        let old_tail = edge.label.substr(cpl, l - cpl);
        let old_child = edge.child.take().expect("checked above");
        let new_tail = suffix.substr(cpl, suffix.len() - cpl);

        let mut mid = Node::default();
        let old_bit = old_tail.bit(0) as usize;
        mid.edges[old_bit] = Edge {
            label: old_tail,
            child: Some(old_child),
        };
        if new_tail.is_empty() {
            // the new key ends exactly at the split point
            mid.data = Some(data);
        } else {
            mid.edges[1 - old_bit] = Edge {
                label: new_tail,
                child: Some(Box::new(Node {
                    data: Some(data),
                    ..Node::default()
                })),
            };
        }

        edge.label = edge.label.substr(0, cpl);
        edge.child = Some(Box::new(mid));
    }
}
