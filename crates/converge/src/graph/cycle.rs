//! Cycle detection by three-color depth-first search

use std::collections::{BTreeMap, BTreeSet};

use crate::resource::NodeKey;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Find a cycle in a successor map
///
/// Returns the nodes along the first cycle found (visiting nodes in key
/// order), with the first node repeated at the end.
pub fn find_cycle(successors: &BTreeMap<NodeKey, BTreeSet<NodeKey>>) -> Option<Vec<NodeKey>> {
    let mut color: BTreeMap<&NodeKey, Color> =
        successors.keys().map(|k| (k, Color::White)).collect();

    for start in successors.keys() {
        if color.get(start) != Some(&Color::White) {
            continue;
        }

        // Explicit stack of (node, remaining successors) keeps deep graphs off
        // the call stack.
        let mut path: Vec<&NodeKey> = vec![start];
        let mut stack: Vec<std::collections::btree_set::Iter<'_, NodeKey>> =
            vec![successors[start].iter()];
        color.insert(start, Color::Gray);

        while let Some(iter) = stack.last_mut() {
            match iter.next() {
                Some(next) => match color.get(next).copied().unwrap_or(Color::Black) {
                    Color::White => {
                        color.insert(next, Color::Gray);
                        path.push(next);
                        stack.push(successors[next].iter());
                    }
                    Color::Gray => {
                        let from = path.iter().position(|k| *k == next).unwrap_or(0);
                        let mut cycle: Vec<NodeKey> =
                            path[from..].iter().map(|k| (*k).clone()).collect();
                        cycle.push(next.clone());
                        return Some(cycle);
                    }
                    Color::Black => {}
                },
                None => {
                    stack.pop();
                    if let Some(done) = path.pop() {
                        color.insert(done, Color::Black);
                    }
                }
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(edges: &[(&str, &str)], extra: &[&str]) -> BTreeMap<NodeKey, BTreeSet<NodeKey>> {
        let mut map: BTreeMap<NodeKey, BTreeSet<NodeKey>> = BTreeMap::new();
        for key in extra {
            map.entry((*key).into()).or_default();
        }
        for (a, b) in edges {
            map.entry((*a).into()).or_default().insert((*b).into());
            map.entry((*b).into()).or_default();
        }
        map
    }

    #[test]
    fn test_acyclic() {
        let g = graph(&[("a", "b"), ("b", "c"), ("a", "c")], &["d"]);
        assert!(find_cycle(&g).is_none());
    }

    #[test]
    fn test_simple_cycle() {
        let g = graph(&[("a", "b"), ("b", "c"), ("c", "a")], &[]);
        let cycle = find_cycle(&g).unwrap();
        let keys: Vec<&str> = cycle.iter().map(NodeKey::as_str).collect();
        assert_eq!(keys, vec!["a", "b", "c", "a"]);
    }

    #[test]
    fn test_self_loop() {
        let g = graph(&[("a", "a")], &[]);
        let cycle = find_cycle(&g).unwrap();
        assert_eq!(cycle, vec![NodeKey::from("a"), NodeKey::from("a")]);
    }

    #[test]
    fn test_cycle_behind_acyclic_prefix() {
        let g = graph(&[("a", "b"), ("b", "c"), ("c", "d"), ("d", "b")], &[]);
        let cycle = find_cycle(&g).unwrap();
        let keys: Vec<&str> = cycle.iter().map(NodeKey::as_str).collect();
        assert_eq!(keys, vec!["b", "c", "d", "b"]);
    }
}
