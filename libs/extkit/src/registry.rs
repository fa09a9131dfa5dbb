//! Dependency graph validation and ordering for registered extensions,
//! plus the compiled-in (built-in mode) extension registry.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::contracts::Extension;
use crate::errors::ExtensionError;

/// Entry submitted by built-in extensions via `inventory::submit!`.
///
/// The constructor runs once per manager when built-in mode is active, so
/// two managers never share instances.
pub struct BuiltinExtension {
    pub name: &'static str,
    pub ctor: fn() -> Arc<dyn Extension>,
}

inventory::collect!(BuiltinExtension);

/// Names present in the compiled-in registry.
pub fn builtin_names() -> Vec<&'static str> {
    inventory::iter::<BuiltinExtension>
        .into_iter()
        .map(|e| e.name)
        .collect()
}

/// Instantiate one compiled-in extension by name.
pub fn builtin_by_name(name: &str) -> Option<Arc<dyn Extension>> {
    inventory::iter::<BuiltinExtension>
        .into_iter()
        .find(|e| e.name == name)
        .map(|e| (e.ctor)())
}

/// Instantiate every compiled-in extension.
pub fn builtin_extensions() -> Vec<Arc<dyn Extension>> {
    inventory::iter::<BuiltinExtension>
        .into_iter()
        .map(|e| (e.ctor)())
        .collect()
}

/// Validate the dependency graph and produce an initialization order.
///
/// Kahn's algorithm with a lexicographically ordered ready set: the drain
/// order is fully deterministic for a given graph. A stall with nodes
/// remaining means a cycle; the reported path comes from a DFS walk so the
/// error names the actual loop rather than the whole residue.
pub fn resolve_order(deps: &HashMap<String, Vec<String>>) -> Result<Vec<String>, ExtensionError> {
    for (name, wanted) in deps {
        for dep in wanted {
            if !deps.contains_key(dep) {
                return Err(ExtensionError::MissingDependency {
                    module: name.clone(),
                    depends_on: dep.clone(),
                });
            }
        }
    }

    // indegree = number of unmet dependencies; edges flow dep -> dependent
    let mut indegree: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for (name, wanted) in deps {
        indegree.entry(name).or_insert(0);
        for dep in wanted {
            *indegree.entry(name.as_str()).or_insert(0) += 1;
            dependents.entry(dep.as_str()).or_default().push(name.as_str());
        }
    }

    let mut ready: BTreeSet<&str> = indegree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(n, _)| *n)
        .collect();

    let mut order = Vec::with_capacity(deps.len());
    while let Some(&next) = ready.iter().next() {
        ready.remove(next);
        order.push(next.to_string());
        if let Some(children) = dependents.get(next) {
            for &child in children {
                let d = indegree.get_mut(child).expect("child was counted");
                *d -= 1;
                if *d == 0 {
                    ready.insert(child);
                }
            }
        }
    }

    if order.len() != deps.len() {
        return Err(ExtensionError::CycleDetected {
            path: find_cycle(deps).unwrap_or_default(),
        });
    }
    Ok(order)
}

/// DFS with path tracking; returns the closed cycle path when one exists.
fn find_cycle(deps: &HashMap<String, Vec<String>>) -> Option<Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    fn dfs<'a>(
        node: &'a str,
        deps: &'a HashMap<String, Vec<String>>,
        colors: &mut HashMap<&'a str, Color>,
        path: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        colors.insert(node, Color::Gray);
        path.push(node);

        for next in deps.get(node).into_iter().flatten() {
            match colors.get(next.as_str()).copied().unwrap_or(Color::White) {
                Color::Gray => {
                    let start = path.iter().position(|&n| n == next.as_str())?;
                    let mut cycle: Vec<String> =
                        path[start..].iter().map(|s| s.to_string()).collect();
                    cycle.push(next.clone());
                    return Some(cycle);
                }
                Color::White => {
                    if let Some(cycle) = dfs(next, deps, colors, path) {
                        return Some(cycle);
                    }
                }
                Color::Black => {}
            }
        }

        path.pop();
        colors.insert(node, Color::Black);
        None
    }

    let mut colors = HashMap::new();
    let mut path = Vec::new();
    let mut names: Vec<&str> = deps.keys().map(String::as_str).collect();
    names.sort_unstable();
    for name in names {
        if colors.get(name).copied().unwrap_or(Color::White) == Color::White {
            if let Some(cycle) = dfs(name, deps, &mut colors, &mut path) {
                return Some(cycle);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(pairs: &[(&str, &[&str])]) -> HashMap<String, Vec<String>> {
        pairs
            .iter()
            .map(|(n, d)| {
                (
                    n.to_string(),
                    d.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
                )
            })
            .collect()
    }

    #[test]
    fn linear_chain_orders_dependencies_first() {
        let deps = graph(&[("a", &[]), ("b", &["a"]), ("c", &["b"])]);
        assert_eq!(resolve_order(&deps).unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn zero_dependency_ties_break_lexicographically() {
        let deps = graph(&[("zeta", &[]), ("alpha", &[]), ("mid", &["zeta"])]);
        assert_eq!(resolve_order(&deps).unwrap(), vec!["alpha", "zeta", "mid"]);
    }

    #[test]
    fn missing_dependency_is_reported() {
        let deps = graph(&[("a", &["ghost"])]);
        match resolve_order(&deps).unwrap_err() {
            ExtensionError::MissingDependency { module, depends_on } => {
                assert_eq!(module, "a");
                assert_eq!(depends_on, "ghost");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn two_node_cycle_detected_with_path() {
        let deps = graph(&[("x", &["y"]), ("y", &["x"])]);
        match resolve_order(&deps).unwrap_err() {
            ExtensionError::CycleDetected { path } => {
                assert!(path.len() >= 3);
                assert_eq!(path.first(), path.last());
                assert!(path.contains(&"x".to_string()));
                assert!(path.contains(&"y".to_string()));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn cycle_path_excludes_unrelated_nodes() {
        let deps = graph(&[("a", &["b"]), ("b", &["c"]), ("c", &["a"]), ("d", &[])]);
        match resolve_order(&deps).unwrap_err() {
            ExtensionError::CycleDetected { path } => {
                assert!(!path.contains(&"d".to_string()));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn diamond_is_deterministic() {
        let deps = graph(&[("root", &[]), ("l", &["root"]), ("r", &["root"]), ("top", &["l", "r"])]);
        assert_eq!(
            resolve_order(&deps).unwrap(),
            vec!["root", "l", "r", "top"]
        );
    }
}
