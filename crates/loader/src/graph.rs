//! Module dependency graph.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::addon::AddonCatalog;
use crate::error::LoadError;

/// Order `graph` (module → dependencies) so that every module follows its
/// dependencies. Among modules ready at the same time, names sort first.
pub fn topological_order(graph: &BTreeMap<String, Vec<String>>) -> Result<Vec<String>, LoadError> {
    let mut pending: BTreeMap<&str, usize> = BTreeMap::new();
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for (module, deps) in graph {
        let deps: BTreeSet<&str> = deps.iter().map(String::as_str).collect();
        for dep in &deps {
            if !graph.contains_key(*dep) {
                return Err(LoadError::MissingDependency {
                    module: module.clone(),
                    dependency: dep.to_string(),
                });
            }
            dependents.entry(*dep).or_default().push(module.as_str());
        }
        pending.insert(module.as_str(), deps.len());
    }

    let mut ready: BTreeSet<&str> = pending
        .iter()
        .filter(|(_, n)| **n == 0)
        .map(|(m, _)| *m)
        .collect();
    let mut order = Vec::with_capacity(graph.len());
    while let Some(module) = ready.pop_first() {
        order.push(module.to_string());
        for dependent in dependents.get(module).into_iter().flatten() {
            if let Some(n) = pending.get_mut(dependent) {
                *n -= 1;
                if *n == 0 {
                    ready.insert(*dependent);
                }
            }
        }
    }

    if order.len() < graph.len() {
        let placed: BTreeSet<&str> = order.iter().map(String::as_str).collect();
        return Err(LoadError::DependencyCycle(find_cycle(graph, &placed)));
    }
    Ok(order)
}

/// A cycle among the modules that could not be ordered, first module repeated at the end.
fn find_cycle(graph: &BTreeMap<String, Vec<String>>, placed: &BTreeSet<&str>) -> Vec<String> {
    let Some(start) = graph.keys().find(|m| !placed.contains(m.as_str())) else {
        return Vec::new();
    };
    // Every unplaced module has an unplaced dependency, so walking them must revisit one.
    let mut path: Vec<&str> = vec![start];
    loop {
        let current = path[path.len() - 1];
        let next = graph[current]
            .iter()
            .map(String::as_str)
            .filter(|d| !placed.contains(d))
            .min();
        let Some(next) = next else {
            return path.into_iter().map(str::to_string).collect();
        };
        if let Some(pos) = path.iter().position(|m| *m == next) {
            let mut cycle: Vec<String> = path[pos..].iter().map(|m| m.to_string()).collect();
            cycle.push(next.to_string());
            return cycle;
        }
        path.push(next);
    }
}

/// Modules to load so that `requested` ends up installed, in load order.
///
/// The result holds the requested modules, their dependencies (installed or
/// not) and every installable `auto_install` module whose dependencies all
/// end up installed.
pub fn resolve(
    catalog: &AddonCatalog,
    requested: &[&str],
    installed: &BTreeSet<String>,
) -> Result<Vec<String>, LoadError> {
    let mut graph: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut stack: Vec<(String, Option<String>)> = requested
        .iter()
        .map(|m| (m.to_string(), None))
        .collect();

    let visit = |graph: &mut BTreeMap<String, Vec<String>>, stack: &mut Vec<(String, Option<String>)>| {
        while let Some((module, wanted_by)) = stack.pop() {
            if graph.contains_key(&module) {
                continue;
            }
            let addon = match (catalog.get(&module), wanted_by) {
                (Some(addon), _) => addon,
                (None, Some(parent)) => {
                    return Err(LoadError::MissingDependency {
                        module: parent,
                        dependency: module,
                    });
                }
                (None, None) => return Err(LoadError::UnknownModule(module)),
            };
            let manifest = addon.manifest();
            if !manifest.installable && !installed.contains(&module) {
                return Err(LoadError::NotInstallable(module));
            }
            let deps = manifest.dependencies();
            for dep in &deps {
                stack.push((dep.clone(), Some(module.clone())));
            }
            graph.insert(module, deps);
        }
        Ok(())
    };
    visit(&mut graph, &mut stack)?;

    loop {
        let extra: Vec<String> = {
            let selected: BTreeSet<&str> = graph
                .keys()
                .map(String::as_str)
                .chain(installed.iter().map(String::as_str))
                .collect();
            catalog
                .manifests()
                .filter(|m| m.auto_install && m.installable && !selected.contains(m.name.as_str()))
                .filter(|m| m.dependencies().iter().all(|d| selected.contains(d.as_str())))
                .map(|m| m.name.clone())
                .collect()
        };
        if extra.is_empty() {
            break;
        }
        for module in extra {
            debug!(module = %module, "auto-installing");
            stack.push((module, None));
        }
        visit(&mut graph, &mut stack)?;
    }

    topological_order(&graph)
}

/// `targets` plus every installed module depending on them, directly or not.
pub fn reverse_dependencies(
    catalog: &AddonCatalog,
    installed: &[String],
    targets: &[&str],
) -> BTreeSet<String> {
    let mut affected: BTreeSet<String> = targets.iter().map(|m| m.to_string()).collect();
    loop {
        let before = affected.len();
        for module in installed {
            if affected.contains(module) {
                continue;
            }
            let depends_on_affected = catalog
                .get(module)
                .map(|a| a.manifest().dependencies().iter().any(|d| affected.contains(d)))
                .unwrap_or(false);
            if depends_on_affected {
                affected.insert(module.clone());
            }
        }
        if affected.len() == before {
            return affected;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addon::StaticAddon;
    use proptest::prelude::*;

    fn catalog(specs: &[(&str, &[&str], bool)]) -> AddonCatalog {
        let mut catalog = AddonCatalog::with_base().unwrap();
        for (name, deps, auto) in specs {
            let deps: Vec<String> = deps.iter().map(|d| format!("\"{d}\"")).collect();
            let raw = format!(
                "name = \"{name}\"\ndepends = [{}]\nauto_install = {auto}\n",
                deps.join(", ")
            );
            catalog.add(StaticAddon::from_manifest_str(&raw).unwrap());
        }
        catalog
    }

    #[test]
    fn dependencies_load_first() {
        let catalog = catalog(&[("a", &[], false), ("b", &["a"], false)]);
        let order = resolve(&catalog, &["b"], &BTreeSet::new()).unwrap();
        assert_eq!(order, vec!["base", "a", "b"]);
    }

    #[test]
    fn missing_dependencies_name_both_modules() {
        let catalog = catalog(&[("b", &["ghost"], false)]);
        let err = resolve(&catalog, &["b"], &BTreeSet::new()).unwrap_err();
        match err {
            LoadError::MissingDependency { module, dependency } => {
                assert_eq!((module.as_str(), dependency.as_str()), ("b", "ghost"));
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn cycles_are_rejected() {
        let catalog = catalog(&[("a", &["b"], false), ("b", &["a"], false)]);
        let err = resolve(&catalog, &["a"], &BTreeSet::new()).unwrap_err();
        match err {
            LoadError::DependencyCycle(cycle) => {
                assert_eq!(cycle.first(), cycle.last());
                assert!(cycle.contains(&"a".to_string()) && cycle.contains(&"b".to_string()));
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn auto_install_follows_its_dependencies() {
        let catalog = catalog(&[
            ("a", &[], false),
            ("b", &[], false),
            ("glue", &["a", "b"], true),
        ]);
        let order = resolve(&catalog, &["a"], &BTreeSet::new()).unwrap();
        assert!(!order.contains(&"glue".to_string()));

        let installed: BTreeSet<String> = ["base", "a"].into_iter().map(String::from).collect();
        let order = resolve(&catalog, &["b"], &installed).unwrap();
        assert_eq!(order.last().map(String::as_str), Some("glue"));
    }

    #[test]
    fn reverse_dependencies_are_transitive() {
        let catalog = catalog(&[("a", &[], false), ("b", &["a"], false), ("c", &["b"], false)]);
        let installed: Vec<String> = ["base", "a", "b", "c"].into_iter().map(String::from).collect();
        let affected = reverse_dependencies(&catalog, &installed, &["a"]);
        assert_eq!(affected.into_iter().collect::<Vec<_>>(), vec!["a", "b", "c"]);
    }

    fn dag() -> impl Strategy<Value = BTreeMap<String, Vec<String>>> {
        prop::collection::vec(prop::collection::vec(any::<prop::sample::Index>(), 0..4), 1..12).prop_map(
            |nodes| {
                let mut graph = BTreeMap::new();
                for (i, deps) in nodes.iter().enumerate() {
                    // Only point at earlier nodes so the graph stays acyclic.
                    let deps = if i == 0 {
                        Vec::new()
                    } else {
                        deps.iter().map(|d| format!("m{}", d.index(i))).collect()
                    };
                    graph.insert(format!("m{i}"), deps);
                }
                graph
            },
        )
    }

    proptest! {
        #[test]
        fn every_module_follows_its_dependencies(graph in dag()) {
            let order = topological_order(&graph).unwrap();
            prop_assert_eq!(order.len(), graph.len());
            for (module, deps) in &graph {
                let at = order.iter().position(|m| m == module).unwrap();
                for dep in deps {
                    prop_assert!(order.iter().position(|m| m == dep).unwrap() < at);
                }
            }
            prop_assert_eq!(topological_order(&graph).unwrap(), order);
        }

        #[test]
        fn closing_a_loop_is_detected(graph in dag()) {
            let last = format!("m{}", graph.len() - 1);
            let mut looped = graph.clone();
            looped.get_mut("m0").unwrap().push(last);
            let reaches_first = {
                // m0 -> last closes a cycle only if last reaches m0.
                let mut seen = BTreeSet::new();
                let mut stack = vec![format!("m{}", graph.len() - 1)];
                while let Some(m) = stack.pop() {
                    if seen.insert(m.clone()) {
                        stack.extend(graph[&m].iter().cloned());
                    }
                }
                seen.contains("m0")
            };
            let result = topological_order(&looped);
            prop_assert_eq!(result.is_err(), reaches_first);
        }
    }
}
