//! Dependency graph validation and ordering.

use std::collections::{BTreeSet, HashMap};

use crate::error::RegistrationError;
use crate::types::JobDescriptor;

/// Validated dependency graph of one job group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobGraph {
    /// Job indices in run order.
    pub order: Vec<usize>,
    /// Dependency indices per job, in declaration order.
    pub dependencies: Vec<Vec<usize>>,
}

/// Validate a group's descriptors and compute a topological order.
///
/// Kahn's algorithm; among ready jobs the one registered first goes first, so
/// the order is deterministic.
pub fn build_graph(group: &str, descriptors: &[JobDescriptor]) -> Result<JobGraph, RegistrationError> {
    let mut index: HashMap<&str, usize> = HashMap::with_capacity(descriptors.len());
    for (i, d) in descriptors.iter().enumerate() {
        if index.insert(d.name.as_str(), i).is_some() {
            return Err(RegistrationError::DuplicateJob {
                group: group.to_string(),
                job: d.name.clone(),
            });
        }
    }

    let mut dependencies = Vec::with_capacity(descriptors.len());
    for d in descriptors {
        let mut deps = Vec::with_capacity(d.dependencies.len());
        for dep in &d.dependencies {
            let &j = index
                .get(dep.as_str())
                .ok_or_else(|| RegistrationError::UnknownDependency {
                    group: group.to_string(),
                    job: d.name.clone(),
                    dependency: dep.clone(),
                })?;
            deps.push(j);
        }
        dependencies.push(deps);
    }

    let n = descriptors.len();
    let mut in_degree = vec![0usize; n];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (i, deps) in dependencies.iter().enumerate() {
        for &d in deps {
            in_degree[i] += 1;
            dependents[d].push(i);
        }
    }

    let mut ready: BTreeSet<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(n);
    while let Some(i) = ready.pop_first() {
        order.push(i);
        for &next in &dependents[i] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.insert(next);
            }
        }
    }

    if order.len() != n {
        let jobs = (0..n)
            .filter(|&i| in_degree[i] > 0)
            .map(|i| descriptors[i].name.clone())
            .collect();
        return Err(RegistrationError::CyclicDependency {
            group: group.to_string(),
            jobs,
        });
    }

    Ok(JobGraph { order, dependencies })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn d(name: &str, deps: &[&str]) -> JobDescriptor {
        deps.iter()
            .fold(JobDescriptor::named(name), |acc, dep| acc.depends_on_name(*dep))
    }

    #[test]
    fn ties_follow_registration_order() {
        let graph = build_graph(
            "sync",
            &[d("roles", &["parties"]), d("parties", &[]), d("resources", &[])],
        )
        .unwrap();
        assert_eq!(graph.order, vec![1, 0, 2]);
        assert_eq!(graph.dependencies[0], vec![1]);
    }

    #[test]
    fn cycle_is_rejected_with_members() {
        let err = build_graph(
            "sync",
            &[d("a", &["c"]), d("b", &["a"]), d("c", &["b"]), d("free", &[])],
        )
        .unwrap_err();
        match err {
            RegistrationError::CyclicDependency { group, jobs } => {
                assert_eq!(group, "sync");
                assert_eq!(jobs, vec!["a", "b", "c"]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let err = build_graph("sync", &[d("a", &["a"])]).unwrap_err();
        assert!(matches!(err, RegistrationError::CyclicDependency { .. }));
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let err = build_graph("sync", &[d("roles", &["parties"])]).unwrap_err();
        assert_eq!(
            err,
            RegistrationError::UnknownDependency {
                group: "sync".into(),
                job: "roles".into(),
                dependency: "parties".into(),
            }
        );
    }

    #[test]
    fn duplicate_job_is_rejected() {
        let err = build_graph("sync", &[d("roles", &[]), d("roles", &[])]).unwrap_err();
        assert!(matches!(err, RegistrationError::DuplicateJob { job, .. } if job == "roles"));
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 128,
            ..ProptestConfig::default()
        })]

        /// Property: for any acyclic graph (edges only point at earlier
        /// registrations), every job appears after all of its dependencies.
        #[test]
        fn order_respects_every_edge(
            edges in prop::collection::vec(prop::collection::vec(any::<prop::sample::Index>(), 0..4), 1..20)
        ) {
            let descriptors: Vec<JobDescriptor> = edges
                .iter()
                .enumerate()
                .map(|(i, picks)| {
                    let mut desc = JobDescriptor::named(format!("job-{i}"));
                    if i > 0 {
                        let mut seen = BTreeSet::new();
                        for p in picks {
                            let dep = p.index(i);
                            if seen.insert(dep) {
                                desc = desc.depends_on_name(format!("job-{dep}"));
                            }
                        }
                    }
                    desc
                })
                .collect();

            let graph = build_graph("prop", &descriptors).unwrap();
            prop_assert_eq!(graph.order.len(), descriptors.len());

            let mut position = vec![0usize; descriptors.len()];
            for (pos, &i) in graph.order.iter().enumerate() {
                position[i] = pos;
            }
            for (i, deps) in graph.dependencies.iter().enumerate() {
                for &dep in deps {
                    prop_assert!(position[dep] < position[i]);
                }
            }
        }
    }
}
