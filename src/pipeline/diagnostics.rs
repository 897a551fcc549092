//! Static checks over declared dependencies.
//!
//! None of these stop a run. Units with an unsatisfiable predicate simply
//! wait forever; the checks only make that visible in the logs up front.

use std::collections::HashMap;
use std::fmt;

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};

use super::registry::RegistrationRecord;
use super::unit::UnitId;

/// A dependency declaration that will keep a unit from ever running
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependencyIssue {
    /// Neither required data nor predecessors declared
    NeverReady { unit: UnitId },
    /// Predecessor that is not registered in this run
    UnknownPredecessor { unit: UnitId, predecessor: UnitId },
    SelfDependency { unit: UnitId },
    /// Units waiting on each other in a loop
    PredecessorCycle { units: Vec<UnitId> },
}

impl fmt::Display for DependencyIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DependencyIssue::NeverReady { unit } => write!(
                f,
                "{} declares no requirement and will never run (declare no_requirement to run immediately)",
                unit
            ),
            DependencyIssue::UnknownPredecessor { unit, predecessor } => {
                write!(f, "{} waits for unregistered unit {}", unit, predecessor)
            }
            DependencyIssue::SelfDependency { unit } => write!(f, "{} waits for itself", unit),
            DependencyIssue::PredecessorCycle { units } => {
                write!(f, "predecessor cycle between {}", units.join(", "))
            }
        }
    }
}

/// Check the predecessor graph of the registered units
pub fn diagnose<'a, I>(records: I) -> Vec<DependencyIssue>
where
    I: IntoIterator<Item = &'a RegistrationRecord>,
{
    let records: Vec<&RegistrationRecord> = records.into_iter().collect();
    let mut issues = Vec::new();
    let mut graph: DiGraph<UnitId, ()> = DiGraph::new();
    let nodes: HashMap<UnitId, NodeIndex> = records
        .iter()
        .map(|record| (record.unit, graph.add_node(record.unit)))
        .collect();

    for record in &records {
        if !record.spec.declares_requirement() {
            issues.push(DependencyIssue::NeverReady { unit: record.unit });
        }

        for predecessor in record.spec.predecessors() {
            if predecessor == record.unit {
                issues.push(DependencyIssue::SelfDependency { unit: record.unit });
                continue;
            }
            match nodes.get(predecessor) {
                Some(&from) => {
                    graph.add_edge(from, nodes[record.unit], ());
                }
                None => issues.push(DependencyIssue::UnknownPredecessor {
                    unit: record.unit,
                    predecessor,
                }),
            }
        }
    }

    for component in tarjan_scc(&graph) {
        if component.len() > 1 {
            let mut units: Vec<UnitId> = component.iter().map(|&index| graph[index]).collect();
            units.sort();
            issues.push(DependencyIssue::PredecessorCycle { units });
        }
    }

    issues
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::unit::UnitSpec;
    use pretty_assertions::assert_eq;

    fn record(unit: UnitId, spec: UnitSpec) -> RegistrationRecord {
        RegistrationRecord {
            unit,
            spec,
            discovery_index: 0,
            seed: 0,
        }
    }

    #[test]
    fn test_clean_pipeline_has_no_issues() {
        let records = vec![
            record("a", UnitSpec::new(1).no_requirement()),
            record("b", UnitSpec::new(1).requires(["x"])),
            record("c", UnitSpec::new(2).after(["a"])),
        ];
        assert!(diagnose(&records).is_empty());
    }

    #[test]
    fn test_reports_each_kind_of_issue() {
        let records = vec![
            record("idle", UnitSpec::new(1)),
            record("lonely", UnitSpec::new(1).after(["missing"])),
            record("selfish", UnitSpec::new(1).after(["selfish"])),
            record("ping", UnitSpec::new(2).after(["pong"])),
            record("pong", UnitSpec::new(2).after(["ping"])),
        ];

        let issues = diagnose(&records);
        assert_eq!(
            issues,
            vec![
                DependencyIssue::NeverReady { unit: "idle" },
                DependencyIssue::UnknownPredecessor { unit: "lonely", predecessor: "missing" },
                DependencyIssue::SelfDependency { unit: "selfish" },
                DependencyIssue::PredecessorCycle { units: vec!["ping", "pong"] },
            ]
        );
        assert_eq!(
            issues[3].to_string(),
            "predecessor cycle between ping, pong"
        );
    }
}
