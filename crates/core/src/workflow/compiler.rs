//! Workflow compilation: validated step graph -> immutable execution plan.

use crate::types::{StepId, StepKind, WorkflowId, WorkflowStep};
use crate::workflow::validator::{self, ValidationReport};
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

/// Compiled, order-resolved, collision-free representation of a step graph.
/// Immutable: if the workflow definition changes, a new plan must be
/// compiled. Serializable so the coordinator can persist it per execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub workflow_id: WorkflowId,
    /// Steps in canonical execution order
    pub steps: Vec<WorkflowStep>,
    pub dependencies: HashMap<StepId, Vec<StepId>>,
    pub execution_order: Vec<StepId>,
    /// Unique function name per `api_call` step after collision resolution
    pub qualified_functions: HashMap<StepId, String>,
}

impl ExecutionPlan {
    pub fn step(&self, step_id: &StepId) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| &s.id == step_id)
    }

    /// Steps with no dependencies; eligible as soon as the execution starts.
    pub fn entry_steps(&self) -> Vec<&WorkflowStep> {
        self.steps.iter().filter(|s| s.depends_on.is_empty()).collect()
    }

    /// Steps that list `step_id` as a dependency.
    pub fn dependents_of(&self, step_id: &StepId) -> Vec<&WorkflowStep> {
        self.steps
            .iter()
            .filter(|s| s.depends_on.contains(step_id))
            .collect()
    }
}

/// Compile a step graph into an execution plan.
///
/// Delegates to the validator first; on failure the issue list is returned
/// and no state is created. On success, assigns a canonical execution order
/// (topological, ties broken by declared `order`, then step id) and resolves
/// API function-name collisions.
pub fn compile(
    workflow_id: WorkflowId,
    steps: Vec<WorkflowStep>,
) -> Result<ExecutionPlan, ValidationReport> {
    let report = validator::validate(&steps);
    if !report.is_valid {
        return Err(report);
    }

    let execution_order = topological_order(&steps);

    let by_id: HashMap<StepId, WorkflowStep> =
        steps.into_iter().map(|s| (s.id.clone(), s)).collect();
    let ordered_steps: Vec<WorkflowStep> = execution_order
        .iter()
        .map(|id| by_id[id].clone())
        .collect();

    let dependencies = ordered_steps
        .iter()
        .map(|s| (s.id.clone(), s.depends_on.clone()))
        .collect();

    let qualified_functions = resolve_function_collisions(&ordered_steps);

    Ok(ExecutionPlan {
        workflow_id,
        steps: ordered_steps,
        dependencies,
        execution_order,
        qualified_functions,
    })
}

/// Kahn's algorithm over a petgraph DiGraph. The ready set is a min-heap
/// keyed by `(declared order, step id)` so ties are broken deterministically.
fn topological_order(steps: &[WorkflowStep]) -> Vec<StepId> {
    let mut graph: DiGraph<StepId, ()> = DiGraph::new();
    let mut indices: HashMap<&StepId, NodeIndex> = HashMap::new();

    for step in steps {
        let node = graph.add_node(step.id.clone());
        indices.insert(&step.id, node);
    }
    for step in steps {
        for dep in &step.depends_on {
            graph.add_edge(indices[dep], indices[&step.id], ());
        }
    }

    let orders: HashMap<&StepId, u32> = steps.iter().map(|s| (&s.id, s.order)).collect();
    let mut indegree: HashMap<NodeIndex, usize> = graph
        .node_indices()
        .map(|n| {
            (
                n,
                graph
                    .neighbors_directed(n, petgraph::Direction::Incoming)
                    .count(),
            )
        })
        .collect();

    let mut ready: BinaryHeap<Reverse<(u32, StepId, NodeIndex)>> = graph
        .node_indices()
        .filter(|n| indegree[n] == 0)
        .map(|n| {
            let id = graph[n].clone();
            Reverse((orders[&id], id, n))
        })
        .collect();

    let mut order = Vec::with_capacity(steps.len());
    while let Some(Reverse((_, id, node))) = ready.pop() {
        order.push(id);
        for next in graph.neighbors_directed(node, petgraph::Direction::Outgoing) {
            if let Some(remaining) = indegree.get_mut(&next) {
                *remaining -= 1;
                if *remaining == 0 {
                    let next_id = graph[next].clone();
                    ready.push(Reverse((orders[&next_id], next_id, next)));
                }
            }
        }
    }
    order
}

/// Guarantee a unique function name per `api_call` step. Ambiguous names are
/// first qualified with their owning connection's id; names that still
/// collide get a numeric suffix.
fn resolve_function_collisions(steps: &[WorkflowStep]) -> HashMap<StepId, String> {
    let mut name_counts: HashMap<&str, usize> = HashMap::new();
    for step in steps {
        if let StepKind::ApiCall { function, .. } = &step.kind {
            *name_counts.entry(function.as_str()).or_default() += 1;
        }
    }

    let mut assigned: HashMap<String, usize> = HashMap::new();
    let mut qualified = HashMap::new();

    for step in steps {
        let StepKind::ApiCall {
            connection_id,
            function,
        } = &step.kind
        else {
            continue;
        };

        let candidate = if name_counts[function.as_str()] > 1 {
            let prefix = connection_id.to_string();
            let short = &prefix[..8.min(prefix.len())];
            format!("{}_{}", function, short)
        } else {
            function.clone()
        };

        let count = assigned.entry(candidate.clone()).or_default();
        *count += 1;
        let unique = if *count > 1 {
            format!("{}_{}", candidate, count)
        } else {
            candidate
        };

        qualified.insert(step.id.clone(), unique);
    }

    qualified
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ConnectionId;
    use std::collections::HashMap as Map;

    fn step(id: &str, order: u32, deps: &[&str]) -> WorkflowStep {
        WorkflowStep {
            id: StepId::new(id),
            name: id.to_string(),
            kind: StepKind::DataTransform {},
            order,
            depends_on: deps.iter().map(|d| StepId::new(*d)).collect(),
            parameters: Map::new(),
            outputs: Map::new(),
            data_mapping: Vec::new(),
        }
    }

    fn api_step(id: &str, order: u32, connection_id: ConnectionId, function: &str) -> WorkflowStep {
        let mut s = step(id, order, &[]);
        s.kind = StepKind::ApiCall {
            connection_id,
            function: function.to_string(),
        };
        s
    }

    #[test]
    fn test_compile_invalid_graph_returns_issues() {
        let steps = vec![step("a", 1, &["b"]), step("b", 2, &["a"])];
        let err = compile(WorkflowId::new(), steps).unwrap_err();
        assert!(!err.is_valid);
        assert!(!err.issues.is_empty());
    }

    #[test]
    fn test_compile_rejects_branch_steps_that_bypass_their_condition() {
        // x and y have no edge back to check, so both would start as roots.
        let mut check = step("check", 2, &["trigger"]);
        check.kind = StepKind::Condition {
            predicate: crate::types::Predicate {
                field: "{{trigger.priority}}".to_string(),
                op: crate::types::ConditionOperator::Equals,
                value: serde_json::json!("urgent"),
            },
            true_steps: vec![StepId::new("x")],
            false_steps: vec![StepId::new("y")],
        };
        let steps = vec![step("trigger", 1, &[]), check, step("x", 1, &[]), step("y", 1, &[])];

        let err = compile(WorkflowId::new(), steps).unwrap_err();
        assert!(err
            .issues
            .iter()
            .any(|i| i.code == crate::workflow::validator::IssueCode::UnguardedBranchStep));
    }

    #[test]
    fn test_diamond_order() {
        let steps = vec![
            step("d", 3, &["b", "c"]),
            step("b", 2, &["a"]),
            step("c", 2, &["a"]),
            step("a", 1, &[]),
        ];

        let plan = compile(WorkflowId::new(), steps).unwrap();
        assert_eq!(
            plan.execution_order,
            vec![
                StepId::new("a"),
                StepId::new("b"),
                StepId::new("c"),
                StepId::new("d")
            ]
        );
        assert_eq!(plan.entry_steps().len(), 1);
        assert_eq!(plan.dependents_of(&StepId::new("a")).len(), 2);
    }

    #[test]
    fn test_declared_order_breaks_ties() {
        // x and y are both eligible immediately; y's lower order wins
        let steps = vec![step("x", 5, &[]), step("y", 2, &[]), step("z", 6, &["x", "y"])];

        let plan = compile(WorkflowId::new(), steps).unwrap();
        assert_eq!(
            plan.execution_order,
            vec![StepId::new("y"), StepId::new("x"), StepId::new("z")]
        );
    }

    #[test]
    fn test_function_collision_qualified_by_connection() {
        let conn_a = ConnectionId::new();
        let conn_b = ConnectionId::new();
        let steps = vec![
            api_step("s1", 1, conn_a, "send_message"),
            api_step("s2", 1, conn_b, "send_message"),
            api_step("s3", 1, conn_a, "list_users"),
        ];

        let plan = compile(WorkflowId::new(), steps).unwrap();
        let f1 = &plan.qualified_functions[&StepId::new("s1")];
        let f2 = &plan.qualified_functions[&StepId::new("s2")];
        let f3 = &plan.qualified_functions[&StepId::new("s3")];

        assert_ne!(f1, f2);
        assert!(f1.starts_with("send_message_"));
        assert!(f2.starts_with("send_message_"));
        // Unambiguous names are left alone
        assert_eq!(f3, "list_users");
    }

    #[test]
    fn test_function_collision_same_connection_numeric_suffix() {
        let conn = ConnectionId::new();
        let steps = vec![
            api_step("s1", 1, conn, "send_message"),
            api_step("s2", 1, conn, "send_message"),
        ];

        let plan = compile(WorkflowId::new(), steps).unwrap();
        let f1 = &plan.qualified_functions[&StepId::new("s1")];
        let f2 = &plan.qualified_functions[&StepId::new("s2")];
        assert_ne!(f1, f2);
        assert!(f2.ends_with("_2"));
    }

    #[test]
    fn test_plan_serializable() {
        let steps = vec![step("a", 1, &[])];
        let plan = compile(WorkflowId::new(), steps).unwrap();

        let json = serde_json::to_string(&plan).unwrap();
        let restored: ExecutionPlan = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.execution_order, plan.execution_order);
    }
}
