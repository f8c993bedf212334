//! Dependency graph validation.
//!
//! Checks a proposed step graph for duplicate ids, missing references,
//! order violations, dependency cycles, ill-typed data mappings, and bad
//! condition branches. All issues are collected in one pass so a caller can
//! display them together; validation never mutates state.

use crate::types::{StepId, StepKind, ValueType, WorkflowStep};
use crate::workflow::template::parse_output_ref;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Machine-readable issue category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueCode {
    DuplicateStepId,
    MissingDependency,
    DependencyCycle,
    OrderViolation,
    BadMappingTemplate,
    UnknownMappingStep,
    MappingNotUpstream,
    UnknownOutputField,
    MappingTypeMismatch,
    UnknownBranchStep,
    UnguardedBranchStep,
    BadPredicateField,
}

/// A single validation finding
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub code: IssueCode,
    pub step_id: Option<StepId>,
    pub message: String,
}

impl ValidationIssue {
    fn new(code: IssueCode, step_id: Option<StepId>, message: impl Into<String>) -> Self {
        Self {
            code,
            step_id,
            message: message.into(),
        }
    }
}

/// Result of validating a step graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub issues: Vec<ValidationIssue>,
}

/// Validate a step graph. Deterministic: the same input yields the same
/// report, issues in the same order.
pub fn validate(steps: &[WorkflowStep]) -> ValidationReport {
    let mut issues = Vec::new();

    let mut by_id: HashMap<&StepId, &WorkflowStep> = HashMap::new();
    for step in steps {
        if by_id.insert(&step.id, step).is_some() {
            issues.push(ValidationIssue::new(
                IssueCode::DuplicateStepId,
                Some(step.id.clone()),
                format!("duplicate step id: {}", step.id),
            ));
        }
    }

    // Missing dependency references and order invariant
    for step in steps {
        let mut max_dep_order = 0u32;
        for dep in &step.depends_on {
            match by_id.get(dep) {
                Some(dep_step) => max_dep_order = max_dep_order.max(dep_step.order),
                None => issues.push(ValidationIssue::new(
                    IssueCode::MissingDependency,
                    Some(step.id.clone()),
                    format!("step {} depends on unknown step {}", step.id, dep),
                )),
            }
        }
        if !step.depends_on.is_empty() && step.order < max_dep_order + 1 {
            issues.push(ValidationIssue::new(
                IssueCode::OrderViolation,
                Some(step.id.clone()),
                format!(
                    "step {} has order {} but must be at least {} (max dependency order + 1)",
                    step.id,
                    step.order,
                    max_dep_order + 1
                ),
            ));
        }
    }

    detect_cycles(steps, &mut issues);

    // Data mappings and condition branches need the transitive upstream set
    for step in steps {
        let upstream = transitive_upstream(step, &by_id);

        for mapping in &step.data_mapping {
            let Some(output_ref) = parse_output_ref(&mapping.source) else {
                issues.push(ValidationIssue::new(
                    IssueCode::BadMappingTemplate,
                    Some(step.id.clone()),
                    format!(
                        "step {}: mapping for {} has malformed source template {:?}",
                        step.id, mapping.target, mapping.source
                    ),
                ));
                continue;
            };

            let Some(source_step) = by_id.get(&output_ref.step_id) else {
                issues.push(ValidationIssue::new(
                    IssueCode::UnknownMappingStep,
                    Some(step.id.clone()),
                    format!(
                        "step {}: mapping for {} references unknown step {}",
                        step.id, mapping.target, output_ref.step_id
                    ),
                ));
                continue;
            };

            if !upstream.contains(&output_ref.step_id) {
                issues.push(ValidationIssue::new(
                    IssueCode::MappingNotUpstream,
                    Some(step.id.clone()),
                    format!(
                        "step {}: mapping for {} references step {}, which is not an upstream dependency",
                        step.id, mapping.target, output_ref.step_id
                    ),
                ));
            }

            match source_step.outputs.get(&output_ref.field) {
                Some(source_type) => {
                    if !source_type.is_compatible_with(mapping.target_type) {
                        issues.push(ValidationIssue::new(
                            IssueCode::MappingTypeMismatch,
                            Some(step.id.clone()),
                            format!(
                                "step {}: cannot map {} field {}.{} onto {} target {}",
                                step.id,
                                source_type,
                                output_ref.step_id,
                                output_ref.field,
                                mapping.target_type,
                                mapping.target
                            ),
                        ));
                    }
                }
                None => issues.push(ValidationIssue::new(
                    IssueCode::UnknownOutputField,
                    Some(step.id.clone()),
                    format!(
                        "step {}: mapping for {} references undeclared output {}.{}",
                        step.id, mapping.target, output_ref.step_id, output_ref.field
                    ),
                )),
            }
        }

        if let StepKind::Condition {
            predicate,
            true_steps,
            false_steps,
        } = &step.kind
        {
            if parse_output_ref(&predicate.field).is_none() {
                issues.push(ValidationIssue::new(
                    IssueCode::BadPredicateField,
                    Some(step.id.clone()),
                    format!(
                        "condition step {}: predicate field {:?} is not a {{{{step.field}}}} template",
                        step.id, predicate.field
                    ),
                ));
            }
            for branch_step in true_steps.iter().chain(false_steps.iter()) {
                let Some(target) = by_id.get(branch_step) else {
                    issues.push(ValidationIssue::new(
                        IssueCode::UnknownBranchStep,
                        Some(step.id.clone()),
                        format!(
                            "condition step {}: branch references unknown step {}",
                            step.id, branch_step
                        ),
                    ));
                    continue;
                };
                // A branch member that does not sit downstream of its condition
                // would be scheduled before the predicate is evaluated, so both
                // branches could run.
                if !transitive_upstream(target, &by_id).contains(&step.id) {
                    issues.push(ValidationIssue::new(
                        IssueCode::UnguardedBranchStep,
                        Some(step.id.clone()),
                        format!(
                            "condition step {}: branch step {} does not depend on the condition",
                            step.id, branch_step
                        ),
                    ));
                }
            }
        }
    }

    ValidationReport {
        is_valid: issues.is_empty(),
        issues,
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Three-color depth-first cycle detection. Every back-edge to a gray node
/// produces one issue carrying the full cycle path in execution order,
/// e.g. `step1 -> step3 -> step2 -> step1`.
fn detect_cycles(steps: &[WorkflowStep], issues: &mut Vec<ValidationIssue>) {
    // Edges point dependency -> dependent (execution direction)
    let mut dependents: HashMap<&StepId, Vec<&StepId>> = HashMap::new();
    let known: HashSet<&StepId> = steps.iter().map(|s| &s.id).collect();
    for step in steps {
        for dep in &step.depends_on {
            if known.contains(dep) {
                dependents.entry(dep).or_default().push(&step.id);
            }
        }
    }

    let mut colors: HashMap<&StepId, Color> =
        steps.iter().map(|s| (&s.id, Color::White)).collect();
    let mut stack: Vec<&StepId> = Vec::new();

    fn visit<'a>(
        node: &'a StepId,
        dependents: &HashMap<&'a StepId, Vec<&'a StepId>>,
        colors: &mut HashMap<&'a StepId, Color>,
        stack: &mut Vec<&'a StepId>,
        issues: &mut Vec<ValidationIssue>,
    ) {
        colors.insert(node, Color::Gray);
        stack.push(node);

        if let Some(next) = dependents.get(node) {
            for &neighbor in next {
                match colors.get(neighbor).copied().unwrap_or(Color::White) {
                    Color::White => visit(neighbor, dependents, colors, stack, issues),
                    Color::Gray => {
                        // Back-edge: the cycle runs from the first occurrence
                        // of `neighbor` on the stack back to itself
                        let start = stack.iter().position(|&s| s == neighbor).unwrap_or(0);
                        let mut path: Vec<String> =
                            stack[start..].iter().map(|s| s.to_string()).collect();
                        path.push(neighbor.to_string());
                        issues.push(ValidationIssue::new(
                            IssueCode::DependencyCycle,
                            Some(neighbor.clone()),
                            format!("dependency cycle: {}", path.join(" -> ")),
                        ));
                    }
                    Color::Black => {}
                }
            }
        }

        stack.pop();
        colors.insert(node, Color::Black);
    }

    for step in steps {
        if colors.get(&step.id) == Some(&Color::White) {
            visit(&step.id, &dependents, &mut colors, &mut stack, issues);
        }
    }
}

/// All steps reachable from `step` by following `depends_on` edges.
fn transitive_upstream(
    step: &WorkflowStep,
    by_id: &HashMap<&StepId, &WorkflowStep>,
) -> HashSet<StepId> {
    let mut seen = HashSet::new();
    let mut frontier: Vec<&StepId> = step.depends_on.iter().collect();
    while let Some(dep) = frontier.pop() {
        if !seen.insert(dep.clone()) {
            continue;
        }
        if let Some(dep_step) = by_id.get(dep) {
            frontier.extend(dep_step.depends_on.iter());
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ConditionOperator, DataMapping, Predicate};
    use std::collections::HashMap;

    fn step(id: &str, order: u32, deps: &[&str]) -> WorkflowStep {
        WorkflowStep {
            id: StepId::new(id),
            name: id.to_string(),
            kind: StepKind::DataTransform {},
            order,
            depends_on: deps.iter().map(|d| StepId::new(*d)).collect(),
            parameters: HashMap::new(),
            outputs: HashMap::new(),
            data_mapping: Vec::new(),
        }
    }

    #[test]
    fn test_valid_acyclic_graph() {
        let steps = vec![
            step("a", 1, &[]),
            step("b", 2, &["a"]),
            step("c", 2, &["a"]),
            step("d", 3, &["b", "c"]),
        ];

        let report = validate(&steps);
        assert!(report.is_valid, "unexpected issues: {:?}", report.issues);
        assert!(report.issues.is_empty());
    }

    #[test]
    fn test_cycle_reports_full_path() {
        let steps = vec![
            step("step1", 1, &["step2"]),
            step("step2", 2, &["step3"]),
            step("step3", 3, &["step1"]),
        ];

        let report = validate(&steps);
        assert!(!report.is_valid);

        let cycle = report
            .issues
            .iter()
            .find(|i| i.code == IssueCode::DependencyCycle)
            .expect("cycle issue");
        assert_eq!(cycle.message, "dependency cycle: step1 -> step3 -> step2 -> step1");
    }

    #[test]
    fn test_missing_dependency() {
        let steps = vec![step("a", 1, &["ghost"])];
        let report = validate(&steps);
        assert!(!report.is_valid);
        assert!(report
            .issues
            .iter()
            .any(|i| i.code == IssueCode::MissingDependency));
    }

    #[test]
    fn test_duplicate_ids() {
        let steps = vec![step("a", 1, &[]), step("a", 1, &[])];
        let report = validate(&steps);
        assert!(report
            .issues
            .iter()
            .any(|i| i.code == IssueCode::DuplicateStepId));
    }

    #[test]
    fn test_order_violation() {
        let steps = vec![step("a", 2, &[]), step("b", 1, &["a"])];
        let report = validate(&steps);
        assert!(report
            .issues
            .iter()
            .any(|i| i.code == IssueCode::OrderViolation));
    }

    #[test]
    fn test_mapping_type_mismatch_reported_not_coerced() {
        let mut producer = step("fetch", 1, &[]);
        producer.outputs.insert("note".to_string(), ValueType::String);

        let mut consumer = step("calc", 2, &["fetch"]);
        consumer.data_mapping.push(DataMapping {
            target: "amount".to_string(),
            target_type: ValueType::Number,
            source: "{{fetch.note}}".to_string(),
        });

        let report = validate(&[producer, consumer]);
        assert!(!report.is_valid);
        let issue = report
            .issues
            .iter()
            .find(|i| i.code == IssueCode::MappingTypeMismatch)
            .expect("type mismatch issue");
        assert!(issue.message.contains("string"));
        assert!(issue.message.contains("number"));
    }

    #[test]
    fn test_mapping_must_reference_upstream_step() {
        let mut producer = step("later", 2, &[]);
        producer
            .outputs
            .insert("value".to_string(), ValueType::String);

        let mut consumer = step("first", 1, &[]);
        consumer.data_mapping.push(DataMapping {
            target: "x".to_string(),
            target_type: ValueType::String,
            source: "{{later.value}}".to_string(),
        });

        let report = validate(&[producer, consumer]);
        assert!(report
            .issues
            .iter()
            .any(|i| i.code == IssueCode::MappingNotUpstream));
    }

    #[test]
    fn test_mapping_transitive_upstream_allowed() {
        let mut root = step("root", 1, &[]);
        root.outputs.insert("value".to_string(), ValueType::String);
        let mid = step("mid", 2, &["root"]);

        let mut leaf = step("leaf", 3, &["mid"]);
        leaf.data_mapping.push(DataMapping {
            target: "x".to_string(),
            target_type: ValueType::String,
            source: "{{root.value}}".to_string(),
        });

        let report = validate(&[root, mid, leaf]);
        assert!(report.is_valid, "unexpected issues: {:?}", report.issues);
    }

    #[test]
    fn test_malformed_mapping_template() {
        let mut consumer = step("a", 1, &[]);
        consumer.data_mapping.push(DataMapping {
            target: "x".to_string(),
            target_type: ValueType::String,
            source: "not a template".to_string(),
        });

        let report = validate(&[consumer]);
        assert!(report
            .issues
            .iter()
            .any(|i| i.code == IssueCode::BadMappingTemplate));
    }

    #[test]
    fn test_condition_branch_references_checked() {
        let mut trigger = step("trigger", 1, &[]);
        trigger
            .outputs
            .insert("priority".to_string(), ValueType::String);

        let mut cond = step("decide", 2, &["trigger"]);
        cond.kind = StepKind::Condition {
            predicate: Predicate {
                field: "{{trigger.priority}}".to_string(),
                op: ConditionOperator::Equals,
                value: serde_json::json!("urgent"),
            },
            true_steps: vec![StepId::new("ghost")],
            false_steps: vec![],
        };

        let report = validate(&[trigger, cond]);
        assert!(report
            .issues
            .iter()
            .any(|i| i.code == IssueCode::UnknownBranchStep));
    }

    fn condition(id: &str, order: u32, deps: &[&str], on_true: &[&str], on_false: &[&str]) -> WorkflowStep {
        let mut cond = step(id, order, deps);
        cond.kind = StepKind::Condition {
            predicate: Predicate {
                field: "{{trigger.priority}}".to_string(),
                op: ConditionOperator::Equals,
                value: serde_json::json!("urgent"),
            },
            true_steps: on_true.iter().map(|s| StepId::new(*s)).collect(),
            false_steps: on_false.iter().map(|s| StepId::new(*s)).collect(),
        };
        cond
    }

    #[test]
    fn test_branch_steps_must_depend_on_condition() {
        let mut trigger = step("trigger", 1, &[]);
        trigger
            .outputs
            .insert("priority".to_string(), ValueType::String);

        // x and y are named as branches but would be scheduled as roots,
        // letting both run before the predicate is evaluated.
        let steps = vec![
            trigger,
            condition("check", 2, &["trigger"], &["x"], &["y"]),
            step("x", 1, &[]),
            step("y", 1, &[]),
        ];

        let report = validate(&steps);
        assert!(!report.is_valid);
        let unguarded: Vec<_> = report
            .issues
            .iter()
            .filter(|i| i.code == IssueCode::UnguardedBranchStep)
            .collect();
        assert_eq!(unguarded.len(), 2);
        assert!(unguarded.iter().any(|i| i.message.contains("branch step x")));
        assert!(unguarded.iter().any(|i| i.message.contains("branch step y")));
    }

    #[test]
    fn test_transitively_dependent_branch_steps_accepted() {
        let mut trigger = step("trigger", 1, &[]);
        trigger
            .outputs
            .insert("priority".to_string(), ValueType::String);

        // y reaches the condition through x, which is enough of a guard.
        let steps = vec![
            trigger,
            condition("check", 2, &["trigger"], &["x"], &["y"]),
            step("x", 3, &["check"]),
            step("y", 4, &["x"]),
        ];

        let report = validate(&steps);
        assert!(report.is_valid, "unexpected issues: {:?}", report.issues);
    }

    #[test]
    fn test_all_issues_reported_in_one_pass() {
        let mut bad = step("a", 1, &["ghost", "a2"]);
        bad.data_mapping.push(DataMapping {
            target: "x".to_string(),
            target_type: ValueType::String,
            source: "broken".to_string(),
        });
        let steps = vec![bad, step("b", 1, &["b"])]; // self-cycle on b

        let report = validate(&steps);
        let codes: Vec<IssueCode> = report.issues.iter().map(|i| i.code).collect();
        assert!(codes.contains(&IssueCode::MissingDependency));
        assert!(codes.contains(&IssueCode::BadMappingTemplate));
        assert!(codes.contains(&IssueCode::DependencyCycle));
    }

    #[test]
    fn test_validation_is_idempotent() {
        let steps = vec![
            step("step1", 1, &["step2"]),
            step("step2", 2, &["step1"]),
        ];

        let first = validate(&steps);
        let second = validate(&steps);
        assert_eq!(first.is_valid, second.is_valid);
        assert_eq!(first.issues.len(), second.issues.len());
        for (a, b) in first.issues.iter().zip(second.issues.iter()) {
            assert_eq!(a.code, b.code);
            assert_eq!(a.message, b.message);
        }
    }
}
