//! Decides which steps may run next.
//!
//! Pure function of the program and the persisted record, so a resumed
//! driver makes exactly the decision the original one would have made.

use std::collections::{HashMap, HashSet};

use db::models::ExecutionRecord;

use crate::program::{Program, Shape};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Steps that may start now, in definition order.  Empty while every
    /// remaining step waits on work that is still in flight.
    Ready(Vec<String>),
    /// The next plan step needs a human decision first.
    AwaitingApproval(String),
    /// Every step has either run or been pruned by a branch.
    Terminal,
    /// Unresolved steps remain but none can ever become ready.
    Stall(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeState {
    Resolved,
    Unreachable,
    Ready,
    Waiting,
}

pub fn next_runnable(
    program: &Program,
    record: &ExecutionRecord,
    in_flight: &HashSet<String>,
) -> Resolution {
    match &program.shape {
        Shape::Linear => next_linear(program, record, in_flight),
        Shape::Graph { edges, order } => next_graph(program, edges, order, record, in_flight),
    }
}

fn next_linear(
    program: &Program,
    record: &ExecutionRecord,
    in_flight: &HashSet<String>,
) -> Resolution {
    let Some(step) = program
        .steps
        .iter()
        .find(|s| record.step_result(&s.id).is_none())
    else {
        return Resolution::Terminal;
    };

    if in_flight.contains(&step.id) {
        return Resolution::Ready(Vec::new());
    }
    if step.requires_approval && !record.is_approved(&step.id) {
        return Resolution::AwaitingApproval(step.id.clone());
    }
    Resolution::Ready(vec![step.id.clone()])
}

fn next_graph(
    program: &Program,
    edges: &[crate::models::Edge],
    order: &[usize],
    record: &ExecutionRecord,
    in_flight: &HashSet<String>,
) -> Resolution {
    let mut incoming: HashMap<&str, Vec<&crate::models::Edge>> = HashMap::new();
    for edge in edges {
        incoming.entry(edge.to.as_str()).or_default().push(edge);
    }

    // Topological order guarantees every origin is classified first.
    let mut states: HashMap<&str, NodeState> = HashMap::with_capacity(order.len());
    for &index in order {
        let id = program.steps[index].id.as_str();
        let state = if record.step_result(id).is_some() {
            NodeState::Resolved
        } else {
            let mut all_live = true;
            let mut any_dead = false;
            for edge in incoming.get(id).map(Vec::as_slice).unwrap_or_default() {
                match edge_state(edge, &states, record) {
                    EdgeState::Live => {}
                    EdgeState::Dead => any_dead = true,
                    EdgeState::Pending => all_live = false,
                }
            }
            if any_dead {
                NodeState::Unreachable
            } else if all_live {
                NodeState::Ready
            } else {
                NodeState::Waiting
            }
        };
        states.insert(id, state);
    }

    let ready: Vec<String> = program
        .steps
        .iter()
        .filter(|s| states.get(s.id.as_str()) == Some(&NodeState::Ready))
        .filter(|s| !in_flight.contains(&s.id))
        .map(|s| s.id.clone())
        .collect();
    if !ready.is_empty() {
        return Resolution::Ready(ready);
    }

    let unresolved: Vec<String> = program
        .steps
        .iter()
        .filter(|s| {
            matches!(
                states.get(s.id.as_str()),
                Some(NodeState::Ready | NodeState::Waiting)
            )
        })
        .map(|s| s.id.clone())
        .collect();

    if unresolved.is_empty() {
        Resolution::Terminal
    } else if !in_flight.is_empty() {
        Resolution::Ready(Vec::new())
    } else {
        Resolution::Stall(unresolved)
    }
}

enum EdgeState {
    Live,
    Dead,
    Pending,
}

fn edge_state(
    edge: &crate::models::Edge,
    states: &HashMap<&str, NodeState>,
    record: &ExecutionRecord,
) -> EdgeState {
    match states.get(edge.from.as_str()) {
        Some(NodeState::Unreachable) => EdgeState::Dead,
        Some(NodeState::Resolved) => match record.step_result(&edge.from) {
            Some(result) if result.succeeded() => match &edge.label {
                Some(label) if result.outcome.as_deref() != Some(label.as_str()) => EdgeState::Dead,
                _ => EdgeState::Live,
            },
            _ => EdgeState::Dead,
        },
        _ => EdgeState::Pending,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Edge, NodeDefinition, Plan, PlanStep, Trigger, Workflow};
    use chrono::Utc;
    use db::models::{ApprovalRecord, NewExecution, StepResult, TriggerKind};
    use serde_json::json;
    use uuid::Uuid;

    fn record(program: &Program) -> ExecutionRecord {
        ExecutionRecord::new(NewExecution {
            target: program.target,
            tenant_id: Uuid::nil(),
            triggered_by: None,
            trigger_kind: TriggerKind::Manual,
            input_data: json!({}),
        })
    }

    fn done(record: &mut ExecutionRecord, step_id: &str, outcome: Option<&str>) {
        let now = Utc::now();
        record.step_results.push(StepResult {
            step_id: step_id.into(),
            result: json!(null),
            outcome: outcome.map(str::to_owned),
            error: None,
            attempts: 1,
            error_trail: vec![],
            started_at: now,
            completed_at: now,
        });
    }

    fn node(id: &str) -> NodeDefinition {
        NodeDefinition::new(id, "transform", json!({ "template": {} }))
    }

    /// A branches to B (true) or C (false); both lead to D.
    fn branching() -> Program {
        let wf = Workflow::new(
            "branch",
            Trigger::Manual,
            vec![node("a"), node("b"), node("c"), node("d")],
            vec![
                Edge::labelled("a", "b", "true"),
                Edge::labelled("a", "c", "false"),
                Edge::new("b", "d"),
                Edge::new("c", "d"),
            ],
        );
        Program::from_workflow(&wf).unwrap()
    }

    #[test]
    fn entry_nodes_are_ready_first() {
        let program = branching();
        let rec = record(&program);
        assert_eq!(next_runnable(&program, &rec, &HashSet::new()), Resolution::Ready(vec!["a".into()]));
    }

    #[test]
    fn only_the_matching_branch_runs() {
        let program = branching();
        let mut rec = record(&program);
        done(&mut rec, "a", Some("true"));
        assert_eq!(next_runnable(&program, &rec, &HashSet::new()), Resolution::Ready(vec!["b".into()]));

        // D joins a live and a dead edge: pruned, not stalled.
        done(&mut rec, "b", None);
        assert_eq!(next_runnable(&program, &rec, &HashSet::new()), Resolution::Terminal);
    }

    #[test]
    fn fan_out_is_returned_in_definition_order() {
        let wf = Workflow::new(
            "fan",
            Trigger::Manual,
            vec![node("root"), node("z"), node("y")],
            vec![Edge::new("root", "z"), Edge::new("root", "y")],
        );
        let program = Program::from_workflow(&wf).unwrap();
        let mut rec = record(&program);
        done(&mut rec, "root", None);

        assert_eq!(
            next_runnable(&program, &rec, &HashSet::new()),
            Resolution::Ready(vec!["z".into(), "y".into()])
        );

        let in_flight = HashSet::from(["z".to_string()]);
        assert_eq!(next_runnable(&program, &rec, &in_flight), Resolution::Ready(vec!["y".into()]));
    }

    #[test]
    fn waiting_on_in_flight_work_is_not_a_stall() {
        let wf = Workflow::new(
            "seq",
            Trigger::Manual,
            vec![node("a"), node("b")],
            vec![Edge::new("a", "b")],
        );
        let program = Program::from_workflow(&wf).unwrap();
        let rec = record(&program);
        let in_flight = HashSet::from(["a".to_string()]);
        assert_eq!(next_runnable(&program, &rec, &in_flight), Resolution::Ready(vec![]));
    }

    #[test]
    fn unsatisfiable_graph_stalls() {
        // Hand-built program that skipped validation: a and b wait on each other.
        let mut program = Program::from_workflow(&Workflow::new(
            "pair",
            Trigger::Manual,
            vec![node("a"), node("b")],
            vec![],
        ))
        .unwrap();
        program.shape = Shape::Graph {
            edges: vec![Edge::new("a", "b"), Edge::new("b", "a")],
            order: vec![0, 1],
        };
        let rec = record(&program);
        assert_eq!(
            next_runnable(&program, &rec, &HashSet::new()),
            Resolution::Stall(vec!["a".into(), "b".into()])
        );
    }

    #[test]
    fn plan_runs_in_order_and_stops_at_approval() {
        let plan = Plan::new(
            "g",
            vec![
                PlanStep::new("s1", "one"),
                PlanStep::new("s2", "two").with_approval(),
                PlanStep::new("s3", "three"),
            ],
        );
        let program = Program::from_plan(&plan).unwrap();
        let mut rec = record(&program);

        assert_eq!(next_runnable(&program, &rec, &HashSet::new()), Resolution::Ready(vec!["s1".into()]));
        done(&mut rec, "s1", None);
        assert_eq!(
            next_runnable(&program, &rec, &HashSet::new()),
            Resolution::AwaitingApproval("s2".into())
        );

        rec.approvals.push(ApprovalRecord {
            step_id: "s2".into(),
            approved: Some(false),
            requested_at: Utc::now(),
            resolved_at: Some(Utc::now()),
        });
        assert_eq!(
            next_runnable(&program, &rec, &HashSet::new()),
            Resolution::AwaitingApproval("s2".into())
        );

        rec.approvals[0].approved = Some(true);
        assert_eq!(next_runnable(&program, &rec, &HashSet::new()), Resolution::Ready(vec!["s2".into()]));

        done(&mut rec, "s2", None);
        done(&mut rec, "s3", None);
        assert_eq!(next_runnable(&program, &rec, &HashSet::new()), Resolution::Terminal);
    }
}
