//! Driver probe loop.
//!
//! Each registered probe function is offered every node in pre-order. A
//! probe answers [`ProbeResult::Unrecognised`] to pass, `Success` /
//! `Failure` to settle the node, or `Waiting` when it matched but a
//! dependency (an interrupt parent, a bus) has not probed yet. Waiting
//! nodes are re-driven in follow-up sweeps until a whole sweep makes no
//! progress, with an overall retry bound.

use super::{DeviceTree, NodeId, ProbeStatus};

/// A probe function's verdict for one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// This driver does not handle the node.
    Unrecognised,
    /// The driver matched but a dependency is missing; retry later.
    Waiting,
    /// The driver bound the node.
    Success,
    /// The driver matched and failed permanently.
    Failure,
}

/// A driver's entry in the probe table.
pub struct ProbeEntry {
    /// Driver name, for logging.
    pub name: &'static str,
    /// Called with each unsettled node.
    pub probe: fn(&mut DeviceTree, NodeId) -> ProbeResult,
}

/// Upper bound on follow-up sweeps over Waiting nodes.
const MAX_RETRY_SWEEPS: usize = 8;

/// Summary of one [`run_probes`] invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProbeSummary {
    /// Nodes that ended in `Success`.
    pub succeeded: usize,
    /// Nodes that ended in `Failure`.
    pub failed: usize,
    /// Nodes still `Waiting` when the loop gave up.
    pub still_waiting: usize,
}

fn drive_node(tree: &mut DeviceTree, id: NodeId, probes: &[ProbeEntry]) -> ProbeStatus {
    for entry in probes {
        match (entry.probe)(tree, id) {
            ProbeResult::Unrecognised => {}
            ProbeResult::Waiting => return ProbeStatus::Waiting,
            ProbeResult::Success => {
                bekos_core::kdebug!(
                    "probe",
                    "{}: bound {}",
                    entry.name,
                    tree.node(id).name
                );
                return ProbeStatus::Success;
            }
            ProbeResult::Failure => {
                bekos_core::kwarn!(
                    "probe",
                    "{}: failed on {}",
                    entry.name,
                    tree.node(id).name
                );
                return ProbeStatus::Failure;
            }
        }
    }
    ProbeStatus::Unrecognised
}

/// Runs the probe loop to quiescence.
///
/// The first pass drives every node; follow-up passes re-drive only nodes
/// left `Waiting`, and stop as soon as a whole sweep moves none of them
/// (or the retry bound is hit).
pub fn run_probes(tree: &mut DeviceTree, probes: &[ProbeEntry]) -> ProbeSummary {
    let order = tree.preorder();

    // First pass: everything.
    for &id in &order {
        if tree.node(id).probe_status == ProbeStatus::Unprobed {
            let status = drive_node(tree, id, probes);
            tree.node_mut(id).probe_status = status;
        }
    }

    // Re-drive Waiting nodes until a sweep makes no progress.
    for _ in 0..MAX_RETRY_SWEEPS {
        let mut progressed = false;
        for &id in &order {
            if tree.node(id).probe_status != ProbeStatus::Waiting {
                continue;
            }
            let status = drive_node(tree, id, probes);
            if status != ProbeStatus::Waiting {
                progressed = true;
            }
            tree.node_mut(id).probe_status = status;
        }
        if !progressed {
            break;
        }
    }

    let mut summary = ProbeSummary::default();
    for &id in &order {
        match tree.node(id).probe_status {
            ProbeStatus::Success => summary.succeeded += 1,
            ProbeStatus::Failure => summary.failed += 1,
            ProbeStatus::Waiting => summary.still_waiting += 1,
            _ => {}
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devicetree::testtree::TreeBuilder;
    use core::sync::atomic::{AtomicUsize, Ordering};

    fn two_node_tree() -> (DeviceTree, NodeId, NodeId) {
        let mut b = TreeBuilder::new();
        let root = NodeId(0);
        let intc = b.add_node(root, "interrupt-controller");
        b.set_compatible(intc, &["test,intc"]);
        let timer = b.add_node(root, "timer");
        b.set_compatible(timer, &["test,timer"]);
        (b.finish(), intc, timer)
    }

    #[test]
    fn unmatched_nodes_end_unrecognised() {
        let (mut tree, intc, timer) = two_node_tree();
        let summary = run_probes(&mut tree, &[]);
        assert_eq!(summary.succeeded, 0);
        assert_eq!(tree.node(intc).probe_status, ProbeStatus::Unrecognised);
        assert_eq!(tree.node(timer).probe_status, ProbeStatus::Unrecognised);
    }

    #[test]
    fn matching_probe_binds() {
        let (mut tree, intc, timer) = two_node_tree();
        fn probe(tree: &mut DeviceTree, id: NodeId) -> ProbeResult {
            if tree.node(id).is_compatible("test,intc") {
                ProbeResult::Success
            } else {
                ProbeResult::Unrecognised
            }
        }
        let entries = [ProbeEntry {
            name: "intc",
            probe,
        }];
        let summary = run_probes(&mut tree, &entries);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(tree.node(intc).probe_status, ProbeStatus::Success);
        assert_eq!(tree.node(timer).probe_status, ProbeStatus::Unrecognised);
    }

    /// The timer waits until the interrupt controller has probed: the
    /// classic dependency the retry sweeps exist for. With the intc probe
    /// listed *after* the timer probe, the first pass leaves the timer
    /// Waiting and a follow-up sweep settles it.
    #[test]
    fn waiting_nodes_retried_until_dependency_ready() {
        let (mut tree, intc, timer) = two_node_tree();

        fn probe_timer(tree: &mut DeviceTree, id: NodeId) -> ProbeResult {
            if !tree.node(id).is_compatible("test,timer") {
                return ProbeResult::Unrecognised;
            }
            // Dependency: the intc node must have bound already.
            let intc = tree.find_compatible("test,intc").unwrap();
            if tree.node(intc).probe_status == ProbeStatus::Success {
                ProbeResult::Success
            } else {
                ProbeResult::Waiting
            }
        }
        fn probe_intc(tree: &mut DeviceTree, id: NodeId) -> ProbeResult {
            if tree.node(id).is_compatible("test,intc") {
                ProbeResult::Success
            } else {
                ProbeResult::Unrecognised
            }
        }

        let entries = [
            ProbeEntry {
                name: "timer",
                probe: probe_timer,
            },
            ProbeEntry {
                name: "intc",
                probe: probe_intc,
            },
        ];
        let summary = run_probes(&mut tree, &entries);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.still_waiting, 0);
        assert_eq!(tree.node(timer).probe_status, ProbeStatus::Success);
        assert_eq!(tree.node(intc).probe_status, ProbeStatus::Success);
    }

    #[test]
    fn permanently_waiting_node_terminates_loop() {
        let (mut tree, _intc, timer) = two_node_tree();

        static CALLS: AtomicUsize = AtomicUsize::new(0);
        fn probe_stuck(tree: &mut DeviceTree, id: NodeId) -> ProbeResult {
            if tree.node(id).is_compatible("test,timer") {
                CALLS.fetch_add(1, Ordering::Relaxed);
                ProbeResult::Waiting
            } else {
                ProbeResult::Unrecognised
            }
        }

        CALLS.store(0, Ordering::Relaxed);
        let entries = [ProbeEntry {
            name: "stuck",
            probe: probe_stuck,
        }];
        let summary = run_probes(&mut tree, &entries);
        assert_eq!(summary.still_waiting, 1);
        assert_eq!(tree.node(timer).probe_status, ProbeStatus::Waiting);
        // First pass + exactly one fruitless sweep.
        assert_eq!(CALLS.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn failure_is_terminal() {
        let (mut tree, intc, _) = two_node_tree();
        fn probe_fail(tree: &mut DeviceTree, id: NodeId) -> ProbeResult {
            if tree.node(id).is_compatible("test,intc") {
                ProbeResult::Failure
            } else {
                ProbeResult::Unrecognised
            }
        }
        let entries = [ProbeEntry {
            name: "failing",
            probe: probe_fail,
        }];
        let summary = run_probes(&mut tree, &entries);
        assert_eq!(summary.failed, 1);
        assert_eq!(tree.node(intc).probe_status, ProbeStatus::Failure);
    }
}
