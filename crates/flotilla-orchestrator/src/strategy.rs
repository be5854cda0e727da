//! Batch partitioning and rollout phases.
//!
//! Rolling deployments process `ceil(N / batchSize)` batches in inventory
//! order. Canary deployments take the first `ceil(N * canaryPercent / 100)`
//! servers sorted by id as the canary subset, then roll the rest.
//! Blue-green deployments treat the whole standby slot as one phase.

use std::fmt;

use flotilla_core::{DeploymentPlan, ServerSpec, Slot, Strategy};

/// An ordered, non-empty group of servers processed together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    /// 1-based position within its phase.
    pub number: usize,
    /// Servers in the batch.
    pub servers: Vec<ServerSpec>,
}

impl Batch {
    /// Returns the server ids in the batch.
    pub fn ids(&self) -> Vec<String> {
        self.servers.iter().map(|s| s.id.clone()).collect()
    }

    /// Returns the number of servers in the batch.
    pub fn len(&self) -> usize {
        self.servers.len()
    }

    /// Returns true if the batch has no servers.
    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}

/// Number of batches needed for `total` servers.
pub const fn batch_count(total: usize, batch_size: usize) -> usize {
    if batch_size == 0 {
        0
    } else {
        total.div_ceil(batch_size)
    }
}

/// Splits servers into consecutive batches of `batch_size`; the last one may be smaller.
pub fn partition(servers: &[ServerSpec], batch_size: usize) -> Vec<Batch> {
    if batch_size == 0 {
        return Vec::new();
    }
    servers
        .chunks(batch_size)
        .enumerate()
        .map(|(i, chunk)| Batch {
            number: i + 1,
            servers: chunk.to_vec(),
        })
        .collect()
}

/// Size of the canary subset for `total` servers.
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn canary_count(total: usize, percent: f64) -> usize {
    let count = ((total as f64) * percent / 100.0).ceil() as usize;
    count.min(total)
}

/// Splits servers into the canary subset and the remainder.
///
/// Servers are ordered by id first so the subset is deterministic.
pub fn canary_split(servers: &[ServerSpec], percent: f64) -> (Vec<ServerSpec>, Vec<ServerSpec>) {
    let mut sorted = servers.to_vec();
    sorted.sort_by(|a, b| a.id.cmp(&b.id));
    let count = canary_count(sorted.len(), percent);
    let rest = sorted.split_off(count);
    (sorted, rest)
}

/// A step of a rollout, as shown by a dry run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Phase {
    /// Phase name.
    pub name: String,
    /// Batches in the phase.
    pub batches: Vec<Batch>,
    /// Whether a metrics watch gates the next phase.
    pub gated: bool,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if self.gated {
            write!(f, " (gated by metrics watch)")?;
        }
        for batch in &self.batches {
            write!(f, "\n  batch {}: {}", batch.number, batch.ids().join(", "))?;
        }
        Ok(())
    }
}

/// Computes the phases a plan will go through.
///
/// `active_slot` is the blue/green slot currently live; it is ignored by
/// the other strategies.
pub fn rollout_phases(plan: &DeploymentPlan, active_slot: Option<Slot>) -> Vec<Phase> {
    match plan.strategy {
        Strategy::Rolling => vec![Phase {
            name: "rolling".to_string(),
            batches: partition(&plan.servers, plan.batch_size),
            gated: false,
        }],
        Strategy::Canary => {
            let (canary, rest) = canary_split(&plan.servers, plan.canary_percent.unwrap_or(0.0));
            let mut phases = vec![Phase {
                name: "canary".to_string(),
                batches: partition(&canary, canary.len().max(1)),
                gated: true,
            }];
            if !rest.is_empty() {
                phases.push(Phase {
                    name: "rolling".to_string(),
                    batches: partition(&rest, plan.batch_size),
                    gated: false,
                });
            }
            phases
        }
        Strategy::BlueGreen => {
            let target = active_slot.unwrap_or(Slot::Blue).opposite();
            let servers = plan.servers_in_slot(target);
            vec![Phase {
                name: format!("blue-green: deploy to {target}, then switch traffic"),
                batches: partition(&servers, servers.len().max(1)),
                gated: plan.post_deploy_monitor,
            }]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn servers(n: usize) -> Vec<ServerSpec> {
        (1..=n)
            .map(|i| ServerSpec::new(format!("web-{i:02}"), format!("10.0.0.{i}:8080")))
            .collect()
    }

    #[test]
    fn test_six_servers_batches_of_two() {
        let batches = partition(&servers(6), 2);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[1].ids(), vec!["web-03", "web-04"]);
        assert_eq!(batches[2].number, 3);
    }

    #[test]
    fn test_last_batch_smaller() {
        let batches = partition(&servers(7), 3);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[2].len(), 1);
    }

    #[test]
    fn test_canary_ten_percent_of_twenty() {
        assert_eq!(canary_count(20, 10.0), 2);
        assert_eq!(canary_count(5, 10.0), 1);
        assert_eq!(canary_count(1, 99.0), 1);
    }

    #[test]
    fn test_canary_split_sorted_by_id() {
        let mut shuffled = servers(5);
        shuffled.reverse();
        let (canary, rest) = canary_split(&shuffled, 40.0);
        assert_eq!(canary.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(), vec!["web-01", "web-02"]);
        assert_eq!(rest.len(), 3);
    }

    #[test]
    fn test_blue_green_phase_targets_standby() {
        let plan = DeploymentPlan::builder("prod", "2.0.0")
            .strategy(Strategy::BlueGreen)
            .server(ServerSpec::new("blue-1", "a:1").in_slot(Slot::Blue))
            .server(ServerSpec::new("green-1", "b:1").in_slot(Slot::Green))
            .server(ServerSpec::new("green-2", "c:1").in_slot(Slot::Green))
            .build()
            .unwrap();
        let phases = rollout_phases(&plan, Some(Slot::Blue));
        assert_eq!(phases.len(), 1);
        assert_eq!(phases[0].batches[0].ids(), vec!["green-1", "green-2"]);
    }

    proptest! {
        #[test]
        fn batch_count_is_ceiling(n in 0usize..500, b in 1usize..64) {
            let batches = partition(&servers(n), b);
            let expected = batch_count(n, b);
            prop_assert_eq!(batches.len(), expected);
            prop_assert_eq!(expected, (n + b - 1) / b);
            if let Some(last) = batches.last() {
                prop_assert_eq!(last.len(), n - b * (expected - 1));
            }
            prop_assert!(batches.iter().all(|batch| !batch.is_empty() && batch.len() <= b));
        }

        #[test]
        fn batches_preserve_order_and_cover_all(n in 1usize..200, b in 1usize..32) {
            let input = servers(n);
            let flattened: Vec<_> = partition(&input, b)
                .into_iter()
                .flat_map(|batch| batch.servers)
                .collect();
            prop_assert_eq!(flattened, input);
        }

        #[test]
        fn canary_subset_is_ceiling_and_disjoint(n in 1usize..300, pct in 0.5f64..99.5) {
            let (canary, rest) = canary_split(&servers(n), pct);
            let expected = ((n as f64) * pct / 100.0).ceil() as usize;
            prop_assert_eq!(canary.len(), expected.min(n));
            prop_assert!(!canary.is_empty());
            prop_assert_eq!(canary.len() + rest.len(), n);
            prop_assert!(canary.iter().all(|c| !rest.contains(c)));
        }
    }
}
