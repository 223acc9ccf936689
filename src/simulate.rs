//! Scripted multi-node scenarios.
//!
//! A scenario is a YAML file describing a cluster and an ordered list of
//! steps. Each step runs against an in-process [`LocalCluster`]; the
//! cluster is allowed to go quiet after every step so asynchronous grants
//! have landed before the next one starts.
//!
//! # Example
//!
//! ```yaml
//! cluster: [1, 2]
//! masters:
//!   R: 1
//! steps:
//!   - acquire: { node: 1, cookie: 1, resource: R, mode: PR }
//!   - acquire: { node: 2, cookie: 1, resource: R, mode: PR }
//!   - convert: { node: 2, cookie: 1, resource: R, mode: EX, expect: queued }
//!   - release: { node: 1, cookie: 1, resource: R }
//!   - settle
//! ```

use crate::cluster::LocalCluster;
use crate::config::types::DEFAULT_MASTER_WAIT_MS;
use crate::error::{DlmError, Result};
use crate::lock::{ConversionOutcome, HolderId, LockFlags, NodeId};
use crate::manager::{RecoveryEvent, ShadowView};
use crate::mode::LockMode;
use crate::resource::ResourceSnapshot;
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5_000;

fn default_master_wait_ms() -> u64 {
    DEFAULT_MASTER_WAIT_MS
}

fn default_request_timeout_ms() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_MS
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    pub cluster: Vec<NodeId>,

    #[serde(default)]
    pub masters: BTreeMap<String, NodeId>,

    /// How long a request waits for a dead master to be replaced.
    #[serde(default = "default_master_wait_ms")]
    pub master_wait_ms: u64,

    /// Upper bound on every request and on each settle.
    #[serde(default = "default_request_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(deserialize_with = "serde_yaml::with::singleton_map_recursive::deserialize")]
    pub steps: Vec<Step>,
}

/// A lock request from one holder.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LockStep {
    pub node: NodeId,
    pub cookie: u64,
    pub resource: String,
    pub mode: LockMode,
    #[serde(default)]
    pub no_queue: bool,
    #[serde(default)]
    pub expect: Option<Expect>,
}

/// A release or cancel by one holder.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HolderStep {
    pub node: NodeId,
    pub cookie: u64,
    pub resource: String,
    #[serde(default)]
    pub expect: Option<Expect>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Acquire(LockStep),
    Convert(LockStep),
    Release(HolderStep),
    Cancel(HolderStep),
    NodeDown { node: NodeId, generation: u32 },
    AssignMaster {
        resource: String,
        master: NodeId,
        generation: u32,
    },
    Settle,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Acquire(s) => write!(
                f,
                "acquire {} {} as {}:{}",
                s.resource, s.mode, s.node, s.cookie
            ),
            Step::Convert(s) => write!(
                f,
                "convert {} to {} as {}:{}",
                s.resource, s.mode, s.node, s.cookie
            ),
            Step::Release(s) => write!(f, "release {} as {}:{}", s.resource, s.node, s.cookie),
            Step::Cancel(s) => write!(f, "cancel {} as {}:{}", s.resource, s.node, s.cookie),
            Step::NodeDown { node, generation } => {
                write!(f, "node {} down (generation {})", node, generation)
            }
            Step::AssignMaster {
                resource,
                master,
                generation,
            } => write!(
                f,
                "node {} masters {} (generation {})",
                master, resource, generation
            ),
            Step::Settle => write!(f, "settle"),
        }
    }
}

/// What a step is expected to return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expect {
    Ok,
    Granted,
    Queued,
    Denied,
    UnknownResource,
    NotHolder,
    AlreadyHolder,
    ConversionInProgress,
    RetryMaster,
    Timeout,
    MasterUnreachable,
}

impl Expect {
    fn of(result: &Result<Option<ConversionOutcome>>) -> Option<Self> {
        Some(match result {
            Ok(None) => Expect::Ok,
            Ok(Some(ConversionOutcome::Granted(_))) => Expect::Granted,
            Ok(Some(ConversionOutcome::Queued)) => Expect::Queued,
            Ok(Some(ConversionOutcome::Denied)) => Expect::Denied,
            Err(DlmError::UnknownResource(_)) => Expect::UnknownResource,
            Err(DlmError::NotHolder { .. }) => Expect::NotHolder,
            Err(DlmError::AlreadyHolder { .. }) => Expect::AlreadyHolder,
            Err(DlmError::ConversionInProgress { .. }) => Expect::ConversionInProgress,
            Err(DlmError::RetryMaster(_)) => Expect::RetryMaster,
            Err(DlmError::Timeout(_)) => Expect::Timeout,
            Err(DlmError::MasterUnreachable { .. }) => Expect::MasterUnreachable,
            Err(_) => return None,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub index: usize,
    pub step: String,
    pub outcome: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected: Option<Expect>,
    pub passed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeReport {
    pub node: NodeId,
    pub resources: Vec<ResourceSnapshot>,
    pub shadows: Vec<ShadowView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub steps: Vec<StepReport>,
    pub nodes: Vec<NodeReport>,
}

impl ScenarioReport {
    pub fn failures(&self) -> usize {
        self.steps.iter().filter(|s| !s.passed).count()
    }
}

impl Scenario {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            DlmError::UserError(format!(
                "failed to read scenario '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let scenario: Scenario = serde_yaml::from_str(yaml)
            .map_err(|e| DlmError::UserError(format!("failed to parse scenario YAML: {}", e)))?;
        if scenario.cluster.is_empty() {
            return Err(DlmError::UserError(
                "scenario cluster must list at least one node".to_string(),
            ));
        }
        Ok(scenario)
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Run every step, then report what each node ended up with.
    ///
    /// A step whose outcome differs from its `expect` is recorded as failed
    /// and the run continues; errors that say nothing about locking (an
    /// unknown node, a cluster that never settles) abort the run.
    pub fn run(&self) -> Result<ScenarioReport> {
        let cluster = LocalCluster::start_with(&self.cluster, |config| {
            config.masters = self.masters.clone();
            config.master_wait_ms = self.master_wait_ms;
        })?;

        let mut steps = Vec::with_capacity(self.steps.len());
        for (index, step) in self.steps.iter().enumerate() {
            let result = self.run_step(&cluster, step)?;
            cluster.settle(self.request_timeout())?;

            let expected = match step {
                Step::Acquire(s) | Step::Convert(s) => s.expect,
                Step::Release(s) | Step::Cancel(s) => s.expect,
                _ => None,
            };
            let outcome = match &result {
                Ok(None) => "ok".to_string(),
                Ok(Some(outcome)) => outcome.to_string(),
                Err(e) if e.is_retryable() => format!("error (retryable): {}", e),
                Err(e) => format!("error: {}", e),
            };
            let passed = expected.is_none_or(|want| Expect::of(&result) == Some(want));
            info!("step {}: {} -> {}", index + 1, step, outcome);
            steps.push(StepReport {
                index: index + 1,
                step: step.to_string(),
                outcome,
                expected,
                passed,
            });
        }

        let mut nodes = Vec::new();
        for id in cluster.node_ids() {
            let node = cluster.node(id)?;
            nodes.push(NodeReport {
                node: id,
                resources: node.snapshot(None)?,
                shadows: node.shadows(),
            });
        }
        Ok(ScenarioReport { steps, nodes })
    }

    /// The outer `Result` aborts the run; the inner one is the step's outcome.
    fn run_step(
        &self,
        cluster: &LocalCluster,
        step: &Step,
    ) -> Result<Result<Option<ConversionOutcome>>> {
        let timeout = Some(self.request_timeout());
        let flags = |no_queue: bool| LockFlags {
            no_queue,
            ..LockFlags::default()
        };

        Ok(match step {
            Step::Acquire(s) => {
                let holder = HolderId::new(s.node, s.cookie);
                cluster
                    .node(s.node)?
                    .acquire(&s.resource, holder, s.mode, flags(s.no_queue), timeout)
                    .map(Some)
            }
            Step::Convert(s) => {
                let holder = HolderId::new(s.node, s.cookie);
                cluster
                    .node(s.node)?
                    .request_conversion(&s.resource, holder, s.mode, flags(s.no_queue), timeout)
                    .map(Some)
            }
            Step::Release(s) => {
                let holder = HolderId::new(s.node, s.cookie);
                cluster
                    .node(s.node)?
                    .release(&s.resource, holder, timeout)
                    .map(|_| None)
            }
            Step::Cancel(s) => {
                let holder = HolderId::new(s.node, s.cookie);
                cluster
                    .node(s.node)?
                    .cancel_conversion(&s.resource, holder)
                    .map(|_| None)
            }
            Step::NodeDown { node, generation } => {
                cluster.node(*node)?;
                cluster.kill(*node);
                cluster.recover(RecoveryEvent::NodeDown {
                    node: *node,
                    generation: *generation,
                });
                Ok(None)
            }
            Step::AssignMaster {
                resource,
                master,
                generation,
            } => {
                cluster.node(*master)?;
                cluster.recover(RecoveryEvent::MasterAssigned {
                    resource: resource.clone(),
                    master: *master,
                    generation: *generation,
                });
                Ok(None)
            }
            Step::Settle => Ok(None),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::write_file;
    use tempfile::TempDir;

    const UPGRADE: &str = r#"
cluster: [1, 2]
masters:
  R: 1
steps:
  - acquire: { node: 1, cookie: 1, resource: R, mode: PR, expect: granted }
  - acquire: { node: 2, cookie: 1, resource: R, mode: PR, expect: granted }
  - convert: { node: 2, cookie: 1, resource: R, mode: EX, expect: queued }
  - convert: { node: 2, cookie: 1, resource: R, mode: CR, expect: conversion_in_progress }
  - release: { node: 1, cookie: 1, resource: R, expect: ok }
  - settle
"#;

    #[test]
    fn parses_steps_and_defaults() {
        let scenario = Scenario::from_yaml(UPGRADE).unwrap();
        assert_eq!(scenario.cluster, vec![1, 2]);
        assert_eq!(scenario.master_wait_ms, DEFAULT_MASTER_WAIT_MS);
        assert_eq!(scenario.steps.len(), 6);
        assert_eq!(scenario.steps[5], Step::Settle);
        match &scenario.steps[2] {
            Step::Convert(s) => {
                assert_eq!(s.mode, LockMode::Exclusive);
                assert_eq!(s.expect, Some(Expect::Queued));
                assert!(!s.no_queue);
            }
            other => panic!("unexpected step {:?}", other),
        }
    }

    #[test]
    fn rejects_empty_cluster_and_unknown_keys() {
        assert!(Scenario::from_yaml("cluster: []\nsteps: []").is_err());
        assert!(Scenario::from_yaml("cluster: [1]\nsteps: []\nbogus: 1").is_err());
    }

    #[test]
    fn queued_remote_upgrade_ends_granted() {
        let report = Scenario::from_yaml(UPGRADE).unwrap().run().unwrap();

        assert_eq!(report.failures(), 0, "{:#?}", report.steps);
        let master = report.nodes.iter().find(|n| n.node == 1).unwrap();
        let granted = &master.resources[0].granted;
        assert_eq!(granted.len(), 1);
        assert_eq!(granted[0].holder, HolderId::new(2, 1));
        assert_eq!(granted[0].granted_mode, LockMode::Exclusive);

        let remote = report.nodes.iter().find(|n| n.node == 2).unwrap();
        assert_eq!(remote.shadows[0].granted, LockMode::Exclusive);
    }

    #[test]
    fn failed_expectation_is_reported_not_fatal() {
        let yaml = r#"
cluster: [1]
steps:
  - acquire: { node: 1, cookie: 1, resource: R, mode: EX }
  - acquire: { node: 1, cookie: 2, resource: R, mode: EX, no_queue: true, expect: granted }
  - release: { node: 1, cookie: 9, resource: R, expect: not_holder }
"#;
        let report = Scenario::from_yaml(yaml).unwrap().run().unwrap();
        assert_eq!(report.failures(), 1);
        assert!(!report.steps[1].passed);
        assert_eq!(report.steps[1].outcome, "denied");
        assert!(report.steps[2].passed);
    }

    #[test]
    fn master_failover_scenario_from_file() {
        let dir = TempDir::new().unwrap();
        let path = write_file(
            dir.path(),
            "failover.yaml",
            r#"
cluster: [1, 2, 3]
masters:
  R: 3
master_wait_ms: 50
steps:
  - acquire: { node: 1, cookie: 1, resource: R, mode: PR }
  - acquire: { node: 2, cookie: 1, resource: R, mode: PR }
  - node_down: { node: 3, generation: 2 }
  - convert: { node: 2, cookie: 1, resource: R, mode: EX, expect: master_unreachable }
  - assign_master: { resource: R, master: 1, generation: 2 }
  - convert: { node: 2, cookie: 1, resource: R, mode: EX, expect: queued }
  - release: { node: 1, cookie: 1, resource: R }
"#,
        );

        let report = Scenario::load(&path).unwrap().run().unwrap();

        assert_eq!(report.failures(), 0, "{:#?}", report.steps);
        assert_eq!(report.nodes.len(), 2);
        let master = report.nodes.iter().find(|n| n.node == 1).unwrap();
        let snapshot = &master.resources[0];
        assert_eq!(snapshot.generation, 2);
        assert_eq!(snapshot.granted[0].holder, HolderId::new(2, 1));
        assert_eq!(snapshot.granted[0].granted_mode, LockMode::Exclusive);
    }

    #[test]
    fn unknown_node_aborts_the_run() {
        let yaml = r#"
cluster: [1]
steps:
  - acquire: { node: 4, cookie: 1, resource: R, mode: EX }
"#;
        assert!(matches!(
            Scenario::from_yaml(yaml).unwrap().run(),
            Err(DlmError::UserError(_))
        ));
    }
}
