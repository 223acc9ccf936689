//! Implementation of the `dlmcore simulate` command.

use crate::cli::SimulateArgs;
use crate::error::{DlmError, Result};
use crate::lock::Lock;
use crate::simulate::{Scenario, ScenarioReport};

pub fn cmd_simulate(args: SimulateArgs) -> Result<()> {
    let scenario = Scenario::load(&args.script)?;
    let report = scenario.run()?;

    if args.json {
        let json = serde_json::to_string_pretty(&report)
            .map_err(|e| DlmError::UserError(format!("failed to serialize report: {}", e)))?;
        println!("{}", json);
    } else {
        print!("{}", render(&report));
    }

    match report.failures() {
        0 => Ok(()),
        n => Err(DlmError::UserError(format!(
            "{} of {} steps did not match their expected outcome",
            n,
            report.steps.len()
        ))),
    }
}

fn render_queue(locks: &[Lock]) -> String {
    if locks.is_empty() {
        return "-".to_string();
    }
    locks
        .iter()
        .map(|l| match l.requested_mode {
            Some(wanted) => format!("{} {}->{}", l.holder, l.granted_mode, wanted),
            None => format!("{} {}", l.holder, l.granted_mode),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn render(report: &ScenarioReport) -> String {
    let mut out = String::new();

    for step in &report.steps {
        let verdict = match (step.passed, step.expected) {
            (true, Some(_)) => "  [ok]".to_string(),
            (true, None) => String::new(),
            (false, Some(want)) => format!(
                "  [FAILED, expected {}]",
                serde_json::to_string(&want)
                    .unwrap_or_default()
                    .trim_matches('"')
            ),
            (false, None) => "  [FAILED]".to_string(),
        };
        out.push_str(&format!(
            "Step {:>2}: {} -> {}{}\n",
            step.index, step.step, step.outcome, verdict
        ));
    }

    for node in &report.nodes {
        out.push_str(&format!("\nNode {}:\n", node.node));
        if node.resources.is_empty() && node.shadows.is_empty() {
            out.push_str("  (no locks)\n");
        }
        for res in &node.resources {
            out.push_str(&format!(
                "  {} (master {}, generation {})\n",
                res.name, res.master, res.generation
            ));
            out.push_str(&format!("    granted:    {}\n", render_queue(&res.granted)));
            out.push_str(&format!("    converting: {}\n", render_queue(&res.converting)));
            out.push_str(&format!("    blocked:    {}\n", render_queue(&res.blocked)));
        }
        for shadow in &node.shadows {
            out.push_str(&format!(
                "  shadow {} as {}: {} via node {} ({:?}{})\n",
                shadow.resource,
                shadow.holder,
                shadow.granted,
                shadow.master,
                shadow.state,
                if shadow.orphaned { ", orphaned" } else { "" }
            ));
        }
    }
    out
}
