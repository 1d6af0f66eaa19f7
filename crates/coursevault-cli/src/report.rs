//! Final run report, as text or JSON.

use std::fmt::Write as _;

use coursevault::{FailureStage, RunOutcome, RunState};

/// Human-readable report. `quiet` keeps only the summary line and failures.
pub fn render_text(outcome: &RunOutcome, quiet: bool) -> String {
    let mut out = String::new();
    let status = match &outcome.state {
        RunState::Done if outcome.failed == 0 => "done".to_string(),
        RunState::Done => "done with failures".to_string(),
        RunState::Aborted { reason } => format!("aborted: {reason}"),
    };
    if !quiet {
        let _ = writeln!(out, "  {}: {status}", outcome.label);
        let _ = writeln!(out, "  Nodes visited:  {}", outcome.nodes_visited);
    }
    let _ = writeln!(
        out,
        "  Fetched {}, skipped {}, failed {}",
        outcome.fetched, outcome.skipped, outcome.failed
    );

    if !outcome.failures.is_empty() {
        let _ = writeln!(out, "\n  Failures:");
        for failure in &outcome.failures {
            let stage = match failure.stage {
                FailureStage::Navigation => "navigation",
                FailureStage::Resolution => "resolution",
                FailureStage::Retrieval => "retrieval",
            };
            let _ = write!(out, "    [{stage}] {} ({})", failure.node_title, failure.node_id);
            if let Some(resource) = &failure.resource {
                let _ = write!(out, " {resource}");
            }
            let _ = writeln!(out, ": {}", failure.cause);
        }
    }
    if quiet {
        if let RunState::Aborted { reason } = &outcome.state {
            let _ = writeln!(out, "  Aborted: {reason}");
        }
    }
    out
}

/// Machine-readable report.
pub fn render_json(outcome: &RunOutcome) -> String {
    let mut value = serde_json::to_value(outcome).unwrap_or_default();
    if let Some(map) = value.as_object_mut() {
        map.insert("exit_code".into(), outcome.exit_code().into());
    }
    serde_json::to_string_pretty(&value).unwrap_or_default()
}
