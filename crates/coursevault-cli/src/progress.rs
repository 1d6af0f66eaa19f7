//! Progress bar driven by the engine's progress events.

use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use coursevault::{ProgressEventKind, ProgressReceiver, RunPhase};

/// Render events from `rx` until the run reaches a terminal phase.
pub fn spawn_progress_bar(mut rx: ProgressReceiver) -> JoinHandle<()> {
    tokio::spawn(async move {
        let bar = ProgressBar::new_spinner();
        bar.set_message("starting");
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if apply(&bar, &event.event) {
                        break;
                    }
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
        bar.finish_and_clear();
    })
}

/// Update `bar` for one event; `true` once the run is over.
fn apply(bar: &ProgressBar, event: &ProgressEventKind) -> bool {
    match event {
        ProgressEventKind::PhaseChanged { phase } => match phase {
            RunPhase::Done | RunPhase::Aborted => return true,
            RunPhase::Resolving | RunPhase::Fetching => {}
            other => bar.set_message(other.to_string()),
        },
        ProgressEventKind::NodesDiscovered { total } => {
            bar.set_length(u64::from(*total));
            let style = ProgressStyle::default_bar()
                .template("[{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-");
            bar.set_style(style);
        }
        ProgressEventKind::NodeStarted { title, .. } => bar.set_message(title.clone()),
        ProgressEventKind::ResourceFetched { filename, .. } => {
            bar.set_message(format!("saved {filename}"));
        }
        ProgressEventKind::ResourceSkipped { .. } => {}
        ProgressEventKind::Failure { node_id, cause, .. } => {
            bar.println(format!("  ✗ {node_id}: {cause}"));
        }
        ProgressEventKind::NodeFinished { .. } => bar.inc(1),
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bar_counts_finished_nodes() {
        let bar = ProgressBar::hidden();
        assert!(!apply(&bar, &ProgressEventKind::NodesDiscovered { total: 3 }));
        assert!(!apply(&bar, &ProgressEventKind::NodeFinished { id: "a".into() }));
        assert!(!apply(&bar, &ProgressEventKind::NodeFinished { id: "b".into() }));
        assert_eq!(bar.position(), 2);
        assert_eq!(bar.length(), Some(3));
        assert!(apply(
            &bar,
            &ProgressEventKind::PhaseChanged {
                phase: RunPhase::Aborted
            }
        ));
    }
}
