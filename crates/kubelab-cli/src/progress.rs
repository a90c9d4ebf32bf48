//! Progress presentation
//!
//! The spinner runs in its own task and is stopped with a oneshot signal
//! once the operation it decorates finishes, success or failure. The
//! caller then awaits the task, so no ticker outlives the operation.

use std::future::Future;
use std::time::Duration;

use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use kubelab_readiness::ReadinessEvent;
use tokio::sync::{mpsc, oneshot};

use crate::output::phase_label;

fn spinner(enabled: bool, message: &str) -> ProgressBar {
    if !enabled {
        return ProgressBar::hidden();
    }

    let bar = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg} {prefix:.dim}") {
        bar.set_style(style.tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏ "));
    }
    bar.set_message(message.to_string());
    bar.enable_steady_tick(Duration::from_millis(80));
    bar
}

fn render(bar: &ProgressBar, event: ReadinessEvent) {
    match event {
        ReadinessEvent::Tick { elapsed, .. } => {
            bar.set_prefix(format!("{}s", elapsed.as_secs()));
        }
        ReadinessEvent::PhaseChanged {
            workload,
            phase,
            message,
        } => {
            bar.println(format!(
                "  {:<32} {:<10} {}",
                workload.display_name(),
                phase_label(phase),
                style(message).dim()
            ));
        }
        ReadinessEvent::ApplicationProbe { healthy, message } => {
            if healthy {
                bar.println(format!("  {:<32} {}", "application", style("healthy").green()));
            } else {
                bar.set_message(format!("Infra ready, app warming up ({})", message));
            }
        }
    }
}

async fn present_readiness(
    mut events: mpsc::UnboundedReceiver<ReadinessEvent>,
    mut stop: oneshot::Receiver<()>,
    enabled: bool,
) {
    let bar = spinner(enabled, "Waiting for workloads");

    loop {
        tokio::select! {
            _ = &mut stop => break,
            event = events.recv() => match event {
                Some(event) => render(&bar, event),
                None => {
                    let _ = (&mut stop).await;
                    break;
                }
            }
        }
    }

    while let Ok(event) = events.try_recv() {
        render(&bar, event);
    }
    bar.finish_and_clear();
}

/// Run `operation` while rendering readiness events
pub async fn with_readiness_progress<T>(
    events: mpsc::UnboundedReceiver<ReadinessEvent>,
    enabled: bool,
    operation: impl Future<Output = T>,
) -> T {
    let (stop_tx, stop_rx) = oneshot::channel();
    let presenter = tokio::spawn(present_readiness(events, stop_rx, enabled));

    let result = operation.await;

    let _ = stop_tx.send(());
    let _ = presenter.await;
    result
}

/// Run `operation` behind a plain spinner
pub async fn with_spinner<T>(
    message: &str,
    enabled: bool,
    operation: impl Future<Output = T>,
) -> T {
    let bar = spinner(enabled, message);
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let ticker = {
        let bar = bar.clone();
        tokio::spawn(async move {
            let _ = stop_rx.await;
            bar.finish_and_clear();
        })
    };

    let result = operation.await;

    let _ = stop_tx.send(());
    let _ = ticker.await;
    result
}
