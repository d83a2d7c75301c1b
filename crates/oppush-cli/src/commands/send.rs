//! Send command implementation.
//!
//! Queues every file on one push client, renders progress from the status
//! stream and prints a summary once the session has ended.

use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use uuid::Uuid;

use oppush_core::file::format_size;
use oppush_core::push::{PushClient, PushStatus, StatusKind};
use oppush_core::share::{ShareHandle, ShareInfo};

use super::SendArgs;

/// Run the send command.
pub async fn run(args: SendArgs) -> Result<()> {
    if args.name.is_some() && args.files.len() > 1 {
        anyhow::bail!("--name can only be used when sending a single file");
    }

    let mut config = super::load_config();
    if let Some(port) = args.port {
        config.connection.tcp_port = port;
    }
    config.validate().context("Invalid configuration")?;

    let connector = Arc::new(config.tcp_connector());
    let (mut client, mut updates) =
        PushClient::with_options(args.address.clone(), connector, config.transfer_options());

    if !args.quiet && !args.json {
        println!();
        println!("OpPush v{}", oppush_core::VERSION);
        println!("{}", "-".repeat(37));
        println!();
        println!("  Sending {} file(s) to {}", args.files.len(), args.address);
        println!();
    }

    let mut shares = Vec::with_capacity(args.files.len());
    for path in &args.files {
        let mut share = ShareInfo::new(path);
        if let Some(name) = &args.name {
            share = share.with_name(name.clone());
        }
        if let Some(content_type) = &args.content_type {
            share = share.with_content_type(content_type.clone());
        }
        let share = client
            .share_file(share)
            .with_context(|| format!("Failed to queue {}", path.display()))?;
        shares.push(share);
    }

    let start_time = Instant::now();
    let mut display = ProgressDisplay::new(args.quiet || args.json);
    let mut pending = shares.len();

    loop {
        tokio::select! {
            update = updates.recv() => {
                let Some(update) = update else { break };
                if display.show(&update) {
                    pending = pending.saturating_sub(1);
                    if pending == 0 {
                        tracing::debug!("All shares finished, disconnecting");
                        client.disconnect().await;
                    }
                }
                if update.is_disconnect() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                display.interrupt();
                client.disconnect().await;
            }
        }
    }
    client.disconnect().await;

    let failed = shares.iter().filter(|s| !s.status().is_success()).count();
    if args.json {
        print_json_summary(&shares, start_time.elapsed().as_secs_f64())?;
    } else if !args.quiet {
        print_summary(&shares, start_time.elapsed().as_secs());
    }

    if failed > 0 {
        anyhow::bail!("{} of {} file(s) were not delivered", failed, shares.len());
    }
    Ok(())
}

/// Renders status updates as terminal lines.
struct ProgressDisplay {
    quiet: bool,
    totals: HashMap<Uuid, u64>,
    line_open: bool,
}

impl ProgressDisplay {
    fn new(quiet: bool) -> Self {
        Self {
            quiet,
            totals: HashMap::new(),
            line_open: false,
        }
    }

    /// Render `update`; returns whether it finished a share.
    fn show(&mut self, update: &PushStatus) -> bool {
        let share = update.share.as_ref();
        let finished = share.is_some()
            && matches!(
                update.kind,
                StatusKind::Succeeded | StatusKind::Failed(_) | StatusKind::TimedOut
            );
        if self.quiet {
            return finished;
        }

        match (&update.kind, share) {
            (StatusKind::Connected, _) => self.line("  Connected."),
            (StatusKind::ConnectFailed { reason }, _) => {
                self.line(&format!("  Could not connect: {reason}"));
            }
            (StatusKind::Started { total }, Some(share)) => {
                self.totals.insert(share.id(), *total);
                self.progress(share, 0);
            }
            (StatusKind::Progress { sent }, Some(share)) => self.progress(share, *sent),
            (StatusKind::Succeeded, Some(share)) => {
                self.line(&format!("  ✓ {}", share.display_name()));
            }
            (StatusKind::Failed(status), Some(share)) => {
                self.line(&format!("  ✗ {} ({})", share.display_name(), status));
            }
            (StatusKind::Failed(status), None) => self.line(&format!("  Session failed ({status})")),
            (StatusKind::TimedOut, Some(share)) => {
                self.line(&format!("  ✗ {} (no answer from device)", share.display_name()));
            }
            (StatusKind::Disconnected(reason), _) => {
                tracing::debug!("Session ended: {}", reason);
                self.close_line();
            }
            _ => {}
        }
        finished
    }

    fn interrupt(&mut self) {
        if !self.quiet {
            self.line("  Interrupted, stopping...");
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn progress(&mut self, share: &ShareHandle, sent: u64) {
        let total = self.totals.get(&share.id()).copied().unwrap_or(0);
        let pct = if total == 0 {
            100.0
        } else {
            sent as f64 / total as f64 * 100.0
        };
        print!(
            "\r  [{:>6.2}%] {} - {}/{}    ",
            pct,
            share.display_name(),
            format_size(sent),
            format_size(total)
        );
        let _ = io::stdout().flush();
        self.line_open = true;
    }

    fn line(&mut self, text: &str) {
        self.close_line();
        println!("{text}");
    }

    fn close_line(&mut self) {
        if self.line_open {
            println!();
            self.line_open = false;
        }
    }
}

fn print_summary(shares: &[ShareHandle], elapsed_secs: u64) {
    let delivered = shares.iter().filter(|s| s.status().is_success()).count();
    println!();
    println!(
        "  {} of {} file(s) delivered in {}s",
        delivered,
        shares.len(),
        elapsed_secs
    );
    println!();
}

fn print_json_summary(shares: &[ShareHandle], elapsed_secs: f64) -> Result<()> {
    let output = serde_json::json!({
        "elapsed_secs": elapsed_secs,
        "shares": shares.iter().map(|s| {
            let status = s.status();
            serde_json::json!({
                "id": s.id().to_string(),
                "path": s.path().display().to_string(),
                "name": s.display_name(),
                "destination": s.destination(),
                "code": status.code(),
                "result": status,
            })
        }).collect::<Vec<_>>(),
    });
    println!(
        "{}",
        serde_json::to_string_pretty(&output).context("Failed to serialize summary")?
    );
    Ok(())
}
