//! warden-advisor: admission advice for a stream of load samples.
//!
//! Reads one `ConcurrencyMetrics` JSON object per line on stdin and writes
//! the matching `AdmissionAdvice` as one JSON line on stdout. Lines that do
//! not parse are logged and skipped.

use clap::Parser;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{info, warn};

use warden_control::{AdmissionAdvice, BackpressureController};
use warden_core::{config, ConcurrencyMetrics, ControlPlaneConfig};

// ── CLI ─────────────────────────────────────────────────────────────

/// Turn worker-pool load samples into admission advice.
#[derive(Parser, Debug)]
#[command(name = "warden-advisor", version, about)]
struct Cli {
    /// Path to a warden.toml config file.
    #[arg(long, env = "WARDEN_CONFIG", default_value = "config/warden.toml")]
    config: String,

    /// Override the configured backpressure threshold.
    #[arg(long, env = "WARDEN_ADVISOR_THRESHOLD")]
    threshold: Option<f64>,
}

// ── main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    config::load_dotenv();
    let cli = Cli::parse();

    let config = match ControlPlaneConfig::from_file(&cli.config) {
        Ok(cfg) => {
            info!(path = %cli.config, "loaded warden config");
            cfg
        }
        Err(e) => {
            warn!(
                error = %e,
                path = %cli.config,
                "failed to load config, using environment and defaults"
            );
            ControlPlaneConfig::from_env()?
        }
    };
    config.log_summary();

    let mut concurrency = config.concurrency.clone();
    if let Some(threshold) = cli.threshold {
        concurrency.backpressure_threshold = threshold;
        concurrency.validate()?;
    }
    let controller = BackpressureController::new(concurrency);

    let mut stdout = tokio::io::stdout();
    let summary = run(&controller, BufReader::new(tokio::io::stdin()), &mut stdout).await?;

    info!(
        lines = summary.lines,
        advised = summary.advised,
        skipped = summary.skipped,
        "input closed, advisor exiting"
    );
    Ok(())
}

// ── Stream processing ───────────────────────────────────────────────

#[derive(Debug, Default, PartialEq, Eq)]
struct RunSummary {
    lines: u64,
    advised: u64,
    skipped: u64,
}

/// Parse one input line. Blank lines yield `Ok(None)`.
fn advise_line(
    controller: &BackpressureController,
    line: &str,
) -> Result<Option<AdmissionAdvice>, serde_json::Error> {
    if line.trim().is_empty() {
        return Ok(None);
    }
    let metrics: ConcurrencyMetrics = serde_json::from_str(line)?;
    Ok(Some(controller.evaluate(&metrics)))
}

/// Answer every metrics line from `input` with an advice line on `output`.
async fn run<R, W>(
    controller: &BackpressureController,
    input: R,
    output: &mut W,
) -> anyhow::Result<RunSummary>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut summary = RunSummary::default();
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        summary.lines += 1;
        let advice = match advise_line(controller, &line) {
            Ok(Some(advice)) => advice,
            Ok(None) => continue,
            Err(e) => {
                warn!(line = summary.lines, error = %e, "skipping unparseable metrics line");
                summary.skipped += 1;
                continue;
            }
        };
        let mut out = serde_json::to_vec(&advice)?;
        out.push(b'\n');
        output.write_all(&out).await?;
        output.flush().await?;
        summary.advised += 1;
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_core::ConcurrencyConfig;

    fn controller() -> BackpressureController {
        BackpressureController::new(ConcurrencyConfig {
            max_queue_size: 100,
            backpressure_threshold: 0.8,
            min_workers: 2,
            max_workers: 10,
            ..ConcurrencyConfig::default()
        })
    }

    #[test]
    fn blank_line_yields_nothing() {
        assert!(advise_line(&controller(), "   ").unwrap().is_none());
    }

    #[test]
    fn malformed_line_is_an_error() {
        assert!(advise_line(&controller(), "{not json").is_err());
    }

    #[tokio::test]
    async fn bad_line_is_skipped_and_next_line_answered() {
        let input: &[u8] = b"{not json\n\n{\"queueDepth\":90,\"activeWorkers\":10,\"idleWorkers\":0}\n";
        let mut output = Vec::new();

        let summary = run(&controller(), input, &mut output).await.unwrap();
        assert_eq!(
            summary,
            RunSummary {
                lines: 3,
                advised: 1,
                skipped: 1,
            }
        );

        let text = String::from_utf8(output).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 1);
        let advice: AdmissionAdvice = serde_json::from_str(lines[0]).unwrap();
        assert!(advice.reject);
        assert_eq!(advice.suggested_workers, 9);
    }
}
