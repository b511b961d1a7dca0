//! Clients for a running `lumen run`.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use eventsource_stream::Eventsource;
use futures_util::StreamExt;

use lumen_runtime::HealthReport;

fn client(timeout: Option<Duration>) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().connect_timeout(Duration::from_secs(3));
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    builder.build().context("failed to build http client")
}

fn endpoint(base: &str, path: &str) -> String {
    format!("{}{path}", base.trim_end_matches('/'))
}

pub async fn fetch_health(base: &str) -> Result<HealthReport> {
    let url = endpoint(base, "/health");
    client(Some(Duration::from_secs(5)))?
        .get(&url)
        .send()
        .await
        .with_context(|| format!("cannot reach {url}"))?
        .error_for_status()?
        .json()
        .await
        .context("malformed health report")
}

pub async fn post_state(base: &str, body: serde_json::Value) -> Result<u64> {
    let url = endpoint(base, "/state");
    let reply: serde_json::Value = client(Some(Duration::from_secs(5)))?
        .post(&url)
        .json(&body)
        .send()
        .await
        .with_context(|| format!("cannot reach {url}"))?
        .error_for_status()?
        .json()
        .await?;
    reply["written"]
        .as_u64()
        .ok_or_else(|| anyhow!("unexpected reply from {url}: {reply}"))
}

/// One line per health event: rate, mode, engine and stage times.
pub fn summary_line(report: &HealthReport) -> String {
    format!(
        "{:>8} frames  {:5.1}/{:4.1} fps  mode={:<11} blend={:.2}  engine={:<11} total={:.2}ms infer={:.2}ms  dropped={} errors={} overruns={}",
        report.frames,
        report.fps,
        report.target_fps,
        report.mode.name(),
        report.blend_progress,
        report.engine_state.as_str(),
        report.stage_ms.total,
        report.stage_ms.inference,
        report.dropped,
        report.errors,
        report.overruns,
    )
}

/// Follow `/metrics/stream`, printing each report. Stops after `count`
/// events when given, otherwise when the server goes away.
pub async fn watch(base: &str, count: Option<usize>) -> Result<()> {
    let url = endpoint(base, "/metrics/stream");
    let response = client(None)?
        .get(&url)
        .send()
        .await
        .with_context(|| format!("cannot reach {url}"))?
        .error_for_status()?;

    let mut events = response.bytes_stream().eventsource();
    let mut seen = 0usize;
    while let Some(event) = events.next().await {
        let event = event.map_err(|e| anyhow!("metrics stream failed: {e}"))?;
        if event.event != "health" {
            continue;
        }
        let report: HealthReport = serde_json::from_str(&event.data).context("malformed health event")?;
        println!("{}", summary_line(&report));
        seen += 1;
        if count.is_some_and(|n| seen >= n) {
            break;
        }
    }
    Ok(())
}
