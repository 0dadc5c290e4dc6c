// SPDX-License-Identifier: MIT

//! Plain-text rendering of protocol replies.

use gantry_core::SimpleStatus;
use gantry_daemon::protocol::{ServerStatus, TargetFlatState, TargetSummary};

/// Compact duration for the age and uptime columns: `"45s"`, `"12m"`,
/// `"2h"`, `"1h30m"`, `"3d"`. Minutes appear in the hours range only when
/// non-zero.
fn brief(secs: u64) -> String {
    const MINUTE: u64 = 60;
    const HOUR: u64 = 60 * MINUTE;
    const DAY: u64 = 24 * HOUR;
    match secs {
        s if s < MINUTE => format!("{s}s"),
        s if s < HOUR => format!("{}m", s / MINUTE),
        s if s < DAY => {
            let h = s / HOUR;
            let m = (s % HOUR) / MINUTE;
            if m == 0 {
                format!("{h}h")
            } else {
                format!("{h}h{m}m")
            }
        }
        s => format!("{}d", s / DAY),
    }
}

fn brief_ms(ms: u64) -> String {
    brief(ms / 1000)
}

/// One line per target: id, state, age since last change, name, error.
pub fn render_summaries(summaries: &[TargetSummary], now_ms: u64) -> String {
    let mut out = String::new();
    for s in summaries {
        let age = now_ms.saturating_sub(s.status_changed_at_ms);
        out.push_str(&format!(
            "{:<28} {:<12} {:>6}  {}{}\n",
            s.id,
            status_glyph(s.simple),
            brief_ms(age),
            s.name,
            s.error
                .as_deref()
                .map(|e| format!("  [{}]", e))
                .unwrap_or_default(),
        ));
    }
    out
}

fn status_glyph(simple: SimpleStatus) -> String {
    match simple {
        SimpleStatus::Activable => "activable".to_string(),
        SimpleStatus::InProgress => "in-progress".to_string(),
        SimpleStatus::Successful => "successful".to_string(),
        SimpleStatus::Failed => "FAILED".to_string(),
    }
}

/// The full state history, one entry per line.
pub fn render_flat_state(flat: &TargetFlatState) -> String {
    let mut out = format!("{}\n", flat.id);
    for entry in &flat.entries {
        out.push_str(&format!(
            "  {:>13}  {:<28} {}{}{}\n",
            entry.at_ms,
            entry.state.to_string(),
            entry.cause,
            if entry.attempts > 0 {
                format!("  attempts={}", entry.attempts)
            } else {
                String::new()
            },
            entry
                .error
                .as_deref()
                .map(|e| format!("  error={}", e))
                .unwrap_or_default(),
        ));
    }
    out
}

pub fn render_status(status: &ServerStatus) -> String {
    format!(
        "gantryd {}\n  time:        {}\n  uptime:      {}\n  read-only:   {}\n  tls:         {:?}\n  database:    {}\n  targets:     {} total, {} alive, {} active\n  engine:      {} batches, {} steps\n  deferred:    {}\n",
        status.version,
        status.time,
        brief(status.uptime_s),
        status.read_only,
        status.tls,
        status.database,
        status.store.total,
        status.store.alive,
        status.store.active,
        status.engine.batches,
        status.engine.steps,
        status.deferred_queries,
    )
}

#[cfg(test)]
#[path = "output_tests.rs"]
mod tests;
