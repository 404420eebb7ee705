//! Memory flush controller (spec §4.6).
//!
//! Scans a configured threshold ladder each turn and decides whether the
//! caller's LLM glue should be nudged to write durable notes to `memory/`
//! before compaction erases them.

use crate::config::{FlushConfig, FlushThreshold, InjectAs};
use crate::records::Message;
use chrono::Utc;
use std::collections::BTreeSet;

pub struct FlushDirective<'a> {
    pub percent: u32,
    pub prompt: String,
    pub inject_as: &'a InjectAs,
}

pub struct MemoryFlushController {
    config: FlushConfig,
}

impl MemoryFlushController {
    pub fn new(config: FlushConfig) -> Self {
        Self { config }
    }

    /// Picks the highest configured threshold at or below `usage` that
    /// hasn't already fired this cycle (spec §4.6 "Scan thresholds in
    /// descending order").
    pub fn evaluate(&self, usage: f64, flushed_thresholds: &BTreeSet<u32>) -> Option<FlushDirective<'_>> {
        let mut candidates: Vec<&FlushThreshold> = self.config.thresholds.iter().collect();
        candidates.sort_by(|a, b| b.percent.cmp(&a.percent));

        for threshold in candidates {
            let usage_percent = (usage * 100.0) as u32;
            if usage_percent < threshold.percent {
                continue;
            }
            if threshold.once_per_cycle && flushed_thresholds.contains(&threshold.percent) {
                continue;
            }
            return Some(FlushDirective {
                percent: threshold.percent,
                prompt: substitute_date(&threshold.prompt),
                inject_as: &threshold.inject_as,
            });
        }
        None
    }

    /// `usage < reset_usage` clears the flushed-threshold set for a new
    /// cycle; compaction does the same via `LiveSession::reset_flush_cycle`.
    pub fn should_reset(&self, usage: f64) -> bool {
        usage < self.config.reset_usage
    }

    /// A tool call counts as "actioning" a flush when it writes or edits a
    /// path under `memory/` (spec §4.6).
    pub fn is_flush_action(tool_name: &str, tool_input: Option<&serde_json::Value>) -> bool {
        if tool_name != "write" && tool_name != "edit" {
            return false;
        }
        tool_input
            .and_then(|v| v.get("path"))
            .and_then(|p| p.as_str())
            .map(|p| p.starts_with("memory/"))
            .unwrap_or(false)
    }

    pub fn observe_tool_call(msg: &Message) -> bool {
        msg.tool_name
            .as_deref()
            .map(|name| Self::is_flush_action(name, msg.tool_input.as_ref()))
            .unwrap_or(false)
    }
}

fn substitute_date(prompt: &str) -> String {
    prompt.replace("YYYY-MM-DD", &Utc::now().format("%Y-%m-%d").to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FlushThreshold;

    fn config() -> FlushConfig {
        FlushConfig {
            thresholds: vec![
                FlushThreshold {
                    percent: 50,
                    prompt: "50% as of YYYY-MM-DD".into(),
                    inject_as: InjectAs::System,
                    once_per_cycle: true,
                },
                FlushThreshold {
                    percent: 75,
                    prompt: "75% as of YYYY-MM-DD".into(),
                    inject_as: InjectAs::System,
                    once_per_cycle: true,
                },
                FlushThreshold {
                    percent: 90,
                    prompt: "90% as of YYYY-MM-DD".into(),
                    inject_as: InjectAs::User,
                    once_per_cycle: true,
                },
            ],
            reset_usage: 0.25,
        }
    }

    #[test]
    fn picks_highest_eligible_threshold_not_yet_fired() {
        let controller = MemoryFlushController::new(config());
        let flushed = BTreeSet::new();
        let directive = controller.evaluate(0.80, &flushed).unwrap();
        assert_eq!(directive.percent, 75);
    }

    #[test]
    fn skips_thresholds_already_flushed_this_cycle() {
        let controller = MemoryFlushController::new(config());
        let mut flushed = BTreeSet::new();
        flushed.insert(75);
        let directive = controller.evaluate(0.80, &flushed).unwrap();
        assert_eq!(directive.percent, 50);
    }

    #[test]
    fn below_lowest_threshold_fires_nothing() {
        let controller = MemoryFlushController::new(config());
        let flushed = BTreeSet::new();
        assert!(controller.evaluate(0.10, &flushed).is_none());
    }

    #[test]
    fn reset_rule_below_quarter_usage() {
        let controller = MemoryFlushController::new(config());
        assert!(controller.should_reset(0.10));
        assert!(!controller.should_reset(0.30));
    }

    #[test]
    fn date_placeholder_is_substituted() {
        let controller = MemoryFlushController::new(config());
        let mut flushed = BTreeSet::new();
        flushed.insert(75);
        flushed.insert(90);
        let directive = controller.evaluate(0.95, &flushed).unwrap();
        assert!(!directive.prompt.contains("YYYY-MM-DD"));
    }

    #[test]
    fn memory_write_tool_call_is_flush_action() {
        assert!(MemoryFlushController::is_flush_action(
            "write",
            Some(&serde_json::json!({"path": "memory/notes.md"}))
        ));
        assert!(!MemoryFlushController::is_flush_action(
            "write",
            Some(&serde_json::json!({"path": "src/lib.rs"}))
        ));
        assert!(!MemoryFlushController::is_flush_action(
            "read",
            Some(&serde_json::json!({"path": "memory/notes.md"}))
        ));
    }
}
