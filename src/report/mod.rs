//! Batch reporting.
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`ResultAggregator`] | Turns a [`BatchResult`] into a renderer-agnostic [`Report`] |
//! | [`FailureCategory`] | Closed set of user-facing failure categories |
//! | [`classify_error`] | Keyword heuristics from raw message to category |
//!
//! A [`Report`] is an ordered list of typed lines, so the same result can be
//! rendered tersely for a chat reply or verbosely for logs without recomputing.

mod category;

pub use category::{classify_error, failure_summary, FailureCategory};

use crate::batch::{BatchResult, ProcessingOutcome};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderStyle {
    /// Headline, counts, footer and suggestions.
    Terse,
    #[default]
    Verbose,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    pub style: RenderStyle,
    /// Send a short "received, waiting" message for every accepted item.
    pub progress_feedback: bool,
    /// Below this success rate generic photo advice is added.
    pub low_success_threshold: f64,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            style: RenderStyle::Verbose,
            progress_feedback: true,
            low_success_threshold: 0.5,
        }
    }
}

impl ReportConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_style(mut self, style: RenderStyle) -> Self {
        self.style = style;
        self
    }

    pub fn with_progress_feedback(mut self, enabled: bool) -> Self {
        self.progress_feedback = enabled;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LineKind {
    Headline,
    Counts,
    Success,
    Failure,
    Skipped,
    Footer,
    Suggestion,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportLine {
    pub kind: LineKind,
    /// 1-based item position for per-item lines.
    pub position: Option<usize>,
    pub text: String,
}

impl ReportLine {
    fn new(kind: LineKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            position: None,
            text: text.into(),
        }
    }

    fn at(kind: LineKind, position: usize, text: impl Into<String>) -> Self {
        Self {
            kind,
            position: Some(position),
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportStats {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub success_rate: f64,
    pub stored: usize,
    #[serde(with = "crate::config::duration_ms")]
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub submitter: String,
    pub stats: ReportStats,
    pub failures_by_category: BTreeMap<FailureCategory, usize>,
    pub lines: Vec<ReportLine>,
}

impl Report {
    pub fn render(&self, style: RenderStyle) -> String {
        let mut out: Vec<&str> = Vec::with_capacity(self.lines.len() + 2);
        let mut in_suggestions = false;
        for line in &self.lines {
            let keep = match style {
                RenderStyle::Verbose => true,
                RenderStyle::Terse => matches!(
                    line.kind,
                    LineKind::Headline | LineKind::Counts | LineKind::Footer | LineKind::Suggestion
                ),
            };
            if !keep {
                continue;
            }
            if line.kind == LineKind::Suggestion && !in_suggestions {
                in_suggestions = true;
                out.push("");
                out.push("💡 Suggestions:");
            }
            out.push(&line.text);
        }
        out.join("\n")
    }

    pub fn lines_of(&self, kind: LineKind) -> impl Iterator<Item = &ReportLine> {
        self.lines.iter().filter(move |l| l.kind == kind)
    }
}

/// Builds reports and progress messages.
#[derive(Debug, Clone, Default)]
pub struct ResultAggregator {
    config: ReportConfig,
}

impl ResultAggregator {
    pub fn new(config: ReportConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ReportConfig {
        &self.config
    }

    pub fn summarize(&self, result: &BatchResult) -> Report {
        let stats = ReportStats {
            total: result.total(),
            succeeded: result.success_count(),
            failed: result.failure_count(),
            skipped: result.skipped_count(),
            success_rate: result.success_rate(),
            stored: result.successes().filter(|o| o.location().is_some()).count(),
            elapsed: result.elapsed(),
        };

        let mut failures_by_category = BTreeMap::new();
        for (category, _) in result.failures().filter_map(|o| o.failure()) {
            *failures_by_category.entry(category).or_insert(0) += 1;
        }

        let mut lines = Vec::with_capacity(result.total() + 8);
        let headline = if stats.total > 0 && stats.succeeded == stats.total {
            "✅ Batch complete!"
        } else if stats.succeeded > 0 {
            "⚠️ Batch complete (partial success)"
        } else {
            "❌ Batch failed"
        };
        lines.push(ReportLine::new(LineKind::Headline, headline));
        lines.push(ReportLine::new(
            LineKind::Counts,
            format!("📊 Results ({}/{} succeeded)", stats.succeeded, stats.total),
        ));

        for o in result.successes() {
            lines.push(ReportLine::at(LineKind::Success, o.index() + 1, success_text(o)));
        }
        for o in result.failures() {
            let (category, message) = o.failure().unwrap_or((FailureCategory::Unknown, ""));
            lines.push(ReportLine::at(
                LineKind::Failure,
                o.index() + 1,
                format!("⚠️ #{} - {}", o.index() + 1, failure_summary(category, message)),
            ));
        }
        for o in result.skips() {
            let reason = o.skip_reason().filter(|r| !r.is_empty()).unwrap_or("poor quality");
            lines.push(ReportLine::at(
                LineKind::Skipped,
                o.index() + 1,
                format!("⏭️ #{} - skipped ({})", o.index() + 1, reason),
            ));
        }

        if stats.stored > 0 {
            lines.push(ReportLine::new(
                LineKind::Footer,
                format!("💾 {} record(s) stored", stats.stored),
            ));
        }
        if !stats.elapsed.is_zero() {
            lines.push(ReportLine::new(
                LineKind::Footer,
                format!("⏱️ Total time: {:.1}s", stats.elapsed.as_secs_f64()),
            ));
        }
        if stats.total > 0 {
            lines.push(ReportLine::new(
                LineKind::Footer,
                format!("🎯 Success rate: {:.0}%", stats.success_rate * 100.0),
            ));
        }

        if stats.failed > 0 || stats.skipped > 0 {
            for text in self.suggestions(&failures_by_category, stats.success_rate) {
                lines.push(ReportLine::new(LineKind::Suggestion, format!("• {text}")));
            }
        }

        Report {
            submitter: result.submitter().to_string(),
            stats,
            failures_by_category,
            lines,
        }
    }

    /// Summarize and render with the configured style.
    pub fn format(&self, result: &BatchResult) -> String {
        self.summarize(result).render(self.config.style)
    }

    /// Acknowledgement sent while a batch is still collecting.
    pub fn progress_message(&self, count: usize) -> String {
        if count == 1 {
            "📥 Received 1 photo, waiting for more...".to_string()
        } else {
            format!("📥 Received {count} photos, waiting for more...")
        }
    }

    fn suggestions(
        &self,
        failures: &BTreeMap<FailureCategory, usize>,
        success_rate: f64,
    ) -> Vec<&'static str> {
        let mut out: Vec<&'static str> = failures.keys().filter_map(|c| c.suggestion()).collect();
        if success_rate < self.config.low_success_threshold {
            out.push("Make sure each photo shows one business card, clearly visible");
            out.push("Keep photos under 5 MB at a moderate resolution");
        }
        if out.is_empty() {
            out.push("If the problem persists, please contact support");
        }
        out
    }
}

fn success_text(o: &ProcessingOutcome) -> String {
    let Some(record) = o.record() else {
        return format!("✅ #{}", o.index() + 1);
    };
    let name = record.name.as_deref().unwrap_or("Unknown");
    let company = record.company.as_deref().unwrap_or("Unknown company");
    let mut text = match record.title.as_deref().filter(|t| !t.is_empty()) {
        Some(title) => format!("✅ {name} - {company} ({title})"),
        None => format!("✅ {name} - {company}"),
    };
    if let Some(conf) = record.confidence {
        text.push(' ');
        text.push_str(confidence_marker(conf));
    }
    if let Some(location) = o.location() {
        text.push_str(&format!(" [{location}]"));
    }
    text
}

fn confidence_marker(confidence: f32) -> &'static str {
    if confidence >= 0.9 {
        "🎯"
    } else if confidence >= 0.8 {
        "✨"
    } else if confidence >= 0.7 {
        "⭐"
    } else {
        "❓"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::ExtractedRecord;
    use crate::tier::TierUsed;
    use std::time::SystemTime;
    use uuid::Uuid;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn mixed() -> BatchResult {
        let id = Uuid::new_v4();
        BatchResult::from_outcomes(
            "u1",
            vec![
                ProcessingOutcome::success(
                    0,
                    id,
                    ExtractedRecord::new()
                        .with_name("Ada Lovelace")
                        .with_company("Analytical Engines")
                        .with_title("CTO")
                        .with_confidence(0.93),
                    "memory://records/1",
                    TierUsed::Primary,
                    ms(800),
                ),
                ProcessingOutcome::failed(1, id, FailureCategory::Timeout, "timeout", TierUsed::None, ms(2000)),
                ProcessingOutcome::failed(2, id, FailureCategory::Quality, "image too blurry", TierUsed::Fallback, ms(900)),
                ProcessingOutcome::skipped(3, id, "not a business card", TierUsed::Primary, ms(300)),
            ],
            SystemTime::now(),
            ms(2500),
        )
    }

    #[test]
    fn test_summarize_stats_add_up() {
        let report = ResultAggregator::default().summarize(&mixed());
        let s = &report.stats;
        assert_eq!(s.succeeded + s.failed + s.skipped, s.total);
        assert_eq!(s.stored, 1);
        assert_eq!(report.failures_by_category.get(&FailureCategory::Timeout), Some(&1));
        assert_eq!(report.failures_by_category.get(&FailureCategory::Quality), Some(&1));
    }

    #[test]
    fn test_lines_are_ordered_and_complete() {
        let report = ResultAggregator::default().summarize(&mixed());
        let kinds: Vec<LineKind> = report.lines.iter().map(|l| l.kind).collect();
        assert_eq!(kinds[0], LineKind::Headline);
        assert_eq!(kinds[1], LineKind::Counts);
        assert_eq!(report.lines_of(LineKind::Success).count(), 1);
        assert_eq!(report.lines_of(LineKind::Failure).count(), 2);
        assert_eq!(report.lines_of(LineKind::Skipped).count(), 1);

        let success = report.lines_of(LineKind::Success).next().unwrap();
        assert_eq!(
            success.text,
            "✅ Ada Lovelace - Analytical Engines (CTO) 🎯 [memory://records/1]"
        );
        let failures: Vec<&str> = report.lines_of(LineKind::Failure).map(|l| l.text.as_str()).collect();
        assert_eq!(failures, vec!["⚠️ #2 - processing timed out", "⚠️ #3 - photo too blurry"]);
    }

    #[test]
    fn test_suggestions_per_category_and_low_rate() {
        let report = ResultAggregator::default().summarize(&mixed());
        let suggestions: Vec<&str> = report
            .lines_of(LineKind::Suggestion)
            .map(|l| l.text.as_str())
            .collect();
        assert!(suggestions.iter().any(|s| s.contains("good light")));
        assert!(suggestions.iter().any(|s| s.contains("few minutes")));
        // 1 of 4 succeeded: generic advice applies
        assert!(suggestions.iter().any(|s| s.contains("under 5 MB")));
        assert!(!suggestions.iter().any(|s| s.contains("contact support")));
    }

    #[test]
    fn test_unknown_only_falls_back_to_support() {
        let id = Uuid::new_v4();
        let result = BatchResult::from_outcomes(
            "u1",
            vec![
                ProcessingOutcome::success(0, id, ExtractedRecord::new(), "loc", TierUsed::Primary, ms(1)),
                ProcessingOutcome::success(1, id, ExtractedRecord::new(), "loc", TierUsed::Primary, ms(1)),
                ProcessingOutcome::failed(2, id, FailureCategory::Unknown, "???", TierUsed::Primary, ms(1)),
            ],
            SystemTime::now(),
            ms(3),
        );
        let report = ResultAggregator::default().summarize(&result);
        let suggestions: Vec<&str> = report
            .lines_of(LineKind::Suggestion)
            .map(|l| l.text.as_str())
            .collect();
        assert_eq!(suggestions, vec!["• If the problem persists, please contact support"]);
    }

    #[test]
    fn test_all_failed_still_reports_every_item() {
        let id = Uuid::new_v4();
        let result = BatchResult::from_outcomes(
            "u1",
            (0..3)
                .map(|i| ProcessingOutcome::failed(i, id, FailureCategory::Network, "connection refused", TierUsed::Fallback, ms(5)))
                .collect(),
            SystemTime::now(),
            ms(15),
        );
        let report = ResultAggregator::default().summarize(&result);
        assert_eq!(report.lines[0].text, "❌ Batch failed");
        assert_eq!(report.lines_of(LineKind::Failure).count(), 3);
        assert!(report.render(RenderStyle::Verbose).contains("Success rate: 0%"));
    }

    #[test]
    fn test_terse_render_omits_item_lines() {
        let report = ResultAggregator::default().summarize(&mixed());
        let terse = report.render(RenderStyle::Terse);
        let verbose = report.render(RenderStyle::Verbose);
        assert!(!terse.contains("Ada Lovelace"));
        assert!(verbose.contains("Ada Lovelace"));
        assert!(terse.contains("📊 Results (1/4 succeeded)"));
        assert!(terse.contains("💡 Suggestions:"));
    }

    #[test]
    fn test_progress_message() {
        let agg = ResultAggregator::default();
        assert_eq!(agg.progress_message(1), "📥 Received 1 photo, waiting for more...");
        assert!(agg.progress_message(3).contains("3 photos"));
    }
}
