// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Call tree produced by a tracing session.

use std::borrow::Cow;
use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;

/// One recorded call.
///
/// Offsets are microseconds since the session started. `end_us` is `None`
/// for a call that was still running when the tree was captured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallFrame {
    pub function: Cow<'static, str>,
    pub file: Cow<'static, str>,
    pub line: u32,
    pub start_us: u64,
    pub end_us: Option<u64>,
    pub is_home: bool,
    pub depth: usize,
    /// Child calls in call order
    pub children: Vec<CallFrame>,
}

impl CallFrame {
    /// Wall time of a finished call.
    pub fn duration(&self) -> Option<Duration> {
        self.end_us
            .map(|end| Duration::from_micros(end.saturating_sub(self.start_us)))
    }

    /// True once the call has returned.
    pub fn is_closed(&self) -> bool {
        self.end_us.is_some()
    }

    fn visit<'a>(&'a self, f: &mut impl FnMut(&'a CallFrame)) {
        f(self);
        for child in &self.children {
            child.visit(f);
        }
    }
}

/// Aggregate statistics of a call tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TreeStats {
    /// Wall time of the root frame (or up to the capture instant for a snapshot)
    pub total_wall_time: Duration,
    pub frame_count: usize,
    pub max_depth: usize,
    /// Function names on the path from the root to the deepest frame
    pub deepest_branch: Vec<String>,
    /// Function names on the path that follows the slowest child at each level
    pub longest_branch: Vec<String>,
}

/// Calls of one function, aggregated over a tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallSummary {
    pub function: String,
    pub call_count: usize,
    pub total_time: Duration,
    pub file: String,
    pub is_home: bool,
}

/// Immutable result of a tracing session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallTree {
    /// Frame of the wrapped handler
    pub root: CallFrame,
    pub stats: TreeStats,
    /// Calls skipped because the frame cap was reached
    pub dropped_frames: u64,
    /// False for a snapshot taken while the handler was still running
    pub complete: bool,
}

impl CallTree {
    pub(crate) fn new(root: CallFrame, captured_at_us: u64, dropped_frames: u64, complete: bool) -> Self {
        let stats = compute_stats(&root, captured_at_us);
        Self {
            root,
            stats,
            dropped_frames,
            complete,
        }
    }

    /// Check the structural invariants of the tree.
    ///
    /// Every closed frame ends at or after its start, children lie inside
    /// their parent's interval, children follow each other in call order and
    /// depths grow by one per level.
    pub fn is_well_formed(&self) -> bool {
        fn check(frame: &CallFrame, parent_end: Option<u64>) -> bool {
            if let Some(end) = frame.end_us {
                if end < frame.start_us {
                    return false;
                }
                if let Some(parent_end) = parent_end {
                    if end > parent_end {
                        return false;
                    }
                }
            } else if parent_end.is_some() {
                // an open frame cannot live under a closed parent
                return false;
            }

            let mut previous_start = frame.start_us;
            for child in &frame.children {
                if child.start_us < previous_start || child.depth != frame.depth + 1 {
                    return false;
                }
                previous_start = child.start_us;
                if !check(child, frame.end_us) {
                    return false;
                }
            }
            true
        }

        self.root.depth == 0 && check(&self.root, None)
    }

    /// Iterate over every frame, root first, depth-first in call order.
    pub fn frames(&self) -> Vec<&CallFrame> {
        let mut out = Vec::with_capacity(self.stats.frame_count);
        self.root.visit(&mut |f| out.push(f));
        out
    }

    /// Aggregate finished calls below the root by function name, slowest first.
    pub fn summaries(&self) -> Vec<CallSummary> {
        let mut by_name: HashMap<&str, CallSummary> = HashMap::new();
        for child in &self.root.children {
            child.visit(&mut |frame| {
                let Some(duration) = frame.duration() else {
                    return;
                };
                by_name
                    .entry(frame.function.as_ref())
                    .and_modify(|s| {
                        s.call_count += 1;
                        s.total_time += duration;
                    })
                    .or_insert_with(|| CallSummary {
                        function: frame.function.to_string(),
                        call_count: 1,
                        total_time: duration,
                        file: frame.file.to_string(),
                        is_home: frame.is_home,
                    });
            });
        }

        let mut summaries: Vec<CallSummary> = by_name.into_values().collect();
        summaries.sort_by(|a, b| {
            b.total_time
                .cmp(&a.total_time)
                .then_with(|| a.function.cmp(&b.function))
        });
        summaries
    }

    /// Render the slowest `limit` functions as a markdown list.
    pub fn format_top_calls(&self, limit: usize) -> String {
        format_summaries(&self.summaries(), limit)
    }
}

/// Render call summaries as a markdown list. Home frames get a `:zap:` mark.
pub fn format_summaries(summaries: &[CallSummary], limit: usize) -> String {
    if summaries.is_empty() {
        return "_No function calls were traced_".to_string();
    }

    let mut out = format!(
        "🕵️ *Top {} most time-consuming function call{}:*",
        limit,
        if limit != 1 { "s" } else { "" }
    );
    for (idx, summary) in summaries.iter().take(limit).enumerate() {
        out.push_str(&format!(
            "\n{}. `{}`: *{:.3}s*, called {} time{} (`{}`){}",
            idx + 1,
            summary.function,
            summary.total_time.as_secs_f64(),
            summary.call_count,
            if summary.call_count != 1 { "s" } else { "" },
            summary.file,
            if summary.is_home { " :zap:" } else { "" },
        ));
    }
    out
}

fn compute_stats(root: &CallFrame, captured_at_us: u64) -> TreeStats {
    let mut frame_count = 0;
    root.visit(&mut |_| frame_count += 1);

    let deepest_branch = deepest_path(root);
    let longest_branch = longest_path(root, captured_at_us);
    let end = root.end_us.unwrap_or(captured_at_us);

    TreeStats {
        total_wall_time: Duration::from_micros(end.saturating_sub(root.start_us)),
        frame_count,
        max_depth: deepest_branch.len().saturating_sub(1),
        deepest_branch,
        longest_branch,
    }
}

fn deepest_path(frame: &CallFrame) -> Vec<String> {
    let mut best: Vec<String> = Vec::new();
    for child in &frame.children {
        let path = deepest_path(child);
        if path.len() > best.len() {
            best = path;
        }
    }
    let mut path = Vec::with_capacity(best.len() + 1);
    path.push(frame.function.to_string());
    path.extend(best);
    path
}

fn longest_path(root: &CallFrame, captured_at_us: u64) -> Vec<String> {
    let span = |f: &CallFrame| f.end_us.unwrap_or(captured_at_us).saturating_sub(f.start_us);

    let mut path = vec![root.function.to_string()];
    let mut current = root;
    // first child wins ties
    while let Some(next) = current
        .children
        .iter()
        .reduce(|best, c| if span(c) > span(best) { c } else { best })
    {
        path.push(next.function.to_string());
        current = next;
    }
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(name: &'static str, start: u64, end: Option<u64>, depth: usize, children: Vec<CallFrame>) -> CallFrame {
        CallFrame {
            function: Cow::Borrowed(name),
            file: Cow::Borrowed("src/app.rs"),
            line: 1,
            start_us: start,
            end_us: end,
            is_home: name.starts_with("home"),
            depth,
            children,
        }
    }

    fn sample_tree() -> CallTree {
        let root = frame(
            "handler",
            0,
            Some(1_000_000),
            0,
            vec![
                frame("home_load", 0, Some(100_000), 1, vec![frame("parse", 10, Some(50_000), 2, vec![])]),
                frame("fetch", 100_000, Some(700_000), 1, vec![]),
                frame("home_load", 700_000, Some(800_000), 1, vec![]),
            ],
        );
        CallTree::new(root, 1_000_000, 0, true)
    }

    #[test]
    fn test_stats() {
        let tree = sample_tree();
        assert_eq!(tree.stats.frame_count, 5);
        assert_eq!(tree.stats.max_depth, 2);
        assert_eq!(tree.stats.total_wall_time, Duration::from_secs(1));
        assert_eq!(tree.stats.deepest_branch, vec!["handler", "home_load", "parse"]);
        assert_eq!(tree.stats.longest_branch, vec!["handler", "fetch"]);
        assert!(tree.is_well_formed());
    }

    #[test]
    fn test_summaries_aggregate_by_function() {
        let summaries = sample_tree().summaries();
        assert_eq!(summaries.len(), 3);
        assert_eq!(summaries[0].function, "fetch");
        assert_eq!(summaries[1].function, "home_load");
        assert_eq!(summaries[1].call_count, 2);
        assert_eq!(summaries[1].total_time, Duration::from_millis(200));
        assert!(summaries[1].is_home);
    }

    #[test]
    fn test_format_top_calls() {
        let text = sample_tree().format_top_calls(2);
        assert!(text.starts_with("🕵️ *Top 2 most time-consuming function calls:*"));
        assert!(text.contains("1. `fetch`: *0.600s*, called 1 time (`src/app.rs`)"));
        assert!(text.contains("2. `home_load`: *0.200s*, called 2 times (`src/app.rs`) :zap:"));
        assert!(!text.contains("parse"));
    }

    #[test]
    fn test_format_empty() {
        let root = frame("handler", 0, Some(5), 0, vec![]);
        let tree = CallTree::new(root, 5, 0, true);
        assert_eq!(tree.format_top_calls(15), "_No function calls were traced_");
    }

    #[test]
    fn test_ill_formed_child_outlives_parent() {
        let root = frame("handler", 0, Some(10), 0, vec![frame("late", 5, Some(20), 1, vec![])]);
        let tree = CallTree::new(root, 20, 0, true);
        assert!(!tree.is_well_formed());
    }

    #[test]
    fn test_snapshot_with_open_frames() {
        let root = frame("handler", 0, None, 0, vec![frame("slow", 10, None, 1, vec![])]);
        let tree = CallTree::new(root, 4_000, 0, false);
        assert!(tree.is_well_formed());
        assert_eq!(tree.stats.total_wall_time, Duration::from_millis(4));
        assert!(tree.summaries().is_empty());
    }
}
