//! Fuzzy edit-target location
//!
//! Finds where a requested "old text" lives in a file even when it does not
//! match byte-for-byte. Exact matches win outright. Otherwise candidate
//! regions are found by anchoring on the target's first and last non-blank
//! lines and scored with normalized Levenshtein similarity. Every mode is
//! capped at [`MAX_EVALUATIONS`] examined candidates so huge files stay cheap.
//!
//! A `None` result means there is no safe edit location; callers must fail
//! rather than guess.

use thiserror::Error;

pub const DEFAULT_MIN_SIMILARITY: f64 = 0.85;
pub const DEFAULT_MIN_SIMILARITY_WITH_HINT: f64 = 0.80;

/// Upper bound on candidate pairs examined per call, pruned ones included.
pub const MAX_EVALUATIONS: usize = 500;

/// Above this size only the head and tail of the file are searched for anchors.
pub const LARGE_CONTENT_BYTES: usize = 5 * 1024 * 1024;
const LARGE_WINDOW_BYTES: usize = 512 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FuzzyError {
    #[error("Search text is empty; the edit target is ambiguous")]
    EmptyTarget,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FuzzyMatch {
    /// Byte offset of the first matched byte.
    pub start: usize,
    /// Byte offset one past the last matched byte.
    pub end: usize,
    /// 1-based line numbers.
    pub start_line: usize,
    pub end_line: usize,
    pub similarity: f64,
    pub matched_text: String,
}

#[derive(Debug, Clone, Copy)]
pub struct MatchOptions {
    pub min_similarity: f64,
    pub min_similarity_with_hint: f64,
}

impl Default for MatchOptions {
    fn default() -> Self {
        Self {
            min_similarity: DEFAULT_MIN_SIMILARITY,
            min_similarity_with_hint: DEFAULT_MIN_SIMILARITY_WITH_HINT,
        }
    }
}

impl MatchOptions {
    fn threshold(&self, hint_line: Option<usize>) -> f64 {
        if hint_line.is_some() {
            self.min_similarity_with_hint
        } else {
            self.min_similarity
        }
    }
}

pub fn find_best_match(
    content: &str,
    old: &str,
    hint_line: Option<usize>,
) -> Result<Option<FuzzyMatch>, FuzzyError> {
    find_best_match_with(content, old, hint_line, &MatchOptions::default())
}

pub fn find_best_match_with(
    content: &str,
    old: &str,
    hint_line: Option<usize>,
    options: &MatchOptions,
) -> Result<Option<FuzzyMatch>, FuzzyError> {
    locate(content, old, hint_line, options).map(|outcome| outcome.found)
}

struct Outcome {
    found: Option<FuzzyMatch>,
    /// Candidate pairs examined, scored or pruned.
    evaluations: usize,
}

fn locate(
    content: &str,
    old: &str,
    hint_line: Option<usize>,
    options: &MatchOptions,
) -> Result<Outcome, FuzzyError> {
    if old.is_empty() {
        return Err(FuzzyError::EmptyTarget);
    }

    let lines = LineIndex::new(content);

    if let Some(found) = exact_match(content, old, hint_line, &lines) {
        return Ok(Outcome {
            found: Some(found),
            evaluations: 0,
        });
    }

    let target = Target::new(old);
    if target.is_blank() {
        // Whitespace-only targets are only ever matched exactly.
        return Ok(Outcome {
            found: None,
            evaluations: 0,
        });
    }

    let threshold = options.threshold(hint_line);
    let mut search = Search::new(content, &lines, &target, hint_line, threshold);
    search.anchor_pass();
    if search.best.is_none() {
        search.sliding_pass();
    }

    tracing::debug!(
        evaluations = search.evaluations,
        found = search.best.is_some(),
        "fuzzy search finished"
    );

    Ok(Outcome {
        found: search.best.map(|c| c.into_match(content, &lines)),
        evaluations: search.evaluations,
    })
}

fn exact_match(
    content: &str,
    old: &str,
    hint_line: Option<usize>,
    lines: &LineIndex,
) -> Option<FuzzyMatch> {
    let mut best: Option<(usize, usize)> = None;
    for (start, _) in content.match_indices(old) {
        let line = lines.line_of(start);
        let distance = hint_distance(hint_line, line);
        match best {
            Some((_, best_distance)) if best_distance <= distance => {}
            _ => best = Some((start, distance)),
        }
        // Without a hint the first hit wins.
        if hint_line.is_none() || distance == 0 {
            break;
        }
    }

    best.map(|(start, _)| {
        let end = start + old.len();
        FuzzyMatch {
            start,
            end,
            start_line: lines.line_of(start),
            end_line: lines.line_of(end.saturating_sub(1).max(start)),
            similarity: 1.0,
            matched_text: old.to_string(),
        }
    })
}

fn hint_distance(hint_line: Option<usize>, line: usize) -> usize {
    hint_line.map(|h| h.abs_diff(line)).unwrap_or(0)
}

/// Byte ranges of every line (without the trailing newline).
struct LineIndex {
    ranges: Vec<(usize, usize)>,
}

impl LineIndex {
    fn new(content: &str) -> Self {
        let mut ranges = Vec::new();
        let mut start = 0;
        for (i, b) in content.bytes().enumerate() {
            if b == b'\n' {
                let end = if i > start && content.as_bytes()[i - 1] == b'\r' {
                    i - 1
                } else {
                    i
                };
                ranges.push((start, end));
                start = i + 1;
            }
        }
        if start <= content.len() {
            ranges.push((start, content.len()));
        }
        Self { ranges }
    }

    fn len(&self) -> usize {
        self.ranges.len()
    }

    fn text<'a>(&self, content: &'a str, line: usize) -> &'a str {
        let (start, end) = self.ranges[line];
        &content[start..end]
    }

    /// 1-based line containing `offset`.
    fn line_of(&self, offset: usize) -> usize {
        match self.ranges.binary_search_by(|(start, _)| start.cmp(&offset)) {
            Ok(idx) => idx + 1,
            Err(idx) => idx.max(1),
        }
    }
}

/// The search text reduced to its non-blank core.
struct Target {
    /// Trimmed lines from the first to the last non-blank line.
    core: Vec<String>,
    /// `core` joined with newlines.
    chars: Vec<char>,
}

impl Target {
    fn new(old: &str) -> Self {
        let all: Vec<&str> = old.lines().collect();
        let first = all.iter().position(|l| !l.trim().is_empty());
        let last = all.iter().rposition(|l| !l.trim().is_empty());
        let core: Vec<String> = match (first, last) {
            (Some(f), Some(l)) => all[f..=l].iter().map(|l| l.trim().to_string()).collect(),
            _ => Vec::new(),
        };
        let chars = core.join("\n").chars().collect();
        Self { core, chars }
    }

    fn is_blank(&self) -> bool {
        self.core.is_empty()
    }

    fn line_count(&self) -> usize {
        self.core.len()
    }

    fn first_anchor(&self) -> &str {
        &self.core[0]
    }

    fn last_anchor(&self) -> &str {
        &self.core[self.core.len() - 1]
    }

    /// Extra lines tolerated between anchors on either side of the
    /// target's own span.
    fn slack(&self) -> usize {
        (self.line_count() / 4).max(2)
    }
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    first_line: usize,
    last_line: usize,
    similarity: f64,
    hint_distance: usize,
}

impl Candidate {
    fn beats(&self, other: &Candidate) -> bool {
        if (self.similarity - other.similarity).abs() > f64::EPSILON {
            return self.similarity > other.similarity;
        }
        if self.hint_distance != other.hint_distance {
            return self.hint_distance < other.hint_distance;
        }
        self.first_line < other.first_line
    }

    fn into_match(self, content: &str, lines: &LineIndex) -> FuzzyMatch {
        let start = lines.ranges[self.first_line].0;
        let end = lines.ranges[self.last_line].1;
        FuzzyMatch {
            start,
            end,
            start_line: self.first_line + 1,
            end_line: self.last_line + 1,
            similarity: self.similarity,
            matched_text: content[start..end].to_string(),
        }
    }
}

struct Search<'a> {
    content: &'a str,
    lines: &'a LineIndex,
    target: &'a Target,
    /// Every line of `content`, trimmed.
    trimmed: Vec<&'a str>,
    /// `prefix[i]` is the char count of trimmed lines `0..i`.
    prefix: Vec<usize>,
    hint_line: Option<usize>,
    threshold: f64,
    evaluations: usize,
    best: Option<Candidate>,
}

impl<'a> Search<'a> {
    fn new(
        content: &'a str,
        lines: &'a LineIndex,
        target: &'a Target,
        hint_line: Option<usize>,
        threshold: f64,
    ) -> Self {
        let trimmed: Vec<&str> = (0..lines.len())
            .map(|i| lines.text(content, i).trim())
            .collect();
        let mut prefix = Vec::with_capacity(trimmed.len() + 1);
        prefix.push(0);
        let mut total = 0;
        for line in &trimmed {
            total += line.chars().count();
            prefix.push(total);
        }
        Self {
            content,
            lines,
            target,
            trimmed,
            prefix,
            hint_line,
            threshold,
            evaluations: 0,
            best: None,
        }
    }

    fn exhausted(&self) -> bool {
        self.evaluations >= MAX_EVALUATIONS
    }

    /// Large files are only searched near their head and tail.
    fn in_window(&self, line: usize) -> bool {
        let len = self.content.len();
        if len <= LARGE_CONTENT_BYTES {
            return true;
        }
        let (start, _) = self.lines.ranges[line];
        start < LARGE_WINDOW_BYTES || start >= len - LARGE_WINDOW_BYTES
    }

    /// Char length of trimmed lines `first..=last` joined with newlines.
    fn region_len(&self, first: usize, last: usize) -> usize {
        self.prefix[last + 1] - self.prefix[first] + (last - first)
    }

    fn order_by_hint(&self, starts: &mut [usize]) {
        if let Some(hint) = self.hint_line {
            starts.sort_by_key(|&i| ((i + 1).abs_diff(hint), i));
        }
    }

    fn anchor_pass(&mut self) {
        let target = self.target;
        let span = target.line_count() - 1;
        let slack = target.slack();
        let total = self.lines.len();

        let first_anchor = target.first_anchor();
        let last_anchor = target.last_anchor();
        let mut starts: Vec<usize> = (0..total)
            .filter(|&i| self.trimmed[i] == first_anchor && self.in_window(i))
            .collect();
        self.order_by_hint(&mut starts);
        let ends: Vec<usize> = (0..total)
            .filter(|&i| self.trimmed[i] == last_anchor)
            .collect();

        for first in starts {
            let lo = first + span.saturating_sub(slack);
            let hi = (first + span + slack).min(total.saturating_sub(1));
            let from = ends.partition_point(|&end| end < lo);
            for &last in ends[from..].iter().take_while(|&&end| end <= hi) {
                if self.exhausted() {
                    return;
                }
                self.evaluate(first, last);
            }
        }
    }

    /// Fixed-size windows, centred on the hint when there is one.
    fn sliding_pass(&mut self) {
        let total = self.lines.len();
        let size = self.target.line_count();
        if size > total {
            return;
        }
        let last_start = total - size;

        let mut starts: Vec<usize> = (0..=last_start).filter(|&i| self.in_window(i)).collect();
        if self.hint_line.is_some() {
            self.order_by_hint(&mut starts);
        } else if starts.len() > MAX_EVALUATIONS {
            // Spread the budget evenly across the file.
            let step = starts.len().div_ceil(MAX_EVALUATIONS);
            starts = starts.into_iter().step_by(step).collect();
        }

        for first in starts {
            if self.exhausted() {
                return;
            }
            self.evaluate(first, first + size - 1);
        }
    }

    /// Counts against the budget whether or not the pair is scored.
    fn evaluate(&mut self, first: usize, last: usize) {
        self.evaluations += 1;

        // Length difference alone bounds the best reachable similarity.
        let region_len = self.region_len(first, last);
        let target_len = self.target.chars.len();
        let max_len = region_len.max(target_len);
        if max_len == 0 {
            return;
        }
        let limit = ((1.0 - self.threshold) * max_len as f64 + 1e-9).floor() as usize;
        if region_len.abs_diff(target_len) > limit {
            return;
        }

        let mut region = Vec::with_capacity(region_len);
        for (i, line) in self.trimmed[first..=last].iter().enumerate() {
            if i > 0 {
                region.push('\n');
            }
            region.extend(line.chars());
        }
        let Some(distance) = levenshtein_within(&region, &self.target.chars, limit) else {
            return;
        };
        let similarity = 1.0 - distance as f64 / max_len as f64;
        if similarity < self.threshold {
            return;
        }

        let candidate = Candidate {
            first_line: first,
            last_line: last,
            similarity,
            hint_distance: hint_distance(self.hint_line, first + 1),
        };
        match &self.best {
            Some(best) if !candidate.beats(best) => {}
            _ => self.best = Some(candidate),
        }
    }
}

/// `1 - distance / max_len`, character based. Two empty strings are identical.
pub fn similarity(a: &str, b: &str) -> f64 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - levenshtein(a, b) as f64 / max_len as f64
}

/// Levenshtein distance over chars.
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a_chars: Vec<char> = a.chars().collect();
    let b_chars: Vec<char> = b.chars().collect();
    let max_len = a_chars.len().max(b_chars.len());
    levenshtein_within(&a_chars, &b_chars, max_len).unwrap_or(max_len)
}

/// Two-row Levenshtein restricted to the diagonal band `|i - j| <= limit`.
/// Returns `None` as soon as the distance is known to exceed `limit`.
fn levenshtein_within(a: &[char], b: &[char], limit: usize) -> Option<usize> {
    let (m, n) = (a.len(), b.len());
    if m.abs_diff(n) > limit {
        return None;
    }
    let over = limit + 1;
    let mut prev: Vec<usize> = (0..=n).map(|j| j.min(over)).collect();
    let mut curr = vec![over; n + 1];
    for i in 1..=m {
        let lo = i.saturating_sub(limit).max(1);
        let hi = (i + limit).min(n);
        curr[0] = i.min(over);
        if lo > 1 {
            curr[lo - 1] = over;
        }
        let mut row_min = curr[lo - 1];
        for j in lo..=hi {
            let cost = usize::from(a[i - 1] != b[j - 1]);
            let value = (prev[j] + 1)
                .min(curr[j - 1] + 1)
                .min(prev[j - 1] + cost)
                .min(over);
            curr[j] = value;
            row_min = row_min.min(value);
        }
        if hi < n {
            curr[hi + 1] = over;
        }
        if row_min > limit {
            return None;
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    (prev[n] <= limit).then_some(prev[n])
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = "fn main() {\n    let config = load();\n    run(config);\n}\n\nfn run(config: Config) {\n    println!(\"running\");\n    config.apply();\n}\n";

    #[test]
    fn empty_target_is_rejected() {
        assert_eq!(find_best_match("abc", "", None), Err(FuzzyError::EmptyTarget));
    }

    #[test]
    fn exact_match_returns_span() {
        let old = "    run(config);\n}";
        let m = find_best_match(SOURCE, old, None).unwrap().unwrap();
        assert_eq!(m.similarity, 1.0);
        assert_eq!(&SOURCE[m.start..m.end], old);
        assert_eq!(m.start_line, 3);
        assert_eq!(m.end_line, 4);
        assert_eq!(m.matched_text, old);
    }

    #[test]
    fn exact_match_prefers_hint() {
        let content = "x = 1\ny = 2\nx = 1\n";
        let first = find_best_match(content, "x = 1", None).unwrap().unwrap();
        assert_eq!(first.start_line, 1);
        let near = find_best_match(content, "x = 1", Some(3)).unwrap().unwrap();
        assert_eq!(near.start_line, 3);
        assert_eq!(near.start, 12);
    }

    #[test]
    fn indentation_differences_still_match() {
        let old = "fn run(config: Config) {\nprintln!(\"running\");\n  config.apply();\n}";
        let m = find_best_match(SOURCE, old, None).unwrap().unwrap();
        assert_eq!(m.start_line, 6);
        assert_eq!(m.end_line, 9);
        assert!(m.similarity >= 0.99, "similarity {}", m.similarity);
        assert!(m.matched_text.starts_with("fn run(config: Config) {"));
    }

    #[test]
    fn minor_edit_matches_above_threshold() {
        let old = "fn run(config: Config) {\n    println!(\"runnin\");\n    config.apply();\n}";
        let m = find_best_match(SOURCE, old, None).unwrap().unwrap();
        assert!(m.similarity >= DEFAULT_MIN_SIMILARITY);
        assert!(m.similarity < 1.0);
        assert_eq!(m.start_line, 6);
    }

    #[test]
    fn sliding_window_handles_changed_anchor() {
        let content = "alpha one\nbeta two\ngamma three\ndelta four\n";
        // First line differs, so no anchor pair exists.
        let old = "beta twp\ngamma three";
        let m = find_best_match(content, old, None).unwrap().unwrap();
        assert_eq!(m.start_line, 2);
        assert_eq!(m.end_line, 3);
    }

    #[test]
    fn unrelated_text_returns_none() {
        let m = find_best_match(SOURCE, "completely different\nnothing alike here", None).unwrap();
        assert!(m.is_none());
    }

    #[test]
    fn hint_relaxes_threshold() {
        let content = "abcdefghijkl\n";
        // 2 of 12 chars differ: between the two thresholds.
        let old = "abcdefghijXY";
        assert!(find_best_match(content, old, None).unwrap().is_none());
        let m = find_best_match(content, old, Some(1)).unwrap().unwrap();
        assert!((m.similarity - 10.0 / 12.0).abs() < 1e-9);
    }

    #[test]
    fn evaluation_budget_is_bounded_on_repetitive_input() {
        let mut content = String::new();
        for _ in 0..5_000 {
            content.push_str("start\nbody line\nend\n");
        }
        let old = "start\nbody lime\nend";
        let m = find_best_match(&content, old, Some(4_000)).unwrap().unwrap();
        assert!(m.similarity > 0.9);
        // Nearest candidate to the hint wins the tie.
        assert!(m.start_line.abs_diff(4_000) <= 3);
    }

    #[test]
    fn pruned_pairs_count_against_the_budget() {
        // Every line anchors both ends, and no region is long enough to score.
        let content = "a\n".repeat(20_000);
        let old = format!("a\n{}a", "bbbbbbbbbbbbbbbbbbbb\n".repeat(400));
        let started = std::time::Instant::now();
        let outcome = locate(&content, &old, None, &MatchOptions::default()).unwrap();
        assert!(outcome.found.is_none());
        assert_eq!(outcome.evaluations, MAX_EVALUATIONS);
        assert!(started.elapsed() < std::time::Duration::from_secs(2));
    }

    const BLOCK: &str = "fn alpha() {\n    let total = compute(2);\n    total\n}\n";
    const DRIFTED_BLOCK: &str = "fn alpha() {\n    let total = compute(1);\n    total\n}";

    fn filler(lines: usize) -> String {
        (0..lines).map(|i| format!("// filler line {:07}\n", i)).collect()
    }

    #[test]
    fn large_files_skip_the_middle() {
        let content = format!("{}{}{}", filler(115_000), BLOCK, filler(115_000));
        assert!(content.len() > LARGE_CONTENT_BYTES);
        assert!(find_best_match(&content, DRIFTED_BLOCK, None).unwrap().is_none());
    }

    #[test]
    fn large_files_search_the_tail() {
        let content = format!("{}{}", filler(230_000), BLOCK);
        assert!(content.len() > LARGE_CONTENT_BYTES);
        let m = find_best_match(&content, DRIFTED_BLOCK, None).unwrap().unwrap();
        assert_eq!(m.start_line, 230_001);
        assert_eq!(m.end_line, 230_004);
        assert!(m.similarity > 0.95);
    }

    #[test]
    fn crlf_lines_are_handled() {
        let content = "one\r\ntwo  \r\nthree\r\n";
        let m = find_best_match(content, "two\nthree", None).unwrap().unwrap();
        assert_eq!(m.start_line, 2);
        assert_eq!(m.matched_text, "two  \r\nthree");
    }

    #[test]
    fn levenshtein_basics() {
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("héllo", "hello"), 1);
        assert_eq!(similarity("", ""), 1.0);
    }

    #[test]
    fn banded_distance_gives_up_past_the_limit() {
        let kitten: Vec<char> = "kitten".chars().collect();
        let sitting: Vec<char> = "sitting".chars().collect();
        assert_eq!(levenshtein_within(&kitten, &sitting, 3), Some(3));
        assert_eq!(levenshtein_within(&kitten, &sitting, 2), None);
        assert_eq!(levenshtein_within(&[], &kitten, 6), Some(6));
    }
}
