//! Commit change analysis
//!
//! Derives categories, impact, complexity and risk from a commit's message,
//! line statistics and changed files. Analysis is a pure function of its
//! inputs: no clock, no randomness, no storage access, so re-analysing a
//! commit always overwrites its summary with identical values.
//!
//! # Categorization
//!
//! Categories come from an ordered rule table of `(category, matcher)`
//! pairs. Every rule is evaluated and every match applies; order carries no
//! priority. A rule matches on the commit message, on any changed filename,
//! or both.
//!
//! # Scoring
//!
//! - impact: volume (up to 50) + file count (up to 30) + critical file (20), capped at 100
//! - complexity: grows with volume, file count and directory spread, capped at 100
//! - risk: high / medium / low thresholds, high evaluated first

use std::collections::BTreeSet;
use std::sync::OnceLock;

use regex::Regex;
use tracing::error;

use crate::types::{
    Category, Commit, CommitFile, CommitStats, CommitSummary, PerformanceImpact, RiskLevel,
};

/// Max points from lines changed
const VOLUME_MAX_POINTS: f64 = 50.0;
/// Points per decade of lines changed (10k lines reaches the cap)
const VOLUME_POINTS_PER_DECADE: f64 = 12.5;
/// Max points from files changed
const FILES_MAX_POINTS: f64 = 30.0;
/// Points per changed file
const FILES_POINTS_EACH: f64 = 3.0;
/// Bonus when a critical file is touched
const CRITICAL_FILE_POINTS: f64 = 20.0;

const HIGH_RISK_CHANGES: u64 = 500;
const HIGH_RISK_FILES: u64 = 20;
const MEDIUM_RISK_CHANGES: u64 = 100;
const MEDIUM_RISK_FILES: u64 = 5;

/// Longest short summary kept, in bytes
const SHORT_SUMMARY_MAX: usize = 120;

/// Build manifests, container definitions and dependency lockfiles.
const CRITICAL_FILES: &[&str] = &[
    "Cargo.toml",
    "Cargo.lock",
    "package.json",
    "package-lock.json",
    "yarn.lock",
    "pnpm-lock.yaml",
    "go.mod",
    "go.sum",
    "requirements.txt",
    "Pipfile.lock",
    "poetry.lock",
    "pyproject.toml",
    "setup.py",
    "Gemfile.lock",
    "composer.lock",
    "pom.xml",
    "build.gradle",
    "build.gradle.kts",
    "Makefile",
    "CMakeLists.txt",
    "Dockerfile",
    "docker-compose.yml",
    "docker-compose.yaml",
];

/// What a categorization rule inspects.
struct Matcher {
    message: Option<Regex>,
    filename: Option<Regex>,
    /// Phrases blanked out of the message before `message` is tried
    negation: Option<Regex>,
}

impl Matcher {
    fn matches(&self, message: &str, files: &[CommitFile]) -> bool {
        let by_message = self.message.as_ref().is_some_and(|re| match &self.negation {
            Some(negation) => re.is_match(&negation.replace_all(message, " ")),
            None => re.is_match(message),
        });
        by_message
            || self
                .filename
                .as_ref()
                .is_some_and(|re| files.iter().any(|f| re.is_match(&f.filename)))
    }
}

/// One entry of the categorization table.
struct Rule {
    category: Category,
    matcher: Matcher,
}

/// (category, message pattern, filename pattern)
const RULE_SPECS: &[(Category, Option<&str>, Option<&str>)] = &[
    (
        Category::Bugfix,
        Some(r"(?i)\b(fix(e[sd])?|bug(fix)?|hotfix|patch(ed)?|resolve[sd]?|crash(es)?|regression)\b"),
        None,
    ),
    (
        Category::Feature,
        Some(r"(?i)(^feat(\(|!|:)|\b(feature|add(s|ed)?|implement(s|ed)?|introduce[sd]?|support for|new)\b)"),
        None,
    ),
    (
        Category::Refactor,
        Some(r"(?i)\b(refactor\w*|restructur\w*|clean ?up|simplif\w*|renam(e|ed|ing)|reorgani[sz]\w*|extract(ed)?|tidy)\b"),
        None,
    ),
    (
        Category::Documentation,
        Some(r"(?i)(^docs(\(|:)|\b(docs?|documentation|readme|changelog|typos?)\b)"),
        Some(r"(?i)(\.(md|rst|adoc)$|(^|/)docs?/|(^|/)(readme|changelog)[^/]*$)"),
    ),
    (
        Category::Testing,
        Some(r"(?i)(^test(\(|:)|\b(tests?|testing|unit test|coverage|e2e)\b)"),
        Some(r"(?i)((^|/)(tests?|__tests__|spec)/|_test\.\w+$|\.test\.\w+$|_spec\.\w+$|\.spec\.\w+$|(^|/)test_[^/]+$)"),
    ),
    (
        Category::Performance,
        Some(r"(?i)(^perf(\(|:)|\b(perf|performance|optimi[sz]\w*|speed ?up|faster|latency|throughput|cach(e|ing)|slow(er|down)?)\b)"),
        None,
    ),
    (
        Category::Security,
        Some(r"(?i)(\b(security|vulnerab\w*|exploit\w*|xss|csrf|ssrf|injection|sanitiz\w*|escap(e|ing) (html|input)|auth(entication|orization)?|secrets?|password|token leak)\b|\bcve-\d+)"),
        Some(r"(?i)(^|/)(security|auth)(/|\.)"),
    ),
    (
        Category::Breaking,
        Some(r"(?i)(breaking[ -]change|^\w+(\([^)]*\))?!:|\bbreaking\b|\bremove[sd]? (support|api)\b|\bdrop(s|ped)? support\b)"),
        None,
    ),
    (
        Category::Configuration,
        Some(r"(?i)\b(config(uration)?|settings?|env(ironment)? var\w*)\b"),
        Some(r"(?i)(\.(ya?ml|toml|ini|cfg|conf)$|(^|/)\.env[^/]*$|(^|/)config/)"),
    ),
    (
        Category::Database,
        Some(r"(?i)\b(database|db|migrations?|schema|sql|quer(y|ies)|index(es)?)\b"),
        Some(r"(?i)((^|/)migrations?/|\.sql$|(^|/)schema\.\w+$)"),
    ),
    (
        Category::Infrastructure,
        Some(r"(?i)(^(ci|build)(\(|:)|\b(ci|cd|deploy\w*|docker|kubernetes|k8s|helm|terraform|pipeline|infra\w*)\b)"),
        Some(r"(?i)((^|/)dockerfile$|(^|/)docker-compose\.ya?ml$|^\.github/workflows/|\.gitlab-ci\.yml$|(^|/)jenkinsfile$|\.tf$|(^|/)(k8s|helm|deploy|infra)/)"),
    ),
];

/// Message phrases that deny a category rather than claim it
const NEGATIONS: &[(Category, &str)] = &[(
    Category::Breaking,
    r"(?i)\b(non[- ]?breaking([ -]changes?)?|no breaking changes?)\b",
)];

/// Message mentions of a slowdown flip the performance impact negative
const PERF_NEGATIVE: &str = r"(?i)\b(slow(er|down|s down)|regress(ion|ed)?|degrad\w*)\b";

fn compile(pattern: &str) -> Option<Regex> {
    match Regex::new(pattern) {
        Ok(re) => Some(re),
        Err(e) => {
            error!("Invalid analyzer pattern {}: {}", pattern, e);
            None
        }
    }
}

fn rules() -> &'static [Rule] {
    static RULES: OnceLock<Vec<Rule>> = OnceLock::new();
    RULES.get_or_init(|| {
        RULE_SPECS
            .iter()
            .filter_map(|(category, message, filename)| {
                let message = match message {
                    Some(pattern) => Some(compile(pattern)?),
                    None => None,
                };
                let filename = match filename {
                    Some(pattern) => Some(compile(pattern)?),
                    None => None,
                };
                let negation = match NEGATIONS.iter().find(|(c, _)| c == category) {
                    Some((_, pattern)) => Some(compile(pattern)?),
                    None => None,
                };
                Some(Rule {
                    category: *category,
                    matcher: Matcher {
                        message,
                        filename,
                        negation,
                    },
                })
            })
            .collect()
    })
}

fn perf_negative() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| compile(PERF_NEGATIVE)).as_ref()
}

/// Assign every matching category.
pub fn categorize(message: &str, files: &[CommitFile]) -> BTreeSet<Category> {
    rules()
        .iter()
        .filter(|rule| rule.matcher.matches(message, files))
        .map(|rule| rule.category)
        .collect()
}

/// Whether a filename is a build manifest, container definition or lockfile.
pub fn is_critical_file(filename: &str) -> bool {
    let base = filename.rsplit('/').next().unwrap_or(filename);
    CRITICAL_FILES.iter().any(|c| c.eq_ignore_ascii_case(base))
}

/// Impact score in `[0, 100]`; monotonic in line volume and file count.
pub fn impact_score(stats: &CommitStats, files_changed: u64, files: &[CommitFile]) -> f64 {
    let volume = stats.additions + stats.deletions;
    let volume_points =
        (VOLUME_POINTS_PER_DECADE * (1.0 + volume as f64).log10()).min(VOLUME_MAX_POINTS);
    let file_points = (FILES_POINTS_EACH * files_changed as f64).min(FILES_MAX_POINTS);
    let critical_points = if files.iter().any(|f| is_critical_file(&f.filename)) {
        CRITICAL_FILE_POINTS
    } else {
        0.0
    };

    round2((volume_points + file_points + critical_points).min(100.0))
}

/// Complexity score in `[0, 100]`.
pub fn complexity_score(stats: &CommitStats, files_changed: u64, files: &[CommitFile]) -> f64 {
    let directories: BTreeSet<&str> = files
        .iter()
        .map(|f| f.filename.rsplit_once('/').map_or("", |(dir, _)| dir))
        .collect();
    let raw = 5.0 * (1.0 + stats.total_changes as f64).ln()
        + 2.0 * files_changed as f64
        + 3.0 * directories.len() as f64;
    round2(raw.min(100.0))
}

/// Risk level; high conditions take precedence over medium ones.
pub fn risk_level(
    breaking_changes: bool,
    security_relevant: bool,
    total_changes: u64,
    files_changed: u64,
) -> RiskLevel {
    if breaking_changes
        || security_relevant
        || total_changes > HIGH_RISK_CHANGES
        || files_changed > HIGH_RISK_FILES
    {
        RiskLevel::High
    } else if (MEDIUM_RISK_CHANGES..=HIGH_RISK_CHANGES).contains(&total_changes)
        || (MEDIUM_RISK_FILES..=HIGH_RISK_FILES).contains(&files_changed)
    {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    }
}

fn performance_impact(message: &str, categories: &BTreeSet<Category>) -> PerformanceImpact {
    if perf_negative().is_some_and(|re| re.is_match(message)) {
        PerformanceImpact::Negative
    } else if categories.contains(&Category::Performance) {
        PerformanceImpact::Positive
    } else {
        PerformanceImpact::Neutral
    }
}

/// First non-empty message line, or a generated description.
pub fn short_summary(message: &str, stats: &CommitStats, files_changed: u64) -> String {
    match message.lines().map(str::trim).find(|l| !l.is_empty()) {
        Some(line) => truncate_to_chars(line, SHORT_SUMMARY_MAX).to_string(),
        None => format!(
            "Update {} file{} (+{}/-{})",
            files_changed,
            if files_changed == 1 { "" } else { "s" },
            stats.additions,
            stats.deletions
        ),
    }
}

fn detailed_summary(
    short: &str,
    stats: &CommitStats,
    files_changed: u64,
    categories: &BTreeSet<Category>,
) -> String {
    let categories = if categories.is_empty() {
        "none".to_string()
    } else {
        categories
            .iter()
            .map(Category::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    };

    format!(
        "{short}\nFiles changed: {files_changed}\nLines: +{} -{} ({} total)\n\
         Categories: {categories}",
        stats.additions, stats.deletions, stats.total_changes
    )
}

/// Analyze a commit and its files.
///
/// The file count is the larger of the commit's reported `files_changed`
/// and the number of file records supplied.
pub fn analyze(commit: &Commit, files: &[CommitFile]) -> CommitSummary {
    let stats = commit.stats;
    let files_changed = commit.files_changed.max(files.len() as u64);

    let categories = categorize(&commit.message, files);
    let breaking_changes = categories.contains(&Category::Breaking);
    let security_relevant = categories.contains(&Category::Security);

    let short = short_summary(&commit.message, &stats, files_changed);
    let detailed = detailed_summary(&short, &stats, files_changed, &categories);

    CommitSummary {
        commit_sha: commit.sha.clone(),
        repo_name: commit.repo_name.clone(),
        short_summary: short,
        detailed_summary: detailed,
        impact_score: impact_score(&stats, files_changed, files),
        complexity_score: complexity_score(&stats, files_changed, files),
        risk_level: risk_level(
            breaking_changes,
            security_relevant,
            stats.total_changes,
            files_changed,
        ),
        performance_impact: performance_impact(&commit.message, &categories),
        breaking_changes,
        security_relevant,
        categories,
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Truncate string to approximately n bytes at a word boundary
fn truncate_to_chars(s: &str, max_chars: usize) -> &str {
    if s.len() <= max_chars {
        return s;
    }

    // Find a safe UTF-8 boundary
    let mut end = max_chars;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }

    // Try to break at a word boundary
    if let Some(space_pos) = s[..end].rfind(char::is_whitespace) {
        &s[..space_pos]
    } else {
        &s[..end]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FileStatus;
    use chrono::{TimeZone, Utc};

    fn commit(message: &str, additions: u64, deletions: u64, files_changed: u64) -> Commit {
        Commit {
            sha: "abc123".to_string(),
            repo_name: "o/r".to_string(),
            author_name: "Dev".to_string(),
            author_email: "dev@example.com".to_string(),
            author_login: Some("dev".to_string()),
            message: message.to_string(),
            commit_date: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            branch_name: Some("main".to_string()),
            stats: CommitStats::new(additions, deletions),
            files_changed,
            parent_shas: vec!["p1".to_string()],
        }
    }

    fn file(name: &str) -> CommitFile {
        CommitFile {
            commit_sha: "abc123".to_string(),
            repo_name: "o/r".to_string(),
            filename: name.to_string(),
            status: FileStatus::Modified,
            additions: 1,
            deletions: 0,
            patch: None,
        }
    }

    #[test]
    fn test_all_patterns_compile() {
        assert_eq!(rules().len(), RULE_SPECS.len());
        assert!(perf_negative().is_some());
    }

    #[test]
    fn test_bugfix_message_is_not_feature() {
        let c = commit("fix: resolve null pointer in parser", 3, 1, 1);
        let summary = analyze(&c, &[file("src/parser.rs")]);
        assert!(summary.categories.contains(&Category::Bugfix));
        assert!(!summary.categories.contains(&Category::Feature));
    }

    #[test]
    fn test_categories_are_a_set() {
        let files = [file("docs/guide.md"), file("tests/parser_test.rs")];
        let cats = categorize("feat: add streaming parser", &files);
        assert!(cats.contains(&Category::Feature));
        assert!(cats.contains(&Category::Documentation));
        assert!(cats.contains(&Category::Testing));
        assert!(categorize("wip", &[]).is_empty());
    }

    #[test]
    fn test_filename_rules() {
        let files = [file(".github/workflows/ci.yml"), file("db/migrations/001.sql")];
        let cats = categorize("bump", &files);
        assert!(cats.contains(&Category::Infrastructure));
        assert!(cats.contains(&Category::Database));
        assert!(cats.contains(&Category::Configuration));
    }

    #[test]
    fn test_volume_threshold_is_high_risk() {
        let c = commit("tidy things", 600, 0, 25);
        let summary = analyze(&c, &[]);
        assert_eq!(summary.risk_level, RiskLevel::High);
        assert!(!summary.breaking_changes);
    }

    #[test]
    fn test_breaking_change_is_always_high_risk() {
        let c = commit("feat!: drop legacy config format", 1, 1, 1);
        let summary = analyze(&c, &[]);
        assert!(summary.breaking_changes);
        assert_eq!(summary.risk_level, RiskLevel::High);
    }

    #[test]
    fn test_non_breaking_wording_is_not_breaking() {
        let c = commit("docs: clarify wording (non-breaking change)", 3, 1, 1);
        let summary = analyze(&c, &[file("README.md")]);
        assert!(!summary.breaking_changes);
        assert!(!summary.categories.contains(&Category::Breaking));
        assert!(summary.categories.contains(&Category::Documentation));
        assert_eq!(summary.risk_level, RiskLevel::Low);

        for message in ["refactor: nonbreaking cleanup", "chore: no breaking changes here"] {
            assert!(!categorize(message, &[]).contains(&Category::Breaking), "{message}");
        }
        // A real breaking note alongside a denial still counts
        let cats = categorize("non-breaking for users, BREAKING CHANGE: drops v1 api", &[]);
        assert!(cats.contains(&Category::Breaking));
    }

    #[test]
    fn test_risk_thresholds() {
        assert_eq!(risk_level(false, false, 99, 4), RiskLevel::Low);
        assert_eq!(risk_level(false, false, 100, 1), RiskLevel::Medium);
        assert_eq!(risk_level(false, false, 500, 1), RiskLevel::Medium);
        assert_eq!(risk_level(false, false, 501, 1), RiskLevel::High);
        assert_eq!(risk_level(false, false, 1, 5), RiskLevel::Medium);
        assert_eq!(risk_level(false, false, 1, 21), RiskLevel::High);
        assert_eq!(risk_level(false, true, 0, 0), RiskLevel::High);
    }

    #[test]
    fn test_impact_is_monotonic() {
        let mut last = 0.0;
        for volume in [0, 1, 10, 50, 200, 1_000, 10_000, 100_000] {
            let score = impact_score(&CommitStats::new(volume, 0), 3, &[]);
            assert!(score >= last, "impact decreased at volume {volume}");
            last = score;
        }

        let mut last = 0.0;
        for files_changed in 0..40 {
            let score = impact_score(&CommitStats::new(100, 0), files_changed, &[]);
            assert!(score >= last, "impact decreased at {files_changed} files");
            last = score;
        }
    }

    #[test]
    fn test_impact_components_and_cap() {
        assert_eq!(impact_score(&CommitStats::new(0, 0), 0, &[]), 0.0);
        let maxed = impact_score(&CommitStats::new(1_000_000, 0), 100, &[file("Cargo.lock")]);
        assert_eq!(maxed, 100.0);
        let with_critical = impact_score(&CommitStats::new(0, 0), 0, &[file("web/package.json")]);
        assert_eq!(with_critical, CRITICAL_FILE_POINTS);
    }

    #[test]
    fn test_analysis_is_deterministic() {
        let c = commit("perf: cache parsed manifests\n\nLonger body", 120, 30, 4);
        let files = [file("src/cache.rs"), file("Cargo.toml")];
        let first = analyze(&c, &files);
        for _ in 0..5 {
            assert_eq!(analyze(&c, &files), first);
        }
        assert_eq!(first.performance_impact, PerformanceImpact::Positive);
    }

    #[test]
    fn test_summaries() {
        let c = commit("\n  Add retry loop  \nbody", 10, 2, 2);
        let summary = analyze(&c, &[]);
        assert_eq!(summary.short_summary, "Add retry loop");
        assert_eq!(
            summary.detailed_summary,
            "Add retry loop\nFiles changed: 2\nLines: +10 -2 (12 total)\nCategories: feature"
        );

        let empty = analyze(&commit("", 1, 0, 1), &[]);
        assert_eq!(empty.short_summary, "Update 1 file (+1/-0)");
    }

    #[test]
    fn test_negative_performance_impact() {
        let c = commit("revert cache, causes slowdown", 5, 5, 1);
        assert_eq!(analyze(&c, &[]).performance_impact, PerformanceImpact::Negative);
    }

    #[test]
    fn test_truncate_to_chars() {
        assert_eq!(truncate_to_chars("hello world", 20), "hello world");
        assert_eq!(truncate_to_chars("hello world", 8), "hello");
        assert_eq!(truncate_to_chars("hello world", 5), "hello");
    }
}
