use tracing::debug;

use crate::taskcluster::{Task, TaskState};

/// Token that selects every suite.
pub const ALL_SUITES: &str = "all";

/// Name-matching policy for suites, platforms and artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Matcher {
    Any,
    Exact(String),
    Contains(String),
}

impl Matcher {
    pub fn matches(&self, candidate: &str) -> bool {
        match self {
            Matcher::Any => true,
            Matcher::Exact(value) => candidate == value,
            Matcher::Contains(value) => candidate.contains(value.as_str()),
        }
    }

    /// Suite matchers: substring per token, or [`Matcher::Any`] when `all` is present.
    pub fn suites(tokens: &[String]) -> Vec<Matcher> {
        if tokens.iter().any(|token| token == ALL_SUITES) {
            return vec![Matcher::Any];
        }
        tokens
            .iter()
            .map(|token| Matcher::Contains(token.clone()))
            .collect()
    }
}

/// Return the first artifact pattern contained in `name`.
pub fn pattern_match<'a>(name: &str, patterns: &'a [String]) -> Option<&'a str> {
    patterns
        .iter()
        .map(String::as_str)
        .find(|pattern| name.contains(pattern))
}

#[derive(Debug, Clone)]
pub struct TaskFilter {
    pub platform: Matcher,
    pub suites: Vec<Matcher>,
    pub include_failures: bool,
}

impl TaskFilter {
    pub fn new(platform: Option<&str>, suites: &[String], include_failures: bool) -> Self {
        Self {
            platform: platform.map_or(Matcher::Any, |value| Matcher::Exact(value.to_string())),
            suites: Matcher::suites(suites),
            include_failures,
        }
    }

    pub fn accepts(&self, task: &Task) -> bool {
        if !self.platform.matches(&task.platform) {
            return false;
        }
        if !self.include_failures && task.state != TaskState::Succeeded {
            debug!(task_id = %task.id, state = ?task.state, "skipping unsuccessful task");
            return false;
        }
        self.suites.iter().any(|matcher| matcher.matches(&task.suite))
    }

    /// Keep accepted tasks in their original order.
    pub fn apply(&self, tasks: &[Task]) -> Vec<Task> {
        tasks
            .iter()
            .filter(|task| self.accepts(task))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, suite: &str, platform: &str, state: TaskState) -> Task {
        Task {
            id: id.into(),
            name: format!("{platform}-{suite}"),
            suite: suite.into(),
            platform: platform.into(),
            state,
            artifacts: Vec::new(),
            head_rev: None,
            fetches: None,
        }
    }

    fn sample() -> Vec<Task> {
        vec![
            task("t1", "raptor-tp6m-1", "linux/opt", TaskState::Succeeded),
            task("t2", "raptor-tp6m-2", "linux/opt", TaskState::Failed),
            task("t3", "browsertime-tp6-1", "Linux/opt", TaskState::Succeeded),
            task("t4", "browsertime-tp6-1", "linux/opt", TaskState::Other),
            task("t5", "talos-g1", "linux/opt", TaskState::Succeeded),
        ]
    }

    fn ids(tasks: &[Task]) -> Vec<&str> {
        tasks.iter().map(|task| task.id.as_str()).collect()
    }

    #[test]
    fn all_keeps_every_suite() {
        let filter = TaskFilter::new(None, &["raptor".into(), "all".into()], true);
        assert_eq!(ids(&filter.apply(&sample())), vec!["t1", "t2", "t3", "t4", "t5"]);
    }

    #[test]
    fn platform_is_exact_and_case_sensitive() {
        let filter = TaskFilter::new(Some("linux/opt"), &["all".into()], true);
        assert_eq!(ids(&filter.apply(&sample())), vec!["t1", "t2", "t4", "t5"]);

        let prefix = TaskFilter::new(Some("linux"), &["all".into()], true);
        assert!(prefix.apply(&sample()).is_empty());
    }

    #[test]
    fn unsuccessful_tasks_dropped_without_flag() {
        let filter = TaskFilter::new(None, &["all".into()], false);
        assert_eq!(ids(&filter.apply(&sample())), vec!["t1", "t3", "t5"]);
    }

    #[test]
    fn suites_match_by_substring() {
        let filter = TaskFilter::new(None, &["tp6".into(), "g1".into()], true);
        assert_eq!(ids(&filter.apply(&sample())), vec!["t1", "t2", "t3", "t4", "t5"]);

        let filter = TaskFilter::new(None, &["tp6m".into()], true);
        assert_eq!(ids(&filter.apply(&sample())), vec!["t1", "t2"]);
    }

    #[test]
    fn empty_suite_list_matches_nothing() {
        let filter = TaskFilter::new(None, &[], true);
        assert!(filter.apply(&sample()).is_empty());
    }

    #[test]
    fn pattern_match_returns_first_hit() {
        let patterns = vec!["perfherder".to_string(), "data".to_string()];
        assert_eq!(
            pattern_match("public/perfherder-data.json", &patterns),
            Some("perfherder")
        );
        assert_eq!(pattern_match("public/logs/live.log", &patterns), None);
    }
}
