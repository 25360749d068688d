//! Task graph analyzer (component H): topological ordering by dependencies,
//! parallelism grouping, cycle detection, per spec.md §4.4.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::task::{Task, TaskId};

/// One depth level of the topological ordering.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParallelGroup {
    pub depth: usize,
    /// Tasks at this depth, sorted by `priority` ascending.
    pub tasks: Vec<Task>,
    pub max_priority: i64,
}

/// Result of [`analyze_task_graph`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskGraphAnalysis {
    pub nodes: HashMap<TaskId, Task>,
    pub groups: Vec<ParallelGroup>,
    pub cyclic_task_ids: Vec<TaskId>,
    pub actionable_task_count: usize,
    pub max_parallelism: usize,
    pub recommend_parallel: bool,
}

/// Build the dependency graph (dependsOn plus the inverse of `blocks`) and
/// run Kahn's algorithm: nodes with in-degree zero form depth 0; removing
/// their outgoing edges releases dependents into the next depth. Any nodes
/// left unprocessed at the end are cyclic.
pub fn analyze_task_graph(tasks: &[Task]) -> TaskGraphAnalysis {
    let nodes: HashMap<TaskId, Task> = tasks.iter().map(|t| (t.id.clone(), t.clone())).collect();

    let mut dependents: HashMap<TaskId, Vec<TaskId>> = HashMap::new();
    let mut in_degree: HashMap<TaskId, usize> = HashMap::new();

    for task in tasks {
        in_degree.entry(task.id.clone()).or_insert(0);
        for dep in &task.depends_on {
            if nodes.contains_key(dep) {
                dependents.entry(dep.clone()).or_default().push(task.id.clone());
                *in_degree.entry(task.id.clone()).or_insert(0) += 1;
            }
        }
        // `blocks[x] -> y` is equivalent to `dependsOn[y] -> x`: task depends on
        // each task it blocks being scheduled after it.
        for blocked in &task.blocks {
            if nodes.contains_key(blocked) {
                dependents.entry(task.id.clone()).or_default().push(blocked.clone());
                *in_degree.entry(blocked.clone()).or_insert(0) += 1;
            }
        }
    }

    let mut remaining = in_degree.clone();
    let mut frontier: VecDeque<TaskId> = remaining
        .iter()
        .filter(|(_, &deg)| deg == 0)
        .map(|(id, _)| id.clone())
        .collect();

    let mut groups = Vec::new();
    let mut visited: HashSet<TaskId> = HashSet::new();
    let mut depth = 0;

    while !frontier.is_empty() {
        let mut group_tasks: Vec<Task> = frontier
            .iter()
            .filter_map(|id| nodes.get(id).cloned())
            .collect();
        group_tasks.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
        let max_priority = group_tasks.iter().map(|t| t.priority).max().unwrap_or(0);

        let mut next_frontier = VecDeque::new();
        for id in frontier.drain(..) {
            visited.insert(id.clone());
            if let Some(deps) = dependents.get(&id) {
                for dependent in deps {
                    if let Some(deg) = remaining.get_mut(dependent) {
                        *deg = deg.saturating_sub(1);
                        if *deg == 0 && !visited.contains(dependent) {
                            next_frontier.push_back(dependent.clone());
                        }
                    }
                }
            }
        }

        groups.push(ParallelGroup {
            depth,
            tasks: group_tasks,
            max_priority,
        });
        frontier = next_frontier;
        depth += 1;
    }

    let cyclic_task_ids: Vec<TaskId> = nodes
        .keys()
        .filter(|id| !visited.contains(*id))
        .cloned()
        .collect();

    let actionable_task_count = tasks.iter().filter(|t| t.is_open()).count();
    let max_parallelism = groups.iter().map(|g| g.tasks.len()).max().unwrap_or(0);
    let recommend_parallel = should_run_parallel_inner(actionable_task_count, &cyclic_task_ids, tasks.len(), &groups);

    TaskGraphAnalysis {
        nodes,
        groups,
        cyclic_task_ids,
        actionable_task_count,
        max_parallelism,
        recommend_parallel,
    }
}

fn should_run_parallel_inner(
    actionable_task_count: usize,
    cyclic_task_ids: &[TaskId],
    total: usize,
    groups: &[ParallelGroup],
) -> bool {
    if actionable_task_count < 3 {
        return false;
    }
    let cyclic_ratio = if total == 0 {
        0.0
    } else {
        cyclic_task_ids.len() as f64 / total as f64
    };
    if cyclic_ratio > 0.5 {
        return false;
    }
    groups.iter().any(|g| g.tasks.len() >= 2)
}

/// Whether `analysis` warrants parallel execution at all, per spec.md §4.4:
/// at least 3 actionable tasks, at most 50% cyclic, and at least one group
/// of 2 or more tasks.
pub fn should_run_parallel(analysis: &TaskGraphAnalysis) -> bool {
    analysis.recommend_parallel
}

/// Confidence level attached to a [`ParallelismRecommendation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

/// Output of [`recommend_parallelism`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParallelismRecommendation {
    pub recommended_workers: usize,
    pub confidence: Confidence,
    pub reason: String,
}

/// Inspect task metadata to down- or up-shift the worker count from
/// `default_max`, per spec.md §4.4's classification rules (see
/// [`Task::is_refactor_like`]/[`Task::is_test_like`]/[`Task::affected_files`]
/// for the underlying conventions).
pub fn recommend_parallelism(
    tasks: &[Task],
    _analysis: &TaskGraphAnalysis,
    default_max: usize,
) -> ParallelismRecommendation {
    let total = tasks.len().max(1);
    let refactor_like = tasks.iter().filter(|t| t.is_refactor_like()).count();
    let test_like = tasks.iter().filter(|t| t.is_test_like()).count();
    let refactor_ratio = refactor_like as f64 / total as f64;
    let test_ratio = test_like as f64 / total as f64;

    let mut file_counts: HashMap<String, usize> = HashMap::new();
    for task in tasks {
        for file in task.affected_files() {
            *file_counts.entry(file).or_insert(0) += 1;
        }
    }
    let overlapping_tasks: HashSet<&TaskId> = tasks
        .iter()
        .filter(|t| {
            t.affected_files()
                .iter()
                .any(|f| file_counts.get(f).copied().unwrap_or(0) > 1)
        })
        .map(|t| &t.id)
        .collect();
    let overlap_ratio = overlapping_tasks.len() as f64 / total as f64;

    if refactor_ratio > 0.5 {
        return ParallelismRecommendation {
            recommended_workers: default_max.min(2),
            confidence: Confidence::High,
            reason: "majority of tasks are refactor-like; keeping worker count low to limit \
                     merge conflicts"
                .to_string(),
        };
    }
    if test_ratio > 0.5 {
        return ParallelismRecommendation {
            recommended_workers: default_max,
            confidence: Confidence::High,
            reason: "majority of tasks are test-like; default parallelism is safe".to_string(),
        };
    }
    if overlap_ratio > 0.3 {
        return ParallelismRecommendation {
            recommended_workers: ((default_max as f64) * 0.5).round() as usize,
            confidence: Confidence::Medium,
            reason: "over 30% of tasks share an affected file; reducing parallelism".to_string(),
        };
    }
    if refactor_ratio >= 0.25 {
        return ParallelismRecommendation {
            recommended_workers: ((default_max as f64) * 0.75).round() as usize,
            confidence: Confidence::Medium,
            reason: "25-50% of tasks are refactor-like; moderately reducing parallelism"
                .to_string(),
        };
    }
    ParallelismRecommendation {
        recommended_workers: default_max,
        confidence: Confidence::Low,
        reason: "no strong signal from task metadata; using default worker count".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    fn task(id: &str, priority: i64, depends_on: &[&str]) -> Task {
        Task {
            id: id.to_string(),
            title: id.to_string(),
            status: crate::task::TaskStatus::Open,
            priority,
            description: None,
            labels: vec![],
            r#type: None,
            assignee: None,
            parent_id: None,
            created_at: None,
            updated_at: None,
            metadata: Map::new(),
            depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
            blocks: HashSet::new(),
        }
    }

    #[test]
    fn linear_chain_produces_one_task_per_depth() {
        let tasks = vec![task("a", 0, &[]), task("b", 0, &["a"]), task("c", 0, &["b"])];
        let analysis = analyze_task_graph(&tasks);
        assert_eq!(analysis.groups.len(), 3);
        assert_eq!(analysis.groups[0].tasks[0].id, "a");
        assert_eq!(analysis.groups[2].tasks[0].id, "c");
        assert!(analysis.cyclic_task_ids.is_empty());
    }

    #[test]
    fn independent_tasks_form_one_group_sorted_by_priority() {
        let tasks = vec![task("a", 5, &[]), task("b", 1, &[]), task("c", 3, &[])];
        let analysis = analyze_task_graph(&tasks);
        assert_eq!(analysis.groups.len(), 1);
        let ids: Vec<&str> = analysis.groups[0].tasks.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
    }

    #[test]
    fn cycle_is_detected_and_excluded_from_groups() {
        let mut a = task("a", 0, &["b"]);
        let b = task("b", 0, &["a"]);
        a.depends_on.insert("b".to_string());
        let tasks = vec![a, b];
        let analysis = analyze_task_graph(&tasks);
        assert_eq!(analysis.cyclic_task_ids.len(), 2);
        assert!(analysis.groups.is_empty());
    }

    #[test]
    fn should_run_parallel_requires_three_actionable_and_a_group_of_two() {
        let tasks = vec![task("a", 0, &[]), task("b", 0, &[]), task("c", 0, &[])];
        let analysis = analyze_task_graph(&tasks);
        assert!(should_run_parallel(&analysis));

        let too_few = vec![task("a", 0, &[]), task("b", 0, &[])];
        let analysis_few = analyze_task_graph(&too_few);
        assert!(!should_run_parallel(&analysis_few));
    }

    #[test]
    fn recommend_parallelism_downshifts_for_refactor_heavy_backlog() {
        let mut tasks = vec![task("a", 0, &[]), task("b", 0, &[]), task("c", 0, &[])];
        for t in tasks.iter_mut() {
            t.r#type = Some("refactor".to_string());
        }
        let analysis = analyze_task_graph(&tasks);
        let rec = recommend_parallelism(&tasks, &analysis, 6);
        assert_eq!(rec.recommended_workers, 2);
        assert_eq!(rec.confidence, Confidence::High);
    }
}
