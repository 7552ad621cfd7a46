//! Task dependency graph
//!
//! Tasks declare the fields they read and write. A task depends on every
//! other task writing a field it reads. [`DependencyGraph::build_schedule`]
//! orders tasks with Kahn's algorithm, seeding and breaking ties in
//! insertion order so the result is reproducible.
//!
//! Two tasks writing the same field without a read dependency between them
//! are left unordered; [`DependencyGraph::write_conflicts`] lists such pairs.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Write as _;

use indexmap::IndexMap;
use serde::Serialize;

/// Errors raised while building or validating the task graph.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    /// A task with this name already exists.
    #[error("task '{0}' already exists")]
    DuplicateTask(String),
    /// No task has this name.
    #[error("task '{0}' does not exist")]
    UnknownTask(String),
    /// A task references a field that was never declared.
    #[error("task '{task}' references unknown field '{field}'")]
    UnknownField {
        /// Task name.
        task: String,
        /// Field name.
        field: String,
    },
    /// A field is still referenced by a task.
    #[error("field '{field}' is still used by task '{task}'")]
    FieldInUse {
        /// Field name.
        field: String,
        /// First task referencing it.
        task: String,
    },
    /// The read/write relations form a cycle.
    #[error("cyclic dependency among tasks [{}] (cycle: {})", .unresolved.join(", "), .cycle.join(" -> "))]
    CyclicDependency {
        /// Every task that could not be scheduled, in insertion order.
        unresolved: Vec<String>,
        /// One concrete cycle, closed by repeating its first task.
        cycle: Vec<String>,
    },
    /// The schedule was built before the task set last changed.
    #[error("schedule from generation {schedule} is stale, graph is at generation {current}")]
    StaleSchedule {
        /// Generation the schedule was built from.
        schedule: u64,
        /// Current graph generation.
        current: u64,
    },
}

/// One schedulable unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskNode {
    /// Unique name, also the kernel lookup key.
    pub name: String,
    /// Fields read, in declaration order, without repeats.
    pub reads: Vec<String>,
    /// Fields written, in declaration order, without repeats.
    pub writes: Vec<String>,
    /// Tasks writing a field this task reads. Refreshed by
    /// [`DependencyGraph::build_schedule`].
    pub predecessors: Vec<String>,
}

/// A task as it appears in a [`Schedule`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduledTask {
    /// Task name.
    pub name: String,
    /// Fields read.
    pub reads: Vec<String>,
    /// Fields written.
    pub writes: Vec<String>,
}

/// Topologically ordered task list tagged with the graph generation it was
/// built from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Schedule {
    tasks: Vec<ScheduledTask>,
    generation: u64,
}

impl Schedule {
    /// Tasks in execution order.
    pub fn tasks(&self) -> &[ScheduledTask] {
        &self.tasks
    }

    /// Task names in execution order.
    pub fn names(&self) -> Vec<&str> {
        self.tasks.iter().map(|t| t.name.as_str()).collect()
    }

    /// Position of `name`.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.tasks.iter().position(|t| t.name == name)
    }

    /// Number of tasks.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether the schedule is empty.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Graph generation the schedule was built from.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Two tasks writing the same field with no dependency path between them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteConflict {
    /// Field written by both.
    pub field: String,
    /// Earlier task in insertion order.
    pub first: String,
    /// Later task in insertion order.
    pub second: String,
}

/// The task set and its derived dependencies.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    tasks: IndexMap<String, TaskNode>,
    fields: Option<HashSet<String>>,
    generation: u64,
}

fn dedup(names: impl IntoIterator<Item = impl Into<String>>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for n in names {
        let n = n.into();
        if !out.contains(&n) {
            out.push(n);
        }
    }
    out
}

impl DependencyGraph {
    /// Graph accepting any field name.
    pub fn new() -> Self {
        Self::default()
    }

    /// Graph that rejects tasks referencing fields outside `fields`.
    pub fn with_fields(fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            fields: Some(fields.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }

    /// Allow `field` in task declarations. Turns on field checking if it
    /// was off.
    pub fn declare_field(&mut self, field: impl Into<String>) {
        self.fields
            .get_or_insert_with(HashSet::new)
            .insert(field.into());
    }

    /// Fails if a task reads or writes `field`.
    pub fn ensure_unused(&self, field: &str) -> Result<(), GraphError> {
        match self
            .tasks
            .values()
            .find(|t| t.reads.iter().chain(&t.writes).any(|f| f == field))
        {
            Some(task) => Err(GraphError::FieldInUse {
                field: field.to_string(),
                task: task.name.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Stop allowing `field`. Fails if a task still references it.
    pub fn forget_field(&mut self, field: &str) -> Result<(), GraphError> {
        self.ensure_unused(field)?;
        if let Some(fields) = &mut self.fields {
            fields.remove(field);
        }
        Ok(())
    }

    /// Register a task. Repeated field names are collapsed.
    pub fn add_task(
        &mut self,
        name: impl Into<String>,
        reads: impl IntoIterator<Item = impl Into<String>>,
        writes: impl IntoIterator<Item = impl Into<String>>,
    ) -> Result<(), GraphError> {
        let name = name.into();
        if self.tasks.contains_key(&name) {
            return Err(GraphError::DuplicateTask(name));
        }
        let reads = dedup(reads);
        let writes = dedup(writes);
        if let Some(fields) = &self.fields {
            if let Some(field) = reads.iter().chain(&writes).find(|f| !fields.contains(*f)) {
                return Err(GraphError::UnknownField {
                    task: name,
                    field: field.clone(),
                });
            }
        }
        tracing::debug!("Task '{}' reads {:?} writes {:?}", name, reads, writes);
        self.tasks.insert(
            name.clone(),
            TaskNode {
                name,
                reads,
                writes,
                predecessors: Vec::new(),
            },
        );
        self.generation += 1;
        Ok(())
    }

    /// Remove a task, keeping the insertion order of the others.
    pub fn remove_task(&mut self, name: &str) -> Result<TaskNode, GraphError> {
        let node = self
            .tasks
            .shift_remove(name)
            .ok_or_else(|| GraphError::UnknownTask(name.to_string()))?;
        self.generation += 1;
        Ok(node)
    }

    /// Task by name.
    pub fn task(&self, name: &str) -> Option<&TaskNode> {
        self.tasks.get(name)
    }

    /// Tasks in insertion order.
    pub fn tasks(&self) -> impl Iterator<Item = &TaskNode> {
        self.tasks.values()
    }

    /// Number of tasks.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether there are no tasks.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Incremented on every add or remove.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Fail if `schedule` predates the last change to the task set.
    pub fn ensure_current(&self, schedule: &Schedule) -> Result<(), GraphError> {
        if schedule.generation != self.generation {
            return Err(GraphError::StaleSchedule {
                schedule: schedule.generation,
                current: self.generation,
            });
        }
        Ok(())
    }

    /// Predecessor indices per task, in insertion order.
    fn predecessor_indices(&self) -> Vec<Vec<usize>> {
        let mut writers: HashMap<&str, Vec<usize>> = HashMap::new();
        for (i, t) in self.tasks.values().enumerate() {
            for w in &t.writes {
                writers.entry(w.as_str()).or_default().push(i);
            }
        }
        self.tasks
            .values()
            .enumerate()
            .map(|(i, t)| {
                let mut preds: Vec<usize> = t
                    .reads
                    .iter()
                    .filter_map(|r| writers.get(r.as_str()))
                    .flatten()
                    .copied()
                    .filter(|&p| p != i)
                    .collect();
                preds.sort_unstable();
                preds.dedup();
                preds
            })
            .collect()
    }

    /// Recompute predecessors and order the tasks.
    ///
    /// Fails with [`GraphError::CyclicDependency`] naming every task that
    /// could not be placed and one cycle among them.
    pub fn build_schedule(&mut self) -> Result<Schedule, GraphError> {
        let preds = self.predecessor_indices();
        let names: Vec<String> = self.tasks.keys().cloned().collect();
        for (node, p) in self.tasks.values_mut().zip(&preds) {
            node.predecessors = p.iter().map(|&i| names[i].clone()).collect();
        }

        let n = preds.len();
        let mut in_degree: Vec<usize> = preds.iter().map(Vec::len).collect();
        let mut dependents = vec![Vec::new(); n];
        for (i, p) in preds.iter().enumerate() {
            for &j in p {
                dependents[j].push(i);
            }
        }

        let mut ready: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(n);
        while let Some(i) = ready.pop_front() {
            order.push(i);
            for &d in &dependents[i] {
                in_degree[d] -= 1;
                if in_degree[d] == 0 {
                    ready.push_back(d);
                }
            }
        }

        if order.len() < n {
            let unresolved: Vec<usize> = (0..n).filter(|&i| in_degree[i] > 0).collect();
            let cycle = find_cycle(&preds, &in_degree, unresolved[0]);
            let err = GraphError::CyclicDependency {
                unresolved: unresolved.iter().map(|&i| names[i].clone()).collect(),
                cycle: cycle.into_iter().map(|i| names[i].clone()).collect(),
            };
            tracing::warn!("{}", err);
            return Err(err);
        }

        let tasks = order
            .into_iter()
            .filter_map(|i| self.tasks.get_index(i))
            .map(|(_, t)| ScheduledTask {
                name: t.name.clone(),
                reads: t.reads.clone(),
                writes: t.writes.clone(),
            })
            .collect();
        Ok(Schedule {
            tasks,
            generation: self.generation,
        })
    }

    /// Graphviz DOT rendering of every task and every predecessor edge,
    /// edges labelled with the fields carrying the dependency. Does not
    /// modify the graph.
    pub fn export_diagnostic(&self) -> String {
        let preds = self.predecessor_indices();
        let names: Vec<&TaskNode> = self.tasks.values().collect();
        let mut out = String::from("digraph tasks {\n    rankdir=LR;\n    node [shape=box];\n");
        for t in &names {
            let _ = writeln!(
                out,
                "    \"{}\" [label=\"{}\\nreads: {}\\nwrites: {}\"];",
                escape(&t.name),
                escape(&t.name),
                escape(&t.reads.join(", ")),
                escape(&t.writes.join(", "))
            );
        }
        for (i, p) in preds.iter().enumerate() {
            let to = names[i];
            for &j in p {
                let from = names[j];
                let carried: Vec<&str> = to
                    .reads
                    .iter()
                    .filter(|r| from.writes.contains(r))
                    .map(String::as_str)
                    .collect();
                let _ = writeln!(
                    out,
                    "    \"{}\" -> \"{}\" [label=\"{}\"];",
                    escape(&from.name),
                    escape(&to.name),
                    escape(&carried.join(", "))
                );
            }
        }
        out.push_str("}\n");
        out
    }

    /// Pairs of tasks writing the same field with no dependency path
    /// between them, in insertion order.
    pub fn write_conflicts(&self) -> Vec<WriteConflict> {
        let preds = self.predecessor_indices();
        let names: Vec<&str> = self.tasks.keys().map(String::as_str).collect();
        let mut writers: IndexMap<&str, Vec<usize>> = IndexMap::new();
        for (i, t) in self.tasks.values().enumerate() {
            for w in &t.writes {
                writers.entry(w.as_str()).or_default().push(i);
            }
        }
        let mut conflicts = Vec::new();
        for (field, ws) in writers {
            for (k, &a) in ws.iter().enumerate() {
                for &b in &ws[k + 1..] {
                    if !reaches(&preds, a, b) && !reaches(&preds, b, a) {
                        conflicts.push(WriteConflict {
                            field: field.to_string(),
                            first: names[a].to_string(),
                            second: names[b].to_string(),
                        });
                    }
                }
            }
        }
        conflicts
    }
}

/// Whether `to` transitively depends on `from`.
fn reaches(preds: &[Vec<usize>], from: usize, to: usize) -> bool {
    let mut stack = vec![to];
    let mut seen = vec![false; preds.len()];
    while let Some(i) = stack.pop() {
        for &p in &preds[i] {
            if p == from {
                return true;
            }
            if !seen[p] {
                seen[p] = true;
                stack.push(p);
            }
        }
    }
    false
}

/// Walk unresolved predecessors from `start` until a task repeats. Every
/// unresolved task has an unresolved predecessor, so the walk always closes.
/// Returns the cycle in dependency order, closed by its first task.
fn find_cycle(preds: &[Vec<usize>], in_degree: &[usize], start: usize) -> Vec<usize> {
    let mut path = vec![start];
    let mut position = HashMap::from([(start, 0usize)]);
    let mut current = start;
    loop {
        let Some(&next) = preds[current].iter().find(|&&p| in_degree[p] > 0) else {
            return path;
        };
        if let Some(&at) = position.get(&next) {
            let mut cycle: Vec<usize> = path[at..].to_vec();
            cycle.reverse();
            cycle.push(cycle[0]);
            return cycle;
        }
        position.insert(next, path.len());
        path.push(next);
        current = next;
    }
}

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}
