use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub done: u64,
    pub total: u64,
}

impl Progress {
    pub fn new(done: u64, total: u64) -> Self {
        Self { done, total }
    }

    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (self.done.min(self.total) as f64 / self.total as f64) * 100.0
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TaskState {
    Waiting,
    Running,
    Done,
    Failed,
}

/// Task/subtask tree. Groups derive their state and percentage from their
/// children, weighting every child equally.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum TaskNode {
    Task {
        name: String,
        state: TaskState,
        progress: Progress,
    },
    Group {
        name: String,
        children: Vec<TaskNode>,
    },
}

impl TaskNode {
    pub fn task(name: impl Into<String>) -> Self {
        TaskNode::Task {
            name: name.into(),
            state: TaskState::Waiting,
            progress: Progress::default(),
        }
    }

    pub fn group(name: impl Into<String>, children: Vec<TaskNode>) -> Self {
        TaskNode::Group {
            name: name.into(),
            children,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            TaskNode::Task { name, .. } | TaskNode::Group { name, .. } => name,
        }
    }

    pub fn state(&self) -> TaskState {
        match self {
            TaskNode::Task { state, .. } => *state,
            TaskNode::Group { children, .. } => {
                let states: Vec<_> = children.iter().map(TaskNode::state).collect();
                if states.contains(&TaskState::Failed) {
                    TaskState::Failed
                } else if states.iter().all(|s| *s == TaskState::Done) {
                    TaskState::Done
                } else if states.iter().all(|s| *s == TaskState::Waiting) {
                    TaskState::Waiting
                } else {
                    TaskState::Running
                }
            }
        }
    }

    pub fn percent(&self) -> f64 {
        match self {
            TaskNode::Task { state, progress, .. } => match state {
                TaskState::Done => 100.0,
                _ => progress.percent(),
            },
            TaskNode::Group { children, .. } if children.is_empty() => 0.0,
            TaskNode::Group { children, .. } => {
                children.iter().map(TaskNode::percent).sum::<f64>() / children.len() as f64
            }
        }
    }

    /// Summed counts of every leaf below this node.
    pub fn progress(&self) -> Progress {
        match self {
            TaskNode::Task { progress, .. } => *progress,
            TaskNode::Group { children, .. } => children.iter().map(TaskNode::progress).fold(
                Progress::default(),
                |acc, p| Progress::new(acc.done + p.done, acc.total + p.total),
            ),
        }
    }

    pub fn find_mut(&mut self, target: &str) -> Option<&mut TaskNode> {
        if self.name() == target {
            return Some(self);
        }
        match self {
            TaskNode::Task { .. } => None,
            TaskNode::Group { children, .. } => {
                children.iter_mut().find_map(|child| child.find_mut(target))
            }
        }
    }

    /// Updates a leaf; groups and unknown names are left alone.
    pub fn update(&mut self, target: &str, state: TaskState, update: Progress) {
        if let Some(TaskNode::Task {
            state: s, progress, ..
        }) = self.find_mut(target)
        {
            *s = state;
            *progress = update;
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ProgressUpdate<'a> {
    pub task: &'a str,
    pub done: u64,
    pub total: u64,
    /// Overall completion of the whole tree.
    pub percent: f64,
}

/// Receives progress from long operations, e.g. to relay to a task queue.
pub trait ProgressSink: Send + Sync {
    fn report(&self, update: ProgressUpdate<'_>);
}

impl<F> ProgressSink for F
where
    F: Fn(ProgressUpdate<'_>) + Send + Sync,
{
    fn report(&self, update: ProgressUpdate<'_>) {
        self(update)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _update: ProgressUpdate<'_>) {}
}

/// Reports the state of `task` inside `tree`.
pub fn report_task(sink: &dyn ProgressSink, tree: &TaskNode, task: &str, progress: Progress) {
    sink.report(ProgressUpdate {
        task,
        done: progress.done,
        total: progress.total,
        percent: tree.percent(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn pipeline() -> TaskNode {
        TaskNode::group(
            "backup",
            vec![
                TaskNode::task("scan"),
                TaskNode::group("hash", vec![TaskNode::task("files"), TaskNode::task("chunks")]),
            ],
        )
    }

    #[test]
    fn test_group_state_and_percent() {
        let mut tree = pipeline();
        assert_eq!(tree.state(), TaskState::Waiting);
        assert_eq!(tree.percent(), 0.0);

        tree.update("scan", TaskState::Done, Progress::new(10, 10));
        tree.update("files", TaskState::Running, Progress::new(5, 10));
        assert_eq!(tree.state(), TaskState::Running);
        // scan = 100, hash = (50 + 0) / 2
        assert_eq!(tree.percent(), 62.5);
        assert_eq!(tree.progress(), Progress::new(15, 20));

        tree.update("chunks", TaskState::Failed, Progress::new(0, 3));
        assert_eq!(tree.state(), TaskState::Failed);
    }

    #[test]
    fn test_updating_a_group_name_is_ignored() {
        let mut tree = pipeline();
        tree.update("hash", TaskState::Done, Progress::new(1, 1));
        assert_eq!(tree.state(), TaskState::Waiting);
    }

    #[test]
    fn test_closure_sink() {
        let seen = Mutex::new(Vec::new());
        let sink = |update: ProgressUpdate<'_>| {
            seen.lock().unwrap().push((update.task.to_string(), update.done));
        };
        let tree = pipeline();
        report_task(&sink, &tree, "scan", Progress::new(3, 9));
        assert_eq!(seen.lock().unwrap().as_slice(), &[("scan".to_string(), 3)]);
    }
}
