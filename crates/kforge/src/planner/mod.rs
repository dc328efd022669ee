use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::error::{Error, Result};

pub type TaskId = String;

/// One pipeline step.
///
/// `after` entries name either another task id or a token some task lists in
/// `provides` (e.g. `kernel:source`).
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub label: String,
    pub module: String,
    pub phase: String,
    pub after: Vec<TaskId>,
    pub provides: Vec<String>,
}

#[derive(Debug, Default)]
pub struct Plan {
    tasks: BTreeMap<TaskId, Task>,
}

impl Plan {
    pub fn add(&mut self, task: Task) -> Result<()> {
        if self.tasks.contains_key(&task.id) {
            return Err(Error::msg(format!("duplicate task id '{}'", task.id)));
        }
        self.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    fn provides_index(&self) -> Result<BTreeMap<&str, &str>> {
        let mut out: BTreeMap<&str, &str> = BTreeMap::new();
        for (id, task) in &self.tasks {
            for p in &task.provides {
                if let Some(existing) = out.insert(p.as_str(), id.as_str()) {
                    return Err(Error::msg(format!(
                        "provide token '{}' is produced by both '{}' and '{}'",
                        p, existing, id
                    )));
                }
            }
        }
        Ok(out)
    }

    fn resolve_dep<'a>(&'a self, provides: &BTreeMap<&'a str, &'a str>, dep: &'a str) -> Option<&'a str> {
        if self.tasks.contains_key(dep) {
            return Some(dep);
        }
        provides.get(dep).copied()
    }

    /// Topological order; ties are broken by task id so the order is stable.
    pub fn ordered(&self) -> Result<Vec<&Task>> {
        let provides = self.provides_index()?;

        let mut pending: BTreeMap<&str, usize> = BTreeMap::new();
        let mut dependents: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();

        for id in self.tasks.keys() {
            pending.insert(id.as_str(), 0);
            dependents.entry(id.as_str()).or_default();
        }
        for (id, task) in &self.tasks {
            for dep in &task.after {
                let dep_id = self.resolve_dep(&provides, dep.as_str()).ok_or_else(|| {
                    Error::msg(format!(
                        "task '{}' has invalid dependency '{}': unknown task or token",
                        id, dep
                    ))
                })?;
                if dependents.entry(dep_id).or_default().insert(id.as_str())
                    && let Some(n) = pending.get_mut(id.as_str())
                {
                    *n += 1;
                }
            }
        }

        let mut ready: VecDeque<&str> = pending
            .iter()
            .filter_map(|(k, v)| (*v == 0).then_some(*k))
            .collect();
        let mut out: Vec<&Task> = Vec::with_capacity(self.tasks.len());

        while let Some(id) = ready.pop_front() {
            if let Some(task) = self.tasks.get(id) {
                out.push(task);
            }
            for &child in dependents.get(id).into_iter().flatten() {
                if let Some(n) = pending.get_mut(child) {
                    *n -= 1;
                    if *n == 0 {
                        ready.push_back(child);
                    }
                }
            }
        }

        if out.len() != self.tasks.len() {
            let remaining: Vec<&str> = pending
                .iter()
                .filter_map(|(k, v)| (*v > 0).then_some(*k))
                .collect();
            return Err(Error::msg(format!(
                "task graph contains a cycle; remaining nodes: {}",
                remaining.join(", ")
            )));
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, after: &[&str], provides: &[&str]) -> Task {
        Task {
            id: id.into(),
            label: id.into(),
            module: "test".into(),
            phase: "test".into(),
            after: after.iter().map(|s| s.to_string()).collect(),
            provides: provides.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn orders_by_tokens_and_ids() {
        let mut plan = Plan::default();
        plan.add(task("b.compile", &["a:config"], &[])).unwrap();
        plan.add(task("a.configure", &["a.fetch"], &["a:config"])).unwrap();
        plan.add(task("a.fetch", &[], &[])).unwrap();

        let ids: Vec<&str> = plan.ordered().unwrap().iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["a.fetch", "a.configure", "b.compile"]);
    }

    #[test]
    fn rejects_unknown_dependency() {
        let mut plan = Plan::default();
        plan.add(task("a", &["missing:token"], &[])).unwrap();
        let err = plan.ordered().unwrap_err().to_string();
        assert!(err.contains("missing:token"), "unexpected err: {err}");
    }

    #[test]
    fn rejects_cycles_and_duplicates() {
        let mut plan = Plan::default();
        plan.add(task("a", &["b"], &[])).unwrap();
        plan.add(task("b", &["a"], &[])).unwrap();
        assert!(plan.ordered().unwrap_err().to_string().contains("cycle"));
        assert!(plan.add(task("a", &[], &[])).is_err());
    }
}
