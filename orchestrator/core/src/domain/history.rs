// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Information History
//!
//! Thread-safe DAG of [`Information`] vertices keyed by id, with a
//! parent → child edge for every record that names a parent.
//!
//! Writers lock per vertex id rather than globally: inserts of unrelated
//! records proceed in parallel, while two inserts touching the same id (or
//! the same parent) serialize. When both the record and its parent must be
//! locked, locks are taken in id order. A lock entry is dropped once no
//! writer holds or waits on it.
//!
//! # Architecture
//!
//! - **Layer:** Domain
//! - **Purpose:** Track derivation of information across agents

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::domain::information::Information;

#[derive(Default)]
pub struct History {
    locks: DashMap<String, Arc<Mutex<()>>>,
    vertices: DashMap<String, Information>,
    children: DashMap<String, BTreeSet<String>>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Upsert `information` and link it under its parent, creating a
    /// placeholder parent vertex when the parent has not been seen yet.
    pub fn add(&self, information: Information) {
        let id = information.id.clone();
        let parent_id = information.parent_id.clone().filter(|p| *p != id);

        let mut ids: Vec<String> = vec![id];
        if let Some(parent) = &parent_id {
            ids.push(parent.clone());
        }
        ids.sort_unstable();

        let locks: Vec<Arc<Mutex<()>>> = ids.iter().map(|id| self.lock_for(id)).collect();
        {
            let _guards: Vec<_> = locks.iter().map(|lock| lock.lock()).collect();
            self.insert_locked(information, parent_id);
        }
        drop(locks);

        for id in &ids {
            self.locks.remove_if(id.as_str(), |_, lock| Arc::strong_count(lock) == 1);
        }
    }

    fn insert_locked(&self, information: Information, parent_id: Option<String>) {
        let id = information.id.clone();
        self.vertices
            .entry(id.clone())
            .and_modify(|existing| existing.merge_from(&information))
            .or_insert(information);

        if let Some(parent) = parent_id {
            self.vertices
                .entry(parent.clone())
                .or_insert_with(|| Information::with_id(parent.clone(), None));
            self.children.entry(parent).or_default().insert(id);
        }
    }

    pub fn vertex(&self, id: &str) -> Option<Information> {
        self.vertices.get(id).map(|v| v.clone())
    }

    pub fn parent_of(&self, id: &str) -> Option<String> {
        self.vertices.get(id).and_then(|v| v.parent_id.clone())
    }

    pub fn children(&self, id: &str) -> Vec<String> {
        self.children
            .get(id)
            .map(|c| c.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.vertices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    #[cfg(test)]
    fn lock_count(&self) -> usize {
        self.locks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::data::Data;

    #[test]
    fn test_child_before_parent_creates_placeholder() {
        let history = History::new();
        history.add(Information::with_id("child", Some("root".to_string())));

        assert_eq!(history.len(), 2);
        assert_eq!(history.children("root"), vec!["child".to_string()]);
        assert_eq!(history.parent_of("child").as_deref(), Some("root"));
        assert!(history.vertex("root").unwrap().input.is_none());
    }

    #[test]
    fn test_upsert_merges_fields() {
        let history = History::new();
        let mut first = Information::with_id("i1", None);
        first.set_input(Data::new().with("q", "1"), "ag1", "t0");
        history.add(first);

        let mut second = Information::with_id("i1", None);
        second.set_output(Data::new().with("a", "2"), "ag2", "t1");
        history.add(second);

        let merged = history.vertex("i1").unwrap();
        assert_eq!(merged.input_agent_id.as_deref(), Some("ag1"));
        assert_eq!(merged.output_agent_id.as_deref(), Some("ag2"));
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn test_self_parent_is_ignored() {
        let history = History::new();
        history.add(Information::with_id("loop", Some("loop".to_string())));
        assert!(history.children("loop").is_empty());
    }

    #[test]
    fn test_concurrent_inserts_under_one_parent() {
        let history = Arc::new(History::new());
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let history = history.clone();
                std::thread::spawn(move || {
                    history.add(Information::with_id(format!("c{i}"), Some("root".to_string())));
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(history.children("root").len(), 16);
        assert_eq!(history.len(), 17);
        assert_eq!(history.lock_count(), 0);
    }
}
