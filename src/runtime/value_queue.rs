use std::collections::{BTreeMap, VecDeque};
use serde::{Serialize, Deserialize};
use serde_json::Value;
use crate::runtime::ValueMap;

/// Values supplied for a single requirement of a task, in arrival order.
///
/// A repeatable queue belongs to a callback name: its values may be supplied
/// any number of times while the task is blocked.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValueQueue {
    values: VecDeque<Value>,
    #[serde(default)]
    repeatable: bool,
}

impl ValueQueue {
    pub fn new(repeatable: bool) -> Self {
        Self {
            values: VecDeque::new(),
            repeatable,
        }
    }

    pub fn push(&mut self, value: Value) {
        self.values.push_back(value);
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_repeatable(&self) -> bool {
        self.repeatable
    }

    /// Removes and returns the oldest pending value.
    pub fn pop(&mut self) -> Option<Value> {
        self.values.pop_front()
    }

    /// Returns the oldest pending value without removing it.
    pub fn top(&self) -> Option<&Value> {
        self.values.front()
    }

    /// Removes and returns every pending value.
    pub fn consume(&mut self) -> Vec<Value> {
        self.values.drain(..).collect()
    }

    /// Returns every pending value, leaving the queue untouched.
    pub fn peek(&self) -> Vec<Value> {
        self.values.iter().cloned().collect()
    }
}

/// The set of value queues owned by one task, keyed by requirement name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ValueQueueManager {
    queues: BTreeMap<String, ValueQueue>,
}

impl ValueQueueManager {
    /// Creates one queue per requirement and one repeatable queue per callback.
    pub fn new<'a>(
        requires: impl IntoIterator<Item = &'a String>,
        callbacks: impl IntoIterator<Item = &'a String>,
    ) -> Self {
        let mut queues = BTreeMap::new();
        for name in requires {
            queues.insert(name.clone(), ValueQueue::new(false));
        }
        for name in callbacks {
            queues.entry(name.clone()).or_insert_with(|| ValueQueue::new(true)).repeatable = true;
        }
        Self { queues }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.queues.contains_key(name)
    }

    pub fn queue(&self, name: &str) -> Option<&ValueQueue> {
        self.queues.get(name)
    }

    /// Appends a value to the named queue. Returns false if the task has no
    /// such queue.
    pub fn push(&mut self, name: &str, value: Value) -> bool {
        match self.queues.get_mut(name) {
            Some(queue) => {
                queue.push(value);
                true
            }
            None => false,
        }
    }

    /// True when every listed queue has at least one pending value.
    pub fn all_have_content<'a>(&self, names: impl IntoIterator<Item = &'a String>) -> bool {
        names.into_iter().all(|name| {
            self.queues.get(name).map(|q| !q.is_empty()).unwrap_or(false)
        })
    }

    /// Pops the head of every non-empty queue. This is what a task run
    /// consumes.
    pub fn take_top_all(&mut self) -> ValueMap {
        let mut taken = ValueMap::new();
        for (name, queue) in self.queues.iter_mut() {
            if let Some(value) = queue.pop() {
                taken.insert(name.clone(), value);
            }
        }
        taken
    }

    /// Reads the head of every non-empty queue without consuming it.
    pub fn peek_top_all(&self) -> ValueMap {
        let mut peeked = ValueMap::new();
        for (name, queue) in &self.queues {
            if let Some(value) = queue.top() {
                peeked.insert(name.clone(), value.clone());
            }
        }
        peeked
    }

    /// Replays the pending contents of a serialized manager into this one.
    /// Queues unknown to this manager are rejected by name.
    pub fn restore_from(&mut self, other: &ValueQueueManager) -> Result<(), String> {
        for (name, queue) in &other.queues {
            let target = self.queues.get_mut(name).ok_or_else(|| name.clone())?;
            for value in queue.peek() {
                target.push(value);
            }
        }
        Ok(())
    }
}
