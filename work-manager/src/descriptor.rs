//! Queue-descriptor registry.
//!
//! A descriptor is immutable once its pool exists; the registry itself is
//! read-only after activation. Merging, hot-reload and the actual
//! configuration-file loader belong to the surrounding application —
//! this module only holds the resolved data and answers
//! `queue_id_for_category`/`descriptor`.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::error::{Result, WorkManagerError};

/// The id every manager falls back to when a category has no explicit
/// binding and no descriptor claims it.
pub const DEFAULT_QUEUE_ID: &str = "default";

/// Configuration for a single named queue.
///
/// `Deserialize`/`Serialize` so an external registry loader — not part of
/// this crate — can read descriptors from whatever configuration format the
/// host application already uses.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct QueueDescriptor {
    /// Stable id used to look the queue up.
    pub id: String,

    /// Human-readable name.
    pub name: String,

    /// Category strings that route to this queue.
    #[builder(default)]
    pub category_bindings: Vec<String>,

    /// Fixed worker-thread count for the pool. Non-positive values are
    /// replaced by 4.
    #[builder(default = 4)]
    pub max_threads: i32,

    /// Backpressure capacity for the FIFO queue. Ignored when
    /// `use_priority` is set.
    #[builder(default = 0)]
    pub capacity: usize,

    /// Use an unbounded priority queue instead of the bounded FIFO.
    #[builder(default)]
    pub use_priority: bool,

    /// How long a completed entry survives before time-based cleanup
    /// reclaims it. `None` disables time-based cleanup for this queue.
    #[builder(default)]
    pub clear_completed_after: Option<Duration>,
}

impl QueueDescriptor {
    /// Effective worker-thread count (`max_threads <= 0` becomes 4).
    pub fn effective_max_threads(&self) -> usize {
        if self.max_threads <= 0 {
            4
        } else {
            self.max_threads as usize
        }
    }

    /// Effective capacity: priority queues are always unbounded regardless
    /// of a configured `capacity`.
    pub fn effective_capacity(&self) -> Option<usize> {
        if self.use_priority {
            None
        } else if self.capacity == 0 {
            None
        } else {
            Some(self.capacity)
        }
    }
}

/// A read-only, activation-time-built table of queue descriptors plus the
/// category -> queue id bindings derived from them.
#[derive(Debug)]
pub struct DescriptorRegistry {
    descriptors: HashMap<String, QueueDescriptor>,
    category_bindings: HashMap<String, String>,
    default_queue_id: String,
}

impl Default for DescriptorRegistry {
    fn default() -> Self {
        Self::with_default_queue_id(DEFAULT_QUEUE_ID)
    }
}

impl DescriptorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Like [`DescriptorRegistry::new`], but falls back to `default_queue_id`
    /// instead of the crate's own [`DEFAULT_QUEUE_ID`] constant when a
    /// category has no explicit binding (spec.md §4.B, wired from
    /// [`crate::config::WorkManagerConfig::default_queue_id`]).
    pub fn with_default_queue_id(default_queue_id: impl Into<String>) -> Self {
        Self {
            descriptors: HashMap::new(),
            category_bindings: HashMap::new(),
            default_queue_id: default_queue_id.into(),
        }
    }

    /// Build a registry from a fixed set of descriptors, keyed by id.
    /// Later entries with the same id replace earlier ones, and later
    /// category bindings for an already-bound category win — merge policy
    /// belongs to the surrounding component framework, this is just
    /// last-write-wins.
    pub fn from_descriptors(descriptors: impl IntoIterator<Item = QueueDescriptor>) -> Self {
        let mut registry = Self::new();
        for descriptor in descriptors {
            registry.register(descriptor);
        }
        registry
    }

    /// Register (or replace) a single descriptor (spec.md §6
    /// `registerContribution`).
    pub fn register(&mut self, descriptor: QueueDescriptor) {
        if descriptor.use_priority && descriptor.capacity > 0 {
            tracing::warn!(
                queue_id = %descriptor.id,
                capacity = descriptor.capacity,
                "use_priority is set; capacity is ignored and the dispatch queue is unbounded"
            );
        }
        for category in &descriptor.category_bindings {
            self.category_bindings
                .insert(category.clone(), descriptor.id.clone());
        }
        self.descriptors.insert(descriptor.id.clone(), descriptor);
    }

    /// Resolution policy (spec.md §4.B): explicit binding, else this
    /// registry's configured default queue id, else fail.
    pub fn queue_id_for_category(&self, category: Option<&str>) -> Result<String> {
        if let Some(category) = category {
            if let Some(id) = self.category_bindings.get(category) {
                return Ok(id.clone());
            }
        }
        if self.descriptors.contains_key(&self.default_queue_id) {
            Ok(self.default_queue_id.clone())
        } else {
            Err(WorkManagerError::UnknownQueue(
                category.unwrap_or("<none>").to_string(),
            ))
        }
    }

    pub fn descriptor(&self, queue_id: &str) -> Result<QueueDescriptor> {
        self.descriptors
            .get(queue_id)
            .cloned()
            .ok_or_else(|| WorkManagerError::UnknownQueue(queue_id.to_string()))
    }

    pub fn ids(&self) -> Vec<String> {
        self.descriptors.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(id: &str, categories: &[&str]) -> QueueDescriptor {
        QueueDescriptor::builder()
            .id(id)
            .name(id)
            .category_bindings(categories.iter().map(|s| s.to_string()).collect::<Vec<_>>())
            .build()
    }

    #[test]
    fn resolves_explicit_binding() {
        let registry = DescriptorRegistry::from_descriptors([desc("emails", &["email:send"])]);
        assert_eq!(
            registry.queue_id_for_category(Some("email:send")).unwrap(),
            "emails"
        );
    }

    #[test]
    fn falls_back_to_default() {
        let registry =
            DescriptorRegistry::from_descriptors([desc("default", &[]), desc("emails", &[])]);
        assert_eq!(
            registry.queue_id_for_category(Some("unbound")).unwrap(),
            "default"
        );
        assert_eq!(registry.queue_id_for_category(None).unwrap(), "default");
    }

    #[test]
    fn fails_with_no_default_and_no_binding() {
        let registry = DescriptorRegistry::from_descriptors([desc("emails", &[])]);
        assert!(registry.queue_id_for_category(Some("unbound")).is_err());
    }

    #[test]
    fn custom_default_queue_id_is_honored() {
        let mut registry = DescriptorRegistry::with_default_queue_id("background");
        registry.register(desc("background", &[]));
        registry.register(desc("default", &[]));
        // "default" exists but this registry's configured default is
        // "background", so an unbound category resolves there instead.
        assert_eq!(
            registry.queue_id_for_category(Some("unbound")).unwrap(),
            "background"
        );
    }

    #[test]
    fn max_threads_substitution() {
        let d = QueueDescriptor::builder()
            .id("q")
            .name("q")
            .max_threads(0)
            .build();
        assert_eq!(d.effective_max_threads(), 4);

        let d = QueueDescriptor::builder()
            .id("q")
            .name("q")
            .max_threads(-3)
            .build();
        assert_eq!(d.effective_max_threads(), 4);
    }

    #[test]
    fn priority_queues_ignore_capacity() {
        let d = QueueDescriptor::builder()
            .id("q")
            .name("q")
            .capacity(8usize)
            .use_priority(true)
            .build();
        assert_eq!(d.effective_capacity(), None);
    }

    #[test]
    fn zero_capacity_is_unbounded() {
        let d = QueueDescriptor::builder().id("q").name("q").build();
        assert_eq!(d.effective_capacity(), None);
    }
}
