//! Forward-only result set with lazy component hydration

use super::reader::hydrate;
use crate::db::Datastore;
use crate::error::Result;
use crate::models::{ComponentSelector, Object};
use std::collections::VecDeque;
use std::sync::Arc;

/// Single-pass iterator over fetched objects
///
/// Base records are loaded up front; the selected components of each
/// object are fetched only when [`ResultSet::next`] reaches it.
pub struct ResultSet {
    pending: VecDeque<Object>,
    total: usize,
    selector: ComponentSelector,
    hydrator: Option<Arc<dyn Datastore>>,
}

impl std::fmt::Debug for ResultSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultSet")
            .field("total", &self.total)
            .field("remaining", &self.pending.len())
            .field("selector", &self.selector)
            .field("lazy", &self.hydrator.is_some())
            .finish()
    }
}

impl ResultSet {
    /// Objects whose components are fetched from `datastore` on iteration
    pub(crate) fn lazy(
        objects: Vec<Object>,
        selector: ComponentSelector,
        datastore: Arc<dyn Datastore>,
    ) -> Self {
        Self {
            total: objects.len(),
            pending: objects.into(),
            selector,
            hydrator: Some(datastore),
        }
    }

    /// Objects that already carry their components
    pub fn hydrated(objects: Vec<Object>) -> Self {
        Self {
            total: objects.len(),
            pending: objects.into(),
            selector: ComponentSelector::BASE,
            hydrator: None,
        }
    }

    /// Total number of objects, fixed at construction
    pub fn count(&self) -> usize {
        self.total
    }

    pub fn remaining(&self) -> usize {
        self.pending.len()
    }

    /// Next object, or `Ok(None)` once the set is exhausted
    pub async fn next(&mut self) -> Result<Option<Object>> {
        let Some(mut object) = self.pending.pop_front() else {
            return Ok(None);
        };
        if let Some(datastore) = &self.hydrator {
            hydrate(datastore.as_ref(), &mut object, self.selector).await?;
        }
        Ok(Some(object))
    }

    /// Drain every remaining object
    pub async fn collect_all(mut self) -> Result<Vec<Object>> {
        let mut objects = Vec::with_capacity(self.pending.len());
        while let Some(object) = self.next().await? {
            objects.push(object);
        }
        Ok(objects)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_count_matches_successful_next_calls() {
        let objects = vec![Object::with_id("docs", "a"), Object::with_id("docs", "b")];
        let mut set = ResultSet::hydrated(objects);

        let mut seen = 0;
        while set.next().await.unwrap().is_some() {
            seen += 1;
        }
        assert_eq!(seen, set.count());
        assert_eq!(set.remaining(), 0);
        assert!(set.next().await.unwrap().is_none());
        assert!(set.next().await.unwrap().is_none());
    }
}
