//! Recipe cache — in-memory memoization of compiled recipes.
//!
//! Keyed by `ShapeSignature`. Each signature owns a slot guarded by its own
//! mutex, so at most one compilation is in flight per signature while
//! different signatures compile concurrently. The map lock is only held to
//! find or create a slot, never while compiling.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::compiler::signature::ShapeSignature;
use crate::error::KernelResult;

/// Where a recipe handed out by the cache came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
    /// Already compiled by an earlier call.
    Memory,
    /// Compiled by this call.
    Compiled,
}

type Slot<R> = Arc<Mutex<Option<Arc<R>>>>;

pub struct RecipeCache<R> {
    slots: Mutex<HashMap<ShapeSignature, Slot<R>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<R> Default for RecipeCache<R> {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panic inside a compile closure leaves the slot `None`, which is valid.
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl<R> RecipeCache<R> {
    pub fn new() -> Self {
        RecipeCache {
            slots: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Look up a compiled recipe without compiling.
    pub fn get(&self, signature: &ShapeSignature) -> Option<Arc<R>> {
        let slot = lock(&self.slots).get(signature).cloned()?;
        let recipe = lock(&slot).clone();
        recipe
    }

    /// Return the recipe for `signature`, running `compile` on a miss.
    ///
    /// Concurrent callers with the same signature block until the first one
    /// finishes and then share its recipe. A failed compilation leaves the
    /// slot empty; the error goes to the caller that ran `compile`, and the
    /// next waiter retries.
    pub fn get_or_compile<F>(
        &self,
        signature: &ShapeSignature,
        compile: F,
    ) -> KernelResult<(Arc<R>, CacheSource)>
    where
        F: FnOnce() -> KernelResult<R>,
    {
        let slot = {
            let mut slots = lock(&self.slots);
            slots.entry(signature.clone()).or_default().clone()
        };

        let mut entry = lock(&slot);
        if let Some(recipe) = entry.as_ref() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            log::debug!("recipe cache hit: {signature}");
            return Ok((Arc::clone(recipe), CacheSource::Memory));
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let recipe = match compile() {
            Ok(recipe) => Arc::new(recipe),
            Err(e) => {
                drop(entry);
                self.forget_empty(signature, &slot);
                return Err(e);
            }
        };
        *entry = Some(Arc::clone(&recipe));
        log::info!("compiled recipe for {signature}");
        Ok((recipe, CacheSource::Compiled))
    }

    /// Drop the map entry for a failed signature unless another caller is
    /// still waiting on the same slot.
    fn forget_empty(&self, signature: &ShapeSignature, slot: &Slot<R>) {
        let mut slots = lock(&self.slots);
        let unshared = slots
            .get(signature)
            .is_some_and(|current| Arc::ptr_eq(current, slot) && Arc::strong_count(slot) == 2);
        if unshared {
            slots.remove(signature);
        }
    }

    /// Number of signatures with a compiled recipe.
    pub fn len(&self) -> usize {
        let slots: Vec<Slot<R>> = lock(&self.slots).values().cloned().collect();
        slots.iter().filter(|s| lock(s).is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Drop every recipe. Recipes already handed out stay alive through
    /// their `Arc`.
    pub fn clear(&self) {
        lock(&self.slots).clear();
    }
}
