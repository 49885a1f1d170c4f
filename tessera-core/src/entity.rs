use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Stable reference to a value stored in an `Arena`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Handle {
    index: u64,
    generation: u64, // Bumped whenever the slot is reused
}

impl Handle {
    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

#[derive(Debug, Clone)]
struct Slot<T> {
    generation: u64,
    value: Option<T>,
}

/// Slot storage handing out generation-checked handles, recycling freed slots.
#[derive(Debug, Clone)]
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    recycled: VecDeque<u64>, // Queue of slot indices that can be reused
    live: usize,
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Arena {
            slots: Vec::new(),
            recycled: VecDeque::new(),
            live: 0,
        }
    }

    /// Stores a value, reusing a freed slot when possible.
    pub fn insert(&mut self, value: T) -> Handle {
        self.live += 1;
        if let Some(index) = self.recycled.pop_front() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            Handle {
                index,
                generation: slot.generation,
            }
        } else {
            let index = self.slots.len() as u64;
            self.slots.push(Slot {
                generation: 0,
                value: Some(value),
            });
            Handle {
                index,
                generation: 0,
            }
        }
    }

    /// Removes a value; the handle and any copies of it become invalid.
    pub fn remove(&mut self, handle: Handle) -> Option<T> {
        if !self.is_valid(handle) {
            return None;
        }
        let slot = &mut self.slots[handle.index as usize];
        slot.generation += 1;
        self.recycled.push_back(handle.index);
        self.live -= 1;
        slot.value.take()
    }

    pub fn is_valid(&self, handle: Handle) -> bool {
        self.slots
            .get(handle.index as usize)
            .map_or(false, |slot| slot.generation == handle.generation && slot.value.is_some())
    }

    pub fn get(&self, handle: Handle) -> Option<&T> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.value.as_ref()
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.value.as_mut()
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value.as_ref().map(|value| {
                (
                    Handle {
                        index: index as u64,
                        generation: slot.generation,
                    },
                    value,
                )
            })
        })
    }

    pub fn clear(&mut self) {
        let handles: Vec<Handle> = self.iter().map(|(h, _)| h).collect();
        for handle in handles {
            self.remove(handle);
        }
    }
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_get() {
        let mut arena = Arena::new();
        let a = arena.insert("a");
        let b = arena.insert("b");
        assert_eq!(arena.get(a), Some(&"a"));
        assert_eq!(arena.get(b), Some(&"b"));
        assert_eq!(arena.len(), 2);
    }

    #[test]
    fn test_recycled_slot_invalidates_old_handle() {
        let mut arena = Arena::new();
        let a = arena.insert(1);
        assert_eq!(arena.remove(a), Some(1));
        assert!(!arena.is_valid(a));
        assert_eq!(arena.remove(a), None);

        let b = arena.insert(2);
        assert_eq!(b.index(), a.index());
        assert_eq!(b.generation(), a.generation() + 1);
        assert_eq!(arena.get(a), None);
        assert_eq!(arena.get(b), Some(&2));
    }

    #[test]
    fn test_iter_and_clear() {
        let mut arena = Arena::new();
        let handles: Vec<Handle> = (0..4).map(|i| arena.insert(i)).collect();
        arena.remove(handles[1]);
        let values: Vec<i32> = arena.iter().map(|(_, v)| *v).collect();
        assert_eq!(values, vec![0, 2, 3]);

        arena.clear();
        assert!(arena.is_empty());
        assert_eq!(arena.iter().count(), 0);
    }
}
