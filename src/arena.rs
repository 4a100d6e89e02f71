//! # Handle Arena
//!
//! Fixed-capacity slot storage addressed by generational handles. Threads,
//! semaphores, locks and condition variables all live in arenas owned by
//! the scheduler; everything else refers to them by [`Key`].
//!
//! A key carries the slot index and the serial number the slot had when
//! the value was inserted. Once the slot is emptied or reused the serial
//! no longer matches and lookups through the old key return `None`, so a
//! dangling back-reference reads as "not found" instead of aliasing a new
//! occupant.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Key {
    slot: u16,
    serial: u32,
}

impl Key {
    pub const fn slot(self) -> usize {
        self.slot as usize
    }

    pub const fn serial(self) -> u32 {
        self.serial
    }
}

struct Entry<T> {
    serial: u32,
    value: T,
}

pub struct Arena<T, const N: usize> {
    slots: [Option<Entry<T>>; N],
    next_serial: u32,
    len: usize,
}

impl<T, const N: usize> Arena<T, N> {
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| None),
            next_serial: 1,
            len: 0,
        }
    }

    /// Store `value` under a fresh serial. Returns `None` when full.
    pub fn insert(&mut self, value: T) -> Option<Key> {
        let serial = self.next_serial;
        self.next_serial = self.next_serial.wrapping_add(1).max(1);
        self.insert_with_serial(serial, value)
    }

    /// Store `value` under a caller-chosen serial, such as a thread id.
    pub fn insert_with_serial(&mut self, serial: u32, value: T) -> Option<Key> {
        let slot = self.slots.iter().position(Option::is_none)?;
        self.slots[slot] = Some(Entry { serial, value });
        self.len += 1;
        Some(Key {
            slot: slot as u16,
            serial,
        })
    }

    pub fn get(&self, key: Key) -> Option<&T> {
        match self.slots.get(key.slot())? {
            Some(entry) if entry.serial == key.serial => Some(&entry.value),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, key: Key) -> Option<&mut T> {
        match self.slots.get_mut(key.slot())? {
            Some(entry) if entry.serial == key.serial => Some(&mut entry.value),
            _ => None,
        }
    }

    pub fn remove(&mut self, key: Key) -> Option<T> {
        let slot = self.slots.get_mut(key.slot())?;
        if slot.as_ref().map_or(true, |entry| entry.serial != key.serial) {
            return None;
        }
        self.len -= 1;
        slot.take().map(|entry| entry.value)
    }

    #[cfg(test)]
    pub fn iter(&self) -> impl Iterator<Item = (Key, &T)> + '_ {
        self.slots.iter().enumerate().filter_map(|(slot, entry)| {
            entry.as_ref().map(|entry| {
                (
                    Key {
                        slot: slot as u16,
                        serial: entry.serial,
                    },
                    &entry.value,
                )
            })
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == N
    }
}

impl<T, const N: usize> Default for Arena<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_lookup() {
        let mut arena: Arena<u32, 4> = Arena::new();
        let a = arena.insert(10).unwrap();
        let b = arena.insert(20).unwrap();
        assert_ne!(a, b);
        assert_eq!(arena.get(a), Some(&10));
        assert_eq!(arena.get(b), Some(&20));
        *arena.get_mut(b).unwrap() += 1;
        assert_eq!(arena.get(b), Some(&21));
        assert_eq!(arena.len(), 2);
    }

    #[test]
    fn test_stale_key_is_not_found() {
        let mut arena: Arena<u32, 1> = Arena::new();
        let old = arena.insert(1).unwrap();
        assert_eq!(arena.remove(old), Some(1));
        let new = arena.insert(2).unwrap();

        assert_eq!(old.slot(), new.slot());
        assert_eq!(arena.get(old), None);
        assert_eq!(arena.remove(old), None);
        assert_eq!(arena.get(new), Some(&2));
    }

    #[test]
    fn test_capacity_exhaustion() {
        let mut arena: Arena<u8, 2> = Arena::new();
        arena.insert(1).unwrap();
        arena.insert(2).unwrap();
        assert!(arena.is_full());
        assert_eq!(arena.insert(3), None);
    }

    #[test]
    fn test_caller_serial_and_iteration() {
        let mut arena: Arena<&str, 4> = Arena::new();
        let key = arena.insert_with_serial(42, "main").unwrap();
        arena.insert("other").unwrap();
        assert_eq!(key.serial(), 42);

        let found: heapless::Vec<&str, 4> = arena.iter().map(|(_, v)| *v).collect();
        assert_eq!(found.as_slice(), &["main", "other"]);
    }
}
