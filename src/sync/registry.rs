use crate::error::{Error, Result};

/// Key of a [`HandleTable`] entry
///
/// A slot is reused after removal with a bumped generation, so a stale id
/// never reaches the entry that took its place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId {
    index: u32,
    generation: u32,
}

enum Slot<T> {
    Occupied { generation: u32, value: T },
    Vacant { generation: u32 },
}

/// Generation-tagged slab of live handles
pub struct HandleTable<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
    limit: Option<usize>,
}

impl<T> HandleTable<T> {
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
            limit,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Store `value`, failing without side effects when the table is full
    /// or memory cannot be reserved
    pub fn insert(&mut self, value: T) -> Result<HandleId> {
        if self.limit.is_some_and(|limit| self.len >= limit) {
            return Err(Error::ResourceExhausted(format!(
                "statement limit of {} reached",
                self.len
            )));
        }
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            let generation = match slot {
                Slot::Vacant { generation } => *generation,
                Slot::Occupied { .. } => {
                    return Err(Error::LibraryBug(crate::error::eyre!(
                        "free list points at occupied slot {}",
                        index
                    )));
                }
            };
            *slot = Slot::Occupied { generation, value };
            self.len += 1;
            return Ok(HandleId { index, generation });
        }

        let index = u32::try_from(self.slots.len())
            .map_err(|_| Error::ResourceExhausted("handle index overflow".to_string()))?;
        self.slots
            .try_reserve(1)
            .map_err(|e| Error::ResourceExhausted(e.to_string()))?;
        // removal pushes onto the free list, which must not allocate
        self.free
            .try_reserve(self.slots.len() + 1 - self.free.len())
            .map_err(|e| Error::ResourceExhausted(e.to_string()))?;
        self.slots.push(Slot::Occupied {
            generation: 0,
            value,
        });
        self.len += 1;
        Ok(HandleId {
            index,
            generation: 0,
        })
    }

    pub fn get(&self, id: HandleId) -> Option<&T> {
        match self.slots.get(id.index as usize)? {
            Slot::Occupied { generation, value } if *generation == id.generation => Some(value),
            _ => None,
        }
    }

    /// Remove the entry for `id`; a stale or repeated removal returns `None`
    pub fn remove(&mut self, id: HandleId) -> Option<T> {
        let slot = self.slots.get_mut(id.index as usize)?;
        match slot {
            Slot::Occupied { generation, .. } if *generation == id.generation => {}
            _ => return None,
        }
        let next = Slot::Vacant {
            generation: id.generation.wrapping_add(1),
        };
        let Slot::Occupied { value, .. } = std::mem::replace(slot, next) else {
            return None;
        };
        self.free.push(id.index);
        self.len -= 1;
        Some(value)
    }

    /// Remove every entry
    pub fn drain(&mut self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.len);
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let Slot::Occupied { generation, .. } = slot {
                let next = Slot::Vacant {
                    generation: generation.wrapping_add(1),
                };
                if let Slot::Occupied { value, .. } = std::mem::replace(slot, next) {
                    out.push(value);
                    self.free.push(index as u32);
                }
            }
        }
        self.len = 0;
        out
    }
}
