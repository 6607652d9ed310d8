//! Index-linked LRU list.
//!
//! Entries live in a slot vector and link to each other by index, with a free
//! list for slot reuse. A [`ListPosition`] stays valid until the entry is
//! removed; callers keep positions under the same lock as the list, so a
//! position is never observed after its slot was recycled.
//!
//! ```text
//!   hot ──► [A] ◄──► [B] ◄──► [C] ◄── cold
//!           MRU                LRU
//! ```

/// Position of an entry inside an [`IndexList`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListPosition(usize);

impl ListPosition {
    /// Raw slot index.
    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug)]
struct Link<T> {
    value: T,
    /// Neighbour towards the hot end.
    prev: Option<usize>,
    /// Neighbour towards the cold end.
    next: Option<usize>,
}

/// Doubly linked list over a slot arena with O(1) move-to-hot and remove.
#[derive(Debug)]
pub struct IndexList<T> {
    links: Vec<Option<Link<T>>>,
    free: Vec<usize>,
    hot: Option<usize>,
    cold: Option<usize>,
    len: usize,
}

impl<T> Default for IndexList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> IndexList<T> {
    /// Creates an empty list.
    #[must_use]
    pub fn new() -> Self {
        Self {
            links: Vec::new(),
            free: Vec::new(),
            hot: None,
            cold: None,
            len: 0,
        }
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the list holds no entry.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Inserts `value` at the hot end.
    pub fn push_hot(&mut self, value: T) -> ListPosition {
        let idx = self.alloc(value);
        self.link_hot(idx);
        ListPosition(idx)
    }

    /// Inserts `value` at the cold end, next in line for eviction.
    pub fn push_cold(&mut self, value: T) -> ListPosition {
        let idx = self.alloc(value);
        self.link_cold(idx);
        ListPosition(idx)
    }

    /// Moves the entry at `pos` to the hot end.
    ///
    /// Returns false if `pos` holds no entry.
    pub fn move_to_hot(&mut self, pos: ListPosition) -> bool {
        if !self.contains(pos) {
            return false;
        }
        if self.hot == Some(pos.0) {
            return true;
        }
        self.unlink(pos.0);
        self.link_hot(pos.0);
        true
    }

    /// Removes the entry at `pos`.
    pub fn remove(&mut self, pos: ListPosition) -> Option<T> {
        if !self.contains(pos) {
            return None;
        }
        self.unlink(pos.0);
        self.len -= 1;
        self.free.push(pos.0);
        self.links[pos.0].take().map(|link| link.value)
    }

    /// Replaces the value at `pos` in place, keeping its position.
    pub fn replace(&mut self, pos: ListPosition, value: T) -> Option<T> {
        let link = self.links.get_mut(pos.0)?.as_mut()?;
        Some(std::mem::replace(&mut link.value, value))
    }

    /// Coldest entry, if any.
    #[must_use]
    pub fn peek_cold(&self) -> Option<(ListPosition, &T)> {
        let idx = self.cold?;
        self.links[idx]
            .as_ref()
            .map(|link| (ListPosition(idx), &link.value))
    }

    /// Value at `pos`.
    #[must_use]
    pub fn get(&self, pos: ListPosition) -> Option<&T> {
        self.links.get(pos.0)?.as_ref().map(|link| &link.value)
    }

    /// Returns true if `pos` holds an entry.
    #[must_use]
    pub fn contains(&self, pos: ListPosition) -> bool {
        matches!(self.links.get(pos.0), Some(Some(_)))
    }

    /// Iterates from the cold end to the hot end.
    pub fn iter_from_cold(&self) -> impl Iterator<Item = (ListPosition, &T)> + '_ {
        let mut cursor = self.cold;
        std::iter::from_fn(move || {
            let idx = cursor?;
            let link = self.links[idx].as_ref()?;
            cursor = link.prev;
            Some((ListPosition(idx), &link.value))
        })
    }

    fn alloc(&mut self, value: T) -> usize {
        let link = Link {
            value,
            prev: None,
            next: None,
        };
        self.len += 1;
        match self.free.pop() {
            Some(idx) => {
                self.links[idx] = Some(link);
                idx
            }
            None => {
                self.links.push(Some(link));
                self.links.len() - 1
            }
        }
    }

    fn link_hot(&mut self, idx: usize) {
        let old_hot = self.hot;
        if let Some(link) = self.links[idx].as_mut() {
            link.prev = None;
            link.next = old_hot;
        }
        match old_hot {
            Some(h) => {
                if let Some(link) = self.links[h].as_mut() {
                    link.prev = Some(idx);
                }
            }
            None => self.cold = Some(idx),
        }
        self.hot = Some(idx);
    }

    fn link_cold(&mut self, idx: usize) {
        let old_cold = self.cold;
        if let Some(link) = self.links[idx].as_mut() {
            link.prev = old_cold;
            link.next = None;
        }
        match old_cold {
            Some(c) => {
                if let Some(link) = self.links[c].as_mut() {
                    link.next = Some(idx);
                }
            }
            None => self.hot = Some(idx),
        }
        self.cold = Some(idx);
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = match self.links[idx].as_ref() {
            Some(link) => (link.prev, link.next),
            None => return,
        };
        match prev {
            Some(p) => {
                if let Some(link) = self.links[p].as_mut() {
                    link.next = next;
                }
            }
            None => self.hot = next,
        }
        match next {
            Some(n) => {
                if let Some(link) = self.links[n].as_mut() {
                    link.prev = prev;
                }
            }
            None => self.cold = prev,
        }
        if let Some(link) = self.links[idx].as_mut() {
            link.prev = None;
            link.next = None;
        }
    }
}
