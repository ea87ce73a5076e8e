use std::collections::VecDeque;

/// FIFO of pending read completion packets that tolerates limited
/// reordering between requests.
#[derive(Debug)]
pub(super) struct CompletionQueue<T> {
    items: VecDeque<T>,
}

impl<T> Default for CompletionQueue<T> {
    fn default() -> Self {
        CompletionQueue {
            items: VecDeque::new(),
        }
    }
}

impl<T> CompletionQueue<T> {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn front(&self) -> Option<&T> {
        self.items.front()
    }

    pub fn pop_front(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    #[cfg(test)]
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    /// Inserts `item` up to `n_later` positions ahead of the tail. The walk
    /// stops at an entry for which `same_request` holds, so packets of one
    /// request stay in order, and never moves ahead of the head, which may
    /// already be on the wire.
    pub fn insert_reordered(&mut self, item: T, n_later: usize, same_request: impl Fn(&T) -> bool) {
        let Some(mut prev) = self.items.len().checked_sub(1) else {
            self.items.push_back(item);
            return;
        };
        for _ in 0..n_later {
            if same_request(&self.items[prev]) || prev == 0 {
                break;
            }
            prev -= 1;
        }
        self.items.insert(prev + 1, item);
    }
}
