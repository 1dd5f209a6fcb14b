use crate::{
    event::Event,
    mask::FieldMask,
    sync::Arc,
    types::{Color, DistributedId, IndexMap},
    view::LogicalView,
};
use std::collections::VecDeque;

/// A view listed as valid for some fields.
#[derive(Debug, Clone)]
pub(crate) struct ValidView {
    pub(crate) view: Arc<LogicalView>,
    pub(crate) mask: FieldMask,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Waiter {
    event: Event,
    exclusive: bool,
    /// Granted waiters get the lock handed to them; the others are only
    /// woken so they can retry.
    grant: bool,
}

/// FIFO reader/writer lock guarding a physical state across mapping
/// phases.
///
/// Acquisition never blocks: an incompatible request gets an event to wait
/// on instead.
#[derive(Debug, Default)]
pub(crate) struct StateLock {
    holders: u32,
    exclusive: bool,
    waiters: VecDeque<Waiter>,
}

impl StateLock {
    fn compatible(&self, exclusive: bool) -> bool {
        self.waiters.is_empty() && (self.holders == 0 || (!self.exclusive && !exclusive))
    }

    fn take(&mut self, exclusive: bool) {
        self.holders += 1;
        self.exclusive = exclusive;
    }

    /// Take the lock now or queue for it; the queued request owns the lock
    /// once the returned event triggers.
    pub(crate) fn acquire(&mut self, exclusive: bool, make_event: impl FnOnce() -> Event) -> Option<Event> {
        if self.compatible(exclusive) {
            self.take(exclusive);
            return None;
        }
        let event = make_event();
        self.waiters.push_back(Waiter {
            event,
            exclusive,
            grant: true,
        });
        Some(event)
    }

    /// Take the lock now, or get an event after which a retry may succeed.
    pub(crate) fn try_acquire(&mut self, exclusive: bool, make_event: impl FnOnce() -> Event) -> Result<(), Event> {
        if self.compatible(exclusive) {
            self.take(exclusive);
            return Ok(());
        }
        let event = make_event();
        self.waiters.push_back(Waiter {
            event,
            exclusive,
            grant: false,
        });
        Err(event)
    }

    /// Release one hold and return the events to trigger, in FIFO order.
    pub(crate) fn release(&mut self) -> Vec<Event> {
        self.holders = self.holders.saturating_sub(1);
        if self.holders == 0 {
            self.exclusive = false;
        }
        let mut wake = Vec::new();
        while let Some(front) = self.waiters.front().copied() {
            if !front.grant {
                self.waiters.pop_front();
                wake.push(front.event);
                continue;
            }
            let admissible = self.holders == 0 || (!self.exclusive && !front.exclusive);
            if !admissible {
                break;
            }
            self.waiters.pop_front();
            self.take(front.exclusive);
            wake.push(front.event);
            if front.exclusive {
                break;
            }
        }
        wake
    }

    pub(crate) fn is_held(&self) -> bool {
        self.holders > 0
    }
}

/// Physical state of one node in one context.
#[derive(Debug, Default)]
pub(crate) struct PhysicalState {
    /// Fields whose latest data lives at this node (not in an ancestor).
    pub(crate) dirty_mask: FieldMask,
    /// Fields with pending reductions at this node.
    pub(crate) reduction_mask: FieldMask,
    /// Fields this address space may treat as valid without asking the
    /// owner.
    pub(crate) remote_valid: FieldMask,
    pub(crate) open_children: IndexMap<Color, FieldMask>,
    pub(crate) valid_views: IndexMap<DistributedId, ValidView>,
    pub(crate) reduction_views: IndexMap<DistributedId, ValidView>,
    pub(crate) lock: StateLock,
}

impl PhysicalState {
    pub(crate) fn children_valid_fields(&self) -> FieldMask {
        self.open_children
            .values()
            .fold(FieldMask::EMPTY, |acc, fields| acc | *fields)
    }

    /// Open children restricted to `mask`.
    pub(crate) fn open_children_on(&self, mask: FieldMask) -> Vec<(Color, FieldMask)> {
        self.open_children
            .iter()
            .filter_map(|(&color, &fields)| {
                let overlap = fields & mask;
                (!overlap.is_empty()).then_some((color, overlap))
            })
            .collect()
    }

    pub(crate) fn open_child(&mut self, color: Color, mask: FieldMask) {
        *self.open_children.entry(color).or_default() |= mask;
    }

    pub(crate) fn close_child(&mut self, color: Color, mask: FieldMask) {
        if let Some(fields) = self.open_children.get_mut(&color) {
            *fields -= mask;
            if fields.is_empty() {
                self.open_children.shift_remove(&color);
            }
        }
    }

    /// Valid views restricted to `mask`.
    pub(crate) fn views_on(&self, mask: FieldMask) -> Vec<(Arc<LogicalView>, FieldMask)> {
        restrict(&self.valid_views, mask)
    }

    /// Reduction views restricted to `mask`.
    pub(crate) fn reductions_on(&self, mask: FieldMask) -> Vec<(Arc<LogicalView>, FieldMask)> {
        restrict(&self.reduction_views, mask)
    }

    /// Add `view` as valid for `mask`. Returns whether the view is new to
    /// this state (and so needs a valid reference).
    pub(crate) fn insert_view(&mut self, view: &Arc<LogicalView>, mask: FieldMask, reduction: bool) -> bool {
        let views = if reduction {
            &mut self.reduction_views
        } else {
            &mut self.valid_views
        };
        match views.get_mut(&view.did) {
            Some(entry) => {
                entry.mask |= mask;
                false
            }
            None => {
                views.insert(
                    view.did,
                    ValidView {
                        view: Arc::clone(view),
                        mask,
                    },
                );
                true
            }
        }
    }

    /// Drop `mask` from views (or reduction views), returning the views that
    /// lost all of their fields.
    pub(crate) fn remove_fields(&mut self, mask: FieldMask, reduction: bool) -> Vec<Arc<LogicalView>> {
        let views = if reduction {
            &mut self.reduction_views
        } else {
            &mut self.valid_views
        };
        let mut removed = Vec::new();
        views.retain(|_, entry| {
            entry.mask -= mask;
            if entry.mask.is_empty() {
                removed.push(Arc::clone(&entry.view));
                false
            } else {
                true
            }
        });
        removed
    }

    /// Forget `mask` entirely: masks, views and open children. Returns the
    /// views that lost all of their fields and the children that were open.
    pub(crate) fn invalidate(&mut self, mask: FieldMask) -> (Vec<Arc<LogicalView>>, Vec<(Color, FieldMask)>) {
        self.dirty_mask -= mask;
        self.reduction_mask -= mask;
        self.remote_valid -= mask;
        let mut removed = self.remove_fields(mask, false);
        removed.extend(self.remove_fields(mask, true));
        let open = self.open_children_on(mask);
        for &(color, fields) in &open {
            self.close_child(color, fields);
        }
        (removed, open)
    }
}

fn restrict(views: &IndexMap<DistributedId, ValidView>, mask: FieldMask) -> Vec<(Arc<LogicalView>, FieldMask)> {
    views
        .values()
        .filter_map(|entry| {
            let overlap = entry.mask & mask;
            (!overlap.is_empty()).then(|| (Arc::clone(&entry.view), overlap))
        })
        .collect()
}
