use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use youplace_shared::{HexColor, Viewport, user_color};

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Slot<T> {
    value: T,
    next_id: u64,
    subscribers: Vec<(u64, Callback<T>)>,
}

/// A value with explicit change subscribers.
///
/// Subscribers are called outside the lock, so a callback may read the value
/// or subscribe again without deadlocking.
pub struct Observable<T> {
    slot: Arc<Mutex<Slot<T>>>,
}

impl<T> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T: Clone + PartialEq + Send + 'static> Observable<T> {
    pub fn new(value: T) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Slot {
                value,
                next_id: 0,
                subscribers: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot<T>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self) -> T {
        self.lock().value.clone()
    }

    /// Stores `value` and notifies subscribers. Setting an equal value is a no-op.
    pub fn set(&self, value: T) -> bool {
        let callbacks: Vec<Callback<T>> = {
            let mut slot = self.lock();
            if slot.value == value {
                return false;
            }
            slot.value = value.clone();
            slot.subscribers
                .iter()
                .map(|(_, callback)| Arc::clone(callback))
                .collect()
        };
        for callback in callbacks {
            callback(&value);
        }
        true
    }

    /// Calls `callback` with the current value now and with every later change.
    pub fn subscribe(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        let callback: Callback<T> = Arc::new(callback);
        let (id, current) = {
            let mut slot = self.lock();
            let id = slot.next_id;
            slot.next_id += 1;
            slot.subscribers.push((id, Arc::clone(&callback)));
            (id, slot.value.clone())
        };
        callback(&current);

        let weak = Arc::downgrade(&self.slot);
        Subscription {
            cancel: Some(Box::new(move || {
                if let Some(slot) = weak.upgrade() {
                    slot.lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .subscribers
                        .retain(|(existing, _)| *existing != id);
                }
            })),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }
}

/// Unsubscribes on [`Subscription::unsubscribe`] or drop.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        self.cancel_now();
    }

    fn cancel_now(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel_now();
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Mode {
    #[default]
    Navigate,
    Paint,
}

/// UI-facing state of one canvas session.
#[derive(Clone)]
pub struct CanvasControls {
    pub mode: Observable<Mode>,
    pub color: Observable<HexColor>,
    pub viewport: Observable<Option<Viewport>>,
}

impl CanvasControls {
    /// Brush starts at the user's own deterministic color.
    pub fn for_user(user_id: &str) -> Self {
        Self {
            mode: Observable::new(Mode::default()),
            color: Observable::new(user_color(user_id)),
            viewport: Observable::new(None),
        }
    }

    pub fn toggle_mode(&self) -> Mode {
        let next = match self.mode.get() {
            Mode::Navigate => Mode::Paint,
            Mode::Paint => Mode::Navigate,
        };
        self.mode.set(next);
        next
    }
}
