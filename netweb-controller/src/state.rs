//! Shared-state aliases used by the long-lived tasks.

use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

/// Short critical sections written from one task, read from a few.
pub type Shared<T> = Arc<Mutex<T>>;

/// Read-mostly state polled by HTTP handlers while a single task writes.
pub type SharedRw<T> = Arc<RwLock<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

pub fn new_rw_state<T>(value: T) -> SharedRw<T> {
    Arc::new(RwLock::new(value))
}
