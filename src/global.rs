//! Process-wide default injector.
//!
//! The slot is created lazily by [`default_injector`] and shared by everything
//! in the process that doesn't construct an [`Injector`] of its own.

use alloc::sync::Arc;
use core::any::Any;
use parking_lot::{const_mutex, Mutex};
use tracing::{debug, error};

use crate::{any::TypeInfo, errors::GlobalErrorKind, injector::Injector};

type SlotValue = (TypeInfo, Arc<dyn Any + Send + Sync>);

static DEFAULT_INJECTOR: Mutex<Option<SlotValue>> = const_mutex(None);

/// Returns the default injector, creating it on first use.
///
/// # Errors
/// Returns [`GlobalErrorKind::Polluted`] if the slot holds a value that isn't an [`Injector`].
pub fn default_injector() -> Result<Injector, GlobalErrorKind> {
    let mut slot = DEFAULT_INJECTOR.lock();
    if let Some((type_info, value)) = &*slot {
        return match value.downcast_ref::<Injector>() {
            Some(injector) => Ok(injector.clone()),
            None => {
                let err = GlobalErrorKind::Polluted { actual: *type_info };
                error!("{}", err);
                Err(err)
            }
        };
    }

    let injector = Injector::default();
    *slot = Some((TypeInfo::of::<Injector>(), Arc::new(injector.clone())));
    debug!("Default injector created");
    Ok(injector)
}

/// Empties the slot. The next [`default_injector`] call creates a new injector.
pub fn reset_default_injector() {
    if DEFAULT_INJECTOR.lock().take().is_some() {
        debug!("Default injector reset");
    }
}

/// Stores an arbitrary value in the slot, returning whether the slot was occupied.
///
/// Storing anything but an [`Injector`] makes [`default_injector`] fail until the slot is reset.
pub fn replace_slot<T: Any + Send + Sync>(value: T) -> bool {
    DEFAULT_INJECTOR
        .lock()
        .replace((TypeInfo::of::<T>(), Arc::new(value)))
        .is_some()
}
