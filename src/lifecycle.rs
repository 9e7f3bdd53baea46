use alloc::boxed::Box;
use core::{
    convert::Infallible,
    sync::atomic::{AtomicU64, Ordering},
};
use parking_lot::Mutex;

use crate::{
    service::{service_fn, BoxCloneService},
    utils::thread_safety::{BoxFnOnceThreadSafety, RcThreadSafety, SendSafety, SyncSafety},
};

/// Callback run once a molecule instance is unmounted.
pub type Unmount = BoxFnOnceThreadSafety;

/// Callback run when a molecule instance becomes live.
///
/// The returned [`Unmount`], if any, runs when the last lease on the
/// instance's scopes is released. Instances unmount in reverse mount order,
/// so a dependent always unmounts before the molecules it depends on.
pub trait MountCallback: Clone + 'static {
    fn mount(&mut self) -> Option<Unmount>;
}

impl<F> MountCallback for F
where
    F: FnMut() -> Option<Unmount> + Clone + 'static,
{
    #[inline]
    fn mount(&mut self) -> Option<Unmount> {
        self()
    }
}

pub(crate) type BoxedCloneMountCallback = BoxCloneService<(), Option<Unmount>, Infallible>;

#[must_use]
pub(crate) fn boxed_mount_callback<M>(mut callback: M) -> BoxedCloneMountCallback
where
    M: MountCallback + SendSafety + SyncSafety,
{
    BoxCloneService(Box::new(service_fn(move |()| Ok::<_, Infallible>(callback.mount()))))
}

static NEXT_CLEANUP_ID: AtomicU64 = AtomicU64::new(0);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct CleanupId(u64);

/// Shared callback that runs at most once, however many scopes it is registered against.
#[derive(Clone)]
pub(crate) struct Cleanup {
    id: CleanupId,
    callback: RcThreadSafety<Mutex<Option<BoxFnOnceThreadSafety>>>,
}

impl Cleanup {
    #[must_use]
    pub(crate) fn new(callback: BoxFnOnceThreadSafety) -> Self {
        Self {
            id: CleanupId(NEXT_CLEANUP_ID.fetch_add(1, Ordering::Relaxed)),
            callback: RcThreadSafety::new(Mutex::new(Some(callback))),
        }
    }

    #[inline]
    #[must_use]
    pub(crate) fn id(&self) -> CleanupId {
        self.id
    }

    /// Returns `false` if the callback already ran.
    pub(crate) fn run(&self) -> bool {
        let callback = self.callback.lock().take();
        match callback {
            Some(callback) => {
                callback();
                true
            }
            None => false,
        }
    }
}
