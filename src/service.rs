use alloc::boxed::Box;

use crate::utils::thread_safety::{SendSafety, SyncSafety};

pub(crate) trait Service<Request> {
    type Response;
    type Error;

    fn call(&mut self, request: Request) -> Result<Self::Response, Self::Error>;
}

#[inline]
#[must_use]
pub(crate) const fn service_fn<T>(f: T) -> ServiceFn<T> {
    ServiceFn { f }
}

#[derive(Clone)]
pub(crate) struct ServiceFn<T> {
    f: T,
}

impl<F, Request, Response, Error> Service<Request> for ServiceFn<F>
where
    F: FnMut(Request) -> Result<Response, Error>,
{
    type Response = Response;
    type Error = Error;

    #[inline]
    fn call(&mut self, request: Request) -> Result<Self::Response, Self::Error> {
        (self.f)(request)
    }
}

#[cfg(feature = "thread_safe")]
type DynCloneService<Request, Response, Error> = dyn CloneService<Request, Response = Response, Error = Error> + Send + Sync;
#[cfg(not(feature = "thread_safe"))]
type DynCloneService<Request, Response, Error> = dyn CloneService<Request, Response = Response, Error = Error>;

/// Type-erased service that is cloned before every call,
/// so a shared factory never needs to be borrowed mutably across calls.
pub(crate) struct BoxCloneService<Request, Response, Error>(pub(crate) Box<DynCloneService<Request, Response, Error>>);

pub(crate) trait CloneService<Request>: Service<Request> {
    #[must_use]
    fn clone_box(&self) -> Box<DynCloneService<Request, Self::Response, Self::Error>>;
}

impl<Request, T> CloneService<Request> for T
where
    T: Service<Request> + Clone + SendSafety + SyncSafety + 'static,
{
    #[inline]
    fn clone_box(&self) -> Box<DynCloneService<Request, T::Response, T::Error>> {
        Box::new(self.clone())
    }
}

impl<Request, Response, Error> Clone for BoxCloneService<Request, Response, Error> {
    #[inline]
    fn clone(&self) -> Self {
        Self(self.0.clone_box())
    }
}

impl<Request, Response, Error> Service<Request> for BoxCloneService<Request, Response, Error> {
    type Response = Response;
    type Error = Error;

    #[inline]
    fn call(&mut self, request: Request) -> Result<Self::Response, Self::Error> {
        self.0.call(request)
    }
}
