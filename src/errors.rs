mod cache;
mod global;
mod instantiate;
mod lifecycle;
mod resolve;

pub use cache::DeepCacheErrorKind;
pub use global::GlobalErrorKind;
pub use instantiate::InstantiateErrorKind;
pub use lifecycle::LifecycleErrorKind;
pub use resolve::ResolveErrorKind;
