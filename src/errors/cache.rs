#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeepCacheErrorKind {
    #[error("Deep cache path must contain at least one key")]
    EmptyPath,
}
