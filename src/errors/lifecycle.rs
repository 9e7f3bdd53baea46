#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum LifecycleErrorKind {
    #[error("Subscription already started")]
    AlreadyStarted,
    #[error("Subscription already stopped")]
    AlreadyStopped,
    #[error(
        "\
        Scope `{scope}` has no active lease. \
        Cleanups registered against an unleased scope would never run.\
        "
    )]
    ScopeNotLeased { scope: &'static str },
}
