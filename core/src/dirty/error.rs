use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum GlobalDirtyError {
    /// The registry tracks pollers in a fixed-width mask; registering more
    /// replication systems than that is a configuration mistake.
    #[error("Global dirty registry poller limit of {limit} reached")]
    PollerLimitReached { limit: u32 },
}
