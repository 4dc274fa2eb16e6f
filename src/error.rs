use thiserror::Error;

/// Errors raised while setting up one of the allocators or containers.
///
/// These are argument errors: the construction that returned them failed, but
/// the caller may retry with different parameters.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// The Arena does not start at an address with the required Alignment
    #[error("arena is not aligned to {0} bytes")]
    Unaligned(usize),
    /// The requested Alignment is not a power of two
    #[error("alignment {0} is not a power of two")]
    InvalidAlignment(usize),
    /// More Slots were requested than the Index type can address
    #[error("capacity {requested} exceeds the maximum of {max}")]
    CapacityOverflow {
        /// The requested Capacity
        requested: usize,
        /// The largest supported Capacity
        max: usize,
    },
    /// A Block is too small to hold a free-list Index
    #[error("block size {0} is smaller than an index")]
    BlockTooSmall(usize),
    /// The Arena is too short for the requested Layout
    #[error("arena holds {available} bytes but {required} are required")]
    ArenaTooSmall {
        /// The Size of the supplied Arena
        available: usize,
        /// The Size that would have been needed
        required: usize,
    },
    /// The system allocator could not provide the Arena
    #[error("the system allocator could not provide {0} bytes")]
    OutOfMemory(usize),
}
