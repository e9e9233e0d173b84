//! Reading List sync: the `articles` HTTP client, local storage interfaces
//! and the five-stage synchronizer.

mod client;
mod storage;
mod synchronizer;

pub use client::{DownloadOutcome, ItemOutcome, ReadingListClient};
pub use storage::{
    MemoryChangeAccumulator, MemoryReadingListStorage, ReadingListChangeAccumulator,
    ReadingListStorage,
};
pub use synchronizer::{
    checkpoint_key, ReadingListSynchronizer, ReadingListSynchronizerDelegate, Stage, StageOutcome,
};
