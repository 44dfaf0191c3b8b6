/// This module provides in-memory item reader and writer implementations,
/// used as the default collaborators in tests and small jobs.
pub mod in_memory;

/// This module provides a logger item writer implementation.
pub mod logger;

pub use in_memory::{InMemoryItemReader, InMemoryItemWriter};
pub use logger::LoggerWriter;
