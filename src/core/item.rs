use super::execution::ExecutionContext;
use crate::error::BatchError;

/// Result of a single read: `Ok(None)` marks the end of the input.
pub type ItemReaderResult<I> = Result<Option<I>, BatchError>;

/// Result of processing one item.
pub type ItemProcessorResult<O> = Result<O, BatchError>;

/// Result of writing a chunk of items.
pub type ItemWriterResult = Result<(), BatchError>;

/// Retrieval of input for a step, one item at a time.
///
/// Implementations take `&self` and keep their cursor behind interior
/// mutability so the same reader value can be shared with the builder API.
/// The stream hooks carry the restart contract: `open` receives the
/// execution context rehydrated from the last attempt and should seek to the
/// saved position; `update` is called before every chunk commit and should
/// record the current position.
pub trait ItemReader<I>: Send + Sync {
    fn read(&self) -> ItemReaderResult<I>;

    fn open(&self, _execution_context: &ExecutionContext) -> Result<(), BatchError> {
        Ok(())
    }

    fn update(&self, _execution_context: &mut ExecutionContext) -> Result<(), BatchError> {
        Ok(())
    }

    fn close(&self) -> Result<(), BatchError> {
        Ok(())
    }
}

/// Business logic applied to each read item before it is written.
pub trait ItemProcessor<I, O>: Send + Sync {
    fn process(&self, item: &I) -> ItemProcessorResult<O>;
}

/// Output of a step, one chunk of items at a time.
pub trait ItemWriter<O>: Send + Sync {
    fn write(&self, items: &[O]) -> ItemWriterResult;

    fn flush(&self) -> ItemWriterResult {
        Ok(())
    }

    fn open(&self) -> Result<(), BatchError> {
        Ok(())
    }

    fn close(&self) -> Result<(), BatchError> {
        Ok(())
    }
}

/// Identity processor used when a step declares no processor of its own.
#[derive(Default)]
pub struct PassThroughProcessor;

impl<I: Clone + Send + Sync> ItemProcessor<I, I> for PassThroughProcessor {
    fn process(&self, item: &I) -> ItemProcessorResult<I> {
        Ok(item.clone())
    }
}
