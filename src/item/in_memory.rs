use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use log::debug;

use crate::BatchError;
use crate::core::execution::ExecutionContext;
use crate::core::item::{ItemReader, ItemReaderResult, ItemWriter, ItemWriterResult};

/// Restartable reader over an in-memory vector.
///
/// The cursor position is recorded in the execution context under
/// `<name>.read.position` on every `update` call, so a restarted step opens
/// the reader at the first item the failed run never committed.
pub struct InMemoryItemReader<I> {
    name: String,
    items: Vec<I>,
    position: AtomicUsize,
}

impl<I> InMemoryItemReader<I> {
    pub fn new(name: &str, items: Vec<I>) -> Self {
        Self {
            name: name.to_string(),
            items,
            position: AtomicUsize::new(0),
        }
    }

    fn position_key(&self) -> String {
        format!("{}.read.position", self.name)
    }
}

impl<I: Clone + Send + Sync> ItemReader<I> for InMemoryItemReader<I> {
    fn read(&self) -> ItemReaderResult<I> {
        let position = self.position.fetch_add(1, Ordering::SeqCst);
        Ok(self.items.get(position).cloned())
    }

    fn open(&self, execution_context: &ExecutionContext) -> Result<(), BatchError> {
        let position = execution_context
            .get_i64(&self.position_key())
            .unwrap_or(0)
            .max(0) as usize;
        debug!("Reader '{}' opened at position {}", self.name, position);
        self.position.store(position, Ordering::SeqCst);
        Ok(())
    }

    fn update(&self, execution_context: &mut ExecutionContext) -> Result<(), BatchError> {
        // read() overshoots by one at the end of the input.
        let position = self.position.load(Ordering::SeqCst).min(self.items.len());
        execution_context.put_i64(&self.position_key(), position as i64);
        Ok(())
    }
}

/// Writer collecting items into an in-memory vector, inspectable afterwards.
#[derive(Default)]
pub struct InMemoryItemWriter<O> {
    items: Mutex<Vec<O>>,
}

impl<O: Clone> InMemoryItemWriter<O> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(Vec::new()),
        }
    }

    pub fn items(&self) -> Vec<O> {
        self.items.lock().expect("writer lock poisoned").clone()
    }
}

impl<O: Clone + Send + Sync> ItemWriter<O> for InMemoryItemWriter<O> {
    fn write(&self, items: &[O]) -> ItemWriterResult {
        self.items
            .lock()
            .expect("writer lock poisoned")
            .extend_from_slice(items);
        Ok(())
    }
}
