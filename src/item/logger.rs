use std::fmt::Debug;

use log::info;

use crate::{BatchError, core::item::ItemWriter};

/// Writer that logs each item at info level instead of persisting it. Handy
/// as the sink of a smoke-test job.
#[derive(Default)]
pub struct LoggerWriter {}

impl<T> ItemWriter<T> for LoggerWriter
where
    T: Debug + Send + Sync,
{
    fn write(&self, items: &[T]) -> Result<(), BatchError> {
        items.iter().for_each(|item| info!("Record:{:?}", item));
        Ok(())
    }
}
