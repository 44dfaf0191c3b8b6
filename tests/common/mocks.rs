//! Mock item writer used to verify chunking behavior.
use mockall::mock;

use batchflow::BatchError;
use batchflow::core::item::{ItemWriter, ItemWriterResult};

mock! {
    pub Writer {}
    impl ItemWriter<i32> for Writer {
        fn write(&self, items: &[i32]) -> ItemWriterResult;
        fn flush(&self) -> ItemWriterResult;
        fn open(&self) -> Result<(), BatchError>;
        fn close(&self) -> Result<(), BatchError>;
    }
}
