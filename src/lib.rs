#![cfg_attr(docsrs, feature(doc_cfg))]
//#![warn(missing_docs)]

/*!
 <div align="center">
   <h1>Batchflow</h1>
   <h3>🔁 A toolkit for building restart-safe batch applications</h3>
 </div>

 # Batchflow

 **Batchflow** is a chunk-oriented batch processing engine. Jobs are flows of
 steps; each step reads items, processes them, and writes them out in
 transactional chunks. Every execution is recorded in a job repository with
 optimistic locking, so an interrupted or failed run can be restarted and
 resumes from the last committed chunk instead of starting over.

 ## Core Concepts

Understanding these core components will help you get started:

- **Job:** Represents the entire batch process. A `Job` drives a flow of one or more `Step`s and records its outcome in the repository.
- **JobInstance:** The logical identity of a job: its name plus the identifying job parameters. Re-running a failed job lands on the same instance.
- **JobRepository:** Stores instances, executions, and step executions. Refuses duplicate concurrent runs and stale concurrent updates.
- **Step:** An independent, sequential phase of a batch job. A chunk-oriented `Step` reads data, processes it, and writes it out, one chunk per transaction.
- **Flow:** A state machine wiring steps together. Transitions match on exit-status patterns, so a job can branch, end early, or fan out parallel splits.
- **ItemReader:** An abstraction that represents the retrieval of input for a `Step`, one item at a time.
- **ItemProcessor:** An abstraction that represents the business logic of processing an item. The item read by the `ItemReader` is passed to the `ItemProcessor`.
- **ItemWriter:** An abstraction that represents the output of a `Step`, one batch or chunk of items at a time.

 ## Getting Started

```rust
use batchflow::core::item::{ItemProcessor, ItemProcessorResult};
use batchflow::core::job::{Job, JobBuilder};
use batchflow::core::job_parameters::JobParametersBuilder;
use batchflow::core::repository::InMemoryJobRepository;
use batchflow::core::status::BatchStatus;
use batchflow::core::step::StepBuilder;
use batchflow::error::BatchError;
use batchflow::item::{InMemoryItemReader, InMemoryItemWriter};

#[derive(Default)]
struct UpperCaseProcessor {}

impl ItemProcessor<String, String> for UpperCaseProcessor {
    fn process(&self, item: &String) -> ItemProcessorResult<String> {
        Ok(item.to_uppercase())
    }
}

fn main() -> Result<(), BatchError> {
    let repository = InMemoryJobRepository::new();
    let parameters = JobParametersBuilder::new()
        .add_string("input", "makes")
        .build();

    let reader = InMemoryItemReader::new(
        "makes",
        vec!["porsche".to_string(), "peugeot".to_string(), "mazda".to_string()],
    );
    let processor = UpperCaseProcessor::default();
    let writer: InMemoryItemWriter<String> = InMemoryItemWriter::new();

    let step = StepBuilder::new("upper-case-makes")
        .reader(&reader) // set the input source
        .writer(&writer) // set the output sink
        .processor(&processor) // set the upper case processor
        .chunk(2) // set the commit interval
        .build()?;

    let job = JobBuilder::new()
        .name("import-makes".to_string())
        .repository(&repository)
        .parameters(parameters)
        .start(&step)
        .build()?;
    let execution = job.run()?;

    assert_eq!(execution.status, BatchStatus::Completed);
    assert_eq!(writer.items().len(), 3);

    Ok(())
}
```

 ## Restart Behavior

 A job execution that fails leaves its step executions and their execution
 contexts behind in the repository. Running the same job with the same
 identifying parameters creates a new execution on the same instance:
 completed steps are skipped, and the failed step reopens its reader at the
 position saved with the last committed chunk. A completed instance refuses
 another run unless the job allows it.

 ## License
 Licensed under either of

 -   Apache License, Version 2.0
     ([LICENSE-APACHE](LICENSE-APACHE) or <http://www.apache.org/licenses/LICENSE-2.0>)
 -   MIT license
     ([LICENSE-MIT](LICENSE-MIT) or <http://opensource.org/licenses/MIT>)

 at your option.

 ## Contribution
 Unless you explicitly state otherwise, any contribution intentionally submitted
 for inclusion in the work by you, as defined in the Apache-2.0 license, shall be
 dual licensed as above, without any additional terms or conditions

 */

/// Core module for batch operations
pub mod core;

/// Error types for batch operations
pub mod error;

#[doc(inline)]
pub use error::*;

/// Set of item readers / writers (for example: in-memory reader and writer)
pub mod item;
