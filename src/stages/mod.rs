//! The concrete pipeline stages.
//!
//! Each consuming stage is a [`StageHandler`](crate::pipeline::StageHandler) holding its
//! collaborators behind traits, so production wiring and tests differ only in what is passed
//! to the constructor. The upload trigger is the producer at the head of the pipeline.

pub mod apply_result;
pub mod index;
pub mod ocr;
pub mod summarize;
pub mod upload;

pub use apply_result::ApplyResultStage;
pub use index::IndexStage;
pub use ocr::OcrStage;
pub use summarize::SummarizeStage;
pub use upload::{UploadError, UploadRequest, UploadTrigger};
