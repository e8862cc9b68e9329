//! Data model shared by the synchronous and asynchronous analysis surfaces.

mod batch;
mod classification;
mod events;

pub use batch::{AnalyzeRequest, Batch, ImageRef, ValidationError};
pub use classification::{Classification, TaxonomyTag, Verdict};
pub use events::{RequestEvent, ResultEvent, SourceId};
