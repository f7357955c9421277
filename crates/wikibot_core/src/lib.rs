pub mod batch;
pub mod category;
pub mod client;
pub mod config;
pub mod error;
pub mod page;
pub mod retry;
pub mod session;
pub mod sparql;
pub mod transforms;
pub mod transport;
pub mod wikibase;

#[cfg(test)]
mod testing;

pub use batch::{
    BatchEditOrchestrator, BatchOutcome, BatchReport, CancelFlag, PageSource, RunPolicy, TitleList,
    Transform, TransformOutcome,
};
pub use client::{ClientConfig, HttpApiClient};
pub use error::{ApiError, AuthError, ErrorKind, classify_error};
pub use page::{PageContent, PageHandle, SaveOptions, SaveOutcome, WikiPageApi};
pub use retry::RetryPolicy;
pub use session::{Credentials, SessionState, WikiSession};
