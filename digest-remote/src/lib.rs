//! Remote boundaries of the weekly digest: the bookmark archive, the
//! notebook / generation service and audio publishing.
//!
//! - [`boundary`]: capability traits and their value types
//! - [`readeck`], [`notebook`], [`upload`]: production adapters
//! - `fake`: in-memory stand-ins for tests (`test-support` feature)
//! - [`error`]: [`RemoteError`]

pub mod boundary;
pub mod error;
#[cfg(any(test, feature = "test-support"))]
pub mod fake;
mod http;
pub mod notebook;
pub mod readeck;
pub mod upload;

pub use boundary::{
    ArchiveBoundary, ArchiveItem, AudioRequest, AudioUploader, NotebookBoundary, RemoteStatus,
    SourceSubmission, SubmissionPayload,
};
pub use error::RemoteError;
pub use notebook::OpenNotebookClient;
pub use readeck::ReadeckClient;
pub use upload::{episode_filename, LocalUploader};
