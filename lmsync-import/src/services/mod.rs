//! Import pipeline services
//!
//! Leaf-first: LMS client and file staging, normalizers, the pure
//! reconciler, the repository writer, the run controller that drives
//! them, scheduling, and failed-run notification.

pub mod file_stager;
pub mod lms_client;
pub mod normalizer;
pub mod notifier;
pub mod reconciler;
pub mod repository_writer;
pub mod run_controller;
pub mod scheduler;

pub use file_stager::FileStager;
pub use lms_client::{FetchError, LmsClient, LmsSource, StagedFile};
pub use normalizer::{normalizer_for, Normalizer, ValidationError};
pub use notifier::{FailureNotifier, NotifyError, WebhookNotifier};
pub use reconciler::{reconcile, Decision, RecordDiff};
pub use repository_writer::{RepositoryWriter, VersionChange, WriteError, WriteOutcome};
pub use run_controller::{RunController, RunError};
pub use scheduler::run_on_schedule;
