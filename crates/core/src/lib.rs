#![forbid(unsafe_code)]
#![deny(unreachable_pub)]

//! Shared data model and wire protocol for the `jobq` job queue.
//!
//! The master process and its workers exchange the message types defined
//! here over framed byte channels; no state is shared any other way.

pub mod channel;
pub mod error;
pub mod job;
pub mod message;
pub mod settings;
pub mod status;
pub mod worker;

pub use channel::{Channel, ChannelError, FramedReader, FramedWriter, duplex_pair, stdio_channel};
pub use error::{JobError, JobErrorKind};
pub use job::{InvalidTransition, JobInfo, now_millis};
pub use message::{MasterMessage, WorkerMessage};
pub use settings::QueueSettings;
pub use status::JobStatus;
pub use worker::{WorkerId, WorkerInfo, WorkerStatus};
