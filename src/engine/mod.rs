pub mod catalog;
pub mod error;
pub mod quality;
pub mod registry;
pub mod relay;
pub mod selector;
pub mod session;
pub mod worker;

pub use error::EngineError;
pub use registry::{CancelOutcome, SessionRegistry};
pub use relay::ClientMessage;
pub use session::{ContentKind, DownloadSession, RequestParams, SessionStatus};
pub use worker::DownloadEngine;
