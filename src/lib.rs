pub mod attachments;
pub mod claim_time;
pub mod config;
pub mod fetcher;
pub mod mailbox;
pub mod message;
pub mod outcome;
pub mod pipeline;
pub mod recorder;
pub mod responder;
pub mod store;
pub mod subject;
pub mod validator;

pub use attachments::{AttachmentProcessor, PhotoReport};
pub use claim_time::{ClaimTimeResolver, RallyWindow};
pub use config::{Config, ConfigSource};
pub use fetcher::{run_cycle, CycleReport, FetchCycle};
pub use outcome::ClaimOutcome;
pub use pipeline::{Disposition, IngestError, Ingestor};
pub use recorder::{ClaimRecord, ClaimRecorder};
pub use store::ScoreStore;
pub use subject::{ParseMode, ParsedClaim, SubjectParser};
pub use validator::EntrantBonusValidator;
