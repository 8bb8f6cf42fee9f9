pub mod agent;
pub mod completion;
pub mod metadata;
pub mod segment;
pub mod snapshot;
pub mod transaction;
pub mod wrapper;

pub use agent::{Agent, AgentBuilder, ExceptionSink, TransactionSink};
pub use completion::{CallFailure, Completion, CompletionResult, CompletionStatus};
pub use segment::{Segment, SegmentKind, SegmentState};
pub use snapshot::{FinishedTransaction, SegmentSnapshot};
pub use transaction::Transaction;
pub use wrapper::{AfterCall, Wrapper, WrapperRegistry};
