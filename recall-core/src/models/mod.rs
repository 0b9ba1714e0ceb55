pub mod session;

pub use session::{QueryResult, Session, SessionMetadata, SessionSummary};
