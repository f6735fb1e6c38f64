pub mod blind;
pub mod chunked;
pub mod raw_http;

pub use crate::domain::model::{CapturedRequest, ProbeOutcome, RawResponse};
pub use crate::domain::ports::Oracle;
pub use crate::utils::error::Result;
