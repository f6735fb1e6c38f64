pub mod adapters;
pub mod config;
pub mod core;
pub mod domain;
pub mod template;
pub mod utils;

#[cfg(feature = "cli")]
pub use config::CliConfig;
pub use config::SolverConfig;

pub use adapters::ctfd::{ChallengeFilter, CtfdClient, Credentials};
pub use adapters::ctftime::{CtftimeClient, EventFilter};
pub use adapters::http::BaseApi;
pub use adapters::rpc::{Account, Address, Contract, RpcClient, Token};
pub use adapters::server::{CallbackHandle, CallbackServer};
pub use adapters::sqli::{Indicator, SqlLikeOracle};
pub use adapters::tube::{Target, Tube};
pub use core::blind::{BlindExtractor, RetryPolicy};
pub use domain::model::{CapturedRequest, ProbeOutcome, RawResponse};
pub use domain::ports::Oracle;
pub use template::{TemplateContext, TemplateKind};
pub use utils::error::{CtfError, Result};
