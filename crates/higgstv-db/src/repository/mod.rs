//! Entity repositories. Built only on the [`Store`](crate::store::Store)
//! contract, so each one works unchanged on either backend.

pub mod channels;
pub mod programs;
pub mod users;

pub use channels::{ChannelRepository, ListChannelsQuery};
pub use programs::ProgramRepository;
pub use users::UserRepository;

use chrono::Utc;
use serde_json::Value;

use crate::document::import::format_timestamp;
use crate::dsl::UpdateResult;
use crate::error::{Result, StoreError};

pub(crate) fn now() -> Value {
    Value::String(format_timestamp(Utc::now()))
}

/// Turn "nothing matched" into a not-found error.
pub(crate) fn require_match(res: UpdateResult, what: impl FnOnce() -> String) -> Result<UpdateResult> {
    if res.matched == 0 {
        return Err(StoreError::not_found(what()));
    }
    Ok(res)
}
