//! The four pipeline stages
//!
//! Data flows feed-check → fetch → build → burn, one queue stage per hop:
//!
//! | Stage       | Consumes              | Produces              |
//! |-------------|-----------------------|-----------------------|
//! | [`FeedCheck`] | `feedchk-url-*`     | `fetch-desc-*`        |
//! | [`Fetch`]     | `fetch-desc-*`      | `isobuild-item-*`     |
//! | [`Build`]     | `isobuild-item-*`   | `discburn-iso-*`      |
//! | [`Burn`]      | `discburn-iso-*`    | a physical disc       |

mod build;
mod burn;
mod feedchk;
mod fetch;

pub use build::{Batch, BatchLimits, Build, plan_batch, select_candidates, should_build};
pub use burn::{Burn, DriveState, STATUS_ACTION_REQUIRED, STATUS_CHECKING, STATUS_OK};
pub use feedchk::{FeedCheck, FeedCheckSettings, Selection, ValidEntry, select_new_entries};
pub use fetch::Fetch;

use serde::{Deserialize, Serialize};

/// Queue payload asking the fetch stage to download one enclosure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchDescriptor {
    pub url: String,
    pub title: String,
}
