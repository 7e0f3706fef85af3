//! Feed endpoints and the collaborator that retrieves them

mod endpoint;
mod source;

pub use endpoint::{FeedEndpoint, FeedState, STATUS_PREFIX, URL_PREFIX};
pub use source::{
    ConditionalRequest, FeedClientConfig, FeedError, FeedResponse, FeedSource, HttpFeedSource,
    RawEntry,
};
