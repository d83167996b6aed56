//! Data models for bunkreq-sync

pub mod bunk_request;
pub mod original_request;
pub mod parse;
pub mod source_link;

pub use bunk_request::{BunkRequest, RequestIdentity, RequestStatus, RequestType};
pub use original_request::{ChangeKind, OriginalRequest, SourceRow};
pub use parse::{
    ParseRequest, ParseResult, ParsedRequest, Person, PlaceholderKind, RequestPair,
    RequesterContext, ResolutionResult, PLACEHOLDER_METHOD,
};
pub use source_link::{LinkWithField, NewSourceLink, SourceLink};
