//! Claim extraction and claim-to-role mapping

mod mapper;
pub mod path;

pub use mapper::map_principal;
pub use path::{ClaimPath, ClaimPathError, PathSegment};
