//! Credential lifecycle for the Depfleet update orchestrator.
//!
//! Everything here exists to answer one question cheaply and safely: *which
//! credential does this repository's update run use?* For the installable
//! application platform that means discovering installations and minting
//! short-lived access tokens; for the static-token platform it means
//! selecting the best-matching operator-managed credential. The expensive
//! lookups sit on [`cache::StaleCache`], a stale-while-revalidate cache
//! with singleflight refresh coalescing.

pub mod cache;
pub mod github;
pub mod installations;
pub mod mock;
pub mod platform;
pub mod selector;
pub mod tokens;

pub use cache::StaleCache;
pub use github::GithubAppClient;
pub use installations::{Installation, InstallationDirectory};
pub use mock::MockAppApi;
pub use platform::{GithubAppApi, MintedToken, normalize_repository};
pub use selector::{
    StaticCredentialCandidate, StaticCredentialSource, candidate_from_secret, select_candidate,
};
pub use tokens::{TokenIssuer, TokenRecord};
