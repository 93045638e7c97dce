#![warn(clippy::pedantic)]
// Don't care enough to fix
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::wildcard_imports)]

pub mod cache;
pub mod recursive;
pub mod upstream;

/// Maximum recursion depth.  Every referral followed, and every
/// nameserver address looked up, uses up one level.
///
/// This is to protect against a maliciously-configured upstream
/// nameserver which refers the resolver around in a loop.
pub const RECURSION_LIMIT: usize = 32;
