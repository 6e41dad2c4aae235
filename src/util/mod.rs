//! Shared utilities that are not GC semantics: configuration, logging and
//! test plumbing.

pub mod logger;
pub mod options;
pub mod test_util;
