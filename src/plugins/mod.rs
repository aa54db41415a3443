//! Validators and database safety plugins.
//!
//! Each validator implements [`crate::core::finding::Validator`] and is
//! registered with the pipeline by the service; the backup manager is used by
//! the database guardian before destructive statements.

pub mod backup;
pub mod guardian;
pub mod hallucination;
pub mod security;
