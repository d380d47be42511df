#![deny(warnings)]
#![deny(dead_code)]
#![deny(unused_variables)]
#![deny(unused_imports)]

//! kbsearch-core
//!
//! Data model, error taxonomy, collaborator traits, tokenization and
//! configuration shared by the index crates and the retrieval pipeline.

pub mod config;
pub mod error;
pub mod tokenize;
pub mod traits;
pub mod types;

pub use error::{Error, Result};
