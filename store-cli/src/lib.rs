//! `verso-store` CLI tools.
//!
//! ## Getting started
//!
//! ```doc
//! ❯ ./storecli init ./data
//! ❯ ./storecli put ./data greeting "hello" --base-version <v0>
//! ❯ ./storecli get ./data greeting --at <v0>
//! hello
//! ```

pub mod command;
pub mod config;
pub mod trace;
