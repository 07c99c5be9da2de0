//! Build execution backends for buildhook.
//!
//! Provides [`ScriptRunner`], which runs a project's build script in its
//! checkout directory.

pub mod script;

pub use buildhook_core::{BuildOutput, BuildRunner};
pub use script::ScriptRunner;
