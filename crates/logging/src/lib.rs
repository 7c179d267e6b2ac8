// Copyright 2026 The Capsule Authors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
// Enable all clippy lints except for many of the pedantic ones. It's a shame this needs to be copied and pasted across crates, but there doesn't appear to be a way to include inner attributes from a common source.
#![deny(
    clippy::all,
    clippy::default_trait_access,
    clippy::expl_impl_clone_on_copy,
    clippy::if_not_else,
    clippy::needless_continue,
    clippy::unseparated_literal_suffix,
    clippy::used_underscore_binding
)]
// It is often more clear to show that nothing is being moved.
#![allow(clippy::match_ref_pats)]
// Subjective style.
#![allow(
    clippy::len_without_is_empty,
    clippy::redundant_field_names,
    clippy::too_many_arguments
)]
// Default isn't as big a deal as people seem to think it is.
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]
// Arc<Mutex> can be more clear than needing to grok Orderings:
#![allow(clippy::mutex_atomic)]

///
/// Macro to allow fatal logging to a file which bypasses the standard logging system. Useful
/// for code paths which must not themselves depend on the logger being initialized.
///
#[macro_export]
macro_rules! fatal_log {
    ($($arg:tt)+) => {
      {
        use ::std::io::Write;
        let mut f = ::std::fs::OpenOptions::new().create(true).append(true).open("fatal.log").unwrap();
        writeln!(f, $($arg)+).unwrap()
      }
    };
}

pub mod logger;

pub use logger::CapsuleLogger as Logger;
