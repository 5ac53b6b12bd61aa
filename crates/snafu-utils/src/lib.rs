//! Error plumbing shared by the heap crates.
//!
//! - [`Location`] records where an error was constructed. Use it as an
//!   `#[snafu(implicit)]` field.
//! - [`ErrorLocation`] exposes that location, and the one of the source, to
//!   [`Report`].
//! - [`Report`] renders an error together with its chain of sources.
//! - [`report`] aborts the current operation with a rendered report, for
//!   errors that leave no way to continue.

#![cfg_attr(not(test), no_std)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

use core::{error::Error, fmt};

use snafu::GenerateImplicitData;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Location(&'static core::panic::Location<'static>);

impl Location {
    #[must_use]
    pub fn file(&self) -> &'static str {
        self.0.file()
    }

    #[must_use]
    pub fn line(&self) -> u32 {
        self.0.line()
    }
}

impl Default for Location {
    #[track_caller]
    fn default() -> Self {
        Self(core::panic::Location::caller())
    }
}

impl GenerateImplicitData for Location {
    #[track_caller]
    fn generate() -> Self {
        Self::default()
    }
}

impl fmt::Debug for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// An error that records where it was constructed.
pub trait ErrorLocation: Error {
    /// Location the error was constructed at, if recorded.
    fn location(&self) -> Option<Location>;

    /// Returns [`Error::source`] as an `ErrorLocation`, if it is one.
    ///
    /// Must refer to the same error as `source()` when it returns `Some`.
    fn located_source(&self) -> Option<&dyn ErrorLocation> {
        None
    }
}

/// Renders an error and every error in its source chain.
///
/// ```text
/// Error: cannot grow heap for a 0x10020 byte block
///   at crates/kheap/src/heap/allocate.rs:LL:CC
///
/// Caused by:
///    0: heap end 0x...5000 would exceed limit 0x...4000
///       at crates/kheap/src/heap/mod.rs:LL:CC
/// ```
pub struct Report<E> {
    error: E,
}

impl<E> Report<E> {
    pub fn new(error: E) -> Self {
        Self { error }
    }
}

impl<E> fmt::Debug for Report<E>
where
    E: ErrorLocation,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl<E> fmt::Display for Report<E>
where
    E: ErrorLocation,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Error: {}", self.error)?;
        if let Some(loc) = self.error.location() {
            writeln!(f, "  at {loc}")?;
        }
        let mut source = self.error.source();
        let mut located = self.error.located_source();
        if source.is_some() {
            writeln!(f)?;
            writeln!(f, "Caused by:")?;
        }
        let mut index = 0;
        while let Some(s) = source {
            writeln!(f, "{index:4}: {s}")?;
            if let Some(loc) = located.and_then(|err| err.location()) {
                writeln!(f, "      at {loc}")?;
            }
            source = s.source();
            located = located.and_then(|err| err.located_source());
            index += 1;
        }
        Ok(())
    }
}

/// Panics with a rendered [`Report`] of `err`.
#[track_caller]
pub fn report<E>(err: E) -> !
where
    E: ErrorLocation,
{
    let report = Report::new(err);
    panic!("Critical error occurred\n\n{report}");
}
