//! Byte streams opened by URL.
//!
//! A [`Registry`] maps URL schemes such as `cip:` or `mmap:` to
//! [`SchemeHandler`]s. Plugins add their handlers through a [`PluginInit`]
//! entry point. URLs without a scheme are opened as local files.
//!
//! Every opened stream is an [`HFile`]: a [`Backend`] plus the [`Mode`] it was
//! opened with. Errors follow the `std::io::Error` convention so that a
//! handler wrapping another stream can pass the inner error through unchanged.

mod file;
mod mode;
mod registry;
mod stream;

pub use {
    file::FileHandler,
    mode::{Access, Mode},
    registry::{BUILTIN_PRIORITY, PluginInit, Registry, SchemeHandler, scheme_of, strip_scheme},
    stream::{Backend, HFile},
};
