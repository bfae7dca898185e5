#![forbid(unsafe_code)]

//! Path expressions: tokenizer and resolver.
//!
//! A path such as `user.tags["home"].items[0].title` is tokenized once into
//! a [`ParsedPath`] and then walked against a container. The walk yields the
//! final target plus every intermediate attribute it crossed, which is what
//! path attributes subscribe to in order to rewire on replacement.

pub(crate) mod resolve;
mod token;

pub use resolve::{Hop, HopStatus, Preflight, ResolvedPath};
pub use token::{ParsedPath, Token, parse_path};
