#![warn(rust_2018_idioms)]
#![allow(dead_code)]

//! Mirroring of live RTP tracks for concurrent, independent consumers.
//!
//! A [`mirror::MirroredTrack`] re-publishes every encoding layer of a
//! [`source::SourceTrack`] through a dedicated [`buffer::DuplicationBuffer`],
//! so each downstream context reads from its own copy of the stream and never
//! contends with the producer or with sibling mirrors. Attach/detach
//! reference counting drives `attached`/`detached`/`stopped` lifecycle events
//! published on a per-instance [`event::EventChannel`].

#[macro_use]
extern crate lazy_static;

pub(crate) const UNSPECIFIED_STR: &str = "Unspecified";

pub mod assembler;
pub mod buffer;
pub mod error;
pub mod event;
pub mod mirror;
pub mod source;

pub use error::{Error, Result};
