//! # Dispatch Core
//!
//! Core types for the Dispatch message pipeline.
//!
//! This crate provides the foundational types used throughout Dispatch:
//!
//! - [`Message`] - Immutable envelope (id, kind, type name, headers, tags, body)
//! - [`MessageKind`] - Action / Event / Document bitmask
//! - [`MessageId`] - UUID v7 message identifier
//! - [`DispatchOutcome`] - `Success(payload)` or `Failed(ProblemDetails)`
//! - [`DispatchError`] - The error taxonomy shared by every pipeline stage
//! - [`ports`] - Narrow interfaces to external collaborators

#![doc(html_root_url = "https://docs.rs/dispatch-core/0.1.0")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod error;
mod message;
mod outcome;
pub mod ports;

pub use error::{DispatchError, ErrorCategory, FaultKind, FieldErrors};
pub use message::{Message, MessageBuilder, MessageId, MessageKind, CORRELATION_ID_HEADER};
pub use outcome::{DispatchOutcome, DispatchResult, ProblemDetails};

use std::future::Future;
use std::pin::Pin;

/// A boxed, sendable future.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
