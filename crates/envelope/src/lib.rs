//! # Envelope Helper Crate
//!
//! Strongly-typed result envelopes for the supervisor. An envelope carries either
//! a success payload or an [`ErrorInfo`], plus diagnostics, per-phase timing
//! metrics and provenance. Producers build envelopes in-process; the text or JSON
//! rendering happens at whichever boundary has to emit them.
//!
//! ```rust
//! use envelope::*;
//! use std::time::Duration;
//!
//! let envelope = ResultEnvelope::builder()
//!     .success("container output")
//!     .add_info("container started")
//!     .record_phase("executing", Duration::from_millis(120))
//!     .with_source_info("udocker-exec", Some("0.1.0"), Some("request-01"))
//!     .build()
//!     .expect("Valid envelope");
//!
//! assert!(envelope.result.is_success());
//! ```
//!
//! Failures carry a stable code next to the message:
//!
//! ```rust
//! use envelope::*;
//!
//! let envelope = ResultEnvelope::<()>::builder()
//!     .error_with_code("image pull failed", "SUPERVISOR_PROVISIONING_ERROR")
//!     .add_error("udocker pull exited with status 1")
//!     .build()
//!     .expect("Valid envelope");
//!
//! assert!(envelope.result.is_error());
//! ```

mod builder;
mod envelope;

pub use builder::*;
pub use envelope::*;
