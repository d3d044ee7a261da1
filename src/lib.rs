//! Subrequest aware HTTP response output engine
//!
//! A connection serves one main request and any number of nested subrequests. Every
//! request produces output concurrently, the engine delivers it to the connection in
//! document order, under flow control and rate limiting.
//!
//! ```no_run
//! use std::sync::Arc;
//! use weave::{Config, Engine, content::{Routes, Include, Text}};
//!
//! # async fn app() -> std::io::Result<()> {
//! let routes = Routes::new()
//!     .route("/", Include::new(r#"<p>A<!--# include virtual="/x" -->B</p>"#))
//!     .route("/x", Text::html("X"));
//! let engine = Arc::new(Engine::new(Config::default(), routes));
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await?;
//! weave::rt::serve(listener, engine).await;
//! # Ok(())
//! # }
//! ```
#![warn(missing_debug_implementations)]

mod log;
mod slab;

pub mod error;
pub mod config;

pub mod buf;
pub mod pool;
pub mod chain;

pub mod transport;
pub mod response;
pub mod request;
mod session;

pub mod filter;
pub mod content;
pub mod rt;

pub use slab::Key;
pub use config::Config;
pub use error::{AllocError, BudgetExceeded, Error};
pub use request::{ChildOptions, ChildOutput, NodeId, Request, Special};
pub use response::{ResponseHead, StatusCode};
pub use session::{Engine, Session, Waker};

#[cfg(test)]
mod test;
