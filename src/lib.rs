//! composeapp: fetch, verify, install and update compose applications
//! shipped as OCI artifacts.
//!
//! An app is a digest-pinned OCI manifest whose first layer is a compose
//! bundle (`docker-compose.yml` and friends) and whose services reference
//! digest-pinned images. The crate loads every app as a Merkle tree of
//! typed descriptors, copies missing blobs into a content-addressed store,
//! loads the images into the container daemon and starts the projects,
//! tracking each step in a persistent update record.
//!
//! # Example
//!
//! ```no_run
//! use composeapp::config::Config;
//! use composeapp::update::{Env, InitOptions, Runner};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> composeapp::Result<()> {
//!     let runner = Runner::new(Env::from_config(Config::load(None)?)?);
//!     let cancel = CancellationToken::new();
//!
//!     runner
//!         .create("ci-1234", vec!["hub.example.com/factory/web@sha256:...".into()], false)
//!         .await?;
//!     runner.init(InitOptions::default(), &cancel).await?;
//!     runner.fetch(&cancel, |u| println!("fetched {}%", u.progress)).await?;
//!     runner.install(&cancel, |_| {}).await?;
//!     runner.start(&cancel).await?;
//!     runner.complete(true, &cancel).await?;
//!     Ok(())
//! }
//! ```

pub mod app;
pub mod blob;
pub mod compose;
pub mod config;
pub mod docker;
pub mod error;
pub mod fetch;
pub mod install;
pub mod progress;
pub mod status;
pub mod update;
pub mod usage;

pub use error::{Error, ErrorKind, Result};
