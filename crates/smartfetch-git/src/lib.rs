//! Git smart HTTP fetch client for smartfetch.
//!
//! This crate implements the client side of `git-upload-pack` over HTTP:
//! ref discovery, stateless want/have negotiation, and streaming pack
//! ingestion into any store implementing the `smartfetch-storage` traits.
//!
//! ```no_run
//! use smartfetch_git::{FetchOptions, Fetcher, HttpTransport};
//! use smartfetch_storage::FsRepository;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let repo = FsRepository::open(".").await?;
//! let fetcher = Fetcher::new(repo, HttpTransport::new()?);
//! let options = FetchOptions::new().with_depth(1);
//! for result in fetcher.fetch("https://example.com/repo.git", &options).await? {
//!     println!("{} -> {}", result.ref_name, result.to);
//! }
//! # Ok(())
//! # }
//! ```

mod advertisement;
mod capabilities;
mod delta;
mod error;
mod fetch;
#[cfg(feature = "http")]
mod http;
mod negotiation;
mod pack;
mod pktline;
mod refspec;
mod request;
mod shallow;
mod sideband;
mod transport;

pub use advertisement::{parse_advertisement, Ref, RefAdvertisement};
pub use capabilities::{Capabilities, Capability, AGENT};
pub use delta::apply_delta;
pub use error::FetchError;
pub use fetch::{ls_remote, FetchOptions, FetchResult, Fetcher};
#[cfg(feature = "http")]
pub use http::{HttpTransport, USER_AGENT};
pub use negotiation::{
    Acknowledgement, NegotiationConfig, NegotiationInput, NegotiationRequest, Negotiator,
};
pub use pack::{ObjectRecord, PackIngestOptions, PackIngestor};
pub use pktline::{PktLine, PktLineReader, PktLineWriter, MAX_PKT_LEN};
pub use refspec::{map_refs, parse_refspecs, MappedRef, Refspec, DEFAULT_REFSPEC};
pub use request::compose_request;
pub use shallow::{ShallowSet, ShallowUpdate, SHALLOW_KEY};
pub use sideband::{Channel, Progress};
pub use transport::{
    BodyReader, BodyStream, HttpRequest, HttpResponse, Method, Transport, UPLOAD_PACK,
};

/// Result type for fetch operations.
pub type Result<T> = std::result::Result<T, FetchError>;
