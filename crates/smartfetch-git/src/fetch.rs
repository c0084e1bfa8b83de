//! Fetch orchestration.
//!
//! Ties discovery, negotiation and pack ingestion together:
//!
//! 1. read local refs and the shallow set,
//! 2. `GET info/refs` and map the advertised refs through the refspecs,
//! 3. negotiate with one `POST git-upload-pack` per round,
//! 4. store every object of the final pack,
//! 5. persist the shallow set and update the tracking refs.
//!
//! Step 5 only runs once the pack has been verified.

use crate::advertisement::{parse_advertisement, RefAdvertisement};
use crate::negotiation::{read_acknowledgements, NegotiationConfig, NegotiationInput, Negotiator};
use crate::pack::{PackIngestOptions, PackIngestor};
use crate::pktline::PktLineReader;
use crate::refspec::{map_refs, parse_refspecs};
use crate::request::compose_request;
use crate::shallow::{read_shallow_info, ShallowSet, ShallowUpdate};
use crate::sideband::Progress;
use crate::transport::{HttpRequest, HttpResponse, Transport, UPLOAD_PACK};
use crate::{FetchError, Result};
use bytes::Bytes;
use serde::Serialize;
use smartfetch_storage::{ObjectId, ObjectStore, RefStore};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// Options for a single fetch.
#[derive(Clone, Default)]
pub struct FetchOptions {
    /// Refspecs; empty means `refs/heads/*:refs/remotes/origin/*`.
    pub refspecs: Vec<String>,
    /// Limit history to this many commits from each wanted tip.
    pub depth: Option<u32>,
    /// Fetch the history behind the current shallow boundaries.
    pub unshallow: bool,
    /// Receives server progress text.
    pub progress: Option<Progress>,
    /// Negotiation tunables.
    pub negotiation: NegotiationConfig,
}

impl FetchOptions {
    /// Creates default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a refspec.
    pub fn with_refspec(mut self, refspec: impl Into<String>) -> Self {
        self.refspecs.push(refspec.into());
        self
    }

    /// Sets the history depth.
    pub fn with_depth(mut self, depth: u32) -> Self {
        self.depth = Some(depth);
        self
    }

    /// Requests the full history of a shallow repository.
    pub fn with_unshallow(mut self, unshallow: bool) -> Self {
        self.unshallow = unshallow;
        self
    }

    /// Installs a progress callback.
    pub fn with_progress<F>(mut self, progress: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(progress));
        self
    }

    /// Replaces the negotiation tunables.
    pub fn with_negotiation(mut self, negotiation: NegotiationConfig) -> Self {
        self.negotiation = negotiation;
        self
    }
}

impl fmt::Debug for FetchOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchOptions")
            .field("refspecs", &self.refspecs)
            .field("depth", &self.depth)
            .field("unshallow", &self.unshallow)
            .field("progress", &self.progress.is_some())
            .field("negotiation", &self.negotiation)
            .finish()
    }
}

/// Outcome for one local ref.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FetchResult {
    /// Local ref that was updated.
    pub ref_name: String,
    /// Value before the fetch, if the ref existed.
    pub from: Option<ObjectId>,
    /// Value after the fetch.
    pub to: ObjectId,
}

impl FetchResult {
    /// Returns true if the ref moved or was created.
    pub fn is_changed(&self) -> bool {
        self.from != Some(self.to)
    }
}

/// Fetches the ref advertisement of `url`.
pub async fn ls_remote<T: Transport + ?Sized>(transport: &T, url: &str) -> Result<RefAdvertisement> {
    let request = HttpRequest::info_refs(url);
    let request_url = request.url.clone();
    let response = transport
        .send(request)
        .await?
        .error_for_status(&request_url)?;
    parse_advertisement(response.into_reader(), UPLOAD_PACK).await
}

/// Fetches from smart-HTTP remotes into a repository.
#[derive(Debug)]
pub struct Fetcher<R, T> {
    repo: R,
    transport: T,
}

impl<R, T> Fetcher<R, T>
where
    R: ObjectStore + RefStore,
    T: Transport,
{
    /// Creates a fetcher.
    pub fn new(repo: R, transport: T) -> Self {
        Self { repo, transport }
    }

    /// The repository fetched into.
    pub fn repo(&self) -> &R {
        &self.repo
    }

    /// The transport used for requests.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Lists the refs of a remote without fetching anything.
    pub async fn ls_remote(&self, url: &str) -> Result<RefAdvertisement> {
        ls_remote(&self.transport, url).await
    }

    /// Fetches `url` and updates the refs selected by the refspecs.
    ///
    /// Returns one result per mapped ref, in advertisement order, including
    /// refs that did not change.
    ///
    /// Refs are always overwritten, whether or not the refspec carries `+`;
    /// history is not walked to check for fast-forwards.
    #[tracing::instrument(skip(self, options))]
    pub async fn fetch(&self, url: &str, options: &FetchOptions) -> Result<Vec<FetchResult>> {
        if options.depth == Some(0) {
            return Err(FetchError::invalid_request("depth must be positive"));
        }
        let refspecs = parse_refspecs(&options.refspecs)?;

        let (local_refs, shallow) = tokio::join!(self.local_refs(), ShallowSet::load(&self.repo));
        let local_refs = local_refs?;
        let shallow = shallow?;

        let advertisement = self.ls_remote(url).await?;
        let mapped = map_refs(&refspecs, &advertisement.refs);

        let mut local = Vec::new();
        let mut seen = HashSet::new();
        let candidates = local_refs
            .iter()
            .map(|(_, id)| *id)
            .chain(advertisement.refs.iter().map(|r| r.id));
        for id in candidates {
            if seen.insert(id) && self.repo.has_object(&id).await? {
                local.push(id);
            }
        }

        let input = NegotiationInput {
            remote: advertisement.refs.iter().map(|r| r.id).collect(),
            local,
            wanted: mapped.iter().map(|m| m.id).collect(),
            shallows: shallow.to_vec(),
            depth: options.depth,
            unshallow: options.unshallow,
        };
        let mut negotiator = Negotiator::new(input, options.negotiation.clone());

        let mut objects = 0usize;
        let mut merged = shallow.clone();
        if negotiator.has_wants() {
            let updates = self
                .negotiate(url, &advertisement, &mut negotiator, options, &mut objects)
                .await?;

            if options.unshallow {
                merged.clear();
            }
            for update in &updates {
                merged.apply(update);
            }
        } else {
            tracing::debug!("Nothing to fetch");
        }

        // Nothing is written until every target is known to be stored.
        for mapped_ref in &mapped {
            if !self.repo.has_object(&mapped_ref.id).await? {
                return Err(FetchError::protocol(format!(
                    "{} points to {} which the remote did not send",
                    mapped_ref.remote, mapped_ref.id
                )));
            }
        }

        if merged != shallow {
            merged.persist(&self.repo).await?;
            tracing::debug!(before = shallow.len(), after = merged.len(), "Updated shallow set");
        }

        let previous: HashMap<&str, ObjectId> = local_refs
            .iter()
            .map(|(name, id)| (name.as_str(), *id))
            .collect();
        let results: Vec<FetchResult> = mapped
            .iter()
            .map(|mapped_ref| FetchResult {
                ref_name: mapped_ref.local.clone(),
                from: previous.get(mapped_ref.local.as_str()).copied(),
                to: mapped_ref.id,
            })
            .collect();
        for result in &results {
            self.repo.set_ref(&result.ref_name, result.to).await?;
        }

        tracing::info!(
            refs = results.len(),
            updated = results.iter().filter(|r| r.is_changed()).count(),
            objects,
            rounds = negotiator.rounds(),
            "Fetch complete"
        );
        Ok(results)
    }

    /// Runs negotiation rounds and ingests the final pack.
    ///
    /// Returns the shallow-info lines of the final response.
    async fn negotiate(
        &self,
        url: &str,
        advertisement: &RefAdvertisement,
        negotiator: &mut Negotiator,
        options: &FetchOptions,
        objects: &mut usize,
    ) -> Result<Vec<ShallowUpdate>> {
        let capabilities = &advertisement.capabilities;
        let progress = options.progress.is_some();

        while let Some(request) = negotiator.next_request() {
            let body = compose_request(&request, capabilities, progress)?;
            let response = self.post(url, body).await?;

            if !request.done {
                let mut reader = PktLineReader::new(response.into_reader());
                if request.expects_shallow_info() {
                    read_shallow_info(&mut reader).await?;
                }
                let acks = read_acknowledgements(&mut reader).await?;
                negotiator.receive(&acks);
                continue;
            }

            let ingest_options = PackIngestOptions {
                expects_shallow_info: request.expects_shallow_info(),
                side_band: capabilities.uses_side_band(),
                progress: options.progress.clone(),
            };
            let mut ingestor = PackIngestor::start(response.into_reader(), ingest_options).await?;
            while let Some(record) = ingestor.next_object(&self.repo).await? {
                self.repo.save_raw(&record.id, record.body).await?;
                *objects += 1;
            }
            return Ok(ingestor.shallow_updates()?.to_vec());
        }

        Err(FetchError::protocol("negotiation ended without a pack"))
    }

    async fn post(&self, url: &str, body: Bytes) -> Result<HttpResponse> {
        let request = HttpRequest::upload_pack(url, body);
        let request_url = request.url.clone();
        self.transport
            .send(request)
            .await?
            .error_for_status(&request_url)
    }

    async fn local_refs(&self) -> Result<Vec<(String, ObjectId)>> {
        let mut refs = Vec::new();
        for name in self.repo.list_refs().await? {
            if let Some(id) = self.repo.get_ref(&name).await? {
                refs.push((name, id));
            }
        }
        Ok(refs)
    }
}
