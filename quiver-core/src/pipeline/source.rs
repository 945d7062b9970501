use std::future::Future;
use std::sync::Arc;

use quiver_common::dependency::{DescriptorRequest, ResolvedDescriptor};
use quiver_common::error::{QuiverError, Result};
use quiver_common::model::{Module, VersionConstraint};
use quiver_net::FileFetcher;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::descriptor::VersionListing;
use crate::repository::Repository;

/// Where the orchestrator gets descriptors from. The resolver only ever
/// sees this seam, so tests drive it with an in-memory universe.
pub trait DescriptorSource: Send + Sync + 'static {
    fn load(
        &self,
        request: DescriptorRequest,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<ResolvedDescriptor>> + Send;
}

/// The production source: repositories in priority order through the
/// cache fetcher; the first descriptor found wins.
pub struct RemoteSource {
    repositories: Vec<Repository>,
    fetcher: Arc<FileFetcher>,
}

impl RemoteSource {
    pub fn new(repositories: Vec<Repository>, fetcher: Arc<FileFetcher>) -> Self {
        Self {
            repositories,
            fetcher,
        }
    }

    /// Resolve `latest.*` and range constraints against the repository
    /// version listings.
    async fn resolve_version(
        &self,
        module: &Module,
        constraint: &VersionConstraint,
        cancel: &CancellationToken,
    ) -> Result<String> {
        // Soft and exact constraints name their version; they never
        // consult the listing, and a miss surfaces as NotFound from the
        // descriptor walk below.
        if let Some(version) = constraint.preferred() {
            return Ok(version.to_string());
        }
        let mut last_error: Option<QuiverError> = None;
        for repository in &self.repositories {
            let url = repository.version_listing_url(module)?;
            // Listings are mutable by nature, so always treated as
            // changing.
            match self.fetcher.fetch(&url, true, cancel).await {
                Ok(path) => {
                    let bytes = std::fs::read(&path)?;
                    let listing = VersionListing::parse(&bytes, url.as_str())?;
                    match listing.resolve(module, constraint) {
                        Ok(version) => {
                            debug!(%module, %constraint, %version, "resolved from listing");
                            return Ok(version);
                        }
                        Err(error) => last_error = Some(error),
                    }
                }
                Err(QuiverError::Cancelled) => return Err(QuiverError::Cancelled),
                Err(error) => last_error = Some(error),
            }
        }
        Err(last_error
            .unwrap_or_else(|| QuiverError::UnknownVersion(format!("{module} matching {constraint}"))))
    }
}

impl DescriptorSource for RemoteSource {
    async fn load(
        &self,
        request: DescriptorRequest,
        cancel: CancellationToken,
    ) -> Result<ResolvedDescriptor> {
        let version = self
            .resolve_version(&request.module, &request.constraint, &cancel)
            .await?;

        let mut last_error: Option<QuiverError> = None;
        for (index, repository) in self.repositories.iter().enumerate() {
            let url = repository.descriptor_url(&request.module, &version)?;
            let changing = repository.is_changing_version(&version);
            match self.fetcher.fetch(&url, changing, &cancel).await {
                Ok(path) => {
                    let bytes = std::fs::read(&path)?;
                    let descriptor = repository.parse_descriptor(&bytes, url.as_str())?;
                    return Ok(ResolvedDescriptor {
                        version,
                        descriptor,
                        repository: Some(index),
                    });
                }
                Err(QuiverError::Cancelled) => return Err(QuiverError::Cancelled),
                Err(error) => {
                    debug!(%url, %error, "descriptor miss, trying next repository");
                    last_error = Some(error);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            QuiverError::NotFound(format!("{}:{version}", request.module))
        }))
    }
}
