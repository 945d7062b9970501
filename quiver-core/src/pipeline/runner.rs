use std::path::PathBuf;
use std::sync::Arc;

use quiver_common::config::Config;
use quiver_common::dependency::{
    DescriptorRequest, DescriptorResponse, ReconciliationPolicy, ResolutionError,
    ResolvedDescriptor, ResolvedGraph, Resolver, ResolverOptions,
};
use quiver_common::error::{QuiverError, Result};
use quiver_common::events::{EventSender, FetchEvent, EVENT_CHANNEL_SIZE};
use quiver_common::model::{Coordinate, Module, VersionConstraint};
use quiver_net::FileFetcher;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::pipeline::source::{DescriptorSource, RemoteSource};
use crate::repository::Repository;

/// Everything a run produces: the frozen graph, the materialized files in
/// classpath order, and the artifact failures that did not abort siblings.
#[derive(Debug)]
pub struct ResolutionOutcome {
    pub graph: ResolvedGraph,
    pub files: Vec<PathBuf>,
    pub artifact_errors: Vec<ResolutionError>,
}

/// Drives the resolver off fetch completions and then materializes the
/// resolved artifacts through the same worker pool.
pub struct Orchestrator {
    config: Config,
    repositories: Vec<Repository>,
    fetcher: Arc<FileFetcher>,
    events: EventSender,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(config: Config, repositories: Vec<Repository>) -> Result<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        let fetcher = Arc::new(FileFetcher::new(config.clone(), events.clone())?);
        Ok(Self {
            config,
            repositories,
            fetcher,
            events,
            cancel: CancellationToken::new(),
        })
    }

    /// Subscribe to progress events; the UI layer owns the display.
    pub fn subscribe(&self) -> broadcast::Receiver<FetchEvent> {
        self.events.subscribe()
    }

    /// Token the embedding application cancels to tear the run down.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn fetcher(&self) -> &Arc<FileFetcher> {
        &self.fetcher
    }

    fn resolver_options(&self) -> ResolverOptions {
        ResolverOptions {
            policy: if self.config.strict_conflicts {
                ReconciliationPolicy::Strict
            } else {
                ReconciliationPolicy::NearestWins
            },
            ..Default::default()
        }
    }

    /// Close the dependency graph over the configured repositories.
    #[instrument(skip_all, fields(roots = roots.len()))]
    pub async fn resolve(
        &self,
        roots: &[(Module, VersionConstraint)],
    ) -> Result<ResolvedGraph> {
        let _ = self.events.send(FetchEvent::ResolutionStarted {
            root_count: roots.len(),
        });
        let mut resolver = Resolver::new(self.resolver_options());
        for (module, constraint) in roots {
            resolver.add_root(module.clone(), constraint.clone());
        }
        let source = Arc::new(RemoteSource::new(
            self.repositories.clone(),
            Arc::clone(&self.fetcher),
        ));
        let graph = drive(
            resolver,
            source,
            self.config.concurrency,
            self.events.clone(),
            self.cancel.clone(),
        )
        .await?;
        let _ = self.events.send(FetchEvent::ResolutionFinished {
            node_count: graph.nodes.len(),
            conflict_count: graph.conflicts.len(),
        });
        Ok(graph)
    }

    /// Materialize every artifact file of a closed graph, in parallel,
    /// preserving the graph's classpath order in the returned list. One
    /// failure never aborts its siblings; failures come back aggregated.
    #[instrument(skip_all, fields(nodes = graph.nodes.len()))]
    pub async fn fetch_artifacts(
        &self,
        graph: &ResolvedGraph,
    ) -> Result<(Vec<PathBuf>, Vec<ResolutionError>)> {
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let mut tasks: JoinSet<(usize, Result<PathBuf>)> = JoinSet::new();

        for (index, node) in graph.nodes.iter().enumerate() {
            let coordinate = Coordinate {
                module: node.module.clone(),
                version: node.version.clone(),
                classifier: node.classifier.clone(),
                ext: node.ext.clone(),
            };
            let repositories = self.repositories.clone();
            let preferred = node.repository;
            let fetcher = Arc::clone(&self.fetcher);
            let semaphore = Arc::clone(&semaphore);
            let cancel = self.cancel.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let result =
                    fetch_one_artifact(&fetcher, &repositories, preferred, &coordinate, &cancel)
                        .await;
                (index, result)
            });
        }

        let mut slots: Vec<Option<PathBuf>> = vec![None; graph.nodes.len()];
        let mut errors = Vec::new();
        let mut cancelled = false;
        while let Some(joined) = tasks.join_next().await {
            let (index, result) = joined.map_err(|e| {
                QuiverError::Cache(format!("artifact download task failed: {e}"))
            })?;
            match result {
                Ok(path) => slots[index] = Some(path),
                Err(QuiverError::Cancelled) => cancelled = true,
                Err(error) => {
                    let node = &graph.nodes[index];
                    warn!(module = %node.module, version = %node.version, %error, "artifact fetch failed");
                    errors.push(ResolutionError {
                        module: node.module.clone(),
                        message: error.to_string(),
                    });
                }
            }
        }
        // In-flight siblings have unwound by now; cancellation wins over
        // partial results.
        if cancelled {
            return Err(QuiverError::Cancelled);
        }

        let files = slots.into_iter().flatten().collect();
        Ok((files, errors))
    }

    /// Full run: close the graph, then materialize it.
    pub async fn run(&self, roots: &[(Module, VersionConstraint)]) -> Result<ResolutionOutcome> {
        let graph = self.resolve(roots).await?;
        let (files, artifact_errors) = self.fetch_artifacts(&graph).await?;
        Ok(ResolutionOutcome {
            graph,
            files,
            artifact_errors,
        })
    }
}

async fn fetch_one_artifact(
    fetcher: &FileFetcher,
    repositories: &[Repository],
    preferred: Option<usize>,
    coordinate: &Coordinate,
    cancel: &CancellationToken,
) -> Result<PathBuf> {
    // The repository that served the descriptor goes first; the rest stay
    // in priority order.
    let mut order: Vec<usize> = Vec::with_capacity(repositories.len());
    if let Some(preferred) = preferred.filter(|i| *i < repositories.len()) {
        order.push(preferred);
    }
    order.extend((0..repositories.len()).filter(|i| Some(*i) != preferred));

    let mut last_error: Option<QuiverError> = None;
    for index in order {
        let repository = &repositories[index];
        let url = repository.artifact_url(coordinate)?;
        let changing = repository.is_changing_version(&coordinate.version);
        match fetcher.fetch(&url, changing, cancel).await {
            Ok(path) => return Ok(path),
            Err(QuiverError::Cancelled) => return Err(QuiverError::Cancelled),
            Err(error) => last_error = Some(error),
        }
    }
    Err(last_error.unwrap_or_else(|| QuiverError::NotFound(coordinate.to_string())))
}

/// Feed the resolver from a descriptor source until the graph closes.
/// Results are processed in arrival order; the reconciliation tie-breaks
/// keep the final graph independent of that order.
pub async fn drive<S: DescriptorSource>(
    mut resolver: Resolver,
    source: Arc<S>,
    concurrency: usize,
    events: EventSender,
    cancel: CancellationToken,
) -> Result<ResolvedGraph> {
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    type DescriptorArrival = (DescriptorRequest, Result<ResolvedDescriptor>);
    let mut tasks: JoinSet<DescriptorArrival> = JoinSet::new();

    let spawn_all = |resolver: &mut Resolver, tasks: &mut JoinSet<DescriptorArrival>| {
        let requests = resolver.take_requests();
        if !requests.is_empty() {
            let _ = events.send(FetchEvent::DescriptorBatch {
                pending: requests.len(),
            });
        }
        for request in requests {
            let source = Arc::clone(&source);
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let result = source.load(request.clone(), cancel).await;
                (request, result)
            });
        }
    };

    spawn_all(&mut resolver, &mut tasks);
    while let Some(joined) = tasks.join_next().await {
        let (request, result) = joined.map_err(|e| {
            QuiverError::Cache(format!("descriptor task failed: {e}"))
        })?;
        debug!(module = %request.module, ok = result.is_ok(), "descriptor arrived");
        let outcome = resolver.supply(DescriptorResponse {
            module: request.module,
            constraint: request.constraint,
            result,
        });
        if let Err(error) = outcome {
            // Fatal for the whole resolution: let in-flight fetches
            // unwind, then surface.
            tasks.shutdown().await;
            return Err(error);
        }
        spawn_all(&mut resolver, &mut tasks);
    }

    resolver.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use quiver_common::config::CachePolicy;
    use quiver_common::model::{DeclaredDependency, Descriptor, Version};
    use quiver_net::Cache;

    /// Test double for the repository layer: descriptors straight from a
    /// vector, newest matching version wins.
    struct InMemorySource {
        universe: Vec<Descriptor>,
        delay: std::time::Duration,
    }

    impl DescriptorSource for InMemorySource {
        async fn load(
            &self,
            request: quiver_common::dependency::DescriptorRequest,
            _cancel: CancellationToken,
        ) -> Result<quiver_common::dependency::ResolvedDescriptor> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.universe
                .iter()
                .filter(|d| d.module == request.module)
                .filter(|d| match &request.constraint {
                    VersionConstraint::Latest(_) => true,
                    other => other.matches(&Version::parse(&d.version)),
                })
                .max_by(|a, b| Version::parse(&a.version).cmp(&Version::parse(&b.version)))
                .map(|d| quiver_common::dependency::ResolvedDescriptor {
                    version: d.version.clone(),
                    descriptor: d.clone(),
                    repository: Some(0),
                })
                .ok_or_else(|| QuiverError::NotFound(request.module.to_string()))
        }
    }

    fn module(spec: &str) -> Module {
        let (org, name) = spec.split_once(':').unwrap();
        Module::new(org, name)
    }

    fn descriptor(spec: &str, deps: &[&str]) -> Descriptor {
        let parts: Vec<&str> = spec.split(':').collect();
        let mut d = Descriptor::new(Module::new(parts[0], parts[1]), parts[2]);
        for dep in deps {
            let dep_parts: Vec<&str> = dep.split(':').collect();
            d.dependencies.push(DeclaredDependency {
                organization: dep_parts[0].to_string(),
                name: dep_parts[1].to_string(),
                version: Some(dep_parts[2].to_string()),
                ..Default::default()
            });
        }
        d
    }

    async fn drive_universe(
        universe: Vec<Descriptor>,
        roots: &[(&str, &str)],
    ) -> Result<ResolvedGraph> {
        let mut resolver = Resolver::new(ResolverOptions::default());
        for (m, v) in roots {
            resolver.add_root(module(m), VersionConstraint::soft(*v));
        }
        drive(
            resolver,
            Arc::new(InMemorySource {
                universe,
                delay: std::time::Duration::from_millis(1),
            }),
            4,
            quiver_common::events::null_sender(),
            CancellationToken::new(),
        )
        .await
    }

    #[tokio::test]
    async fn transitive_resolution_preserves_classpath_order() {
        let universe = vec![
            descriptor("org:a:1.0", &["org:b:1.0"]),
            descriptor("org:b:1.0", &[]),
        ];
        let graph = drive_universe(universe, &[("org:a", "1.0")]).await.unwrap();
        let order: Vec<String> = graph.nodes.iter().map(|n| n.module.to_string()).collect();
        assert_eq!(order, vec!["org:a", "org:b"]);
    }

    #[tokio::test]
    async fn arrival_order_does_not_change_outcome() {
        // Two roots race; the slow path loses the race but reconciliation
        // is still deterministic.
        let universe = vec![
            descriptor("x:x:1", &["z:z:1.0"]),
            descriptor("y:y:1", &["z:z:2.0"]),
            descriptor("z:z:1.0", &[]),
            descriptor("z:z:2.0", &[]),
        ];
        for _ in 0..4 {
            let graph = drive_universe(universe.clone(), &[("x:x", "1"), ("y:y", "1")])
                .await
                .unwrap();
            let z = graph
                .nodes
                .iter()
                .find(|n| n.module == module("z:z"))
                .unwrap();
            assert_eq!(z.version, "2.0");
        }
    }

    #[tokio::test]
    async fn resolution_report_serializes() {
        let universe = vec![
            descriptor("org:a:1.0", &["org:b:1.0"]),
            descriptor("org:b:1.0", &[]),
        ];
        let graph = drive_universe(universe, &[("org:a", "1.0")]).await.unwrap();
        let json = serde_json::to_value(&graph).unwrap();
        assert_eq!(json["nodes"][0]["module"]["name"], "a");
        assert_eq!(json["nodes"][0]["scope"], "compile");
        assert_eq!(json["edges"][0]["to"]["name"], "b");
    }

    #[tokio::test]
    async fn cancellation_surfaces_cancelled() {
        struct BlockedSource;
        impl DescriptorSource for BlockedSource {
            async fn load(
                &self,
                _request: quiver_common::dependency::DescriptorRequest,
                cancel: CancellationToken,
            ) -> Result<quiver_common::dependency::ResolvedDescriptor> {
                cancel.cancelled().await;
                Err(QuiverError::Cancelled)
            }
        }
        let mut resolver = Resolver::new(ResolverOptions::default());
        resolver.add_root(module("org:a"), VersionConstraint::soft("1"));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = drive(
            resolver,
            Arc::new(BlockedSource),
            2,
            quiver_common::events::null_sender(),
            cancel,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, QuiverError::Cancelled));
    }

    fn seed_artifact(cache_root: &std::path::Path, repo: &Repository, coordinate: &Coordinate) {
        let cache = Cache::new(cache_root, std::time::Duration::from_secs(3600));
        let url = repo.artifact_url(coordinate).unwrap();
        let path = cache.local_path(&url).unwrap();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, coordinate.to_string()).unwrap();
    }

    #[tokio::test]
    async fn artifact_fetch_preserves_order_and_aggregates_errors() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::maven("test", "https://repo.example.com/m2").unwrap();
        let config = Config::builder()
            .cache_root(dir.path())
            .policies(vec![CachePolicy::LocalOnly])
            .concurrency(4)
            .build()
            .unwrap();
        let orchestrator = Orchestrator::new(config, vec![repo.clone()]).unwrap();

        // a depends on b and c; only a and c are present in the cache.
        let universe = vec![
            descriptor("org:a:1.0", &["org:b:1.0", "org:c:1.0"]),
            descriptor("org:b:1.0", &[]),
            descriptor("org:c:1.0", &[]),
        ];
        let mut resolver = Resolver::new(ResolverOptions::default());
        resolver.add_root(module("org:a"), VersionConstraint::soft("1.0"));
        let graph = drive(
            resolver,
            Arc::new(InMemorySource {
                universe,
                delay: std::time::Duration::ZERO,
            }),
            4,
            quiver_common::events::null_sender(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        for spec in ["org:a:1.0", "org:c:1.0"] {
            let parts: Vec<&str> = spec.split(':').collect();
            seed_artifact(
                dir.path(),
                &repo,
                &Coordinate::new(Module::new(parts[0], parts[1]), parts[2]),
            );
        }

        let (files, errors) = orchestrator.fetch_artifacts(&graph).await.unwrap();
        // Order preserved: a before c; the missing b is reported, not
        // fatal.
        assert_eq!(files.len(), 2);
        assert!(files[0].ends_with("a-1.0.jar"));
        assert!(files[1].ends_with("c-1.0.jar"));
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].module, module("org:b"));
    }

    #[tokio::test]
    async fn full_run_simple_transitive() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::maven("test", "https://repo.example.com/m2").unwrap();
        for spec in ["org:a:1.0", "org:b:1.0"] {
            let parts: Vec<&str> = spec.split(':').collect();
            seed_artifact(
                dir.path(),
                &repo,
                &Coordinate::new(Module::new(parts[0], parts[1]), parts[2]),
            );
        }
        let config = Config::builder()
            .cache_root(dir.path())
            .policies(vec![CachePolicy::LocalOnly])
            .build()
            .unwrap();
        let orchestrator = Orchestrator::new(config, vec![repo]).unwrap();

        let universe = vec![
            descriptor("org:a:1.0", &["org:b:1.0"]),
            descriptor("org:b:1.0", &[]),
        ];
        let mut resolver = Resolver::new(ResolverOptions::default());
        resolver.add_root(module("org:a"), VersionConstraint::soft("1.0"));
        let graph = drive(
            resolver,
            Arc::new(InMemorySource {
                universe,
                delay: std::time::Duration::ZERO,
            }),
            2,
            quiver_common::events::null_sender(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let (files, errors) = orchestrator.fetch_artifacts(&graph).await.unwrap();
        assert!(errors.is_empty());
        assert_eq!(files.len(), 2);
        assert!(files[0].ends_with("a-1.0.jar"));
        assert!(files[1].ends_with("b-1.0.jar"));
    }
}
