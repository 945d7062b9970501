use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{QuiverError, Result};
use crate::model::coordinate::{normalize_exclusions, Exclusion, Module, Scope};
use crate::model::descriptor::{ActivationContext, DeclaredDependency, Descriptor};
use crate::model::version::{Version, VersionConstraint};

pub const MAX_ITERATIONS: usize = 200;
pub const PARENT_DEPTH_LIMIT: usize = 20;

/// How competing version claims for one module are reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReconciliationPolicy {
    /// Roots are sticky; otherwise shortest root distance, then highest
    /// version, then lexicographically smallest requesting path.
    #[default]
    NearestWins,
    /// Any disagreement fails the resolution.
    Strict,
}

/// A descriptor the resolver wants loaded. The orchestrator resolves the
/// constraint to a concrete version (consulting version listings for
/// ranges and `latest`) and feeds back a [`DescriptorResponse`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorRequest {
    pub module: Module,
    pub constraint: VersionConstraint,
}

impl DescriptorRequest {
    fn key(&self) -> (Module, String) {
        (self.module.clone(), self.constraint.to_string())
    }
}

/// Fetch outcome for one [`DescriptorRequest`].
#[derive(Debug)]
pub struct DescriptorResponse {
    pub module: Module,
    /// Echo of the request constraint.
    pub constraint: VersionConstraint,
    pub result: Result<ResolvedDescriptor>,
}

#[derive(Debug, Clone)]
pub struct ResolvedDescriptor {
    /// Concrete version the constraint resolved to.
    pub version: String,
    /// Raw descriptor, before inheritance and substitution.
    pub descriptor: Descriptor,
    /// Index of the repository that provided it, when applicable.
    pub repository: Option<usize>,
}

// Derive order Root < Parent keeps root claims first in claim maps.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum ClaimSource {
    Root(usize),
    Parent(Module),
}

/// One inbound version claim on a module.
#[derive(Debug, Clone)]
struct Claim {
    constraint: VersionConstraint,
    /// Concrete version, once known.
    version: Option<String>,
    depth: usize,
    /// Module keys from the root down to (excluding) the claimed module.
    path: Vec<String>,
    scope: Scope,
    /// Exclusion context applying below the claimed module.
    exclusions: BTreeSet<Exclusion>,
    classifier: Option<String>,
    ext: String,
}

#[derive(Debug)]
enum RawState {
    Loaded(Descriptor),
    Effective(Arc<Descriptor>),
    Failed,
}

/// What a module was last expanded with; expansion reruns when any of it
/// changes.
#[derive(Debug, Clone)]
struct Expansion {
    version: String,
    scope: Scope,
    exclusions: BTreeSet<Exclusion>,
    children: Vec<Module>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolvedNode {
    pub module: Module,
    pub version: String,
    pub scope: Scope,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classifier: Option<String>,
    pub ext: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repository: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolvedEdge {
    pub from: Module,
    pub to: Module,
    pub scope: Scope,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConflictReport {
    pub module: Module,
    pub candidates: Vec<String>,
    pub chosen: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolutionError {
    pub module: Module,
    pub message: String,
}

/// The frozen output of a resolution: nodes in classpath (breadth-first)
/// order, the edge list, the conflicts that reconciliation papered over,
/// and per-coordinate failures that did not stop the run.
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedGraph {
    pub nodes: Vec<ResolvedNode>,
    pub edges: Vec<ResolvedEdge>,
    pub conflicts: Vec<ConflictReport>,
    pub errors: Vec<ResolutionError>,
}

#[derive(Debug, Clone)]
pub struct ResolverOptions {
    pub policy: ReconciliationPolicy,
    pub activation: ActivationContext,
    pub extra_properties: BTreeMap<String, String>,
    pub max_iterations: usize,
    pub parent_depth_limit: usize,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self {
            policy: ReconciliationPolicy::default(),
            activation: ActivationContext::current(),
            extra_properties: BTreeMap::new(),
            max_iterations: MAX_ITERATIONS,
            parent_depth_limit: PARENT_DEPTH_LIMIT,
        }
    }
}

enum Assembly {
    Ready(Arc<Descriptor>),
    Awaiting,
    Failed,
}

/// Iterative dependency graph expansion with per-module reconciliation.
///
/// The resolver is CPU-only: it never performs I/O itself. The caller
/// drains [`Resolver::take_requests`], loads each descriptor however it
/// likes, and feeds results back through [`Resolver::supply`] in whatever
/// order they complete.
pub struct Resolver {
    options: ResolverOptions,
    roots: Vec<Module>,
    /// Forced versions: root dependency-management union, plus explicit
    /// caller overrides.
    forced: HashMap<Module, String>,
    claims: HashMap<Module, BTreeMap<ClaimSource, Claim>>,
    raw: HashMap<(Module, String), RawState>,
    repositories: HashMap<(Module, String), Option<usize>>,
    requested: HashSet<(Module, String)>,
    queue: Vec<DescriptorRequest>,
    expansions: HashMap<Module, Expansion>,
    errors: Vec<(Module, QuiverError)>,
    fatal: Option<QuiverError>,
    iterations: usize,
}

impl Resolver {
    pub fn new(options: ResolverOptions) -> Self {
        Self {
            options,
            roots: Vec::new(),
            forced: HashMap::new(),
            claims: HashMap::new(),
            raw: HashMap::new(),
            repositories: HashMap::new(),
            requested: HashSet::new(),
            queue: Vec::new(),
            expansions: HashMap::new(),
            errors: Vec::new(),
            fatal: None,
            iterations: 0,
        }
    }

    /// Register an initial coordinate. Root versions are sticky under the
    /// default reconciliation policy.
    pub fn add_root(&mut self, module: Module, constraint: VersionConstraint) {
        let index = self.roots.len();
        self.roots.push(module.clone());
        let version = constraint.preferred().map(str::to_string);
        self.claims.entry(module.clone()).or_default().insert(
            ClaimSource::Root(index),
            Claim {
                constraint: constraint.clone(),
                version,
                depth: 0,
                path: Vec::new(),
                scope: Scope::Compile,
                exclusions: BTreeSet::new(),
                classifier: None,
                ext: "jar".to_string(),
            },
        );
        self.request(module, constraint);
    }

    /// Pin a module to a version, overriding every claim.
    pub fn force_version(&mut self, module: Module, version: impl Into<String>) {
        self.forced.insert(module, version.into());
    }

    /// Descriptors the resolver is waiting for. Empty while requests are
    /// in flight does not mean settled; see [`Resolver::is_settled`].
    pub fn take_requests(&mut self) -> Vec<DescriptorRequest> {
        std::mem::take(&mut self.queue)
    }

    /// True when no request is queued or outstanding.
    pub fn is_settled(&self) -> bool {
        self.queue.is_empty() && self.requested.is_empty()
    }

    fn request(&mut self, module: Module, constraint: VersionConstraint) {
        let request = DescriptorRequest { module, constraint };
        let key = request.key();
        // A concrete version already loaded needs no round-trip.
        if self.raw.contains_key(&key) {
            return;
        }
        if self.requested.insert(key) {
            debug!(module = %request.module, constraint = %request.constraint, "requesting descriptor");
            self.queue.push(request);
        }
    }

    /// Feed one fetch result back. Processes everything that became
    /// processable; returns an error only for resolution-fatal conditions.
    pub fn supply(&mut self, response: DescriptorResponse) -> Result<()> {
        let spec = response.constraint.to_string();
        self.requested.remove(&(response.module.clone(), spec.clone()));

        match response.result {
            Ok(resolved) => {
                // Tell every claim under this constraint its concrete
                // version.
                if let Some(claims) = self.claims.get_mut(&response.module) {
                    for claim in claims.values_mut() {
                        if claim.version.is_none() && claim.constraint.to_string() == spec {
                            claim.version = Some(resolved.version.clone());
                        }
                    }
                }
                let key = (response.module.clone(), resolved.version.clone());
                self.repositories
                    .entry(key.clone())
                    .or_insert(resolved.repository);
                self.raw
                    .entry(key)
                    .or_insert(RawState::Loaded(resolved.descriptor));
            }
            Err(error) => {
                if error.is_fatal() {
                    self.fatal = Some(error.clone());
                    return Err(error);
                }
                warn!(module = %response.module, %error, "descriptor fetch failed");
                // Mark the concrete version failed when the constraint
                // named one, so assembly stops waiting for it.
                if let VersionConstraint::Exact(v) | VersionConstraint::Soft(v) =
                    &response.constraint
                {
                    self.raw
                        .entry((response.module.clone(), v.clone()))
                        .or_insert(RawState::Failed);
                }
                self.errors.push((response.module.clone(), error));
            }
        }

        self.step()
    }

    /// Run the expansion loop to quiescence.
    fn step(&mut self) -> Result<()> {
        if let Some(fatal) = &self.fatal {
            return Err(fatal.clone());
        }
        let result = self.step_inner();
        if let Err(error) = &result {
            if error.is_fatal() {
                self.fatal = Some(error.clone());
            }
        }
        result
    }

    fn step_inner(&mut self) -> Result<()> {
        loop {
            let mut progress = false;

            // Assemble effective descriptors for everything loaded.
            let keys: Vec<(Module, String)> = self
                .raw
                .iter()
                .filter(|(_, state)| matches!(state, RawState::Loaded(_)))
                .map(|(key, _)| key.clone())
                .collect();
            for (module, version) in keys {
                let mut visiting = Vec::new();
                let before = matches!(
                    self.raw.get(&(module.clone(), version.clone())),
                    Some(RawState::Effective(_))
                );
                self.try_effective(&module, &version, &mut visiting)?;
                let after = matches!(
                    self.raw.get(&(module.clone(), version.clone())),
                    Some(RawState::Effective(_))
                );
                if after != before {
                    progress = true;
                }
            }

            // Expand every module whose chosen version has an effective
            // descriptor and whose expansion inputs changed.
            let modules: Vec<Module> = self.claims.keys().cloned().collect();
            for module in modules {
                if self.expand(&module)? {
                    progress = true;
                }
            }

            if !progress {
                return Ok(());
            }
        }
    }

    /// Inherit parents, activate profiles, substitute properties and
    /// splice imported BOMs for one raw descriptor. Issues requests for
    /// anything missing.
    fn try_effective(
        &mut self,
        module: &Module,
        version: &str,
        visiting: &mut Vec<(Module, String)>,
    ) -> Result<Assembly> {
        let key = (module.clone(), version.to_string());
        match self.raw.get(&key) {
            Some(RawState::Effective(descriptor)) => return Ok(Assembly::Ready(descriptor.clone())),
            Some(RawState::Failed) => return Ok(Assembly::Failed),
            Some(RawState::Loaded(_)) => {}
            None => {
                self.request(
                    module.clone(),
                    VersionConstraint::Soft(version.to_string()),
                );
                return Ok(Assembly::Awaiting);
            }
        }

        if visiting.contains(&key) || visiting.len() >= self.options.parent_depth_limit {
            let err = QuiverError::ParentCycle(format!("{module}:{version}"));
            self.fatal = Some(err.clone());
            return Err(err);
        }

        let raw = match self.raw.get(&key) {
            Some(RawState::Loaded(descriptor)) => descriptor.clone(),
            _ => unreachable!("checked above"),
        };

        // Fold the parent chain one level at a time.
        let merged = if let Some(parent) = raw.parent.clone() {
            visiting.push(key.clone());
            let outcome = self.try_effective(&parent.module, &parent.version, visiting)?;
            visiting.pop();
            match outcome {
                Assembly::Ready(parent_descriptor) => raw.inherit(&parent_descriptor),
                Assembly::Awaiting => return Ok(Assembly::Awaiting),
                Assembly::Failed => {
                    warn!(module = %module, parent = %parent.module, "parent descriptor unavailable");
                    self.errors.push((
                        module.clone(),
                        QuiverError::NotFound(format!(
                            "parent {}:{} of {module}:{version}",
                            parent.module, parent.version
                        )),
                    ));
                    self.raw.insert(key, RawState::Failed);
                    return Ok(Assembly::Failed);
                }
            }
        } else {
            raw
        };

        let merged = merged.activate_profiles(&self.options.activation);
        let mut merged = merged.substitute_properties(&self.options.extra_properties)?;

        // scope=import entries splice the target's dependency management
        // in; the imported artifact itself never becomes a dependency.
        let imports: Vec<DeclaredDependency> = merged
            .dependency_management
            .iter()
            .filter(|entry| entry.scope.as_deref() == Some("import"))
            .cloned()
            .collect();
        if !imports.is_empty() {
            let mut spliced = Vec::new();
            for import in &imports {
                let Some(bom_version) = import.version.clone() else {
                    self.errors.push((
                        module.clone(),
                        QuiverError::UnknownVersion(format!(
                            "BOM import {}:{} without version",
                            import.organization, import.name
                        )),
                    ));
                    continue;
                };
                visiting.push(key.clone());
                let outcome = self.try_effective(&import.module(), &bom_version, visiting)?;
                visiting.pop();
                match outcome {
                    Assembly::Ready(bom) => spliced.push(bom),
                    Assembly::Awaiting => return Ok(Assembly::Awaiting),
                    Assembly::Failed => {
                        self.errors.push((
                            module.clone(),
                            QuiverError::NotFound(format!(
                                "imported BOM {}:{bom_version}",
                                import.module()
                            )),
                        ));
                    }
                }
            }
            merged
                .dependency_management
                .retain(|entry| entry.scope.as_deref() != Some("import"));
            let existing: BTreeSet<(String, String)> = merged
                .dependency_management
                .iter()
                .map(|entry| entry.key())
                .collect();
            for bom in spliced {
                for entry in &bom.dependency_management {
                    if !existing.contains(&entry.key()) {
                        merged.dependency_management.push(entry.clone());
                    }
                }
            }
        }

        // The closest root ancestor's management entries force versions
        // for the whole graph.
        if self.is_root_version(module, version) {
            for entry in &merged.dependency_management {
                if let Some(forced_version) = &entry.version {
                    self.forced
                        .entry(entry.module())
                        .or_insert_with(|| forced_version.clone());
                }
            }
        }

        let descriptor = Arc::new(merged);
        self.raw
            .insert(key, RawState::Effective(descriptor.clone()));
        Ok(Assembly::Ready(descriptor))
    }

    fn is_root_version(&self, module: &Module, version: &str) -> bool {
        self.claims
            .get(module)
            .map(|claims| {
                claims.iter().any(|(source, claim)| {
                    matches!(source, ClaimSource::Root(_))
                        && claim.version.as_deref() == Some(version)
                })
            })
            .unwrap_or(false)
    }

    /// Reconciliation: one surviving version per module key.
    fn choose(&self, module: &Module) -> Option<(String, Scope, BTreeSet<Exclusion>)> {
        let claims = self.claims.get(module)?;
        let known: Vec<(&ClaimSource, &Claim)> = claims
            .iter()
            .filter(|(_, claim)| claim.version.is_some())
            .collect();
        if known.is_empty() {
            return None;
        }

        let version = if let Some(forced) = self.forced.get(module) {
            forced.clone()
        } else {
            let roots: Vec<&(&ClaimSource, &Claim)> = known
                .iter()
                .filter(|(source, _)| matches!(source, ClaimSource::Root(_)))
                .collect();
            let candidates: Vec<&(&ClaimSource, &Claim)> = if !roots.is_empty() {
                roots
            } else {
                let min_depth = known.iter().map(|(_, c)| c.depth).min().unwrap_or(0);
                known.iter().filter(|(_, c)| c.depth == min_depth).collect()
            };
            candidates
                .iter()
                .max_by(|a, b| {
                    let va = Version::parse(a.1.version.as_deref().unwrap_or(""));
                    let vb = Version::parse(b.1.version.as_deref().unwrap_or(""));
                    va.cmp(&vb)
                        // Highest version wins; among equals the smallest
                        // requesting path, so arrival order cannot matter.
                        .then_with(|| b.1.path.cmp(&a.1.path))
                })
                .and_then(|candidate| candidate.1.version.clone())?
        };

        // The strongest scope across inbound paths survives.
        let scope = known
            .iter()
            .map(|(_, claim)| claim.scope)
            .max_by_key(Scope::precedence)
            .unwrap_or_default();

        // A module reached along several paths keeps a child if any path
        // allows it: the effective context is the intersection.
        let mut iter = known.iter().map(|(_, claim)| claim.exclusions.clone());
        let mut exclusions = iter.next().unwrap_or_default();
        for other in iter {
            exclusions = exclusion_intersection(&exclusions, &other);
        }

        Some((version, scope, exclusions))
    }

    /// Expand one module under its chosen version if anything changed.
    /// Returns whether work happened.
    fn expand(&mut self, module: &Module) -> Result<bool> {
        let Some((version, scope, exclusions)) = self.choose(module) else {
            return Ok(false);
        };

        if let Some(previous) = self.expansions.get(module) {
            if previous.version == version
                && previous.scope == scope
                && previous.exclusions == exclusions
            {
                return Ok(false);
            }
            // Re-expansion. Each one moves the module-to-version map up the
            // reconciliation lattice; the guard trips on pathological
            // inputs that keep oscillating instead.
            self.iterations += 1;
            if self.iterations > self.options.max_iterations {
                return Err(QuiverError::MaxIterations(self.options.max_iterations));
            }
        }

        let mut visiting = Vec::new();
        let descriptor = match self.try_effective(module, &version, &mut visiting)? {
            Assembly::Ready(descriptor) => descriptor,
            Assembly::Awaiting => return Ok(false),
            Assembly::Failed => {
                // Keep the node; it just has no expandable children.
                self.expansions.insert(
                    module.clone(),
                    Expansion {
                        version,
                        scope,
                        exclusions,
                        children: Vec::new(),
                    },
                );
                return Ok(true);
            }
        };

        debug!(module = %module, %version, ?scope, "expanding");

        // Replace this module's previous claims on its children wholesale.
        let source = ClaimSource::Parent(module.clone());
        for claims in self.claims.values_mut() {
            claims.remove(&source);
        }

        let base_path = self
            .claims
            .get(module)
            .and_then(|claims| {
                claims
                    .values()
                    .filter(|c| c.version.as_deref() == Some(version.as_str()))
                    .map(|c| c.path.clone())
                    .min()
            })
            .unwrap_or_default();
        let mut path = base_path;
        path.push(module.to_string());
        let depth = path.len();

        let managed = descriptor.managed_index();
        let managed: BTreeMap<(String, String), DeclaredDependency> = managed
            .into_iter()
            .map(|(k, v)| (k, v.clone()))
            .collect();

        let mut children = Vec::new();
        for dep in &descriptor.dependencies {
            if dep.optional == Some(true) {
                continue;
            }
            let child = dep.module();
            if exclusions.iter().any(|e| e.matches(&child)) {
                debug!(module = %module, child = %child, "pruned by exclusion");
                continue;
            }

            let entry = managed.get(&dep.key());
            let declared_scope = dep
                .scope
                .as_deref()
                .or_else(|| entry.and_then(|e| e.scope.as_deref()))
                .and_then(Scope::parse)
                .unwrap_or(Scope::Compile);
            let Some(child_scope) = Scope::transition(declared_scope, scope) else {
                continue;
            };
            if entry.and_then(|e| e.optional) == Some(true) && dep.optional.is_none() {
                continue;
            }

            let version_str = dep
                .version
                .clone()
                .or_else(|| entry.and_then(|e| e.version.clone()));
            let Some(version_str) = version_str.filter(|v| !v.trim().is_empty()) else {
                debug!(module = %module, child = %child, "no effective version, skipping");
                continue;
            };
            let constraint = match VersionConstraint::parse(&version_str) {
                Ok(constraint) => constraint,
                Err(error) => {
                    self.errors.push((child.clone(), error));
                    continue;
                }
            };

            let mut child_exclusions = exclusions.clone();
            child_exclusions.extend(dep.exclusions.iter().cloned());
            if let Some(entry) = entry {
                child_exclusions.extend(entry.exclusions.iter().cloned());
            }
            normalize_exclusions(&mut child_exclusions);

            let claim = Claim {
                version: constraint.preferred().map(str::to_string),
                constraint: constraint.clone(),
                depth,
                path: path.clone(),
                scope: child_scope,
                exclusions: child_exclusions,
                classifier: dep
                    .classifier
                    .clone()
                    .or_else(|| entry.and_then(|e| e.classifier.clone())),
                ext: dep
                    .ext
                    .clone()
                    .or_else(|| entry.and_then(|e| e.ext.clone()))
                    .unwrap_or_else(|| "jar".to_string()),
            };
            let needs_resolution = claim.version.is_none();
            self.claims
                .entry(child.clone())
                .or_default()
                .insert(source.clone(), claim);
            // Concrete versions get their descriptor requested when the
            // child is expanded; only unresolved constraints (ranges,
            // latest) need the round-trip now.
            if needs_resolution {
                self.request(child.clone(), constraint);
            }
            children.push(child);
        }

        self.expansions.insert(
            module.clone(),
            Expansion {
                version,
                scope,
                exclusions,
                children,
            },
        );
        Ok(true)
    }

    fn collect_conflicts(&self) -> Vec<ConflictReport> {
        let mut conflicts = Vec::new();
        for (module, claims) in &self.claims {
            let mut versions: Vec<String> = claims
                .values()
                .filter_map(|claim| claim.version.clone())
                .collect();
            versions.sort_by(|a, b| Version::parse(a).cmp(&Version::parse(b)));
            versions.dedup_by(|a, b| Version::parse(a) == Version::parse(b));
            let Some((chosen, _, _)) = self.choose(module) else {
                continue;
            };
            let chosen_version = Version::parse(&chosen);
            let hard_mismatch = claims
                .values()
                .any(|claim| claim.constraint.is_hard() && !claim.constraint.matches(&chosen_version));
            if versions.len() > 1 || hard_mismatch {
                conflicts.push(ConflictReport {
                    module: module.clone(),
                    candidates: versions,
                    chosen,
                });
            }
        }
        conflicts.sort_by(|a, b| a.module.cmp(&b.module));
        conflicts
    }

    /// Freeze the graph. Call once [`Resolver::is_settled`] holds.
    pub fn finalize(&self) -> Result<ResolvedGraph> {
        if let Some(fatal) = &self.fatal {
            return Err(fatal.clone());
        }

        let conflicts = self.collect_conflicts();
        if self.options.policy == ReconciliationPolicy::Strict {
            if let Some(conflict) = conflicts.first() {
                return Err(QuiverError::VersionConflict {
                    module: conflict.module.to_string(),
                    versions: conflict.candidates.clone(),
                });
            }
        }

        // Classpath order: breadth-first from the roots, dependents before
        // dependencies, first-seen wins.
        let mut nodes = Vec::new();
        let mut edges = Vec::new();
        let mut seen: HashSet<Module> = HashSet::new();
        let mut queue: VecDeque<Module> = VecDeque::new();
        for root in &self.roots {
            if seen.insert(root.clone()) {
                queue.push_back(root.clone());
            }
        }
        while let Some(module) = queue.pop_front() {
            let Some((version, scope, _)) = self.choose(&module) else {
                continue;
            };
            let claim_meta = self.claims.get(&module).and_then(|claims| {
                claims
                    .values()
                    .find(|c| c.version.as_deref() == Some(version.as_str()))
            });
            nodes.push(ResolvedNode {
                module: module.clone(),
                version: version.clone(),
                scope,
                classifier: claim_meta.and_then(|c| c.classifier.clone()),
                ext: claim_meta
                    .map(|c| c.ext.clone())
                    .unwrap_or_else(|| "jar".to_string()),
                repository: self
                    .repositories
                    .get(&(module.clone(), version.clone()))
                    .copied()
                    .flatten(),
            });
            if let Some(expansion) = self.expansions.get(&module) {
                if expansion.version == version {
                    for child in &expansion.children {
                        if let Some((_, child_scope, _)) = self.choose(child) {
                            edges.push(ResolvedEdge {
                                from: module.clone(),
                                to: child.clone(),
                                scope: child_scope,
                            });
                            if seen.insert(child.clone()) {
                                queue.push_back(child.clone());
                            }
                        }
                    }
                }
            }
        }

        let errors = self
            .errors
            .iter()
            .map(|(module, error)| ResolutionError {
                module: module.clone(),
                message: error.to_string(),
            })
            .collect();

        Ok(ResolvedGraph {
            nodes,
            edges,
            conflicts,
            errors,
        })
    }
}

/// Pairwise intersection of exclusion patterns, per the union-of-inclusions
/// rule: a child is pruned only when every inbound path excludes it.
fn exclusion_intersection(
    a: &BTreeSet<Exclusion>,
    b: &BTreeSet<Exclusion>,
) -> BTreeSet<Exclusion> {
    fn intersect(left: &Exclusion, right: &Exclusion) -> Option<Exclusion> {
        let organization = if left.organization == "*" {
            &right.organization
        } else if right.organization == "*" || left.organization == right.organization {
            &left.organization
        } else {
            return None;
        };
        let name = if left.name == "*" {
            &right.name
        } else if right.name == "*" || left.name == right.name {
            &left.name
        } else {
            return None;
        };
        Some(Exclusion::new(organization.clone(), name.clone()))
    }

    let mut out = BTreeSet::new();
    for left in a {
        for right in b {
            if let Some(intersection) = intersect(left, right) {
                out.insert(intersection);
            }
        }
    }
    normalize_exclusions(&mut out);
    out
}
