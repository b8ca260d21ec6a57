//! Which installed runtimes are still needed.
//!
//! Refs form a graph whose edges come from deployed metadata: an app needs its
//! runtime, anything needs its SDK, a runtime extension carrying extra data
//! needs the runtime its `apply_extra` runs against, and any ref keeps the
//! extensions its metadata declares unless they are auto-pruned. Roots are
//! every app, pinned runtimes and injected metadata; runtimes not reachable
//! from a root are unused. Apps are never reported.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use anyhow::Result;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use refdeploy_domain::{AppMetadata, Ref, RefKind};
use tracing::{debug, warn};

use crate::core::config::Environment;
use crate::core::deploy::{self, get_if_deployed, METADATA_FILE};
use crate::core::remote::RefGlobs;

/// Inputs to [`list_unused_refs`].
pub struct UnusedRefsQuery<'a> {
    pub base: &'a Path,
    pub pinned: &'a RefGlobs,
    /// Every runtime under `base` is a root. Used when `base` shadows another
    /// installation whose apps may depend on anything installed here.
    pub all_runtimes_are_roots: bool,
    /// A second installation whose refs keep ours alive without being
    /// candidates themselves. Missing or unreadable is not an error.
    pub marker_base: Option<&'a Path>,
    /// Metadata of refs that are about to be installed.
    pub injected: &'a HashMap<Ref, AppMetadata>,
    /// Refs about to be removed; they are neither roots nor reported.
    pub excluded: &'a [Ref],
    /// Only report refs whose deploy data marks them end-of-life.
    pub eol_only: bool,
    pub environment: &'a Environment,
}

/// Whether one `autoprune-unless` condition holds on this host.
fn condition_holds(condition: &str, extension_suffix: Option<&str>, environment: &Environment) -> bool {
    match condition {
        "active-gl-driver" => extension_suffix
            .is_some_and(|suffix| environment.gl_drivers.iter().any(|driver| driver == suffix)),
        "active-gtk-theme" => extension_suffix
            .is_some_and(|suffix| environment.gtk_theme.as_deref() == Some(suffix)),
        "have-intel-gpu" => environment.has_kernel_module("i915"),
        other => {
            if let Some(module) = other.strip_prefix("have-kernel-module-") {
                environment.has_kernel_module(module)
            } else if let Some(desktop) = other.strip_prefix("on-xdg-desktop-") {
                environment
                    .current_desktops
                    .iter()
                    .any(|current| current.eq_ignore_ascii_case(desktop))
            } else {
                debug!(condition = other, "unknown autoprune condition");
                false
            }
        }
    }
}

/// Refs `reference` depends on, given its metadata and what is installed.
pub fn dependency_edges(
    reference: &Ref,
    metadata: &AppMetadata,
    installed: &[Ref],
    environment: &Environment,
) -> Vec<Ref> {
    let mut edges = Vec::new();
    let mut push = |parsed: Result<Option<Ref>, refdeploy_domain::DeployError>, what: &str| match parsed {
        Ok(Some(target)) => edges.push(target),
        Ok(None) => {}
        Err(err) => warn!(reference = %reference, %err, "ignoring invalid {what}"),
    };

    if reference.kind() == RefKind::App {
        push(metadata.runtime_ref(), "runtime");
    }
    push(metadata.sdk_ref(), "sdk");

    if reference.kind() == RefKind::Runtime
        && metadata.has_extra_data_group()
        && !metadata.extra_data_no_runtime
    {
        let runtime = metadata
            .extension_of
            .as_ref()
            .and_then(|ext| ext.runtime.as_deref())
            .or(metadata.runtime.as_deref());
        push(
            runtime
                .map(|value| Ref::parse_partial(RefKind::Runtime, value))
                .transpose(),
            "extra data runtime",
        );
    }

    for extension in &metadata.extensions {
        let branches = extension.branches(reference.branch());
        for candidate in installed {
            if candidate.kind() != RefKind::Runtime
                || candidate.arch() != reference.arch()
                || !extension.matches_id(candidate.id())
                || !branches.contains(&candidate.branch())
            {
                continue;
            }
            if let Some(conditions) = &extension.autoprune_unless {
                let suffix = candidate
                    .id()
                    .strip_prefix(extension.id.as_str())
                    .and_then(|rest| rest.strip_prefix('.'));
                let keep = conditions
                    .split(';')
                    .map(str::trim)
                    .filter(|condition| !condition.is_empty())
                    .any(|condition| condition_holds(condition, suffix, environment));
                if !keep {
                    debug!(reference = %reference, extension = %candidate, "extension is auto-pruned");
                    continue;
                }
            }
            edges.push(candidate.clone());
        }
    }
    edges.sort();
    edges.dedup();
    edges
}

fn read_deployed_metadata(base: &Path, reference: &Ref) -> Option<AppMetadata> {
    let dir = get_if_deployed(base, reference, None)?;
    let text = match fs::read_to_string(dir.join(METADATA_FILE)) {
        Ok(text) => text,
        Err(err) => {
            warn!(reference = %reference, %err, "deployed ref has no metadata");
            return None;
        }
    };
    match AppMetadata::parse(&text) {
        Ok(metadata) => Some(metadata),
        Err(err) => {
            warn!(reference = %reference, %err, "invalid metadata in deployed ref");
            None
        }
    }
}

fn list_scope(base: &Path) -> Vec<Ref> {
    match deploy::list_deployed(base, None) {
        Ok(refs) => refs,
        Err(err) => {
            debug!(base = %base.display(), error = %format!("{err:#}"), "installation not readable");
            Vec::new()
        }
    }
}

#[derive(Default)]
struct RefGraph {
    graph: DiGraph<Ref, ()>,
    nodes: HashMap<Ref, NodeIndex>,
}

impl RefGraph {
    fn node(&mut self, reference: &Ref) -> NodeIndex {
        if let Some(index) = self.nodes.get(reference) {
            return *index;
        }
        let index = self.graph.add_node(reference.clone());
        self.nodes.insert(reference.clone(), index);
        index
    }

    fn connect(&mut self, from: &Ref, targets: &[Ref]) {
        let from = self.node(from);
        for target in targets {
            let to = self.node(target);
            self.graph.update_edge(from, to, ());
        }
    }

    fn reachable(&self, roots: &[NodeIndex]) -> HashSet<Ref> {
        let mut dfs = Dfs::empty(&self.graph);
        let mut seen = HashSet::new();
        for root in roots {
            dfs.move_to(*root);
            while let Some(index) = dfs.next(&self.graph) {
                seen.insert(self.graph[index].clone());
            }
        }
        seen
    }
}

/// Installed runtimes under `query.base` nothing needs anymore.
pub fn list_unused_refs(query: &UnusedRefsQuery<'_>) -> Result<Vec<Ref>> {
    let owned = deploy::list_deployed(query.base, None)?;
    let markers = query.marker_base.map(list_scope).unwrap_or_default();
    let excluded: HashSet<&Ref> = query.excluded.iter().collect();

    let mut metadata: HashMap<Ref, AppMetadata> = HashMap::new();
    for (base, refs) in [(Some(query.base), &owned), (query.marker_base, &markers)] {
        let Some(base) = base else { continue };
        for reference in refs {
            if metadata.contains_key(reference) {
                continue;
            }
            if let Some(parsed) = read_deployed_metadata(base, reference) {
                metadata.insert(reference.clone(), parsed);
            }
        }
    }
    for (reference, injected) in query.injected {
        metadata.insert(reference.clone(), injected.clone());
    }

    let mut installed: Vec<Ref> = owned.iter().chain(markers.iter()).cloned().collect();
    installed.sort();
    installed.dedup();

    let mut graph = RefGraph::default();
    for (reference, meta) in &metadata {
        let edges = dependency_edges(reference, meta, &installed, query.environment);
        graph.connect(reference, &edges);
    }

    let mut roots = Vec::new();
    for reference in &owned {
        if excluded.contains(reference) {
            continue;
        }
        let is_root = reference.kind() == RefKind::App
            || query.all_runtimes_are_roots
            || query.pinned.matches(&reference.to_string());
        if is_root {
            roots.push(graph.node(reference));
        }
    }
    for reference in markers.iter().chain(query.injected.keys()) {
        if !excluded.contains(reference) {
            roots.push(graph.node(reference));
        }
    }

    let used = graph.reachable(&roots);
    let mut unused = Vec::new();
    for reference in owned {
        if reference.kind() != RefKind::Runtime || used.contains(&reference) || excluded.contains(&reference) {
            continue;
        }
        if query.eol_only && !is_end_of_life(query.base, &reference) {
            continue;
        }
        unused.push(reference);
    }
    Ok(unused)
}

fn is_end_of_life(base: &Path, reference: &Ref) -> bool {
    let Some(dir) = get_if_deployed(base, reference, None) else {
        return false;
    };
    match deploy::read_deploy_data(&dir) {
        Ok(data) => data.eol().is_some() || data.eol_rebase().is_some(),
        Err(err) => {
            warn!(reference = %reference, error = %format!("{err:#}"), "unreadable deploy data");
            false
        }
    }
}

/// Installed apps whose runtime is `runtime`, across `bases`.
pub fn apps_using_runtime(bases: &[&Path], runtime: &Ref) -> Vec<Ref> {
    let mut users = Vec::new();
    for base in bases {
        for app in list_scope(base) {
            if app.kind() != RefKind::App {
                continue;
            }
            let needs = read_deployed_metadata(base, &app)
                .and_then(|metadata| metadata.runtime_ref().ok().flatten())
                .is_some_and(|needed| needed == *runtime);
            if needs && !users.contains(&app) {
                users.push(app);
            }
        }
    }
    users.sort();
    users
}
