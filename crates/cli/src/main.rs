use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use kube::core::DynamicObject;
use kube::CustomResourceExt;
use rekon_api::{
    description_formatter, spawn_notifier, status_patch, trace_from_object, trace_type, with_desired_spec, LiveLoader,
    ObjectLoader, PlanGenerator, ReconciliationTrace, ResourcesManager, StaticLoader, TraceContext, TraceHistory,
    TraceRegistry, TraceUpdate,
};
use rekon_core::config::Settings;
use rekon_core::object::object_ref_of;
use rekon_core::{DryRunPhase, DryRunResult, ObjectRef, ObjectTreeNode};
use rekon_kubehub::{discover, get_kube_client, start_watcher, KubeClient, ListOptions, ObjectClient, ServedTypes};
use rekon_mock::OfflineClient;
use rekon_rules::{init_rules, RuleSet};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "rekonctl", version, about = "Dry-run reconciliation planner")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    /// Rule table YAML replacing the built-in one
    #[arg(long = "rules", global = true)]
    rules: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Predict the changes a new root spec would cause
    Plan {
        /// Desired root spec (YAML or JSON)
        #[arg(long = "desired")]
        desired: PathBuf,
        /// Current root object (offline mode)
        #[arg(long = "root")]
        root: Option<PathBuf>,
        /// Files or directories with the current objects (offline mode)
        #[arg(long = "objects")]
        objects: Vec<PathBuf>,
        /// Load the current state from the cluster
        #[arg(long = "live", action = ArgAction::SetTrue)]
        live: bool,
        /// Root name (live mode)
        #[arg(long = "name")]
        name: Option<String>,
        /// ConfigMap YAML with localized change descriptions
        #[arg(long = "i18n")]
        i18n: Option<PathBuf>,
        #[arg(long = "locale")]
        locale: Option<String>,
    },
    /// Print the effective ownership rule table
    Rules,
    /// Print the ReconciliationTrace CRD
    Crd,
    /// Keep ReconciliationTrace statuses current as traces and their objects change
    Watch {
        /// ConfigMap YAML with localized change descriptions
        #[arg(long = "i18n")]
        i18n: Option<PathBuf>,
    },
}

fn init_tracing() {
    let env = std::env::var("REKON_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("REKON_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid REKON_METRICS_ADDR; expected host:port");
        }
    }
}

fn load_rules(path: Option<&Path>) -> Result<RuleSet> {
    match path {
        Some(p) => {
            let text = std::fs::read_to_string(p).with_context(|| format!("reading {}", p.display()))?;
            Ok(RuleSet::from_yaml(&text)?)
        }
        None => Ok(RuleSet::kubeblocks()),
    }
}

/// Every object in `path`; directories contribute their `.yaml`/`.yml`/`.json` files
/// in name order.
fn read_objects(path: &Path) -> Result<Vec<DynamicObject>> {
    let mut files = Vec::new();
    if path.is_dir() {
        for entry in std::fs::read_dir(path).with_context(|| format!("reading {}", path.display()))? {
            let p = entry?.path();
            if matches!(p.extension().and_then(|e| e.to_str()), Some("yaml" | "yml" | "json")) {
                files.push(p);
            }
        }
        files.sort();
    } else {
        files.push(path.to_path_buf());
    }
    let mut out = Vec::new();
    for f in files {
        let text = std::fs::read_to_string(&f).with_context(|| format!("reading {}", f.display()))?;
        out.extend(rekon_apply::load_yaml_objects(&text).with_context(|| format!("parsing {}", f.display()))?);
    }
    Ok(out)
}

/// Fixtures rarely carry uids: assign them, then fill owner references that name
/// an owner by kind and name only.
fn assign_uids(objects: &mut [DynamicObject]) -> Result<()> {
    let mut uids: BTreeMap<ObjectRef, String> = BTreeMap::new();
    for o in objects.iter_mut() {
        let uid = o.metadata.uid.get_or_insert_with(|| uuid::Uuid::new_v4().to_string()).clone();
        uids.insert(object_ref_of(o)?, uid);
    }
    for o in objects.iter_mut() {
        let ns = o.metadata.namespace.clone().unwrap_or_default();
        for owner in o.metadata.owner_references.iter_mut().flatten().filter(|r| r.uid.is_empty()) {
            let ty = rekon_core::ObjectType::new(owner.api_version.clone(), owner.kind.clone());
            let uid = uids
                .get(&ObjectRef::new(ty.clone(), ns.clone(), owner.name.clone()))
                .or_else(|| uids.get(&ObjectRef::new(ty, "", owner.name.clone())));
            if let Some(uid) = uid {
                owner.uid = uid.clone();
            }
        }
    }
    Ok(())
}

fn print_tree(node: &ObjectTreeNode, depth: usize) {
    let p = &node.primary;
    println!(
        "{:indent$}{}/{}",
        "",
        p.kind.as_deref().unwrap_or("?"),
        p.name.as_deref().unwrap_or("?"),
        indent = depth * 2
    );
    for s in &node.secondaries {
        print_tree(s, depth + 1);
    }
}

fn print_result(result: &DryRunResult, output: Output) -> Result<()> {
    if output == Output::Json {
        println!("{}", serde_json::to_string_pretty(result)?);
        return Ok(());
    }
    let phase = match result.phase {
        DryRunPhase::Succeeded => "Succeeded",
        DryRunPhase::Failed => "Failed",
    };
    println!("phase: {phase}");
    if let Some(reason) = &result.reason {
        println!("reason: {reason}: {}", result.message.as_deref().unwrap_or(""));
    }
    println!("observed generation: {}", result.observed_target_generation);
    if !result.spec_diff.is_empty() {
        println!("\nspec diff:\n{}", result.spec_diff);
    }
    println!("\n{:<8} {:<14} {:<10} DESCRIPTION", "REV", "CHANGE", "KIND");
    for c in &result.plan.changes {
        let r = &c.object_reference;
        let what = c.local_description.as_deref().unwrap_or(&c.description);
        println!(
            "{:<8} {:<14} {:<10} {}/{} {}",
            c.revision,
            c.change_type.as_str(),
            r.kind.as_deref().unwrap_or("?"),
            r.namespace.as_deref().unwrap_or("-"),
            r.name.as_deref().unwrap_or("?"),
            what
        );
    }
    println!("\n{:<40} {:>6} {:>6} {:>6} {:>6}", "TYPE", "TOTAL", "ADDED", "UPDATED", "DELETED");
    for s in &result.plan.summary {
        let cs = s.change_summary.clone().unwrap_or_default();
        println!(
            "{:<40} {:>6} {:>6} {:>6} {:>6}",
            s.object_type.to_string(),
            s.total,
            cs.added.unwrap_or(0),
            cs.updated.unwrap_or(0),
            cs.deleted.unwrap_or(0)
        );
    }
    if let Some(tree) = &result.plan.object_tree {
        println!();
        print_tree(tree, 0);
    }
    Ok(())
}

async fn live_client(rules: RuleSet) -> Result<(Arc<KubeClient>, Arc<RuleSet>, Vec<rekon_kubehub::DiscoveredResource>)> {
    let client = get_kube_client().await.context("connecting to cluster")?;
    let discovered = discover(client.clone()).await.context("discovering API resources")?;
    let served = ServedTypes::from(discovered.as_slice());
    let rules = init_rules(rules.filter_unsupported(&served)).clone();
    Ok((Arc::new(KubeClient::with_resources(client, &discovered)), Arc::new(rules), discovered))
}

fn load_resources(path: Option<&Path>) -> Result<Arc<ResourcesManager>> {
    let resources = Arc::new(ResourcesManager::new());
    if let Some(p) = path {
        for cm in read_objects(p)? {
            resources.parse_raw(&cm);
        }
    }
    Ok(resources)
}

#[allow(clippy::too_many_arguments)]
async fn plan(
    cli: &Cli,
    desired: &Path,
    root: Option<&Path>,
    objects: &[PathBuf],
    live: bool,
    name: Option<&str>,
    i18n: Option<&Path>,
    locale: Option<String>,
) -> Result<DryRunResult> {
    let settings = Settings::from_env();
    let rules = load_rules(cli.rules.as_deref())?;
    let desired_spec = std::fs::read_to_string(desired).with_context(|| format!("reading {}", desired.display()))?;

    let (real, rules, current, loader): (Arc<dyn ObjectClient>, Arc<RuleSet>, DynamicObject, Box<dyn ObjectLoader>) = if live {
        let ns = cli.namespace.clone().ok_or_else(|| anyhow!("--ns is required with --live"))?;
        let name = name.ok_or_else(|| anyhow!("--name is required with --live"))?;
        let (client, rules, _) = live_client(rules).await?;
        let key = ObjectRef::new(rules.root.clone(), ns, name);
        let current = client.get(&key).await.with_context(|| format!("fetching {key}"))?;
        let real: Arc<dyn ObjectClient> = client;
        let loader = LiveLoader::new(real.clone(), rules.clone(), current.clone());
        (real, rules, current, Box::new(loader))
    } else {
        let root = root.ok_or_else(|| anyhow!("--root is required without --live"))?;
        let mut all = read_objects(root)?;
        let root_key = object_ref_of(all.first().ok_or_else(|| anyhow!("{} holds no object", root.display()))?)?;
        for p in objects {
            all.extend(read_objects(p)?);
        }
        assign_uids(&mut all)?;
        let current = all
            .iter()
            .find(|o| object_ref_of(o).ok().as_ref() == Some(&root_key))
            .cloned()
            .ok_or_else(|| anyhow!("root {root_key} missing"))?;
        info!(root = %root_key, objects = all.len(), "offline plan");
        (Arc::new(OfflineClient), Arc::new(init_rules(rules).clone()), current, Box::new(StaticLoader::from_objects(all)?))
    };

    let desired_root = with_desired_spec(&current, &desired_spec)?;
    let mut generator = PlanGenerator::new(real, rules, settings.clone());
    if let Some(p) = i18n {
        let resources = load_resources(Some(p))?;
        generator = generator.with_formatter(description_formatter(resources, settings.default_locale.clone(), locale));
    }
    Ok(generator.generate_plan(&desired_root, loader.as_ref()).await)
}

/// Recompute a trace's status and write it back.
async fn refresh(ctx: &TraceContext, client: &KubeClient, key: &ObjectRef, trace: &ReconciliationTrace) -> Result<()> {
    let status = ctx.reconcile(trace).await;
    client.patch_status(key, &status_patch(&status)?).await.with_context(|| format!("updating status of {key}"))?;
    Ok(())
}

/// Follow trace resources and the objects they target; every new trace, spec edit
/// or relevant object change refreshes the trace's status.
async fn watch(cli: &Cli, i18n: Option<&Path>) -> Result<()> {
    let settings = Settings::from_env();
    let (client, rules, discovered) = live_client(load_rules(cli.rules.as_deref())?).await?;
    let kube = get_kube_client().await?;
    let trace_res = discovered
        .iter()
        .find(|r| r.object_type() == trace_type())
        .cloned()
        .ok_or_else(|| anyhow!("{} is not served; install it with `rekonctl crd`", trace_type()))?;
    let registry = Arc::new(TraceRegistry::new());

    let (trace_tx, mut trace_rx) = mpsc::channel(settings.notify_queue_cap);
    let (ev_tx, ev_rx) = mpsc::channel(settings.notify_queue_cap);
    let mut watchers = Vec::new();
    let managed = rules.managed_types();
    let watched = discovered.iter().filter(|r| managed.contains(&r.object_type())).map(|r| (r.clone(), ev_tx.clone()));
    for (res, tx) in watched.chain(std::iter::once((trace_res, trace_tx))) {
        let (kube, ns) = (kube.clone(), cli.namespace.clone());
        watchers.push(tokio::spawn(async move {
            if let Err(e) = start_watcher(kube, &res, ns.as_deref(), tx).await {
                error!(error = %e, ty = %res.object_type(), "watcher failed");
            }
        }));
    }
    drop(ev_tx);

    let (out_tx, mut out_rx) = mpsc::channel::<ObjectRef>(settings.notify_queue_cap);
    let real: Arc<dyn ObjectClient> = client.clone();
    let notifier = spawn_notifier(real.clone(), rules.clone(), registry.clone(), &settings, ev_rx, out_tx);
    let generator = PlanGenerator::new(real, rules.clone(), settings);
    let ctx = TraceContext::new(generator, TraceHistory::default(), load_resources(i18n)?);

    loop {
        tokio::select! {
            maybe = trace_rx.recv() => {
                let Some(ev) = maybe else { break };
                match registry.track(&ev, &rules.root) {
                    Ok((key, TraceUpdate::Changed(trace))) => {
                        if let Err(e) = refresh(&ctx, &client, &key, &trace).await {
                            warn!(trace = %key, error = %e, "watch: refresh failed");
                        }
                    }
                    Ok((_, TraceUpdate::Unchanged)) => {}
                    Ok((key, TraceUpdate::Deleted)) => {
                        ctx.forget(&key);
                    }
                    Err(e) => warn!(error = %e, "watch: unreadable trace event"),
                }
            }
            maybe = out_rx.recv() => {
                let Some(key) = maybe else { break };
                let trace = match client.get(&key).await.and_then(|o| trace_from_object(&o)) {
                    Ok(t) => t,
                    Err(e) if e.is_not_found() => {
                        registry.remove(&key);
                        ctx.forget(&key);
                        continue;
                    }
                    Err(e) => {
                        warn!(trace = %key, error = %e, "watch: trace lookup failed");
                        continue;
                    }
                };
                if let Err(e) = refresh(&ctx, &client, &key, &trace).await {
                    warn!(trace = %key, error = %e, "watch: refresh failed");
                }
            }
            _ = signal::ctrl_c() => {
                info!("Ctrl-C received; shutting down watch loop");
                break;
            }
        }
    }
    notifier.cancel();
    for w in watchers {
        w.abort();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match &cli.command {
        Commands::Plan { desired, root, objects, live, name, i18n, locale } => {
            let result = plan(&cli, desired, root.as_deref(), objects, *live, name.as_deref(), i18n.as_deref(), locale.clone()).await?;
            print_result(&result, cli.output)?;
            if !result.succeeded() {
                std::process::exit(2);
            }
        }
        Commands::Rules => {
            let rules = load_rules(cli.rules.as_deref())?;
            match cli.output {
                Output::Json => println!("{}", serde_json::to_string_pretty(&rules)?),
                Output::Human => {
                    println!("root: {}", rules.root);
                    for rule in &rules.rules {
                        println!("{}", rule.primary);
                        for owned in &rule.owned_resources {
                            println!("  -> {}", owned.secondary);
                        }
                    }
                }
            }
        }
        Commands::Crd => {
            let crd = ReconciliationTrace::crd();
            match cli.output {
                Output::Json => println!("{}", serde_json::to_string_pretty(&crd)?),
                Output::Human => print!("{}", serde_yaml::to_string(&crd)?),
            }
        }
        Commands::Watch { i18n } => watch(&cli, i18n.as_deref()).await?,
    }
    Ok(())
}
