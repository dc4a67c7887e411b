//! # roster
//!
//! Command-line front end for a Clash-style proxy engine. Lists groups and
//! providers (filtered, sorted and streamed in batches), switches the active
//! member of a group, and runs latency probes, health checks and provider updates.
//!
//! Settings come from `roster.conf` (or `--config-path`), `ROSTER_*` environment
//! variables (a `.env` file is honored) and the flags below, in rising priority.

use std::io::Write;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;

use lib_roster::configs::{load_settings, Settings};
use lib_roster::core::{CollapsibleCategory, DelaySnapshot};
use lib_roster::loggers::setup_logging;
use lib_roster::{ApiConfig, FetchOutcome, FilterState, ProbeOutcome, ProxyName, ProxyStore, SortBy, StreamingConfig, StreamingReveal};

#[derive(Parser)]
#[clap(
    name = "roster",
    version = "0.1.0",
    author = "ckir",
    about = "Inspect and steer a Clash-style proxy engine.",
    long_about = "Talks to the engine's REST control API. Group and provider listings honor the \
                  configured sort order and hide-unavailable flag and are printed in batches."
)]
struct Cli {
    #[command(flatten)]
    settings: Settings,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List proxy groups and their members.
    Groups {
        /// Only this group.
        group: Option<String>,
        /// Case-insensitive substring a member name must contain.
        #[clap(long, short = 'f', value_name = "TEXT")]
        filter: Option<String>,
        /// Show members of every group, collapsed ones included.
        #[clap(long, action = ArgAction::SetTrue)]
        expand_all: bool,
    },
    /// List proxy providers and their proxies.
    Providers {
        #[clap(long, short = 'f', value_name = "TEXT")]
        filter: Option<String>,
        #[clap(long, action = ArgAction::SetTrue)]
        expand_all: bool,
    },
    /// Make MEMBER the active member of GROUP.
    Switch { group: String, member: String },
    /// Probe the latency of every member of GROUP, or of the given proxies.
    Probe {
        group: Option<String>,
        #[clap(long, value_name = "NAME", num_args = 1.., conflicts_with = "group")]
        proxies: Vec<String>,
    },
    /// Health-check a provider, or all of them.
    Healthcheck {
        provider: Option<String>,
        #[clap(long, action = ArgAction::SetTrue, conflicts_with = "provider")]
        all: bool,
    },
    /// Have the engine re-pull a provider, or all of them.
    UpdateProvider {
        name: Option<String>,
        #[clap(long, action = ArgAction::SetTrue, conflicts_with = "name")]
        all: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let settings = load_settings(cli.settings);
    setup_logging(&settings.log_dir(), settings.log_level()).context("Failed to set up logging")?;

    let api = settings.api_config();
    if !api.is_enabled() {
        bail!("No control API configured. Set --base-url, ROSTER_BASE_URL or baseUrl in the settings file.");
    }
    let store = ProxyStore::new(settings.store_settings());

    tokio::select! {
        result = run(&store, &api, &settings, cli.command) => result,
        _ = signal::ctrl_c() => {
            log::info!("Ctrl-C received, shutting down.");
            store.latency().shutdown();
            Ok(())
        }
    }
}

async fn run(store: &ProxyStore, api: &ApiConfig, settings: &Settings, command: Command) -> Result<()> {
    store.fetch_proxies(api).await.context("Failed to fetch the proxy roster")?;
    let streaming = settings.streaming_config();

    match command {
        Command::Groups { group, filter, expand_all } => {
            let filter = with_text(settings.filter_state(), filter);
            let names = match group {
                Some(g) => vec![g],
                None => store.get_proxy_group_names(),
            };
            if expand_all {
                store.collapsible().set_all(CollapsibleCategory::ProxyGroup, &names, true);
            }
            for name in names {
                let snapshot = store.get_proxies();
                let Some(g) = snapshot.groups.get(&name) else {
                    bail!("Unknown proxy group: {}", name);
                };
                println!("{} ({}, {} members)", g.name, g.group_type, g.all.len());
                if !store.collapsible().is_open(CollapsibleCategory::ProxyGroup, &name) {
                    continue;
                }
                let members = store.group_view(&name, &filter).unwrap_or_default();
                print_streamed(members, &store.get_delay(), g.now.as_deref(), streaming).await;
            }
        }
        Command::Providers { filter, expand_all } => {
            let filter = with_text(settings.filter_state(), filter);
            let providers = store.get_proxy_providers();
            if expand_all {
                let names: Vec<String> = providers.iter().map(|p| p.name.clone()).collect();
                store.collapsible().set_all(CollapsibleCategory::ProxyProvider, &names, true);
            }
            for p in providers {
                let updated = p.updated_at.map(|t| t.to_rfc3339()).unwrap_or_else(|| "never".to_string());
                println!("{} ({:?}, {} proxies, updated {})", p.name, p.vehicle_type, p.proxies.len(), updated);
                if !store.collapsible().is_open(CollapsibleCategory::ProxyProvider, &p.name) {
                    continue;
                }
                let members = store.provider_view(&p.name, &filter).unwrap_or_default();
                print_streamed(members, &store.get_delay(), None, streaming).await;
            }
        }
        Command::Switch { group, member } => {
            let outcome = store.switch_proxy(api, &group, &member, settings.auto_close_old_conns()).await?;
            println!(
                "{}: {} -> {}",
                group,
                outcome.previous.as_deref().unwrap_or("-"),
                member
            );
            if outcome.awaiting_confirmation {
                let previous = outcome.previous.unwrap_or_default();
                if confirm(&format!("Close connections still going through '{}'? [y/N] ", previous)).await? {
                    println!("Closed {} connection(s).", store.confirm_close_prev_conns().await);
                } else {
                    store.dismiss_close_prev_conns();
                }
            } else if outcome.closed_connections > 0 {
                println!("Closed {} connection(s).", outcome.closed_connections);
            }
        }
        Command::Probe { group, proxies } => {
            let (outcome, names) = match group {
                Some(g) => {
                    let outcome = store.request_delay_for_group(api, &g).await?;
                    let members = store.get_proxies().groups.get(&g).map(|x| x.all.clone()).unwrap_or_default();
                    (outcome, members)
                }
                None if !proxies.is_empty() => (store.request_delay_for_proxies(api, proxies.clone()).await?, proxies),
                None => bail!("Name a group or pass --proxies."),
            };
            report(&outcome);
            let by_latency = FilterState { sort_by: SortBy::LatencyAsc, ..FilterState::default() };
            let snapshot = store.get_proxies();
            let sorted = lib_roster::pipeline::apply_filter_state(&names, &store.get_delay(), &by_latency, Some(&snapshot.proxies));
            print_streamed(sorted, &store.get_delay(), None, streaming).await;
        }
        Command::Healthcheck { provider, all } => {
            let runs = match (provider, all) {
                (_, true) => store.healthcheck_all_providers(api).await?,
                (Some(name), false) => vec![(name.clone(), store.healthcheck_provider_by_name(api, &name).await?)],
                (None, false) => bail!("Name a provider or pass --all."),
            };
            for (name, outcome) in runs {
                print!("{}: ", name);
                report(&outcome);
            }
        }
        Command::UpdateProvider { name, all } => {
            let fetched = match (name, all) {
                (_, true) => store.update_all_providers(api).await?,
                (Some(name), false) => store.update_provider_by_name(api, &name).await?,
                (None, false) => bail!("Name a provider or pass --all."),
            };
            if fetched == FetchOutcome::Adopted {
                println!("{} provider(s) refreshed.", store.get_proxy_providers().len());
            }
        }
    }
    Ok(())
}

fn with_text(mut filter: FilterState, text: Option<String>) -> FilterState {
    if let Some(text) = text {
        filter.text = text;
    }
    filter
}

fn report(outcome: &ProbeOutcome) {
    match outcome {
        ProbeOutcome::Skipped => println!("already running"),
        ProbeOutcome::Completed { ok, failed } => println!("{} ok, {} failed", ok, failed),
        ProbeOutcome::Aborted { attributed, reason } => println!("aborted after {} result(s): {}", attributed, reason),
    }
}

/// Prints `names` as the streaming reveal exposes them.
async fn print_streamed(names: Vec<ProxyName>, delays: &DelaySnapshot, active: Option<&str>, config: StreamingConfig) {
    if names.is_empty() {
        println!("  (none)");
        return;
    }
    let items: Arc<[ProxyName]> = names.into();
    let mut reveal = StreamingReveal::new(config);
    let mut rx = reveal.subscribe();
    reveal.set_source(Arc::clone(&items));

    let mut printed = 0;
    while rx.changed().await.is_ok() {
        let state = *rx.borrow_and_update();
        for name in &items[printed..state.visible_count] {
            let marker = if Some(name.as_str()) == active { "*" } else { " " };
            let delay = delays.get(name).cloned().unwrap_or_default();
            println!("  {} {:<40} {}", marker, name, delay);
        }
        printed = printed.max(state.visible_count);
        if !state.is_loading {
            break;
        }
    }
}

async fn confirm(prompt: &str) -> Result<bool> {
    print!("{}", prompt);
    std::io::stdout().flush()?;
    let mut line = String::new();
    BufReader::new(tokio::io::stdin()).read_line(&mut line).await?;
    Ok(matches!(line.trim().to_lowercase().as_str(), "y" | "yes"))
}
