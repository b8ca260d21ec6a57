use std::fs;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use color_eyre::eyre::eyre;
use refdeploy_core::{
    find_deploy_error, Environment, InstallOptions, Installation, Ref, RefKind, RemoteConfig,
    Scope, UnusedOptions, DEPLOY_VERSION_CURRENT,
};

mod cli;

use cli::{CommandCli, RefdeployCli};

fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let cli = RefdeployCli::parse();
    init_tracing(cli.trace, cli.verbose);

    match run(&cli) {
        Ok(()) => Ok(()),
        Err(err) if find_deploy_error(&err).is_some() => {
            eprintln!("error: {err:#}");
            std::process::exit(1);
        }
        Err(err) => Err(eyre!("{err:?}")),
    }
}

fn init_tracing(trace: bool, verbose: u8) {
    let level = if trace {
        "trace"
    } else {
        match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = format!("refdeploy={level},refdeploy_core={level},refdeploy_store={level}");
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_level(true)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn open_installation(cli: &RefdeployCli) -> Result<Installation> {
    let environment = Arc::new(Environment::capture());
    if let Some(path) = &cli.installation {
        return Installation::open(path, Scope::Custom, environment);
    }
    if cli.user {
        Installation::user(environment)
    } else {
        Installation::system(environment)
    }
}

fn parse_ref(value: &str) -> Result<Ref> {
    value
        .parse()
        .with_context(|| format!("'{value}' is not a ref (kind/id/arch/branch)"))
}

fn run(cli: &RefdeployCli) -> Result<()> {
    let installation = open_installation(cli)?;
    match &cli.command {
        CommandCli::Install(args) => {
            let reference = parse_ref(&args.reference)?;
            let options = InstallOptions {
                subpaths: (!args.subpaths.is_empty()).then_some(args.subpaths.as_slice()),
                no_pull: args.no_pull,
                no_deploy: args.no_deploy,
                reinstall: args.reinstall,
                ..InstallOptions::default()
            };
            match installation.install(&args.remote, &reference, &options)? {
                Some(data) => println!("Installed {reference} ({})", short(&data.commit)),
                None => println!("Pulled {reference}"),
            }
        }
        CommandCli::Update(args) => {
            let reference = parse_ref(&args.reference)?;
            let options = InstallOptions {
                commit: args.commit.as_deref(),
                allow_downgrade: args.allow_downgrade,
                no_pull: args.no_pull,
                ..InstallOptions::default()
            };
            match installation.update(&reference, &options)? {
                Some(data) => println!("Updated {reference} to {}", short(&data.commit)),
                None => println!("{reference} is already up to date"),
            }
        }
        CommandCli::Uninstall(args) => {
            let reference = parse_ref(&args.reference)?;
            installation.uninstall(&reference, args.force_remove)?;
            println!("Uninstalled {reference}");
        }
        CommandCli::List(args) => {
            let kind = if args.app {
                Some(RefKind::App)
            } else if args.runtime {
                Some(RefKind::Runtime)
            } else {
                None
            };
            for reference in installation.list_deployed(kind)? {
                let data = installation.load_deploy_data(&reference, DEPLOY_VERSION_CURRENT)?;
                println!("{reference}\t{}\t{}", data.origin, short(&data.commit));
            }
        }
        CommandCli::Unused(args) => {
            let options = UnusedOptions {
                eol_only: args.eol_only,
                ..UnusedOptions::default()
            };
            for reference in installation.list_unused_refs(&options)? {
                println!("{reference}");
            }
        }
        CommandCli::Prune => match installation.prune()? {
            Some(stats) => println!(
                "Pruned {} of {} objects, freed {} bytes",
                stats.pruned, stats.total, stats.bytes_freed
            ),
            None => println!("Repo is in use, prune skipped"),
        },
        CommandCli::RemoteAdd(args) => {
            let mut remote = RemoteConfig::new(&args.name, &args.url);
            if args.no_gpg_verify {
                remote.gpg_verify = false;
                remote.gpg_verify_summary = false;
            }
            remote.sign_keys.clone_from(&args.sign_key);
            remote.title.clone_from(&args.title);
            if let Some(prio) = args.prio {
                remote.prio = prio;
            }
            installation.configure_remote(&remote)?;
            println!("Added remote {}", args.name);
        }
        CommandCli::RemoteDelete(args) => {
            installation.remove_remote(&args.name, args.force)?;
            println!("Removed remote {}", args.name);
        }
        CommandCli::Remotes => {
            for remote in installation.remotes() {
                let mut flags = Vec::new();
                if remote.disabled {
                    flags.push("disabled");
                }
                if !remote.gpg_verify {
                    flags.push("no-gpg-verify");
                }
                if remote.noenumerate {
                    flags.push("no-enumerate");
                }
                println!("{}\t{}\t{}\t{}", remote.name, remote.url, remote.prio, flags.join(","));
            }
        }
        CommandCli::InstallRefFile(args) => {
            let text = fs::read_to_string(&args.file)
                .with_context(|| format!("failed to read {}", args.file.display()))?;
            let (reference, remote) = installation.install_ref_file(&text)?;
            let data = installation.install(&remote, &reference, &InstallOptions::default())?;
            match data {
                Some(data) => println!("Installed {reference} from {remote} ({})", short(&data.commit)),
                None => println!("Pulled {reference} from {remote}"),
            }
        }
        CommandCli::Cleanup => {
            let removed = installation.cleanup_removed()?;
            let stale = installation.cleanup_stale_tmp()?;
            println!("Removed {removed} old deployments and {stale} stale temp dirs");
        }
    }
    Ok(())
}

fn short(checksum: &str) -> &str {
    checksum.get(..12).unwrap_or(checksum)
}
