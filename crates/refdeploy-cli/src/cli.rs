use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};

pub const HELP_TEMPLATE: &str =
    "{before-help}\nUsage:\n    {usage}\n\nGlobal options:\n{options}\n";

pub const BEFORE_HELP: &str = concat!(
    "refdeploy ",
    env!("CARGO_PKG_VERSION"),
    " – install and update refs from remote repositories\n\n",
    "\x1b[1;36mRefs\x1b[0m\n",
    "  install           Pull a ref from a remote and deploy it.\n",
    "  update            Move an installed ref to the newest commit of its origin.\n",
    "  uninstall         Remove a deployed ref.\n",
    "  list              Show deployed refs.\n",
    "  install-ref-file  Set up the remote a .flatpakref file describes and install it.\n\n",
    "\x1b[1;36mRemotes\x1b[0m\n",
    "  remotes           Show configured remotes.\n",
    "  remote-add        Add or replace a remote.\n",
    "  remote-delete     Remove a remote.\n\n",
    "\x1b[1;36mMaintenance\x1b[0m\n",
    "  unused            List runtimes nothing needs anymore.\n",
    "  prune             Delete unreachable objects from the local repo.\n",
    "  cleanup           Remove quarantined deployments and stale temp dirs.\n",
);

#[derive(Parser, Debug)]
#[command(
    name = "refdeploy",
    author,
    version,
    disable_help_subcommand = true,
    before_help = BEFORE_HELP,
    help_template = HELP_TEMPLATE
)]
pub struct RefdeployCli {
    #[arg(long, help = "Work on the per-user installation", global = true, conflicts_with_all = ["system", "installation"])]
    pub user: bool,
    #[arg(long, help = "Work on the system-wide installation (default)", global = true, conflicts_with = "installation")]
    pub system: bool,
    #[arg(long, value_name = "PATH", help = "Work on the installation at PATH", global = true)]
    pub installation: Option<PathBuf>,
    #[arg(short, long, action = ArgAction::Count, help = "Increase logging (-vv reaches trace)", global = true)]
    pub verbose: u8,
    #[arg(long, help = "Force trace logging regardless of -v", global = true)]
    pub trace: bool,
    #[command(subcommand)]
    pub command: CommandCli,
}

#[derive(Subcommand, Debug)]
pub enum CommandCli {
    #[command(
        about = "Pull REF from REMOTE and deploy it.",
        override_usage = "refdeploy install <REMOTE> <REF> [--subpath PATH ...]"
    )]
    Install(InstallArgs),
    #[command(
        about = "Update an installed ref from its origin remote.",
        override_usage = "refdeploy update <REF> [--commit C] [--allow-downgrade]"
    )]
    Update(UpdateArgs),
    #[command(
        about = "Remove a deployed ref.",
        override_usage = "refdeploy uninstall <REF> [--force-remove]"
    )]
    Uninstall(UninstallArgs),
    #[command(about = "List deployed refs.")]
    List(ListArgs),
    #[command(about = "List installed runtimes that nothing uses anymore.")]
    Unused(UnusedArgs),
    #[command(about = "Delete objects no ref reaches; skipped while the repo is in use.")]
    Prune,
    #[command(name = "remote-add", about = "Add or replace a remote.")]
    RemoteAdd(RemoteAddArgs),
    #[command(name = "remote-delete", about = "Remove a remote.")]
    RemoteDelete(RemoteDeleteArgs),
    #[command(about = "List configured remotes.")]
    Remotes,
    #[command(name = "install-ref-file", about = "Install the ref a .flatpakref file describes.")]
    InstallRefFile(InstallRefFileArgs),
    #[command(about = "Remove quarantined deployments and stale temp dirs.")]
    Cleanup,
}

#[derive(Args, Debug)]
pub struct InstallArgs {
    pub remote: String,
    #[arg(value_name = "REF", help = "Full ref, kind/id/arch/branch")]
    pub reference: String,
    #[arg(long = "subpath", value_name = "PATH", help = "Only install this subpath of files/")]
    pub subpaths: Vec<String>,
    #[arg(long, help = "Deploy what is already in the local repo")]
    pub no_pull: bool,
    #[arg(long, help = "Pull without deploying")]
    pub no_deploy: bool,
    #[arg(long, help = "Replace an existing deployment")]
    pub reinstall: bool,
}

#[derive(Args, Debug)]
pub struct UpdateArgs {
    #[arg(value_name = "REF")]
    pub reference: String,
    #[arg(long, value_name = "C", help = "Deploy this commit instead of the newest")]
    pub commit: Option<String>,
    #[arg(long, help = "Accept a commit older than the installed one")]
    pub allow_downgrade: bool,
    #[arg(long, help = "Deploy what is already in the local repo")]
    pub no_pull: bool,
}

#[derive(Args, Debug)]
pub struct UninstallArgs {
    #[arg(value_name = "REF")]
    pub reference: String,
    #[arg(long, help = "Remove a runtime even if installed apps use it")]
    pub force_remove: bool,
}

#[derive(Args, Debug)]
pub struct ListArgs {
    #[arg(long, help = "Only apps", conflicts_with = "runtime")]
    pub app: bool,
    #[arg(long, help = "Only runtimes")]
    pub runtime: bool,
}

#[derive(Args, Debug)]
pub struct UnusedArgs {
    #[arg(long, help = "Only report end-of-life runtimes")]
    pub eol_only: bool,
}

#[derive(Args, Debug)]
pub struct RemoteAddArgs {
    pub name: String,
    pub url: String,
    #[arg(long, help = "Do not require signatures")]
    pub no_gpg_verify: bool,
    #[arg(long, value_name = "KEY", help = "Trusted ed25519 public key, base64")]
    pub sign_key: Vec<String>,
    #[arg(long, help = "Title shown in listings")]
    pub title: Option<String>,
    #[arg(long, value_name = "N", help = "Priority; higher wins")]
    pub prio: Option<i64>,
}

#[derive(Args, Debug)]
pub struct RemoteDeleteArgs {
    pub name: String,
    #[arg(long, help = "Remove even if installed refs come from it")]
    pub force: bool,
}

#[derive(Args, Debug)]
pub struct InstallRefFileArgs {
    pub file: PathBuf,
}
