use std::env;
use std::fmt;
use std::fs;
use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use config::{Config, Environment, File, FileFormat};
use log::{LevelFilter, debug, info, warn};
use serde::Serialize;

use sandboxd::cluster::{ClusterApi, KubectlCluster, MemoryCluster};
use sandboxd::config::{AppConfig, ClusterBackend};
use sandboxd::db::Database;
use sandboxd::sandbox_fs::{ExecFs, SandboxFs};
use sandboxd::session::HttpProbe;
use sandboxd::{Engine, EngineConfig};

const APP_NAME: &str = "sandboxd";

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging()?;
    debug!("resolved paths: {}", ctx.paths);

    match cli.command {
        Command::Init(cmd) => handle_init(&ctx, cmd),
        Command::Config { command } => handle_config(&ctx, command),
        Command::Completions { shell } => handle_completions(shell),
        command => async_main(ctx, command),
    }
}

#[tokio::main]
async fn async_main(ctx: RuntimeContext, command: Command) -> Result<()> {
    let engine = ctx.engine().await?;
    let result = match command {
        Command::Session { command } => handle_session(&ctx, &engine, command).await,
        Command::Sync { command } => handle_sync(&ctx, &engine, command).await,
        Command::Maintenance { command } => handle_maintenance(&ctx, &engine, command).await,
        Command::Admin { command } => handle_admin(&ctx, &engine, command).await,
        Command::Init(_) | Command::Config { .. } | Command::Completions { .. } => {
            Err(anyhow!("command does not need the engine"))
        }
    };

    let timeout = Duration::from_secs(ctx.config.pool.drain_timeout_secs);
    if !engine.pool.drain(timeout).await {
        warn!(
            "{} background tasks still pending after {}s",
            engine.pool.pending(),
            timeout.as_secs()
        );
    }
    result
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "sandboxd - sandbox lifecycle and workspace/skill reconciliation.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
    /// Output machine readable JSON
    #[arg(long, global = true, conflicts_with = "yaml")]
    json: bool,
    /// Output machine readable YAML
    #[arg(long, global = true)]
    yaml: bool,
    /// Disable ANSI colors in output
    #[arg(long = "no-color", global = true, conflicts_with = "color")]
    no_color: bool,
    /// Control color output (auto, always, never)
    #[arg(long, value_enum, default_value_t = ColorOption::Auto, global = true)]
    color: ColorOption,
    /// Do not change anything on disk
    #[arg(long = "dry-run", global = true)]
    dry_run: bool,
    /// Assume "yes" for interactive prompts
    #[arg(short = 'y', long = "yes", alias = "force", global = true)]
    assume_yes: bool,
    /// Emit additional diagnostics for troubleshooting
    #[arg(long = "diagnostics", global = true)]
    diagnostics: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ColorOption {
    Auto,
    Always,
    Never,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create config directories and default files
    Init(InitCommand),
    /// Inspect and manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Create, list and delete sessions
    Session {
        #[command(subcommand)]
        command: SessionCommand,
    },
    /// Mirror workspace files and skills into a sandbox
    Sync {
        #[command(subcommand)]
        command: SyncCommand,
    },
    /// Run or schedule maintenance
    Maintenance {
        #[command(subcommand)]
        command: MaintenanceCommand,
    },
    /// Operator actions on sandboxes
    Admin {
        #[command(subcommand)]
        command: AdminCommand,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Clone, Args)]
struct InitCommand {
    /// Recreate configuration even if it already exists
    #[arg(long = "force")]
    force: bool,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Output the effective configuration
    Show,
    /// Print the resolved config file path
    Path,
    /// Regenerate the default configuration file
    Reset,
}

#[derive(Debug, Clone, Args)]
struct SandboxArgs {
    /// User id
    #[arg(long)]
    user: i64,
    /// Agent id
    #[arg(long)]
    agent: i64,
}

#[derive(Debug, Subcommand)]
enum SessionCommand {
    /// Reuse the running session for a sandbox or provision a new one
    Create(SandboxArgs),
    /// List a user's sessions
    List {
        #[arg(long)]
        user: i64,
    },
    /// Soft-delete a session; the sandbox keeps running
    Delete {
        #[arg(long)]
        user: i64,
        /// Session id
        id: String,
    },
}

#[derive(Debug, Subcommand)]
enum SyncCommand {
    /// Mirror every inbound workspace namespace into the sandbox
    Workspace(SandboxArgs),
    /// Reconcile installed skills with the sandbox's command files
    Skills(SandboxArgs),
    /// Rewrite catalogued output files into the sandbox
    RestoreOutput(SandboxArgs),
}

#[derive(Debug, Subcommand)]
enum MaintenanceCommand {
    /// Run all maintenance tasks in this process
    Run,
    /// Create or update the maintenance cron job
    Schedule,
    /// Start a one-off maintenance job in the cluster
    Trigger,
}

#[derive(Debug, Subcommand)]
enum AdminCommand {
    /// Close the sandbox's sessions and delete its workload
    Restart(SandboxArgs),
    /// Change one sandbox's image
    UpdateImage {
        #[command(flatten)]
        sandbox: SandboxArgs,
        #[arg(long)]
        image: String,
    },
    /// Change the image of every sandbox
    BatchUpdateImage {
        #[arg(long)]
        image: String,
    },
    /// Show the live pod status of a sandbox
    PodInfo(SandboxArgs),
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    common: CommonOpts,
    paths: AppPaths,
    config: AppConfig,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let paths = AppPaths::discover(common.config.clone())?;
        let config = load_or_init_config(&paths, &common)?;
        let ctx = Self {
            common,
            paths,
            config,
        };
        ctx.ensure_directories()?;
        Ok(ctx)
    }

    fn init_logging(&self) -> Result<()> {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        if self.common.quiet {
            log::set_max_level(LevelFilter::Off);
            return Ok(());
        }

        let level = match self.effective_log_level() {
            LevelFilter::Off => "off",
            LevelFilter::Error => "error",
            LevelFilter::Warn => "warn",
            LevelFilter::Info => "info",
            LevelFilter::Debug => "debug",
            LevelFilter::Trace => "trace",
        };

        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("sandboxd={level},sqlx=warn")));

        if self.common.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(io::stderr))
                .try_init()
                .ok();
        } else {
            let force_color = matches!(self.common.color, ColorOption::Always)
                || env::var_os("FORCE_COLOR").is_some();
            let disable_color = self.common.no_color
                || matches!(self.common.color, ColorOption::Never)
                || env::var_os("NO_COLOR").is_some()
                || (!force_color && !io::stderr().is_terminal());

            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(io::stderr)
                        .with_ansi(!disable_color)
                        .with_target(self.common.diagnostics)
                        .with_file(self.common.diagnostics)
                        .with_line_number(self.common.diagnostics),
                )
                .try_init()
                .ok();
        }

        // Services log through the log facade
        let mut builder =
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
        builder.filter_level(self.effective_log_level());
        builder.try_init().ok();

        Ok(())
    }

    fn effective_log_level(&self) -> LevelFilter {
        if self.common.trace {
            LevelFilter::Trace
        } else if self.common.debug {
            LevelFilter::Debug
        } else {
            match self.common.verbose {
                0 => self
                    .config
                    .logging
                    .level
                    .parse()
                    .unwrap_or(LevelFilter::Info),
                1 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }

    fn ensure_directories(&self) -> Result<()> {
        if self.common.dry_run {
            info!(
                "dry-run: would ensure data dir {}",
                self.paths.data_dir.display()
            );
            return Ok(());
        }
        fs::create_dir_all(&self.paths.data_dir).with_context(|| {
            format!("creating data directory {}", self.paths.data_dir.display())
        })?;
        Ok(())
    }

    fn database_path(&self) -> Result<PathBuf> {
        match self.config.database.path {
            Some(ref path) => expand_str_path(path),
            None => Ok(self.paths.data_dir.join("sandboxd.db")),
        }
    }

    fn storage_root(&self) -> Result<String> {
        let root = match self.config.storage.root {
            Some(ref root) => expand_str_path(root)?,
            None => self.paths.data_dir.join("objects"),
        };
        Ok(root.display().to_string())
    }

    async fn engine(&self) -> Result<Engine> {
        let db = Database::new(&self.database_path()?).await?;

        let (cluster, fs): (Arc<dyn ClusterApi>, Arc<dyn SandboxFs>) =
            match self.config.cluster.backend {
                ClusterBackend::Kubectl => {
                    let kubeconfig = match self.config.cluster.kubeconfig {
                        Some(ref path) => Some(expand_str_path(path)?),
                        None => None,
                    };
                    let cluster: Arc<dyn ClusterApi> = Arc::new(
                        KubectlCluster::new(self.config.cluster.namespace.clone())
                            .with_binary(self.config.cluster.kubectl.clone())
                            .with_kubeconfig(kubeconfig)
                            .with_context(self.config.cluster.context.clone()),
                    );
                    let fs = Arc::new(ExecFs::new(cluster.clone()));
                    (cluster, fs)
                }
                ClusterBackend::Memory => {
                    warn!("Using the in-memory cluster; sandboxes do not outlive this process");
                    let cluster = Arc::new(MemoryCluster::new());
                    (cluster.clone(), cluster)
                }
            };

        let config = EngineConfig {
            provisioner: self.config.sandbox.provisioner(),
            session: self.config.sandbox.session(),
            settings: self.config.settings_defaults(),
            storage: self.config.storage.backend(&self.storage_root()?),
            quotas: self.config.workspace.quota_defaults(),
            pool: self.config.pool.pool(),
            maintenance: self.config.maintenance.job(),
        };
        let mut engine = Engine::new(db, cluster, fs, config);
        if self.config.sandbox.http_probe {
            let probe = HttpProbe::new(
                engine.provisioner.clone(),
                Duration::from_secs(self.config.sandbox.probe_timeout_secs),
            )
            .context("building HTTP reachability probe")?;
            engine.sessions.set_probe(Arc::new(probe));
        }
        Ok(engine)
    }

    fn print<T: Serialize + fmt::Debug>(&self, value: &T) -> Result<()> {
        if self.common.json {
            println!(
                "{}",
                serde_json::to_string_pretty(value).context("serializing output to JSON")?
            );
        } else if self.common.yaml {
            println!(
                "{}",
                serde_yaml::to_string(value).context("serializing output to YAML")?
            );
        } else {
            println!("{value:#?}");
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct AppPaths {
    config_file: PathBuf,
    data_dir: PathBuf,
}

impl AppPaths {
    fn discover(override_path: Option<PathBuf>) -> Result<Self> {
        let config_file = match override_path {
            Some(path) => {
                let expanded = expand_path(path)?;
                if expanded.is_dir() {
                    expanded.join("config.toml")
                } else {
                    expanded
                }
            }
            None => default_config_dir()?.join("config.toml"),
        };

        if config_file.parent().is_none() {
            return Err(anyhow!("invalid config file path: {config_file:?}"));
        }

        Ok(Self {
            config_file,
            data_dir: default_data_dir()?,
        })
    }
}

impl fmt::Display for AppPaths {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "config: {}, data: {}",
            self.config_file.display(),
            self.data_dir.display()
        )
    }
}

fn handle_init(ctx: &RuntimeContext, cmd: InitCommand) -> Result<()> {
    if ctx.paths.config_file.exists() && !(cmd.force || ctx.common.assume_yes) {
        return Err(anyhow!(
            "config already exists at {} (use --force to overwrite)",
            ctx.paths.config_file.display()
        ));
    }

    if ctx.common.dry_run {
        info!(
            "dry-run: would write default config to {}",
            ctx.paths.config_file.display()
        );
        return Ok(());
    }

    write_default_config(&ctx.paths.config_file)
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => ctx.print(&ctx.config),
        ConfigCommand::Path => {
            println!("{}", ctx.paths.config_file.display());
            Ok(())
        }
        ConfigCommand::Reset => {
            if ctx.common.dry_run {
                info!(
                    "dry-run: would reset config at {}",
                    ctx.paths.config_file.display()
                );
                return Ok(());
            }
            write_default_config(&ctx.paths.config_file)
        }
    }
}

fn handle_completions(shell: Shell) -> Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
    Ok(())
}

async fn handle_session(ctx: &RuntimeContext, engine: &Engine, command: SessionCommand) -> Result<()> {
    match command {
        SessionCommand::Create(args) => {
            let response = engine
                .sessions
                .create_or_reuse_session(args.user, args.agent)
                .await?;
            ctx.print(&response)
        }
        SessionCommand::List { user } => {
            let sessions = engine.sessions.list_sessions(user).await?;
            ctx.print(&sessions)
        }
        SessionCommand::Delete { user, id } => {
            engine.sessions.delete_session(user, &id).await?;
            info!("Session {} deleted", id);
            Ok(())
        }
    }
}

async fn handle_sync(ctx: &RuntimeContext, engine: &Engine, command: SyncCommand) -> Result<()> {
    match command {
        SyncCommand::Workspace(args) => {
            let report = engine
                .workspace_sync
                .full_sync_with_progress(args.user, args.agent, |p| {
                    debug!("[{}/{}] {}", p.synced, p.total, p.current_file);
                })
                .await;
            ctx.print(&report)
        }
        SyncCommand::Skills(args) => {
            let report = engine.skill_sync.sync_all(args.user, args.agent).await?;
            ctx.print(&report)
        }
        SyncCommand::RestoreOutput(args) => {
            let report = engine
                .workspace_sync
                .restore_output_files(args.user, args.agent)
                .await;
            ctx.print(&report)
        }
    }
}

async fn handle_maintenance(
    ctx: &RuntimeContext,
    engine: &Engine,
    command: MaintenanceCommand,
) -> Result<()> {
    match command {
        MaintenanceCommand::Run => {
            let report = engine.maintenance.run_all().await;
            ctx.print(&report)
        }
        MaintenanceCommand::Schedule => {
            let schedule = engine.maintenance.ensure_maintenance_schedule().await?;
            println!("{schedule}");
            Ok(())
        }
        MaintenanceCommand::Trigger => {
            let job = engine.maintenance.trigger_maintenance().await?;
            println!("{job}");
            Ok(())
        }
    }
}

async fn handle_admin(ctx: &RuntimeContext, engine: &Engine, command: AdminCommand) -> Result<()> {
    match command {
        AdminCommand::Restart(args) => {
            engine.admin.restart_user_agent(args.user, args.agent).await?;
            info!("Sandbox {}/{} is restarting", args.user, args.agent);
            Ok(())
        }
        AdminCommand::UpdateImage { sandbox, image } => {
            engine
                .admin
                .update_agent_image(sandbox.user, sandbox.agent, &image)
                .await?;
            info!("Sandbox {}/{} image set to {}", sandbox.user, sandbox.agent, image);
            Ok(())
        }
        AdminCommand::BatchUpdateImage { image } => {
            let report = engine.admin.batch_update_image(&image).await?;
            ctx.print(&report)
        }
        AdminCommand::PodInfo(args) => {
            let info = engine.admin.pod_info(args.user, args.agent).await;
            ctx.print(&info)
        }
    }
}

fn load_or_init_config(paths: &AppPaths, common: &CommonOpts) -> Result<AppConfig> {
    if !paths.config_file.exists() {
        if common.dry_run {
            info!(
                "dry-run: would create default config at {}",
                paths.config_file.display()
            );
        } else {
            write_default_config(&paths.config_file)?;
        }
    }

    let env_prefix = env_prefix();
    let built = Config::builder()
        .set_default("logging.level", "info")?
        .set_default("cluster.backend", "kubectl")?
        .set_default("sandbox.name_prefix", "sandbox")?
        .set_default("maintenance.interval", "10m")?
        .add_source(
            File::from(paths.config_file.as_path())
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(Environment::with_prefix(env_prefix.as_str()).separator("__"))
        .build()?;

    let config: AppConfig = built.try_deserialize()?;
    Ok(config)
}

fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let config = AppConfig::default();
    let toml = toml::to_string_pretty(&config).context("serializing default config to TOML")?;
    let mut body = default_config_header(path);
    body.push_str(&toml);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

fn default_config_header(path: &Path) -> String {
    format!("# Configuration for {APP_NAME}\n# File: {}\n\n", path.display())
}

fn expand_path(path: PathBuf) -> Result<PathBuf> {
    if let Some(text) = path.to_str() {
        expand_str_path(text)
    } else {
        Ok(path)
    }
}

fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}

fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(mut dir) = dirs::config_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

fn default_data_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_DATA_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(mut dir) = dirs::data_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".local").join("share").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine data directory"))
}

fn env_prefix() -> String {
    APP_NAME
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}
