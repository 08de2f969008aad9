mod commands;
mod git;

use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use commands::{EXIT_FAILURE, EXIT_INTERNAL, EXIT_SUCCESS};
use cdflow_core::install_signal_handler;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "cdflow2",
    version,
    about = "Release, deploy and destroy components through config, build and Terraform containers"
)]
struct Cli {
    #[command(flatten)]
    globals: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

/// Options accepted before or after any command.
#[derive(Debug, Clone, Default, Args)]
pub struct GlobalArgs {
    /// Component name (default: repository name from the git remote).
    #[arg(short, long, global = true)]
    pub component: Option<String>,

    /// Commit being released (default: git HEAD).
    #[arg(long, global = true)]
    pub commit: Option<String>,

    /// Use the local config image instead of pulling it.
    #[arg(long, default_value_t = false, global = true)]
    pub no_pull_config: bool,

    /// Use local build images instead of pulling them.
    #[arg(long, default_value_t = false, global = true)]
    pub no_pull_release: bool,

    /// Use the local Terraform image instead of pulling it.
    #[arg(long, default_value_t = false, global = true)]
    pub no_pull_terraform: bool,

    /// Use the local Trivy image instead of pulling it.
    #[arg(long, default_value_t = false, global = true)]
    pub no_pull_scan: bool,

    /// Suppress progress output.
    #[arg(short, long, default_value_t = false, global = true)]
    pub quiet: bool,

    /// Enable verbose (debug) logging output.
    #[arg(long, default_value_t = false, global = true)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Let the config plugin set up what the project needs.
    Setup,
    /// Create a new project, from a basic template or a boilerplate repository.
    Init {
        /// Name of the project directory to create.
        #[arg(long)]
        name: Option<String>,
        /// Git URL of a boilerplate repository, optionally with `?ref=<branch>`.
        #[arg(long)]
        boilerplate: Option<String>,
        /// Template variables as `--KEY VALUE` pairs.
        #[arg(allow_hyphen_values = true, trailing_var_arg = true, value_name = "--KEY VALUE")]
        vars: Vec<String>,
    },
    /// Build and publish a release.
    Release {
        /// Extra release metadata as KEY=VALUE (repeatable).
        #[arg(short = 'r', long = "release-data")]
        release_data: Vec<String>,
        /// Terraform log level (TF_LOG).
        #[arg(short = 't', long)]
        terraform_log_level: Option<String>,
        /// Version of the release.
        version: String,
    },
    /// Deploy a release to an environment.
    Deploy {
        /// Stop after creating the plan.
        #[arg(short = 'p', long, default_value_t = false)]
        plan_only: bool,
        /// The environment's Terraform state is expected not to exist yet.
        #[arg(short = 'n', long, default_value_t = false)]
        new_state: bool,
        /// Fail before applying if the plan would delete anything.
        #[arg(short = 'e', long, default_value_t = false)]
        error_on_destroy: bool,
        /// Terraform log level (TF_LOG).
        #[arg(short = 't', long)]
        terraform_log_level: Option<String>,
        /// Environment name.
        env: String,
        /// Version of the release to deploy.
        version: String,
    },
    /// Destroy an environment's infrastructure.
    Destroy {
        /// Stop after creating the plan.
        #[arg(short = 'p', long, default_value_t = false)]
        plan_only: bool,
        /// Terraform log level (TF_LOG).
        #[arg(short = 't', long)]
        terraform_log_level: Option<String>,
        /// Environment name.
        env: String,
        /// Version of the release the environment runs.
        version: String,
    },
    /// Open a shell in the Terraform container for an environment.
    Shell {
        /// Environment name.
        env: String,
        /// Use the Terraform image of this release.
        #[arg(short = 'v', long)]
        version: Option<String>,
        /// Terraform log level (TF_LOG).
        #[arg(short = 't', long)]
        terraform_log_level: Option<String>,
        /// Arguments for `/bin/sh` (after --).
        #[arg(last = true)]
        args: Vec<String>,
    },
    /// Generate shell completions for bash, zsh, fish, elvish, or powershell.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
        std::process::exit(i32::from(EXIT_INTERNAL));
    }));

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = if e.use_stderr() {
                EXIT_FAILURE
            } else {
                EXIT_SUCCESS
            };
            let _ = e.print();
            return ExitCode::from(code);
        }
    };

    let default_level = if cli.globals.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("CDFLOW2_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .init();

    install_signal_handler();

    let globals = &cli.globals;
    let result = match cli.command {
        Commands::Setup => commands::setup::run(globals),
        Commands::Init {
            name,
            boilerplate,
            vars,
        } => commands::init::run(name.as_deref(), boilerplate.as_deref(), &vars),
        Commands::Release {
            release_data,
            terraform_log_level,
            version,
        } => commands::release::run(globals, version, &release_data, terraform_log_level),
        Commands::Deploy {
            plan_only,
            new_state,
            error_on_destroy,
            terraform_log_level,
            env,
            version,
        } => commands::deploy::run(
            globals,
            cdflow_core::DeployArgs {
                env_name: env,
                version,
                plan_only,
                state_should_exist: !new_state,
                error_on_destroy,
                terraform_log_level,
            },
        ),
        Commands::Destroy {
            plan_only,
            terraform_log_level,
            env,
            version,
        } => commands::destroy::run(
            globals,
            cdflow_core::DestroyArgs {
                env_name: env,
                version,
                plan_only,
                terraform_log_level,
            },
        ),
        Commands::Shell {
            env,
            version,
            terraform_log_level,
            args,
        } => commands::shell::run(
            globals,
            cdflow_core::ShellArgs {
                env_name: env,
                version,
                args,
                terraform_log_level,
            },
        ),
        Commands::Completions { shell } => commands::completions::run::<Cli>(shell),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}
