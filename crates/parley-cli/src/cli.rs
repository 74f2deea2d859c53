//! CLI command definitions and argument parsing

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::{Args, Parser, Subcommand};
use tracing::debug;

use parley_core::context::ContextOptions;
use parley_core::http_relay::HttpRelayClient;
use parley_core::{Config, ConversationId, E2eeContext, E2eeError, FileStore, Outgoing, UserId};
use parley_core::types::KeyBackup;
use parley_crypto::PublicKey;

use crate::output::{IdentityOutput, OutputFormat, OutputFormatter, StatusOutput};
use crate::ExitCode;

/// Parley CLI - end-to-end encrypted conversations
#[derive(Parser, Debug)]
#[command(name = "parley")]
#[command(version, about = "Parley CLI - end-to-end encrypted conversations")]
pub struct Cli {
    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Output format
    #[arg(long, default_value = "table", global = true)]
    pub output: OutputFormat,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// Config file path
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Acting user ID
    #[arg(long, env = "PARLEY_USER", global = true)]
    pub user: Option<String>,

    /// Relay base URL (overrides config)
    #[arg(long = "relay-url", global = true)]
    pub relay_url: Option<String>,

    /// Bearer token for the relay (overrides config)
    #[arg(long, env = "PARLEY_API_TOKEN", global = true, hide_env_values = true)]
    pub token: Option<String>,

    /// Secret store file (overrides config)
    #[arg(long, global = true)]
    pub store: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create or load this device's identity and register it with the relay
    Init,
    /// Show the recovery code protecting the identity backup
    RecoveryCode,
    /// Unlock the identity backup stored on this device with the recovery code
    Recover {
        /// Recovery code (separators and case are ignored)
        code: String,
    },
    /// Delete the identity and every cached key
    Reset {
        /// Confirm the reset
        #[arg(long)]
        yes: bool,
    },
    /// Turn on encryption for a conversation
    Enable(ConversationArgs),
    /// Turn off encryption (only the member who enabled it may)
    Disable {
        conversation: String,
    },
    /// Show a conversation's encryption state
    Status {
        conversation: String,
    },
    /// Send a message, encrypting it when the conversation requires it
    Send {
        #[command(flatten)]
        target: ConversationArgs,
        /// Message text
        message: String,
    },
    /// Fetch and decrypt a conversation's messages
    Read {
        conversation: String,
    },
    /// Export or import an identity backup
    #[command(subcommand)]
    Backup(BackupCommands),
}

#[derive(Args, Debug)]
pub struct ConversationArgs {
    /// Conversation ID
    pub conversation: String,

    /// Conversation member (repeatable); the acting user is always included
    #[arg(long = "member", short = 'm')]
    pub members: Vec<String>,
}

impl ConversationArgs {
    fn members_with(&self, me: &UserId) -> Vec<UserId> {
        let mut members: Vec<UserId> = Vec::with_capacity(self.members.len() + 1);
        members.push(me.clone());
        for m in &self.members {
            let id = UserId::new(m.trim());
            if !id.as_str().is_empty() && !members.contains(&id) {
                members.push(id);
            }
        }
        members
    }
}

#[derive(Subcommand, Debug)]
pub enum BackupCommands {
    /// Write the backup as JSON
    Export {
        /// Output file (stdout when omitted)
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Restore an identity from a backup file
    Import {
        /// Backup file produced by `backup export`
        file: PathBuf,
        /// Recovery code for the backup
        code: String,
    },
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> anyhow::Result<ExitCode> {
        let config = Config::load_default().unwrap_or_default();
        self.execute_with_config(config).await
    }

    /// CLI arguments override config values.
    pub fn apply_overrides(&self, mut config: Config) -> Config {
        if let Some(url) = &self.relay_url {
            config.relay.base_url = url.clone();
        }
        if let Some(token) = &self.token {
            config.relay.api_token = Some(token.clone());
        }
        if let Some(store) = &self.store {
            config.storage.path = Some(store.clone());
        }
        config
    }

    /// Execute the CLI command with a pre-loaded configuration
    pub async fn execute_with_config(self, config: Config) -> anyhow::Result<ExitCode> {
        let formatter = OutputFormatter::new(self.output, self.verbose);
        let config = self.apply_overrides(config);
        if let Err(e) = config.validate() {
            emit_error(&formatter, &e.to_string(), ExitCode::InvalidInput);
            return Ok(ExitCode::InvalidInput);
        }

        let Some(user) = self.user.as_deref().map(str::trim).filter(|u| !u.is_empty()) else {
            emit_error(
                &formatter,
                "no user given; pass --user or set PARLEY_USER",
                ExitCode::InvalidInput,
            );
            return Ok(ExitCode::InvalidInput);
        };
        let user = UserId::new(user);

        let ctx = match build_context(&config, user) {
            Ok(ctx) => ctx,
            Err(e) => return Ok(fail(&formatter, &e)),
        };

        let code = match self.command {
            Commands::Init => init(&ctx, &formatter).await,
            Commands::RecoveryCode => recovery_code(&ctx, &formatter).await,
            Commands::Recover { code } => recover(&ctx, &formatter, &code).await,
            Commands::Reset { yes } => reset(&ctx, &formatter, yes).await,
            Commands::Enable(args) => enable(&ctx, &formatter, &args).await,
            Commands::Disable { conversation } => disable(&ctx, &formatter, &conversation).await,
            Commands::Status { conversation } => status(&ctx, &formatter, &conversation).await,
            Commands::Send { target, message } => send(&ctx, &formatter, &target, &message).await,
            Commands::Read { conversation } => read(&ctx, &formatter, &conversation).await,
            Commands::Backup(BackupCommands::Export { out }) => {
                export_backup(&ctx, &formatter, out.as_deref()).await?
            }
            Commands::Backup(BackupCommands::Import { file, code }) => {
                import_backup(&ctx, &formatter, &file, &code).await?
            }
        };

        // Session keys that could not be written during the command get one
        // more attempt before exit.
        if ctx.is_initialized().await {
            if let Err(e) = ctx.flush().await {
                formatter.warning(&format!("could not save session keys: {e}"));
            }
        }
        Ok(code)
    }
}

fn build_context(config: &Config, user: UserId) -> Result<E2eeContext, E2eeError> {
    let relay = HttpRelayClient::new(
        &config.relay.base_url,
        config.relay.api_token.clone(),
        config.relay.timeout(),
    )
    .map_err(E2eeError::Network)?;
    let path = config
        .storage_path()
        .ok_or_else(|| E2eeError::Config("no storage path configured and no data directory found".into()))?;
    debug!(store = %path.display(), relay = %config.relay.base_url, "building context");
    let store = FileStore::new(path);
    E2eeContext::new(user, Arc::new(relay), Arc::new(store), ContextOptions::from_config(config))
}

fn emit_error(formatter: &OutputFormatter, message: &str, code: ExitCode) {
    let text = formatter.format_error(message, code);
    if !text.is_empty() {
        eprintln!("{text}");
    }
}

fn fail(formatter: &OutputFormatter, err: &E2eeError) -> ExitCode {
    let code = ExitCode::from(err);
    emit_error(formatter, &err.to_string(), code);
    code
}

/// Loads the identity. A degraded init (identity usable but not saved or not
/// registered) only warns.
async fn ensure_ready(ctx: &E2eeContext, formatter: &OutputFormatter) -> Result<(), ExitCode> {
    formatter.progress("Loading identity");
    match ctx.init().await {
        Ok(()) => Ok(()),
        Err(e) if ctx.is_initialized().await => {
            formatter.warning(&format!("identity loaded with problems: {e}"));
            Ok(())
        }
        Err(e) => Err(fail(formatter, &e)),
    }
}

fn identity_output(user: &UserId, pk: &PublicKey, recovery_code: Option<String>) -> IdentityOutput {
    IdentityOutput {
        user_id: user.to_string(),
        fingerprint: pk.fingerprint(),
        public_key: pk.to_base64(),
        recovery_code,
    }
}

async fn show_identity(
    ctx: &E2eeContext,
    formatter: &OutputFormatter,
    recovery_code: Option<String>,
    command: &str,
) -> ExitCode {
    match ctx.public_key().await {
        Ok(pk) => {
            let info = identity_output(ctx.user_id(), &pk, recovery_code);
            formatter.emit(&formatter.format_identity(&info, command));
            ExitCode::Success
        }
        Err(e) => fail(formatter, &e),
    }
}

async fn init(ctx: &E2eeContext, formatter: &OutputFormatter) -> ExitCode {
    if let Err(code) = ensure_ready(ctx, formatter).await {
        return code;
    }
    let code = show_identity(ctx, formatter, ctx.recovery_code().await, "init").await;
    if code == ExitCode::Success {
        formatter.success("Identity ready. Keep the recovery code somewhere safe.");
    }
    code
}

async fn recovery_code(ctx: &E2eeContext, formatter: &OutputFormatter) -> ExitCode {
    if let Err(code) = ensure_ready(ctx, formatter).await {
        return code;
    }
    match ctx.recovery_code().await {
        Some(code) => show_identity(ctx, formatter, Some(code), "recovery-code").await,
        None => fail(formatter, &E2eeError::NotInitialized),
    }
}

async fn recover(ctx: &E2eeContext, formatter: &OutputFormatter, code: &str) -> ExitCode {
    formatter.progress("Recovering identity from backup");
    if let Err(e) = ctx.recover(code).await {
        return fail(formatter, &e);
    }
    formatter.success("Identity recovered");
    show_identity(ctx, formatter, None, "recover").await
}

async fn reset(ctx: &E2eeContext, formatter: &OutputFormatter, yes: bool) -> ExitCode {
    if !yes {
        emit_error(
            formatter,
            "reset deletes the identity and all session keys; rerun with --yes",
            ExitCode::InvalidInput,
        );
        return ExitCode::InvalidInput;
    }
    match ctx.reset().await {
        Ok(()) => {
            formatter.success("Identity and keys deleted");
            formatter.emit(&formatter.format_success(&serde_json::json!({ "reset": true }), "reset"));
            ExitCode::Success
        }
        Err(e) => fail(formatter, &e),
    }
}

async fn print_status(ctx: &E2eeContext, formatter: &OutputFormatter, conv: &ConversationId, command: &str) {
    let state = ctx.conversation_state(conv).await;
    let capability = ctx.can_toggle(conv).await;
    let status = StatusOutput::new(conv, &state, &capability);
    formatter.emit(&formatter.format_status(&status, command));
}

async fn enable(ctx: &E2eeContext, formatter: &OutputFormatter, args: &ConversationArgs) -> ExitCode {
    if let Err(code) = ensure_ready(ctx, formatter).await {
        return code;
    }
    let conv = ConversationId::new(args.conversation.as_str());
    let members = args.members_with(ctx.user_id());
    formatter.progress(&format!("Distributing session key to {} member(s)", members.len()));
    match ctx.enable_conversation(&conv, &members).await {
        Ok(state) => {
            if state.owner() == Some(ctx.user_id()) {
                formatter.success("Encryption enabled");
            } else {
                formatter.success("Encryption was already enabled");
            }
            print_status(ctx, formatter, &conv, "enable").await;
            ExitCode::Success
        }
        Err(e) => fail(formatter, &e),
    }
}

async fn disable(ctx: &E2eeContext, formatter: &OutputFormatter, conversation: &str) -> ExitCode {
    if let Err(code) = ensure_ready(ctx, formatter).await {
        return code;
    }
    let conv = ConversationId::new(conversation);
    match ctx.disable_conversation(&conv).await {
        Ok(_) => {
            formatter.success("Encryption disabled");
            print_status(ctx, formatter, &conv, "disable").await;
            ExitCode::Success
        }
        Err(e) => fail(formatter, &e),
    }
}

async fn status(ctx: &E2eeContext, formatter: &OutputFormatter, conversation: &str) -> ExitCode {
    if let Err(code) = ensure_ready(ctx, formatter).await {
        return code;
    }
    print_status(ctx, formatter, &ConversationId::new(conversation), "status").await;
    ExitCode::Success
}

async fn send(
    ctx: &E2eeContext,
    formatter: &OutputFormatter,
    target: &ConversationArgs,
    message: &str,
) -> ExitCode {
    if let Err(code) = ensure_ready(ctx, formatter).await {
        return code;
    }
    let conv = ConversationId::new(target.conversation.as_str());
    let members = target.members_with(ctx.user_id());
    match ctx.send_message(&conv, message, &members).await {
        Ok(Outgoing::Encrypted(_)) => {
            formatter.success("Encrypted message sent");
            formatter.emit(&formatter.format_success(&serde_json::json!({ "encrypted": true }), "send"));
            ExitCode::Success
        }
        Ok(Outgoing::Plain(_)) => {
            formatter.warning("conversation is not encrypted; message was not sent through the relay");
            formatter.emit(&formatter.format_success(&serde_json::json!({ "encrypted": false }), "send"));
            ExitCode::Success
        }
        Err(e) => fail(formatter, &e),
    }
}

async fn read(ctx: &E2eeContext, formatter: &OutputFormatter, conversation: &str) -> ExitCode {
    if let Err(code) = ensure_ready(ctx, formatter).await {
        return code;
    }
    match ctx.fetch_messages(&ConversationId::new(conversation)).await {
        Ok(messages) => {
            formatter.emit(&formatter.format_messages(&messages));
            ExitCode::Success
        }
        Err(e) => fail(formatter, &e),
    }
}

async fn export_backup(
    ctx: &E2eeContext,
    formatter: &OutputFormatter,
    out: Option<&std::path::Path>,
) -> anyhow::Result<ExitCode> {
    if let Err(code) = ensure_ready(ctx, formatter).await {
        return Ok(code);
    }
    let backup = match ctx.export_backup().await {
        Ok(b) => b,
        Err(e) => return Ok(fail(formatter, &e)),
    };
    let json = serde_json::to_string_pretty(&backup)?;
    match out {
        Some(path) => {
            tokio::fs::write(path, json.as_bytes())
                .await
                .with_context(|| format!("writing backup to {}", path.display()))?;
            formatter.success(&format!("Backup written to {}", path.display()));
            formatter.emit(&formatter.format_success(
                &serde_json::json!({ "path": path.display().to_string() }),
                "backup export",
            ));
        }
        None => match formatter.format() {
            OutputFormat::Json => formatter.emit(&formatter.format_success(&backup, "backup export")),
            OutputFormat::Table => println!("{json}"),
            OutputFormat::Quiet => {}
        },
    }
    Ok(ExitCode::Success)
}

async fn import_backup(
    ctx: &E2eeContext,
    formatter: &OutputFormatter,
    file: &std::path::Path,
    code: &str,
) -> anyhow::Result<ExitCode> {
    let raw = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("reading backup from {}", file.display()))?;
    let backup: KeyBackup = match serde_json::from_str(&raw) {
        Ok(b) => b,
        Err(e) => {
            emit_error(formatter, &format!("not a backup file: {e}"), ExitCode::InvalidInput);
            return Ok(ExitCode::InvalidInput);
        }
    };
    if let Err(e) = ctx.import_backup(&backup, code).await {
        return Ok(fail(formatter, &e));
    }
    formatter.success("Backup imported");
    Ok(show_identity(ctx, formatter, None, "backup import").await)
}
