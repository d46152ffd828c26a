use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{Value, json};
use storekeeper::backend::{BackendError, StorageBackend};
use storekeeper::config::StoreConfig;
use storekeeper::services::backup::BackupRecord;
use storekeeper::services::delete::DeleteOptions;
use storekeeper::services::integrity::Verification;
use storekeeper::services::loader::LoadOptions;
use storekeeper::services::oplog;
use storekeeper::services::read::ReadOptions;
use storekeeper::services::save::SaveOptions;
use storekeeper::{ErrorCode, Failure, Storage, StorageError};
use tracing::Level;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("invalid JSON argument: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

impl ErrorCode for CliError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Storage(e) => e.error_code(),
            Self::Backend(e) => e.error_code(),
            Self::InvalidJson(_) => "E_INVALID_ARGUMENT",
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::Storage(e) => e.retryable(),
            Self::Backend(e) => e.retryable(),
            Self::InvalidJson(_) => false,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "storekeeper", about = "Local key-value store with integrity checks")]
struct Cli {
    /// JSON file holding the store.
    #[arg(long, env = "STOREKEEPER_STORE", default_value = "storekeeper.json")]
    store: PathBuf,

    /// Log lifecycle events to stderr, not just warnings.
    #[arg(long, short, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Save a JSON value under a key.
    Save {
        key: String,
        /// The value, as JSON text.
        data: String,
        #[arg(long, default_value_t = false)]
        no_compress: bool,
        #[arg(long, default_value_t = false)]
        no_backup: bool,
    },
    Read {
        key: String,
        #[arg(long, default_value_t = false)]
        no_verify: bool,
    },
    Delete {
        key: String,
        /// Overwrite the value before removing it.
        #[arg(long, default_value_t = false)]
        secure: bool,
        #[arg(long, default_value_t = false)]
        no_backup: bool,
    },
    /// Load several keys at once; absent keys are left out.
    Load {
        #[arg(required = true)]
        keys: Vec<String>,
        #[arg(long, default_value_t = false)]
        no_verify: bool,
    },
    /// Check a stored value against its checksum.
    Verify { key: String },
    /// List keys, or summarize them with --stats.
    Keys {
        #[arg(long)]
        prefix: Option<String>,
        #[arg(long, default_value_t = false)]
        stats: bool,
    },
    /// Print one diagnostic log.
    Logs {
        #[arg(value_enum)]
        log: LogName,
    },
    /// List the backups of a key, oldest first.
    Backups { key: String },
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum LogName {
    Save,
    Read,
    Delete,
    Keys,
    Json,
    Corruption,
    Autosave,
    Loader,
}

impl LogName {
    fn log_key(self) -> &'static str {
        match self {
            Self::Save => oplog::SAVE_LOG,
            Self::Read => oplog::READ_LOG,
            Self::Delete => oplog::DELETE_LOG,
            Self::Keys => oplog::KEY_VALIDATION_LOG,
            Self::Json => oplog::JSON_VALIDATION_LOG,
            Self::Corruption => oplog::CORRUPTION_LOG,
            Self::Autosave => oplog::AUTOSAVE_LOG,
            Self::Loader => oplog::DATA_LOADER_LOG,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("warning: failed to load .env: {e}");
        }
    }
    let cli = Cli::parse();

    let level = if cli.verbose { Level::INFO } else { Level::WARN };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(level)
        .init();

    match run(cli).await {
        Ok(output) => {
            print_json(&output);
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::debug!(error = %e, code = e.error_code(), "command failed");
            print_json(&json!(Failure::from_error(&e)));
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<Value, CliError> {
    let storage = Storage::open_file(&cli.store, StoreConfig::from_env()).await?;

    match cli.command {
        Command::Save { key, data, no_compress, no_backup } => {
            let value = serde_json::from_str::<Value>(&data)?;
            let opts = SaveOptions { compress: !no_compress, create_backup: !no_backup, ..SaveOptions::default() };
            let receipt = storage.save_item_with(&key, &value, &opts).await?;
            Ok(json!({ "success": true, "receipt": receipt }))
        }
        Command::Read { key, no_verify } => {
            let opts = ReadOptions { verify_integrity: !no_verify, ..ReadOptions::default() };
            let result = storage.read_item_with(&key, &opts).await?;
            Ok(json!({ "success": true, "data": result.data, "timestamp": result.timestamp }))
        }
        Command::Delete { key, secure, no_backup } => {
            let opts = DeleteOptions { secure, create_backup: !no_backup, ..DeleteOptions::default() };
            let receipt = storage.delete_item_with(&key, &opts).await?;
            Ok(json!({ "success": true, "receipt": receipt }))
        }
        Command::Load { keys, no_verify } => {
            let opts = LoadOptions { validate: !no_verify, ..LoadOptions::default() };
            let data = storage.loader().load(&keys, &opts).await?;
            Ok(json!({ "success": true, "data": data }))
        }
        Command::Verify { key } => {
            let outcome = storage.verify(&key).await?;
            Ok(verification_json(&key, &outcome))
        }
        Command::Keys { prefix, stats } => {
            if stats {
                let stats = storage.keys().analyze_keys().await?;
                return Ok(json!({ "success": true, "stats": stats }));
            }
            let backend = &storage.context().backend;
            let mut keys = match prefix {
                Some(prefix) => backend.keys_with_prefix(&prefix).await?,
                None => backend.keys().await?,
            };
            keys.sort();
            Ok(json!({ "success": true, "keys": keys }))
        }
        Command::Logs { log } => {
            let entries = oplog::entries(storage.context(), log.log_key()).await?;
            Ok(json!({ "success": true, "log": log.log_key(), "entries": entries }))
        }
        Command::Backups { key } => {
            let mut records = Vec::new();
            for (timestamp, backup_key) in storage.backups().list(&key).await? {
                if let Some(raw) = storage.context().backend.get(&backup_key).await? {
                    let record = BackupRecord::decode(&key, timestamp, raw);
                    records.push(json!({ "key": backup_key, "record": record }));
                }
            }
            Ok(json!({ "success": true, "backups": records }))
        }
    }
}

fn verification_json(key: &str, outcome: &Verification) -> Value {
    match outcome {
        Verification::FirstWrite => json!({ "success": true, "key": key, "status": "first_write" }),
        Verification::Valid => json!({ "success": true, "key": key, "status": "valid" }),
        Verification::MetadataInvalid => json!({ "success": false, "key": key, "status": "metadata_invalid" }),
        Verification::Corrupted { quarantine_key, restored_from } => json!({
            "success": false,
            "key": key,
            "status": "corrupted",
            "quarantineKey": quarantine_key,
            "restoredFrom": restored_from,
        }),
    }
}

fn print_json(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(rendered) => println!("{rendered}"),
        Err(e) => eprintln!("failed to render output: {e}"),
    }
}
