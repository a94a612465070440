//! Offline wallet tool
//!
//! Works directly on the wallet and metadata files in a data directory; no
//! node connection. Every command prints one `ApiResponse` JSON document.

use clap::{Parser, Subcommand};
use secrecy::SecretString;
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;

use stakewallet::ledger::MetadataFile;
use stakewallet::service::history_entries;
use stakewallet::utils::logging::init_logging;
use stakewallet::wallet::AddressRef;
use stakewallet::{
    compute_balance, AddressKind, ApiResponse, BalanceFilter, ChainParams, CreatedWallet, WalletError, WalletFile,
    WalletResult, WalletSettings,
};

#[derive(Parser)]
#[command(name = "stakewallet", version, about = "Offline tool for stakewallet wallet files")]
struct Cli {
    /// Network: main, test or regtest
    #[arg(long, default_value = "main", global = true)]
    network: String,

    /// Directory holding wallet and metadata files
    #[arg(long, default_value = ".", global = true)]
    datadir: PathBuf,

    /// Wallet passphrase
    #[arg(long, env = "STAKEWALLET_PASSPHRASE", hide_env_values = true, global = true)]
    passphrase: Option<String>,

    /// Log filter (EnvFilter syntax)
    #[arg(long, default_value = "warn", global = true)]
    log: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a wallet and print its mnemonic once
    Create {
        #[arg(long)]
        wallet: String,
        /// Restore from this mnemonic instead of generating one
        #[arg(long, env = "STAKEWALLET_MNEMONIC", hide_env_values = true)]
        mnemonic: Option<String>,
    },
    /// List every address of a wallet
    Addresses {
        #[arg(long)]
        wallet: String,
    },
    /// Balance as of the last sync
    Balance {
        #[arg(long)]
        wallet: String,
        #[arg(long)]
        address: Option<String>,
    },
    /// Wallet transactions, newest first
    History {
        #[arg(long)]
        wallet: String,
    },
}

#[derive(Serialize)]
struct AddressRow {
    address: String,
    kind: AddressKind,
    label: Option<String>,
    path: Option<String>,
    used: Option<bool>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli.log);

    let (json, ok) = match run(&cli) {
        Ok(json) => (json, true),
        Err(e) => (ApiResponse::<()>::err(e).to_json(), false),
    };
    println!("{}", json);
    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn run(cli: &Cli) -> WalletResult<String> {
    let params = ChainParams::for_network(&cli.network)?;
    let settings = WalletSettings::default();

    match &cli.command {
        Commands::Create { wallet, mnemonic } => {
            let passphrase = cli
                .passphrase
                .clone()
                .map(SecretString::from)
                .ok_or_else(|| WalletError::invalid_input("Set STAKEWALLET_PASSPHRASE or pass --passphrase"))?;
            if WalletFile::exists(&cli.datadir, &params, wallet) {
                return Err(WalletError::wallet_exists(wallet));
            }
            std::fs::create_dir_all(&cli.datadir)?;
            let (file, phrase) = WalletFile::create(&params, &settings, wallet, &passphrase, mnemonic.as_deref())?;
            let receive_address = file
                .unused_receive_address()
                .map(|a| a.address.clone())
                .unwrap_or_default();
            file.save(&cli.datadir, &params)?;
            MetadataFile::new(&file).save(&cli.datadir, &params)?;
            let created = CreatedWallet {
                wallet_name: file.wallet_name.clone(),
                wallet_id: file.wallet_id.clone(),
                mnemonic: phrase.to_string(),
                receive_address,
            };
            Ok(ApiResponse::ok(&created).to_json())
        }
        Commands::Addresses { wallet } => {
            let file = WalletFile::load(&cli.datadir, &params, wallet)?;
            let rows: Vec<AddressRow> = file
                .addresses()
                .map(|a| AddressRow {
                    address: a.address().to_string(),
                    kind: a.kind(),
                    label: a.label().map(str::to_string),
                    path: a.spending_key().path_string(),
                    used: match a {
                        AddressRef::PubKeyHash(record) => Some(record.is_used()),
                        _ => None,
                    },
                })
                .collect();
            Ok(ApiResponse::ok(rows).to_json())
        }
        Commands::Balance { wallet, address } => {
            let file = WalletFile::load(&cli.datadir, &params, wallet)?;
            let metadata = MetadataFile::load_or_new(&cli.datadir, &params, &file)?;
            let filter = BalanceFilter {
                address: address.clone(),
                kind: None,
            };
            let balance = compute_balance(&params, &file, &metadata, metadata.sync_height, &filter)?;
            Ok(ApiResponse::ok(balance).to_json())
        }
        Commands::History { wallet } => {
            let file = WalletFile::load(&cli.datadir, &params, wallet)?;
            let metadata = MetadataFile::load_or_new(&cli.datadir, &params, &file)?;
            Ok(ApiResponse::ok(history_entries(&metadata)).to_json())
        }
    }
}
