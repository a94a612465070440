//! Command dispatch
//!
//! The transport layer hands over one decrypted JSON command and gets back an
//! `ApiResponse` JSON string. Commands are tagged by `"command"`:
//!
//! ```json
//! {"command": "get-wallet-info", "wallet": "savings"}
//! ```

use secrecy::SecretString;
use serde::Deserialize;
use serde_json::Value;
use zeroize::Zeroize;

use crate::error::{WalletError, WalletResult};
use crate::log_debug;
use crate::service::WalletManager;
use crate::types::{ApiResponse, SendRequest};
use crate::wallet::ReceiveAddressRequest;

#[derive(Deserialize)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum Command {
    CreateWallet {
        wallet: String,
        passphrase: String,
        #[serde(default)]
        mnemonic: Option<String>,
    },
    LoadWallet {
        wallet: String,
    },
    GetWalletInfo {
        wallet: String,
    },
    GetHistory {
        wallet: String,
    },
    GetUnusedReceiveAddress {
        wallet: String,
        #[serde(default)]
        passphrase: Option<String>,
    },
    CreateReceiveAddress {
        wallet: String,
        passphrase: String,
        request: ReceiveAddressRequest,
    },
    EstimateFee {
        wallet: String,
        request: SendRequest,
    },
    BuildTransaction {
        wallet: String,
        #[serde(default)]
        passphrase: Option<String>,
        request: SendRequest,
    },
    ImportKeys {
        wallet: String,
        passphrase: String,
        keys: Vec<String>,
    },
    ExportKeys {
        wallet: String,
        passphrase: String,
    },
    StartStaking {
        wallet: String,
        passphrase: String,
    },
    StopStaking {
        wallet: String,
    },
    Sync {
        wallet: String,
    },
    OnMempoolTransaction {
        wallet: String,
        raw_hex: String,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::CreateWallet { .. } => "create-wallet",
            Command::LoadWallet { .. } => "load-wallet",
            Command::GetWalletInfo { .. } => "get-wallet-info",
            Command::GetHistory { .. } => "get-history",
            Command::GetUnusedReceiveAddress { .. } => "get-unused-receive-address",
            Command::CreateReceiveAddress { .. } => "create-receive-address",
            Command::EstimateFee { .. } => "estimate-fee",
            Command::BuildTransaction { .. } => "build-transaction",
            Command::ImportKeys { .. } => "import-keys",
            Command::ExportKeys { .. } => "export-keys",
            Command::StartStaking { .. } => "start-staking",
            Command::StopStaking { .. } => "stop-staking",
            Command::Sync { .. } => "sync",
            Command::OnMempoolTransaction { .. } => "on-mempool-transaction",
        }
    }
}

/// Parse, run, and wrap the result; never fails
pub fn dispatch(manager: &WalletManager, json: &str) -> String {
    let command: Command = match serde_json::from_str(json) {
        Ok(command) => command,
        Err(e) => {
            return ApiResponse::<()>::err(WalletError::parse_error(format!("Invalid command: {}", e))).to_json();
        }
    };
    let name = command.name();
    match execute(manager, command) {
        Ok(data) => ApiResponse::ok(data).to_json(),
        Err(e) => {
            log_debug!("commands", "Command failed", command = name, error = e);
            ApiResponse::<()>::err(e).to_json()
        }
    }
}

pub fn execute(manager: &WalletManager, command: Command) -> WalletResult<Value> {
    match command {
        Command::CreateWallet {
            wallet,
            passphrase,
            mut mnemonic,
        } => {
            let created = manager.create_wallet(&wallet, &secret(passphrase), mnemonic.as_deref());
            if let Some(phrase) = mnemonic.as_mut() {
                phrase.zeroize();
            }
            to_value(&created?)
        }
        Command::LoadWallet { wallet } => to_value(&manager.load_wallet(&wallet)?.info()?),
        Command::GetWalletInfo { wallet } => to_value(&manager.wallet(&wallet)?.info()?),
        Command::GetHistory { wallet } => to_value(&manager.wallet(&wallet)?.history()?),
        Command::GetUnusedReceiveAddress { wallet, passphrase } => {
            let passphrase = passphrase.map(secret);
            to_value(&manager.wallet(&wallet)?.unused_receive_address(passphrase.as_ref())?)
        }
        Command::CreateReceiveAddress {
            wallet,
            passphrase,
            request,
        } => to_value(&manager.wallet(&wallet)?.create_receive_address(&secret(passphrase), &request)?),
        Command::EstimateFee { wallet, request } => to_value(&manager.wallet(&wallet)?.estimate_fee(&request)?),
        Command::BuildTransaction {
            wallet,
            passphrase,
            request,
        } => {
            let passphrase = passphrase.map(secret);
            to_value(&manager.wallet(&wallet)?.build_transaction(passphrase.as_ref(), &request)?)
        }
        Command::ImportKeys {
            wallet,
            passphrase,
            mut keys,
        } => {
            let imported = manager.wallet(&wallet)?.import_keys(&secret(passphrase), &keys);
            keys.zeroize();
            to_value(&imported?)
        }
        Command::ExportKeys { wallet, passphrase } => {
            to_value(&manager.wallet(&wallet)?.export_keys(&secret(passphrase))?)
        }
        Command::StartStaking { wallet, passphrase } => {
            to_value(&manager.wallet(&wallet)?.start_staking(&secret(passphrase))?)
        }
        Command::StopStaking { wallet } => to_value(&manager.wallet(&wallet)?.stop_staking()),
        Command::Sync { wallet } => to_value(&manager.wallet(&wallet)?.sync()?),
        Command::OnMempoolTransaction { wallet, raw_hex } => {
            to_value(&manager.wallet(&wallet)?.on_mempool_hex(&raw_hex)?)
        }
    }
}

fn secret(passphrase: String) -> SecretString {
    SecretString::from(passphrase)
}

fn to_value<T: serde::Serialize>(value: &T) -> WalletResult<Value> {
    Ok(serde_json::to_value(value)?)
}
