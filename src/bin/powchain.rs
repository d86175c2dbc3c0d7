#![forbid(unsafe_code)]
use clap::{Parser, Subcommand};
use colored::*;
use powchain::cli;
use powchain::config::load_config;
use std::io;
use std::path::PathBuf;
use tracing::Level;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to a config.toml (defaults to ./config.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Creates a new chain whose genesis reward goes to ADDRESS
    #[command(alias = "createBlockChain")]
    CreateBlockchain { address: String },
    /// Prints every block from the tail back to genesis
    #[command(alias = "printChain")]
    PrintChain,
    /// Shows the spendable balance of ADDRESS
    #[command(alias = "getBalance")]
    GetBalance {
        address: String,
        /// Answer from the UTXO index instead of a full rescan
        #[arg(long)]
        indexed: bool,
    },
    /// Sends AMOUNT from FROM to TO in a block mined by MINER with memo DATA
    Send {
        from: String,
        to: String,
        amount: f64,
        miner: String,
        data: String,
    },
    /// Generates a new key pair and prints its address
    #[command(alias = "createWallet")]
    CreateWallet,
    /// Lists every address in the key store
    #[command(alias = "listAddresses")]
    ListAddresses,
    /// Prints every transaction, block by block
    #[command(alias = "printTx")]
    PrintTx,
    /// Rebuilds the unspent-output index from the chain
    #[command(alias = "reindexUtxo")]
    ReindexUtxo,
    /// Audits proof of work, hashes and links of every block
    #[command(alias = "verifyChain")]
    VerifyChain,
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(cli.config.as_deref())?;
    let stdout = io::stdout();
    let mut out = stdout.lock();

    match cli.command {
        Commands::CreateBlockchain { address } => cli::create_blockchain(&config, &address, &mut out)?,
        Commands::PrintChain => cli::print_chain(&config, &mut out)?,
        Commands::GetBalance { address, indexed } => {
            cli::get_balance(&config, &address, indexed, &mut out)?;
        }
        Commands::Send {
            from,
            to,
            amount,
            miner,
            data,
        } => cli::send(&config, &from, &to, amount, &miner, &data, &mut out)?,
        Commands::CreateWallet => {
            cli::create_wallet(&config, &mut out)?;
        }
        Commands::ListAddresses => {
            cli::list_addresses(&config, &mut out)?;
        }
        Commands::PrintTx => cli::print_tx(&config, &mut out)?,
        Commands::ReindexUtxo => {
            cli::reindex_utxo(&config, &mut out)?;
        }
        Commands::VerifyChain => {
            cli::verify_chain(&config, &mut out)?;
        }
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(io::stderr)
        .init();

    if let Err(e) = run(cli) {
        eprintln!("{} {}", "Error:".bright_red().bold(), e);
        std::process::exit(1);
    }
}
