//! Command handlers behind the `powchain` binary.
//!
//! Each handler validates its address arguments, performs one ledger
//! operation and writes a human-readable report to `out`.

use crate::address;
use crate::blockchain::BlockChain;
use crate::config::Config;
use crate::error::ChainError;
use crate::pow::ProofOfWork;
use crate::transaction::{new_transfer, Transaction};
use crate::wallet::{KeyStore, Wallets};
use colored::*;
use std::io::Write;

fn require_address(role: &str, addr: &str) -> Result<(), ChainError> {
    address::decode(addr)
        .map(|_| ())
        .map_err(|e| ChainError::InvalidAddress(format!("{} {}", role, e)))
}

/// Opens the chain configured in `config`.
pub fn load_blockchain(config: &Config) -> Result<BlockChain, ChainError> {
    let chain = BlockChain::open_at(&config.database.path, config.mining.difficulty_bits)?;
    Ok(chain.with_mining_threads(config.mining.threads))
}

pub fn load_wallets(config: &Config) -> Result<Wallets, ChainError> {
    Wallets::load(&config.wallet.path)
}

fn format_timestamp(secs: u64) -> String {
    i64::try_from(secs)
        .ok()
        .and_then(|s| chrono::DateTime::from_timestamp(s, 0))
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| secs.to_string())
}

pub fn create_blockchain(config: &Config, addr: &str, out: &mut dyn Write) -> Result<(), ChainError> {
    require_address("miner", addr)?;
    let chain = BlockChain::create_at(&config.database.path, addr, config.mining.difficulty_bits)?;
    writeln!(
        out,
        "{} genesis block {}",
        "Created blockchain,".bright_green(),
        hex::encode(chain.tail()).bright_white()
    )?;
    Ok(())
}

pub fn print_chain(config: &Config, out: &mut dyn Write) -> Result<(), ChainError> {
    let chain = load_blockchain(config)?;
    for block in chain.iter() {
        let block = block?;
        writeln!(out, "{}", "========================= BLOCK =========================".bright_cyan())?;
        writeln!(out, "Version:       {}", block.version)?;
        writeln!(out, "PrevHash:      {}", hex::encode(&block.prev_hash))?;
        writeln!(out, "MerkleRoot:    {}", hex::encode(block.merkle_root))?;
        writeln!(out, "Timestamp:     {}", format_timestamp(block.timestamp))?;
        writeln!(out, "Difficulty:    {}", block.difficulty_bits)?;
        writeln!(out, "Nonce:         {}", block.nonce)?;
        if let Some(memo) = block.transactions.first().and_then(Transaction::coinbase_memo) {
            writeln!(out, "Data:          {}", memo)?;
        }
        writeln!(out, "Hash:          {}", block.hash_str().bright_white())?;
        let valid = ProofOfWork::new(&block).verify();
        let verdict = if valid { "true".green() } else { "false".red() };
        writeln!(out, "PoW valid:     {}", verdict)?;
    }
    writeln!(out, "{}", "Reached the genesis block.".bright_green())?;
    Ok(())
}

pub fn get_balance(
    config: &Config,
    addr: &str,
    indexed: bool,
    out: &mut dyn Write,
) -> Result<f64, ChainError> {
    require_address("address", addr)?;
    let chain = load_blockchain(config)?;
    let balance = if indexed {
        chain.get_balance_indexed(addr)?
    } else {
        chain.get_balance(addr)?
    };
    writeln!(
        out,
        "Balance of {}: {}",
        addr.bright_white(),
        format!("{}", balance).bright_green()
    )?;
    Ok(balance)
}

/// Mines one block holding a reward for `miner` (memo `data`) and, when it
/// can be built, a transfer of `amount` from `from` to `to`.
pub fn send(
    config: &Config,
    from: &str,
    to: &str,
    amount: f64,
    miner: &str,
    data: &str,
    out: &mut dyn Write,
) -> Result<(), ChainError> {
    require_address("from", from)?;
    require_address("to", to)?;
    require_address("miner", miner)?;

    let mut chain = load_blockchain(config)?;
    let wallets = load_wallets(config)?;

    let mut txs = vec![Transaction::new_coinbase(miner, data)?];
    match new_transfer(from, to, amount, &wallets, &chain) {
        Ok(tx) => txs.push(tx),
        Err(e) => {
            tracing::warn!("Transfer not created: {}", e);
            writeln!(out, "{} {}", "Transfer skipped:".yellow(), e)?;
        }
    }

    let outcome = chain.add_block(txs)?;
    for (tx, reason) in &outcome.rejected {
        writeln!(out, "{} {}: {}", "Dropped".yellow(), tx.id_str(), reason)?;
    }
    writeln!(
        out,
        "{} block {} with {} transactions",
        "Mined".bright_green(),
        outcome.block.hash_str().bright_white(),
        outcome.block.transactions.len()
    )?;
    Ok(())
}

pub fn create_wallet(config: &Config, out: &mut dyn Write) -> Result<String, ChainError> {
    let wallets = load_wallets(config)?;
    let addr = wallets.create_wallet()?;
    writeln!(out, "{} {}", "New address:".bright_green(), addr.bright_white())?;
    Ok(addr)
}

pub fn list_addresses(config: &Config, out: &mut dyn Write) -> Result<Vec<String>, ChainError> {
    let wallets = load_wallets(config)?;
    let addresses = wallets.list_addresses();
    if addresses.is_empty() {
        writeln!(out, "{}", "No wallets yet.".yellow())?;
    }
    for addr in &addresses {
        writeln!(out, "  {}", addr)?;
    }
    Ok(addresses)
}

pub fn print_tx(config: &Config, out: &mut dyn Write) -> Result<(), ChainError> {
    let chain = load_blockchain(config)?;
    for block in chain.iter() {
        let block = block?;
        writeln!(
            out,
            "{} {}",
            "========================= BLOCK".bright_cyan(),
            block.hash_str().bright_cyan()
        )?;
        for tx in &block.transactions {
            writeln!(out, "{}", tx)?;
        }
    }
    Ok(())
}

pub fn reindex_utxo(config: &Config, out: &mut dyn Write) -> Result<usize, ChainError> {
    let chain = load_blockchain(config)?;
    let count = chain.reindex_utxo()?;
    writeln!(
        out,
        "{} {} unspent outputs indexed",
        "Done:".bright_green(),
        count
    )?;
    Ok(count)
}

pub fn verify_chain(config: &Config, out: &mut dyn Write) -> Result<usize, ChainError> {
    let chain = load_blockchain(config)?;
    let count = chain.verify_chain()?;
    writeln!(out, "{} {} blocks verified", "OK:".bright_green(), count)?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.database.path = dir.path().join("chain.db");
        config.wallet.path = dir.path().join("wallet.json");
        config.mining.difficulty_bits = 8;
        config
    }

    fn output(buf: Vec<u8>) -> String {
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn test_full_session() {
        colored::control::set_override(false);
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let mut out = Vec::new();

        let miner = create_wallet(&config, &mut out).unwrap();
        let friend = create_wallet(&config, &mut out).unwrap();
        assert_eq!(list_addresses(&config, &mut out).unwrap().len(), 2);

        create_blockchain(&config, &miner, &mut out).unwrap();
        assert!(matches!(
            create_blockchain(&config, &miner, &mut out),
            Err(ChainError::AlreadyExists(_))
        ));

        send(&config, &miner, &friend, 2.5, &miner, "first send", &mut out).unwrap();
        assert_eq!(get_balance(&config, &miner, false, &mut out).unwrap(), 22.5);
        assert_eq!(get_balance(&config, &friend, true, &mut out).unwrap(), 2.5);

        assert_eq!(verify_chain(&config, &mut out).unwrap(), 2);
        assert_eq!(reindex_utxo(&config, &mut out).unwrap(), 3);

        let mut chain_out = Vec::new();
        print_chain(&config, &mut chain_out).unwrap();
        let text = output(chain_out);
        assert!(text.contains("Data:          first send"));
        assert!(text.contains("PoW valid:     true"));

        let mut tx_out = Vec::new();
        print_tx(&config, &mut tx_out).unwrap();
        assert_eq!(output(tx_out).matches("--- Transaction").count(), 3);
    }

    #[test]
    fn test_send_without_funds_still_mines_reward() {
        colored::control::set_override(false);
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let mut out = Vec::new();

        let miner = create_wallet(&config, &mut out).unwrap();
        let broke = create_wallet(&config, &mut out).unwrap();
        create_blockchain(&config, &miner, &mut out).unwrap();

        let mut send_out = Vec::new();
        send(&config, &broke, &miner, 1.0, &broke, "reward only", &mut send_out).unwrap();
        assert!(output(send_out).contains("Transfer skipped:"));
        assert_eq!(get_balance(&config, &broke, false, &mut out).unwrap(), 12.5);
    }

    #[test]
    fn test_invalid_addresses_rejected() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let mut out = Vec::new();

        assert!(matches!(
            create_blockchain(&config, "nonsense", &mut out),
            Err(ChainError::InvalidAddress(_))
        ));
        assert!(!config.database.path.exists());
        assert!(matches!(
            get_balance(&config, "nonsense", false, &mut out),
            Err(ChainError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_commands_need_a_chain() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let mut out = Vec::new();
        assert!(matches!(
            print_chain(&config, &mut out),
            Err(ChainError::NotFound(_))
        ));
    }

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp(0), "1970-01-01 00:00:00");
        assert_eq!(format_timestamp(u64::MAX), u64::MAX.to_string());
    }
}
