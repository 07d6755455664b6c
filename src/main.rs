use clap::Parser;
use data_encoding::HEXLOWER;
use log::{error, LevelFilter};
use minicoin::{
    convert_address, hash_pub_key, pub_key_hash_from_address, send_tx, validate_address,
    BlockchainError, Blockchain, Command, Config, Opt, ProofOfWork, Result, Server, Transaction,
    UTXOSet, Wallets,
};
use std::process;
use std::sync::Arc;

fn main() {
    env_logger::builder()
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .init();

    let opt = Opt::parse();

    if let Err(e) = run_command(opt.command) {
        error!("Error: {e}");
        process::exit(1);
    }
}

fn require_address(address: &str) -> Result<()> {
    if validate_address(address) {
        Ok(())
    } else {
        Err(BlockchainError::InvalidAddress(address.to_string()))
    }
}

fn run_command(command: Command) -> Result<()> {
    let config = Config::from_env()?;

    match command {
        Command::Createblockchain { address } => {
            require_address(&address)?;
            let blockchain = Blockchain::create_blockchain(&address, &config.ledger_path())?;
            let utxo_set = UTXOSet::new(blockchain);
            utxo_set.reindex()?;
            println!("Done!");
        }
        Command::Createwallet => {
            let mut wallets = Wallets::load_or_default(&config.wallet_path())?;
            let address = wallets.create_wallet()?;
            println!("Your new address: {address}")
        }
        Command::GetBalance { address } => {
            let pub_key_hash = pub_key_hash_from_address(&address)?;
            let blockchain = Blockchain::open(&config.ledger_path())?;
            let utxo_set = UTXOSet::new(blockchain);
            let balance = utxo_set.get_balance(&pub_key_hash)?;
            println!("Balance of {address}: {balance}");
        }
        Command::ListAddresses => {
            let wallets = Wallets::load_or_default(&config.wallet_path())?;
            for address in wallets.get_addresses() {
                println!("{address}")
            }
        }
        Command::Send {
            from,
            to,
            amount,
            mine,
        } => {
            require_address(&from)?;
            require_address(&to)?;
            if amount == 0 {
                return Err(BlockchainError::Transaction(
                    "Amount must be positive".to_string(),
                ));
            }

            let wallets = Wallets::load_from_file(&config.wallet_path())?;
            let wallet = wallets
                .get_wallet(&from)
                .ok_or_else(|| BlockchainError::WalletNotFound(from.clone()))?;

            let blockchain = Blockchain::open(&config.ledger_path())?;
            let utxo_set = UTXOSet::new(blockchain.clone());
            let transaction = Transaction::new_utxo_transaction(wallet, &to, amount, &utxo_set)?;

            if mine {
                let coinbase_tx = Transaction::new_coinbase_tx(&from, b"")?;
                let block = blockchain.mine_block(&[coinbase_tx, transaction])?;
                utxo_set.update(&block)?;
            } else {
                send_tx(config.bootstrap_addr(), &config.node_addr(), &transaction)?;
            }
            println!("Success!")
        }
        Command::Printchain => {
            let blockchain = Blockchain::open(&config.ledger_path())?;
            for block in blockchain.iter() {
                let block = block?;
                println!("============ Block {} ============", block.get_hash_hex());
                println!("Height: {}", block.get_height());
                println!(
                    "Prev. block: {}",
                    HEXLOWER.encode(block.get_prev_block_hash())
                );
                println!("Timestamp: {}", block.get_timestamp());
                println!("PoW: {}", ProofOfWork::validate(&block));

                for tx in block.get_transactions() {
                    println!("- Transaction {}", HEXLOWER.encode(tx.get_id()));
                    if !tx.is_coinbase() {
                        for input in tx.get_vin() {
                            let pub_key_hash = hash_pub_key(input.get_pub_key());
                            println!(
                                "-- Input txid = {}, vout = {}, from = {}",
                                HEXLOWER.encode(input.get_txid()),
                                input.get_vout(),
                                convert_address(&pub_key_hash),
                            )
                        }
                    }
                    for output in tx.get_vout() {
                        println!(
                            "-- Output value = {}, to = {}",
                            output.get_value(),
                            convert_address(output.get_pub_key_hash()),
                        )
                    }
                }
                println!()
            }
        }
        Command::Reindexutxo => {
            let blockchain = Blockchain::open(&config.ledger_path())?;
            let utxo_set = UTXOSet::new(blockchain);
            utxo_set.reindex()?;
            let count = utxo_set.count_transactions()?;
            println!("Done! There are {count} transactions in the UTXO set.");
        }
        Command::StartNode { miner } => {
            if let Some(addr) = &miner {
                require_address(addr)?;
                println!("Mining is on. Address to receive rewards: {addr}");
            }

            let blockchain = Blockchain::open(&config.ledger_path())?;
            println!("Starting node {}", config.node_addr());
            let server = Arc::new(Server::new(config.server_config(miner), blockchain));
            server.run()?;
        }
    }
    Ok(())
}
