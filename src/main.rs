use clap::Parser;
use data_encoding::HEXLOWER;
use env_logger::Env;
use log::{error, info, warn};
use powchain::{
    convert_address, hash_pub_key, pub_key_hash_from_address, send_tx, validate_address,
    Blockchain, ChainCommand, Command, Config, NodeCommand, Opt, Server, WalletCommand, Wallets,
};
use std::fs;
use std::process;

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let opt = Opt::parse();

    if let Err(e) = run_command(&opt.node, opt.command) {
        error!("Error: {e}");
        process::exit(1);
    }
}

fn ensure_address(address: &str) -> Result<(), Box<dyn std::error::Error>> {
    if !validate_address(address) {
        return Err(format!("Invalid address: {address}").into());
    }
    Ok(())
}

fn run_command(node_id: &str, command: Command) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;
    fs::create_dir_all(&config.data_dir)?;
    let db_path = config.db_path(node_id);
    let wallet_file = config.wallet_file(node_id);

    match command {
        Command::Chain(ChainCommand::Init { address }) => {
            let address = match address {
                Some(address) => {
                    ensure_address(&address)?;
                    address
                }
                None => {
                    let address = Wallets::load(&wallet_file, &config.wallet_passphrase)?.create_wallet()?;
                    println!("Your new address: {address}");
                    address
                }
            };
            let blockchain = Blockchain::init_chain(&db_path, &address, config.chain_params())?;
            println!(
                "Done! Tip block {} at height {}",
                HEXLOWER.encode(&blockchain.get_tip_hash()),
                blockchain.get_best_height()?
            );
        }
        Command::Chain(ChainCommand::Print) => {
            let blockchain = Blockchain::open(&db_path, config.chain_params())?;
            for block in blockchain.iterator() {
                let block = block?;
                println!("Height: {}", block.get_height());
                println!("Pre block hash: {}", HEXLOWER.encode(block.get_prev_hash()));
                println!("Cur block hash: {}", block.get_hash_hex());
                println!("Cur block Timestamp: {}", block.get_timestamp());
                println!("Nonce: {}", block.get_nonce());

                for tx in block.get_transactions() {
                    println!("- Transaction txid_hex: {}", tx.get_id_hex());

                    if !tx.is_coinbase() {
                        for input in tx.get_vin() {
                            let from = input
                                .get_public_key()
                                .map(|key| convert_address(&hash_pub_key(key)))
                                .unwrap_or_default();
                            println!(
                                "-- Input txid = {}, vout = {}, from = {}",
                                HEXLOWER.encode(input.get_prev_txid()),
                                input.get_prev_output_index(),
                                from,
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
        Command::Chain(ChainCommand::Reindex) => {
            let blockchain = Blockchain::open(&db_path, config.chain_params())?;
            let utxo_set = blockchain.utxo_set();
            utxo_set.reindex()?;
            let count = utxo_set.count_transactions()?;
            println!("Done! There are {count} transactions in the UTXO set.");
        }
        Command::Balance { address } => {
            ensure_address(&address)?;
            let blockchain = Blockchain::open(&db_path, config.chain_params())?;
            let balance = blockchain.get_balance(&address)?;
            println!("Balance of {address}: {balance}");
        }
        Command::Send {
            from,
            to,
            amount,
            mine,
        } => {
            ensure_address(&from)?;
            ensure_address(&to)?;
            let blockchain = Blockchain::open(&db_path, config.chain_params())?;
            let wallets = Wallets::load(&wallet_file, &config.wallet_passphrase)?;

            if mine {
                let block = blockchain.send(&from, &to, amount, &wallets)?;
                println!("Mined block {} at height {}", block.get_hash_hex(), block.get_height());
            } else {
                let mut tx = blockchain.build_transaction(&from, &to, amount, &wallets)?;
                let wallet = wallets
                    .get_wallet(&from)
                    .ok_or_else(|| format!("No wallet for {from}"))?;
                blockchain.sign_transaction(wallet, &mut tx)?;

                let root = config.root_node().ok_or("No seed node configured")?;
                let addr_from = format!("{}:{node_id}", config.node_host);
                send_tx(root, &addr_from, &tx, config.connect_timeout())?;
                println!("Sent transaction {} to {root}", tx.get_id_hex());
            }
        }
        Command::Wallet(WalletCommand::New) => {
            let address = Wallets::load(&wallet_file, &config.wallet_passphrase)?.create_wallet()?;
            println!("Your new address: {address}");
        }
        Command::Wallet(WalletCommand::Get { address }) => {
            let wallets = Wallets::load(&wallet_file, &config.wallet_passphrase)?;
            let wallet = wallets
                .get_wallet(&address)
                .ok_or_else(|| format!("No wallet for {address}"))?;
            println!("Address: {}", wallet.get_address());
            println!("Public key: {}", HEXLOWER.encode(wallet.get_public_key()));
            println!("Public key hash: {}", HEXLOWER.encode(&wallet.get_pub_key_hash()));
        }
        Command::Wallet(WalletCommand::List) => {
            let wallets = Wallets::load(&wallet_file, &config.wallet_passphrase)?;
            for address in wallets.get_addresses() {
                println!("{address}")
            }
        }
        Command::Wallet(WalletCommand::Utxos { address }) => {
            let pub_key_hash = pub_key_hash_from_address(&address)?;
            let blockchain = Blockchain::open(&db_path, config.chain_params())?;
            for (txid, unspent) in blockchain.utxo_set().find_unspent_outputs(&pub_key_hash)? {
                println!(
                    "txid = {txid}, index = {}, value = {}",
                    unspent.get_index(),
                    unspent.get_output().get_value()
                );
            }
        }
        Command::Wallet(WalletCommand::Delete { address }) => {
            let mut wallets = Wallets::load(&wallet_file, &config.wallet_passphrase)?;
            if wallets.delete_wallet(&address)? {
                println!("Deleted {address}");
            } else {
                return Err(format!("No wallet for {address}").into());
            }
        }
        Command::Node(NodeCommand::Start { port, miner }) => {
            if let Some(addr) = &miner {
                ensure_address(addr)?;
                info!("Mining is on. Address to receive rewards: {addr}");
            }

            let blockchain = match Blockchain::open(&db_path, config.chain_params()) {
                Ok(blockchain) => blockchain,
                Err(e) => {
                    warn!("{e} Initializing a new chain for node {node_id}");
                    let address = Wallets::load(&wallet_file, &config.wallet_passphrase)?.create_wallet()?;
                    println!("Genesis reward goes to new address: {address}");
                    Blockchain::init_chain(&db_path, &address, config.chain_params())?
                }
            };

            let server = Server::new(blockchain, config.server_config(port, miner));
            server.run()?
        }
    }
    Ok(())
}
