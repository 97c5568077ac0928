use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "powchain", about = "A minimal proof-of-work blockchain node")]
pub struct Opt {
    #[arg(
        long,
        global = true,
        default_value = "0",
        help = "Node id selecting the local database and wallet file"
    )]
    pub node: String,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    #[command(subcommand, about = "Create, inspect or reindex the local chain")]
    Chain(ChainCommand),
    #[command(about = "Get the balance of an address")]
    Balance {
        #[arg(help = "The wallet address")]
        address: String,
    },
    #[command(about = "Send coins between addresses")]
    Send {
        #[arg(help = "Source wallet address")]
        from: String,
        #[arg(help = "Destination wallet address")]
        to: String,
        #[arg(help = "Amount to send")]
        amount: i64,
        #[arg(long, help = "Mine the transaction locally instead of relaying it")]
        mine: bool,
    },
    #[command(subcommand, about = "Manage local wallets")]
    Wallet(WalletCommand),
    #[command(subcommand, about = "Run a network node")]
    Node(NodeCommand),
}

#[derive(Subcommand, Debug)]
pub enum ChainCommand {
    #[command(about = "Create the chain, paying the genesis reward to ADDRESS")]
    Init {
        #[arg(help = "Genesis reward address; a new wallet is created if omitted")]
        address: Option<String>,
    },
    #[command(about = "Print every block from the tip down to genesis")]
    Print,
    #[command(about = "Rebuild the UTXO index")]
    Reindex,
}

#[derive(Subcommand, Debug)]
pub enum WalletCommand {
    #[command(about = "Create a new wallet")]
    New,
    #[command(about = "Show a wallet's address and public key")]
    Get {
        address: String,
    },
    #[command(about = "List local wallet addresses")]
    List,
    #[command(about = "List unspent outputs locked to an address")]
    Utxos {
        address: String,
    },
    #[command(about = "Delete a local wallet")]
    Delete {
        address: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum NodeCommand {
    #[command(about = "Start a node listening on PORT")]
    Start {
        port: u16,
        #[arg(long, help = "Enable mining and send rewards to ADDRESS")]
        miner: Option<String>,
    },
}
