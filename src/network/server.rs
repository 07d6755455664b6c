use crate::core::{Block, Blockchain, Transaction};
use crate::error::{BlockchainError, Result};
use crate::network::message::{
    AddrPayload, BlockPayload, GetBlocksPayload, GetDataPayload, InvPayload, OpType, Package,
    TxPayload, VersionPayload, COMMAND_LENGTH, NODE_VERSION,
};
use crate::network::Nodes;
use crate::storage::{BlockInTransit, MemoryPool, UTXOSet};
use crate::utils::MAX_DECODE_BYTES;
use data_encoding::HEXLOWER;
use log::{debug, error, info, warn};
use std::collections::HashSet;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

/// Pending transactions needed before a miner node builds a block
pub const MIN_MEMPOOL_BATCH: usize = 2;
const TCP_WRITE_TIMEOUT: u64 = 5000;
const DEFAULT_READ_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    node_addr: String,
    bootstrap_addr: String,
    miner_address: Option<String>,
    read_timeout: Duration,
}

impl ServerConfig {
    pub fn new(node_addr: &str, bootstrap_addr: &str) -> ServerConfig {
        ServerConfig {
            node_addr: node_addr.to_string(),
            bootstrap_addr: bootstrap_addr.to_string(),
            miner_address: None,
            read_timeout: Duration::from_secs(DEFAULT_READ_TIMEOUT_SECS),
        }
    }

    pub fn with_miner(mut self, miner_address: Option<String>) -> ServerConfig {
        self.miner_address = miner_address;
        self
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> ServerConfig {
        self.read_timeout = read_timeout;
        self
    }

    pub fn get_node_addr(&self) -> &str {
        self.node_addr.as_str()
    }

    pub fn get_bootstrap_addr(&self) -> &str {
        self.bootstrap_addr.as_str()
    }

    pub fn get_miner_address(&self) -> Option<&str> {
        self.miner_address.as_deref()
    }

    pub fn is_bootstrap(&self) -> bool {
        self.node_addr == self.bootstrap_addr
    }
}

/// Result of one mining round over the mempool
#[derive(Debug)]
pub enum MineOutcome {
    Mined(Block),
    NoValidTransactions,
}

/// Runtime state of one node. Every connection handler works on the same
/// instance through an `Arc`.
pub struct Server {
    config: ServerConfig,
    blockchain: Blockchain,
    nodes: Nodes,
    blocks_in_transit: BlockInTransit,
    mempool: MemoryPool,
    mining_lock: Mutex<()>,
}

impl Server {
    pub fn new(config: ServerConfig, blockchain: Blockchain) -> Server {
        let nodes = Nodes::new();
        nodes.add_node(config.bootstrap_addr.clone());
        Server {
            config,
            blockchain,
            nodes,
            blocks_in_transit: BlockInTransit::new(),
            mempool: MemoryPool::new(),
            mining_lock: Mutex::new(()),
        }
    }

    pub fn get_config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn get_blockchain(&self) -> &Blockchain {
        &self.blockchain
    }

    pub fn get_nodes(&self) -> &Nodes {
        &self.nodes
    }

    pub fn get_mempool(&self) -> &MemoryPool {
        &self.mempool
    }

    /// Binds the configured node address and serves until the listener fails
    pub fn run(self: Arc<Self>) -> Result<()> {
        let addr = self.config.node_addr.clone();
        let listener = TcpListener::bind(&addr)
            .map_err(|e| BlockchainError::Network(format!("Failed to bind to {addr}: {e}")))?;
        self.serve(listener)
    }

    /// Announces this node to the bootstrap node, then handles every inbound
    /// connection on its own thread
    pub fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!("Node {} listening", self.config.node_addr);

        if !self.config.is_bootstrap() {
            let best_height = self.blockchain.get_best_height()?;
            let bootstrap = self.config.bootstrap_addr.clone();
            self.send_version(&bootstrap, best_height)?;
        }

        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    let server = Arc::clone(&self);
                    thread::spawn(move || {
                        if let Err(e) = server.handle_connection(stream) {
                            error!("Dropping connection: {e}");
                        }
                    });
                }
                Err(e) => {
                    error!("Error accepting connection: {e}");
                }
            }
        }
        Ok(())
    }

    fn handle_connection(&self, mut stream: TcpStream) -> Result<()> {
        stream.set_read_timeout(Some(self.config.read_timeout))?;

        let max_len = COMMAND_LENGTH + MAX_DECODE_BYTES;
        let mut request = vec![];
        (&mut stream)
            .take(max_len as u64 + 1)
            .read_to_end(&mut request)?;
        if request.len() > max_len {
            return Err(BlockchainError::Protocol(format!(
                "Message exceeds {max_len} bytes"
            )));
        }
        let pkg = Package::from_bytes(&request)?;
        info!("Received {pkg}");

        match pkg {
            Package::Version(p) => self.handle_version(p),
            Package::GetBlocks(p) => self.handle_get_blocks(p),
            Package::Inv(p) => self.handle_inv(p),
            Package::GetData(p) => self.handle_get_data(p),
            Package::Block(p) => self.handle_block(p),
            Package::Tx(p) => self.handle_tx(p),
            Package::Addr(p) => self.handle_addr(p),
        }
    }

    fn handle_version(&self, payload: VersionPayload) -> Result<()> {
        let local_best_height = self.blockchain.get_best_height()?;
        if local_best_height < payload.best_height {
            self.send_get_blocks(&payload.addr_from)?;
        } else if local_best_height > payload.best_height {
            self.send_version(&payload.addr_from, local_best_height)?;
        }

        if self.nodes.add_node(payload.addr_from.clone()) {
            info!("Learned peer {}", payload.addr_from);
        }
        Ok(())
    }

    fn handle_get_blocks(&self, payload: GetBlocksPayload) -> Result<()> {
        let blocks = self.blockchain.get_block_hashes()?;
        self.send_inv(&payload.addr_from, OpType::Block, &blocks)
    }

    fn handle_inv(&self, payload: InvPayload) -> Result<()> {
        info!(
            "Received inventory with {} {:?} items",
            payload.items.len(),
            payload.op_type
        );
        match payload.op_type {
            OpType::Block => {
                // inventories list the tip first; download parents before children
                let oldest_first: Vec<Vec<u8>> = payload.items.iter().rev().cloned().collect();
                self.blocks_in_transit.replace(&oldest_first);
                if let Some(block_hash) = self.blocks_in_transit.pop_front() {
                    self.send_get_data(&payload.addr_from, OpType::Block, &block_hash)?;
                }
            }
            OpType::Tx => {
                if let Some(txid) = payload.items.first() {
                    if !self.mempool.contains(&HEXLOWER.encode(txid)) {
                        self.send_get_data(&payload.addr_from, OpType::Tx, txid)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn handle_get_data(&self, payload: GetDataPayload) -> Result<()> {
        match payload.op_type {
            OpType::Block => match self.blockchain.get_block(&payload.id)? {
                Some(block) => self.send_block(&payload.addr_from, &block)?,
                None => warn!("Requested block {} not found", HEXLOWER.encode(&payload.id)),
            },
            OpType::Tx => {
                let txid_hex = HEXLOWER.encode(&payload.id);
                match self.mempool.get(&txid_hex) {
                    Some(tx) => self.send_tx(&payload.addr_from, &tx)?,
                    None => warn!("Requested transaction {txid_hex} not in mempool"),
                }
            }
        }
        Ok(())
    }

    fn handle_block(&self, payload: BlockPayload) -> Result<()> {
        let block = Block::deserialize(&payload.block).map_err(|e| {
            BlockchainError::Protocol(format!("Failed to deserialize block: {e}"))
        })?;
        self.blockchain.add_block(&block)?;
        for tx in block.get_transactions() {
            self.mempool.remove(&HEXLOWER.encode(tx.get_id()));
        }

        if let Some(block_hash) = self.blocks_in_transit.pop_front() {
            self.send_get_data(&payload.addr_from, OpType::Block, &block_hash)?;
        } else {
            UTXOSet::new(self.blockchain.clone()).reindex()?;
            info!(
                "Synchronised to height {}",
                self.blockchain.get_best_height()?
            );
        }
        Ok(())
    }

    fn handle_tx(&self, payload: TxPayload) -> Result<()> {
        let tx = Transaction::deserialize(&payload.transaction).map_err(|e| {
            BlockchainError::Protocol(format!("Failed to deserialize transaction: {e}"))
        })?;
        let txid = tx.get_id().to_vec();
        if !self.mempool.add(tx) {
            debug!("Transaction {} already pending", HEXLOWER.encode(&txid));
        }

        if self.config.is_bootstrap() {
            for node in self.nodes.get_addrs() {
                if node != self.config.node_addr && node != payload.addr_from {
                    if let Err(e) = self.send_inv(&node, OpType::Tx, &[txid.clone()]) {
                        warn!("Failed to relay transaction to {node}: {e}");
                    }
                }
            }
        } else if self.mempool.len() >= MIN_MEMPOOL_BATCH && self.config.miner_address.is_some()
        {
            self.mine_pending()?;
        }
        Ok(())
    }

    fn handle_addr(&self, payload: AddrPayload) -> Result<()> {
        for addr in payload.addr_list {
            self.nodes.add_node(addr);
        }
        info!("There are {} known nodes", self.nodes.len());
        for node in self.nodes.get_addrs() {
            if node != self.config.node_addr {
                self.send_get_blocks(&node)?;
            }
        }
        Ok(())
    }

    /// Mines blocks until the mempool is empty or nothing left in it is valid.
    /// Only one batch runs at a time per node.
    pub fn mine_pending(&self) -> Result<()> {
        let Some(miner_address) = self.config.miner_address.as_deref() else {
            return Ok(());
        };
        let _guard = self
            .mining_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        // another handler may have mined this batch while we waited
        if self.mempool.len() < MIN_MEMPOOL_BATCH {
            return Ok(());
        }

        while !self.mempool.is_empty() {
            match self.mine_one(miner_address)? {
                MineOutcome::Mined(block) => {
                    for node in self.nodes.get_addrs() {
                        if node != self.config.node_addr {
                            let items = [block.get_hash().to_vec()];
                            if let Err(e) = self.send_inv(&node, OpType::Block, &items) {
                                warn!("Failed to announce block to {node}: {e}");
                            }
                        }
                    }
                }
                MineOutcome::NoValidTransactions => {
                    warn!(
                        "None of the {} pending transactions is valid, mining deferred",
                        self.mempool.len()
                    );
                    break;
                }
            }
        }
        Ok(())
    }

    /// Mines one block from the valid part of the mempool plus a reward to
    /// `miner_address`.
    ///
    /// Transactions spending outputs that are not in the UTXO index, or carrying
    /// a bad signature, can never be mined and are dropped from the mempool.
    /// Ones conflicting with a transaction already picked wait for a later round.
    pub fn mine_one(&self, miner_address: &str) -> Result<MineOutcome> {
        let utxo_set = UTXOSet::new(self.blockchain.clone());
        let mut spent: HashSet<(Vec<u8>, i64)> = HashSet::new();
        let mut txs = vec![];

        for tx in self.mempool.get_all() {
            let txid_hex = HEXLOWER.encode(tx.get_id());
            if !Self::inputs_unspent(&utxo_set, &tx)? {
                warn!("Dropping transaction {txid_hex}: inputs are not spendable");
                self.mempool.remove(&txid_hex);
                continue;
            }
            if !self.blockchain.verify_transaction(&tx)? {
                warn!("Dropping transaction {txid_hex}: verification failed");
                self.mempool.remove(&txid_hex);
                continue;
            }
            let inputs: Vec<(Vec<u8>, i64)> = tx
                .get_vin()
                .iter()
                .map(|vin| (vin.get_txid().to_vec(), vin.get_vout()))
                .collect();
            if inputs.iter().any(|input| spent.contains(input)) {
                debug!("Deferring transaction {txid_hex}: conflicts with the current batch");
                continue;
            }
            spent.extend(inputs);
            txs.push(tx);
        }

        if txs.is_empty() {
            return Ok(MineOutcome::NoValidTransactions);
        }

        let coinbase_tx = Transaction::new_coinbase_tx(miner_address, b"")?;
        txs.push(coinbase_tx);

        let new_block = self.blockchain.mine_block(&txs)?;
        utxo_set.reindex()?;
        info!("New block {} is mined!", new_block.get_hash_hex());

        for tx in &txs {
            self.mempool.remove(&HEXLOWER.encode(tx.get_id()));
        }
        Ok(MineOutcome::Mined(new_block))
    }

    /// Whether every input of `tx` spends an output still in the UTXO index.
    /// Coinbase transactions never qualify.
    fn inputs_unspent(utxo_set: &UTXOSet, tx: &Transaction) -> Result<bool> {
        if tx.is_coinbase() || tx.get_vin().is_empty() {
            return Ok(false);
        }
        for vin in tx.get_vin() {
            let Ok(index) = vin.output_index() else {
                return Ok(false);
            };
            if !utxo_set.contains_output(vin.get_txid(), index)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn send_version(&self, addr: &str, best_height: usize) -> Result<()> {
        self.send_data(
            addr,
            &Package::Version(VersionPayload {
                version: NODE_VERSION,
                best_height,
                addr_from: self.config.node_addr.clone(),
            }),
        )
    }

    fn send_get_blocks(&self, addr: &str) -> Result<()> {
        self.send_data(
            addr,
            &Package::GetBlocks(GetBlocksPayload {
                addr_from: self.config.node_addr.clone(),
            }),
        )
    }

    fn send_get_data(&self, addr: &str, op_type: OpType, id: &[u8]) -> Result<()> {
        self.send_data(
            addr,
            &Package::GetData(GetDataPayload {
                addr_from: self.config.node_addr.clone(),
                op_type,
                id: id.to_vec(),
            }),
        )
    }

    fn send_inv(&self, addr: &str, op_type: OpType, items: &[Vec<u8>]) -> Result<()> {
        self.send_data(
            addr,
            &Package::Inv(InvPayload {
                addr_from: self.config.node_addr.clone(),
                op_type,
                items: items.to_vec(),
            }),
        )
    }

    fn send_block(&self, addr: &str, block: &Block) -> Result<()> {
        self.send_data(
            addr,
            &Package::Block(BlockPayload {
                addr_from: self.config.node_addr.clone(),
                block: block.serialize()?,
            }),
        )
    }

    fn send_tx(&self, addr: &str, tx: &Transaction) -> Result<()> {
        self.send_data(
            addr,
            &Package::Tx(TxPayload {
                addr_from: self.config.node_addr.clone(),
                transaction: tx.serialize()?,
            }),
        )
    }

    /// Delivers `pkg`. A peer that cannot be reached is forgotten rather than
    /// treated as an error.
    fn send_data(&self, addr: &str, pkg: &Package) -> Result<()> {
        let stream = match connect(addr) {
            Ok(stream) => stream,
            Err(e) => {
                warn!("{addr} is not available, evicting it: {e}");
                self.nodes.evict_node(addr);
                return Ok(());
            }
        };
        debug!("Sending {} to {addr}", pkg.command());
        write_package(stream, pkg)
    }
}

fn connect(addr: &str) -> Result<TcpStream> {
    let socket_addr = addr
        .to_socket_addrs()
        .map_err(|e| BlockchainError::Network(format!("Invalid address {addr}: {e}")))?
        .next()
        .ok_or_else(|| BlockchainError::Network(format!("{addr} did not resolve")))?;
    TcpStream::connect_timeout(&socket_addr, Duration::from_millis(TCP_WRITE_TIMEOUT))
        .map_err(|e| BlockchainError::Network(format!("Failed to connect to {addr}: {e}")))
}

fn write_package(mut stream: TcpStream, pkg: &Package) -> Result<()> {
    stream.set_write_timeout(Some(Duration::from_millis(TCP_WRITE_TIMEOUT)))?;
    stream.write_all(&pkg.to_bytes()?)?;
    stream.flush()?;
    stream.shutdown(Shutdown::Write)?;
    Ok(())
}

/// Submits `tx` to the node at `addr` on behalf of `addr_from`
pub fn send_tx(addr: &str, addr_from: &str, tx: &Transaction) -> Result<()> {
    let stream = connect(addr)?;
    let pkg = Package::Tx(TxPayload {
        addr_from: addr_from.to_string(),
        transaction: tx.serialize()?,
    });
    write_package(stream, &pkg)?;
    info!("Sent transaction {} to {addr}", HEXLOWER.encode(tx.get_id()));
    Ok(())
}

/// Sends `addr` with `addr_list` to the node at `addr`
pub fn send_addr(addr: &str, addr_list: &[String]) -> Result<()> {
    let stream = connect(addr)?;
    write_package(
        stream,
        &Package::Addr(AddrPayload {
            addr_list: addr_list.to_vec(),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SUBSIDY;
    use crate::testnet::create_test_ledger;
    use crate::wallet::{hash_pub_key, Wallet};

    #[test]
    fn test_bootstrap_detection() {
        let config = ServerConfig::new("localhost:3000", "localhost:3000");
        assert!(config.is_bootstrap());
        assert!(config.get_miner_address().is_none());

        let config = ServerConfig::new("localhost:3001", "localhost:3000")
            .with_miner(Some("1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa".to_string()));
        assert!(!config.is_bootstrap());
        assert!(config.get_miner_address().is_some());
    }

    #[test]
    fn test_unreachable_peer_is_evicted() {
        let ledger = create_test_ledger().unwrap();

        // nothing listens on a port that was bound and released
        let closed = TcpListener::bind("127.0.0.1:0").unwrap();
        let closed_addr = closed.local_addr().unwrap().to_string();
        drop(closed);

        let server = Server::new(
            ServerConfig::new("127.0.0.1:1", &closed_addr),
            ledger.blockchain().clone(),
        );
        assert!(server.get_nodes().node_is_known(&closed_addr));
        server.send_get_blocks(&closed_addr).unwrap();
        assert!(!server.get_nodes().node_is_known(&closed_addr));
    }

    #[test]
    fn test_mine_one_skips_double_spend() {
        let ledger = create_test_ledger().unwrap();
        let recipient = Wallet::new().unwrap();
        let miner = Wallet::new().unwrap();

        // both spend the single genesis output
        let first = Transaction::new_utxo_transaction(
            &ledger.owner,
            &recipient.get_address(),
            3,
            &ledger.utxo_set,
        )
        .unwrap();
        let second = Transaction::new_utxo_transaction(
            &ledger.owner,
            &recipient.get_address(),
            5,
            &ledger.utxo_set,
        )
        .unwrap();

        let server = Server::new(
            ServerConfig::new("127.0.0.1:1", "127.0.0.1:1").with_miner(Some(miner.get_address())),
            ledger.blockchain().clone(),
        );
        server.get_mempool().add(first);
        server.get_mempool().add(second);

        let block = match server.mine_one(&miner.get_address()).unwrap() {
            MineOutcome::Mined(block) => block,
            MineOutcome::NoValidTransactions => panic!("expected a block"),
        };
        assert_eq!(block.get_transactions().len(), 2);
        assert!(block.get_transactions()[1].is_coinbase());
        assert_eq!(server.get_mempool().len(), 1);

        // the loser's input is gone now, so it leaves the mempool
        assert!(matches!(
            server.mine_one(&miner.get_address()).unwrap(),
            MineOutcome::NoValidTransactions
        ));
        assert!(server.get_mempool().is_empty());
        assert_eq!(
            ledger
                .utxo_set
                .get_balance(&hash_pub_key(miner.get_public_key()))
                .unwrap(),
            SUBSIDY
        );
    }

    #[test]
    fn test_mine_pending_waits_for_batch() {
        let ledger = create_test_ledger().unwrap();
        let recipient = Wallet::new().unwrap();
        let miner = Wallet::new().unwrap();
        let tx = Transaction::new_utxo_transaction(
            &ledger.owner,
            &recipient.get_address(),
            3,
            &ledger.utxo_set,
        )
        .unwrap();

        let server = Server::new(
            ServerConfig::new("127.0.0.1:1", "127.0.0.1:1").with_miner(Some(miner.get_address())),
            ledger.blockchain().clone(),
        );
        server.get_mempool().add(tx);
        server.mine_pending().unwrap();

        assert_eq!(server.get_mempool().len(), 1);
        assert_eq!(ledger.blockchain().get_best_height().unwrap(), 0);
    }

    #[test]
    fn test_received_block_clears_its_transactions_from_mempool() {
        let ledger = create_test_ledger().unwrap();
        let recipient = Wallet::new().unwrap();
        let tx = Transaction::new_utxo_transaction(
            &ledger.owner,
            &recipient.get_address(),
            3,
            &ledger.utxo_set,
        )
        .unwrap();

        let server = Server::new(
            ServerConfig::new("127.0.0.1:1", "127.0.0.1:1"),
            ledger.blockchain().clone(),
        );
        server.get_mempool().add(tx.clone());

        let block = ledger.blockchain().mine_block(&[tx]).unwrap();
        server
            .handle_block(BlockPayload {
                addr_from: "127.0.0.1:1".to_string(),
                block: block.serialize().unwrap(),
            })
            .unwrap();

        assert!(server.get_mempool().is_empty());
        assert_eq!(
            ledger
                .utxo_set
                .get_balance(&hash_pub_key(recipient.get_public_key()))
                .unwrap(),
            3
        );
    }
}
