// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Thin RPC client over an ethers provider.
//!
//! Everything the settlement pipeline needs from the chain goes through here:
//! bounded `eth_getLogs` queries for ERC20 Transfer events touching the
//! system wallet, transaction counts for nonce allocation, and
//! receipt/mempool lookups for stuck-withdrawal recovery.

use ethers::providers::{Http, JsonRpcClient, Middleware, Provider, ProviderError};
use ethers::types::{
    Address as EthAddress, BlockNumber, Bytes, Filter, Log, Transaction, TransactionReceipt, H256,
    U256,
};
use ethers::utils::keccak256;
use tap::TapFallible;

use crate::error::{SettlementError, SettlementResult};
use crate::types::{TokenConfig, TransferEvent};

/// `Transfer(address,address,uint256)`
pub fn transfer_event_topic() -> H256 {
    H256::from(keccak256("Transfer(address,address,uint256)"))
}

/// Which side of the Transfer must be the system wallet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WalletSide {
    Recipient,
    Sender,
}

pub struct ChainClient<P> {
    provider: Provider<P>,
    system_wallet: EthAddress,
    transfer_topic: H256,
}

impl ChainClient<Http> {
    pub fn connect(provider_url: &str, system_wallet: EthAddress) -> anyhow::Result<Self> {
        let provider = Provider::<Http>::try_from(provider_url)?;
        Ok(Self::new(provider, system_wallet))
    }
}

impl<P: JsonRpcClient> ChainClient<P> {
    pub fn new(provider: Provider<P>, system_wallet: EthAddress) -> Self {
        Self {
            provider,
            system_wallet,
            transfer_topic: transfer_event_topic(),
        }
    }

    pub fn system_wallet(&self) -> EthAddress {
        self.system_wallet
    }

    pub async fn latest_block(&self) -> SettlementResult<u64> {
        let block = self
            .provider
            .get_block_number()
            .await
            .map_err(rpc_err)
            .tap_err(|e| tracing::error!("get_block_number failed. Error {:?}", e))?;
        Ok(block.as_u64())
    }

    // Note: query may fail if range is too big. Callsite is responsible
    // for chunking the query.
    pub async fn incoming_transfers(
        &self,
        token: &TokenConfig,
        start_block: u64,
        end_block: u64,
    ) -> SettlementResult<Vec<TransferEvent>> {
        self.transfers_in_range(token, start_block, end_block, WalletSide::Recipient)
            .await
    }

    // Note: query may fail if range is too big. Callsite is responsible
    // for chunking the query.
    pub async fn outgoing_transfers(
        &self,
        token: &TokenConfig,
        start_block: u64,
        end_block: u64,
    ) -> SettlementResult<Vec<TransferEvent>> {
        self.transfers_in_range(token, start_block, end_block, WalletSide::Sender)
            .await
    }

    async fn transfers_in_range(
        &self,
        token: &TokenConfig,
        start_block: u64,
        end_block: u64,
        side: WalletSide,
    ) -> SettlementResult<Vec<TransferEvent>> {
        let wallet_topic = H256::from(self.system_wallet);
        let filter = Filter::new()
            .from_block(start_block)
            .to_block(end_block)
            .address(token.address)
            .topic0(self.transfer_topic);
        let filter = match side {
            WalletSide::Recipient => filter.topic2(wallet_topic),
            WalletSide::Sender => filter.topic1(wallet_topic),
        };

        let logs = self
            .provider
            .get_logs(&filter)
            .await
            .map_err(rpc_err)
            .tap_err(|e| {
                tracing::error!(
                    "transfers_in_range failed. Filter: {:?}. Error {:?}",
                    filter,
                    e
                )
            })?;

        // Safeguard check that all events are emitted from the requested contract address
        if logs.iter().any(|log| log.address != token.address) {
            return Err(SettlementError::Rpc(format!(
                "Provider returns logs from different contract address (expected: {:?})",
                token.address
            )));
        }

        // A single undecodable log must not sink the whole chunk.
        let mut events = Vec::with_capacity(logs.len());
        for log in logs {
            match parse_transfer_log(log, token) {
                Ok(event) => events.push(event),
                Err(e) => tracing::warn!("[ChainClient] Skipping malformed transfer log: {e}"),
            }
        }
        Ok(events)
    }

    /// Transaction count for `address`; `pending` counts mempool transactions
    /// as well, `latest` only mined ones.
    pub async fn transaction_count(
        &self,
        address: EthAddress,
        pending: bool,
    ) -> SettlementResult<u64> {
        let block = if pending {
            BlockNumber::Pending
        } else {
            BlockNumber::Latest
        };
        let count = self
            .provider
            .get_transaction_count(address, Some(block.into()))
            .await
            .map_err(rpc_err)
            .tap_err(|e| {
                tracing::error!(
                    "get_transaction_count failed for {:?} at {:?}. Error {:?}",
                    address,
                    block,
                    e
                )
            })?;
        Ok(count.as_u64())
    }

    /// `None` means the transaction has not been mined.
    pub async fn transaction_receipt(
        &self,
        tx_hash: H256,
    ) -> SettlementResult<Option<TransactionReceipt>> {
        self.provider
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(rpc_err)
            .tap_err(|e| tracing::error!("get_transaction_receipt failed. Error {:?}", e))
    }

    /// `Some` while the node still knows the transaction (mined or in the
    /// mempool); `None` once it has been dropped.
    pub async fn mempool_transaction(
        &self,
        tx_hash: H256,
    ) -> SettlementResult<Option<Transaction>> {
        self.provider
            .get_transaction(tx_hash)
            .await
            .map_err(rpc_err)
            .tap_err(|e| tracing::error!("get_transaction failed. Error {:?}", e))
    }

    /// Broadcast an already-signed transaction, returning its hash.
    pub async fn send_raw_transaction(&self, raw: Bytes) -> SettlementResult<H256> {
        let pending = self
            .provider
            .send_raw_transaction(raw)
            .await
            .map_err(rpc_err)
            .tap_err(|e| tracing::error!("send_raw_transaction failed. Error {:?}", e))?;
        Ok(pending.tx_hash())
    }

    pub async fn gas_price(&self) -> SettlementResult<U256> {
        self.provider
            .get_gas_price()
            .await
            .map_err(rpc_err)
            .tap_err(|e| tracing::error!("get_gas_price failed. Error {:?}", e))
    }
}

fn rpc_err(e: ProviderError) -> SettlementError {
    SettlementError::TransientRpc(e.to_string())
}

// Converts a raw `Log` into a `TransferEvent`, rejecting logs that are
// missing the fields a mined Transfer must carry.
fn parse_transfer_log(log: Log, token: &TokenConfig) -> SettlementResult<TransferEvent> {
    let block_number = log
        .block_number
        .ok_or(SettlementError::MalformedLog(
            "Provider returns log without block_number".into(),
        ))?
        .as_u64();
    let tx_hash = log.transaction_hash.ok_or(SettlementError::MalformedLog(
        "Provider returns log without transaction_hash".into(),
    ))?;
    if log.topics.len() != 3 {
        return Err(SettlementError::MalformedLog(format!(
            "Transfer log in tx {:?} has {} topics, expected 3",
            tx_hash,
            log.topics.len()
        )));
    }
    if log.data.len() > 32 {
        return Err(SettlementError::MalformedLog(format!(
            "Transfer log in tx {:?} has oversized data ({} bytes)",
            tx_hash,
            log.data.len()
        )));
    }

    Ok(TransferEvent {
        tx_hash,
        block_number,
        from: EthAddress::from(log.topics[1]),
        to: EthAddress::from(log.topics[2]),
        value: U256::from_big_endian(&log.data),
        token: token.token,
        token_address: token.address,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TokenType;
    use ethers::providers::MockProvider;
    use ethers::types::{Bytes, U64};

    fn token() -> TokenConfig {
        TokenConfig {
            token: TokenType::Usdt,
            address: EthAddress::repeat_byte(0x11),
            decimals: 18,
        }
    }

    fn transfer_log(from: EthAddress, to: EthAddress, value: U256) -> Log {
        let mut data = [0u8; 32];
        value.to_big_endian(&mut data);
        Log {
            address: token().address,
            topics: vec![transfer_event_topic(), H256::from(from), H256::from(to)],
            data: Bytes::from(data.to_vec()),
            block_number: Some(U64::from(777)),
            transaction_hash: Some(H256::repeat_byte(0x42)),
            ..Default::default()
        }
    }

    fn mocked_client() -> (ChainClient<MockProvider>, MockProvider) {
        let (provider, mock) = Provider::mocked();
        (
            ChainClient::new(provider, EthAddress::repeat_byte(0xaa)),
            mock,
        )
    }

    #[test]
    fn test_transfer_topic_is_canonical() {
        assert_eq!(
            format!("{:?}", transfer_event_topic()),
            "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"
        );
    }

    #[tokio::test]
    async fn test_incoming_transfers_decode() {
        let (client, mock) = mocked_client();
        let from = EthAddress::repeat_byte(0xbb);
        let to = client.system_wallet();
        let value = U256::from(1_000_000u64);

        mock.push::<Vec<Log>, _>(vec![transfer_log(from, to, value)])
            .unwrap();

        let events = client
            .incoming_transfers(&token(), 700, 800)
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].from, from);
        assert_eq!(events[0].to, to);
        assert_eq!(events[0].value, value);
        assert_eq!(events[0].block_number, 777);
        assert_eq!(events[0].token, TokenType::Usdt);
    }

    #[tokio::test]
    async fn test_rejects_logs_from_wrong_contract() {
        let (client, mock) = mocked_client();
        let mut log = transfer_log(
            EthAddress::repeat_byte(0xbb),
            client.system_wallet(),
            U256::one(),
        );
        log.address = EthAddress::repeat_byte(0x99);
        mock.push::<Vec<Log>, _>(vec![log]).unwrap();

        let err = client
            .incoming_transfers(&token(), 700, 800)
            .await
            .unwrap_err();
        assert_eq!(err.error_type(), "rpc");
    }

    #[tokio::test]
    async fn test_skips_unmined_log_keeps_rest() {
        let (client, mock) = mocked_client();
        let good = transfer_log(
            EthAddress::repeat_byte(0xbb),
            client.system_wallet(),
            U256::one(),
        );
        let mut bad = good.clone();
        bad.block_number = None;
        mock.push::<Vec<Log>, _>(vec![bad, good]).unwrap();

        let events = client
            .incoming_transfers(&token(), 700, 800)
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].block_number, 777);
    }

    #[tokio::test]
    async fn test_latest_block() {
        let (client, mock) = mocked_client();
        mock.push(U64::from(123_456)).unwrap();
        assert_eq!(client.latest_block().await.unwrap(), 123_456);
    }

    #[tokio::test]
    async fn test_transaction_counts() {
        let (client, mock) = mocked_client();
        mock.push(U256::from(17)).unwrap();
        let pending = client
            .transaction_count(client.system_wallet(), true)
            .await
            .unwrap();
        assert_eq!(pending, 17);
    }
}
