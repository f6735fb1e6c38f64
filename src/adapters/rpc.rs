//! Minimal Ethereum JSON-RPC client for smart-contract challenges.
//!
//! An [`Account`] either lets the node sign (`eth_sendTransaction` with one of
//! its managed accounts, anvil/hardhat style) or holds a private key and signs
//! legacy EIP-155 transactions locally for `eth_sendRawTransaction`.

use crate::utils::error::{CtfError, Result};
use k256::ecdsa::SigningKey;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::AffinePoint;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::json;
use sha3::{Digest, Keccak256};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Address(pub [u8; 20]);

impl FromStr for Address {
    type Err = CtfError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |reason: &str| CtfError::InvalidConfigValueError {
            field: "address".to_string(),
            value: s.to_string(),
            reason: reason.to_string(),
        };
        let digits = s.trim().trim_start_matches("0x").trim_start_matches("0X");
        let bytes = hex::decode(digits).map_err(|_| invalid("not a hex string"))?;
        let bytes: [u8; 20] = bytes
            .try_into()
            .map_err(|_| invalid("address must be 20 bytes"))?;
        Ok(Address(bytes))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Static ABI values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Address(Address),
    Uint(u128),
    Bool(bool),
    Bytes32([u8; 32]),
}

impl Token {
    pub fn encode(&self) -> [u8; 32] {
        let mut word = [0u8; 32];
        match self {
            Token::Address(address) => word[12..].copy_from_slice(&address.0),
            Token::Uint(value) => word[16..].copy_from_slice(&value.to_be_bytes()),
            Token::Bool(value) => word[31] = u8::from(*value),
            Token::Bytes32(bytes) => word = *bytes,
        }
        word
    }
}

/// First four bytes of keccak256 of the canonical signature.
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = Keccak256::digest(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

pub fn encode_args(args: &[Token]) -> Vec<u8> {
    args.iter().flat_map(|token| token.encode()).collect()
}

pub fn encode_call(signature: &str, args: &[Token]) -> Vec<u8> {
    let mut data = selector(signature).to_vec();
    data.extend(encode_args(args));
    data
}

fn word_at(data: &[u8], index: usize) -> Result<&[u8]> {
    data.get(index * 32..(index + 1) * 32).ok_or_else(|| {
        CtfError::protocol(format!(
            "return data too short: {} bytes, wanted word {}",
            data.len(),
            index
        ))
    })
}

pub fn decode_uint(data: &[u8], index: usize) -> Result<u128> {
    let word = word_at(data, index)?;
    if word[..16].iter().any(|b| *b != 0) {
        return Err(CtfError::protocol("uint256 value does not fit in u128"));
    }
    let mut low = [0u8; 16];
    low.copy_from_slice(&word[16..]);
    Ok(u128::from_be_bytes(low))
}

pub fn decode_bool(data: &[u8], index: usize) -> Result<bool> {
    Ok(decode_uint(data, index)? != 0)
}

pub fn decode_address(data: &[u8], index: usize) -> Result<Address> {
    let word = word_at(data, index)?;
    let mut bytes = [0u8; 20];
    bytes.copy_from_slice(&word[12..]);
    Ok(Address(bytes))
}

pub fn to_hex(data: &[u8]) -> String {
    format!("0x{}", hex::encode(data))
}

pub fn from_hex(text: &str) -> Result<Vec<u8>> {
    let digits = text.trim().trim_start_matches("0x");
    hex::decode(digits).map_err(|e| CtfError::protocol(format!("invalid hex data: {}", e)))
}

pub fn to_quantity(value: u128) -> String {
    format!("{:#x}", value)
}

pub fn parse_quantity(text: &str) -> Result<u128> {
    let digits = text.trim().trim_start_matches("0x");
    if digits.is_empty() {
        return Ok(0);
    }
    u128::from_str_radix(digits, 16)
        .map_err(|_| CtfError::protocol(format!("invalid quantity: {:?}", text)))
}

/// Quantity that has to fit a `u64` (chain id, block number, nonce).
pub fn quantity_u64(text: &str) -> Result<u64> {
    u64::try_from(parse_quantity(text)?)
        .map_err(|_| CtfError::protocol(format!("quantity {} does not fit in u64", text)))
}

/// Decimal amount to base units, e.g. `parse_units("1.5", 18)`.

pub fn parse_units(amount: &str, decimals: u32) -> Result<u128> {
    let invalid = |reason: &str| CtfError::InvalidConfigValueError {
        field: "amount".to_string(),
        value: amount.to_string(),
        reason: reason.to_string(),
    };
    let amount = amount.trim();
    let (whole, fraction) = amount.split_once('.').unwrap_or((amount, ""));
    if whole.is_empty() && fraction.is_empty() {
        return Err(invalid("empty amount"));
    }
    if !whole.chars().chain(fraction.chars()).all(|c| c.is_ascii_digit()) {
        return Err(invalid("amount must be a decimal number"));
    }
    if fraction.len() > decimals as usize {
        return Err(invalid("too many decimal places"));
    }

    let scale = 10u128
        .checked_pow(decimals)
        .ok_or_else(|| invalid("too many decimals"))?;
    let whole: u128 = if whole.is_empty() {
        0
    } else {
        whole.parse().map_err(|_| invalid("amount too large"))?
    };
    let padded = format!("{:0<width$}", fraction, width = decimals as usize);
    let fraction: u128 = if padded.is_empty() {
        0
    } else {
        padded.parse().map_err(|_| invalid("amount too large"))?
    };

    whole
        .checked_mul(scale)
        .and_then(|w| w.checked_add(fraction))
        .ok_or_else(|| invalid("amount too large"))
}

pub fn parse_ether(amount: &str) -> Result<u128> {
    parse_units(amount, 18)
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TransactionRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<Address>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<Address>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gas: Option<String>,
    #[serde(rename = "gasPrice", skip_serializing_if = "Option::is_none")]
    pub gas_price: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

fn strip_leading_zeros(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    &bytes[start..]
}

fn rlp_length_prefix(len: usize, offset: u8) -> Vec<u8> {
    if len <= 55 {
        return vec![offset + len as u8];
    }
    let len_bytes = (len as u64).to_be_bytes();
    let len_bytes = strip_leading_zeros(&len_bytes);
    let mut prefix = vec![offset + 55 + len_bytes.len() as u8];
    prefix.extend_from_slice(len_bytes);
    prefix
}

fn rlp_bytes(bytes: &[u8]) -> Vec<u8> {
    if let [single] = bytes {
        if *single < 0x80 {
            return vec![*single];
        }
    }
    let mut out = rlp_length_prefix(bytes.len(), 0x80);
    out.extend_from_slice(bytes);
    out
}

fn rlp_uint(value: u128) -> Vec<u8> {
    rlp_bytes(strip_leading_zeros(&value.to_be_bytes()))
}

fn rlp_list(items: &[Vec<u8>]) -> Vec<u8> {
    let payload = items.concat();
    let mut out = rlp_length_prefix(payload.len(), 0xc0);
    out.extend(payload);
    out
}

/// Fully populated legacy transaction, ready to sign.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyTransaction {
    pub nonce: u64,
    pub gas_price: u128,
    pub gas: u64,
    /// `None` deploys a contract.
    pub to: Option<Address>,
    pub value: u128,
    pub data: Vec<u8>,
    pub chain_id: u64,
}

impl LegacyTransaction {
    fn rlp_fields(&self) -> Vec<Vec<u8>> {
        let to = self.to.map(|address| address.0.to_vec()).unwrap_or_default();
        vec![
            rlp_uint(u128::from(self.nonce)),
            rlp_uint(self.gas_price),
            rlp_uint(u128::from(self.gas)),
            rlp_bytes(&to),
            rlp_uint(self.value),
            rlp_bytes(&self.data),
        ]
    }

    /// RLP of the six fields plus `chainId, 0, 0` (EIP-155).
    pub fn signing_payload(&self) -> Vec<u8> {
        let mut fields = self.rlp_fields();
        fields.push(rlp_uint(u128::from(self.chain_id)));
        fields.push(rlp_uint(0));
        fields.push(rlp_uint(0));
        rlp_list(&fields)
    }

    pub fn signing_hash(&self) -> [u8; 32] {
        Keccak256::digest(self.signing_payload()).into()
    }

    /// Signed raw transaction bytes for `eth_sendRawTransaction`.
    pub fn sign(&self, key: &SigningKey) -> Result<Vec<u8>> {
        let (signature, recovery_id) = key
            .sign_prehash_recoverable(&self.signing_hash())
            .map_err(|e| CtfError::processing(format!("signing failed: {}", e)))?;
        let v = u128::from(recovery_id.to_byte()) + u128::from(self.chain_id) * 2 + 35;
        let rs = signature.to_bytes();
        let (r, s) = rs.split_at(32);

        let mut fields = self.rlp_fields();
        fields.push(rlp_uint(v));
        fields.push(rlp_bytes(strip_leading_zeros(r)));
        fields.push(rlp_bytes(strip_leading_zeros(s)));
        Ok(rlp_list(&fields))
    }
}

/// Parses a hex private key (with or without `0x`).
pub fn parse_private_key(text: &str) -> Result<SigningKey> {
    let invalid = |reason: &str| CtfError::InvalidConfigValueError {
        field: "private_key".to_string(),
        value: "<redacted>".to_string(),
        reason: reason.to_string(),
    };
    let bytes = from_hex(text).map_err(|_| invalid("not a hex string"))?;
    SigningKey::from_slice(&bytes).map_err(|_| invalid("not a valid secp256k1 key"))
}

/// Last 20 bytes of keccak256 over the uncompressed public key.
pub fn address_of(key: &SigningKey) -> Address {
    let affine: &AffinePoint = key.verifying_key().as_ref();
    let point = affine.to_encoded_point(false);
    let hash = Keccak256::digest(&point.as_bytes()[1..]);
    let mut address = [0u8; 20];
    address.copy_from_slice(&hash[12..]);
    Address(address)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionReceipt {
    pub transaction_hash: String,
    pub block_number: Option<String>,
    pub contract_address: Option<Address>,
    pub status: Option<String>,
    pub gas_used: Option<String>,
}

impl TransactionReceipt {
    pub fn succeeded(&self) -> bool {
        self.status.as_deref() != Some("0x0")
    }
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

pub struct RpcClient {
    client: Client,
    url: String,
    next_id: AtomicU64,
    poll_interval: Duration,
    receipt_timeout: Duration,
}

impl RpcClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            url: url.into(),
            next_id: AtomicU64::new(1),
            poll_interval: Duration::from_millis(500),
            receipt_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_polling(mut self, interval: Duration, timeout: Duration) -> Self {
        self.poll_interval = interval;
        self.receipt_timeout = timeout;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Sends one request. A `null` result comes back as `None`.
    pub async fn request_optional<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<Option<T>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        tracing::debug!("rpc -> {} {}", method, body["params"]);

        let response: RpcResponse<T> = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if let Some(error) = response.error {
            tracing::debug!("rpc <- {} error {}: {}", method, error.code, error.message);
            return Err(CtfError::RpcError {
                code: error.code,
                message: error.message,
            });
        }
        Ok(response.result)
    }

    pub async fn request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T> {
        self.request_optional(method, params)
            .await?
            .ok_or_else(|| CtfError::protocol(format!("{} returned no result", method)))
    }

    pub async fn chain_id(&self) -> Result<u64> {
        let id: String = self.request("eth_chainId", json!([])).await?;
        quantity_u64(&id)
    }

    pub async fn block_number(&self) -> Result<u64> {
        let number: String = self.request("eth_blockNumber", json!([])).await?;
        quantity_u64(&number)
    }

    pub async fn accounts(&self) -> Result<Vec<Address>> {
        self.request("eth_accounts", json!([])).await
    }

    /// Balance in wei.
    pub async fn get_balance(&self, address: Address) -> Result<u128> {
        let balance: String = self
            .request("eth_getBalance", json!([address, "latest"]))
            .await?;
        parse_quantity(&balance)
    }

    pub async fn call(&self, tx: &TransactionRequest) -> Result<Vec<u8>> {
        let data: String = self.request("eth_call", json!([tx, "latest"])).await?;
        from_hex(&data)
    }

    pub async fn send_transaction(&self, tx: &TransactionRequest) -> Result<String> {
        let hash: String = self.request("eth_sendTransaction", json!([tx])).await?;
        tracing::info!("Sent transaction {}", hash);
        Ok(hash)
    }

    pub async fn send_raw_transaction(&self, raw: &[u8]) -> Result<String> {
        let hash: String = self
            .request("eth_sendRawTransaction", json!([to_hex(raw)]))
            .await?;
        tracing::info!("Sent raw transaction {}", hash);
        Ok(hash)
    }

    /// Next nonce, counting pending transactions.
    pub async fn transaction_count(&self, address: Address) -> Result<u64> {
        let count: String = self
            .request("eth_getTransactionCount", json!([address, "pending"]))
            .await?;
        quantity_u64(&count)
    }

    pub async fn gas_price(&self) -> Result<u128> {
        let price: String = self.request("eth_gasPrice", json!([])).await?;
        parse_quantity(&price)
    }

    pub async fn estimate_gas(&self, tx: &TransactionRequest) -> Result<u64> {
        let gas: String = self.request("eth_estimateGas", json!([tx])).await?;
        quantity_u64(&gas)
    }

    pub async fn get_transaction_receipt(&self, hash: &str) -> Result<Option<TransactionReceipt>> {
        self.request_optional("eth_getTransactionReceipt", json!([hash]))
            .await
    }

    pub async fn wait_for_receipt(&self, hash: &str) -> Result<TransactionReceipt> {
        let poll = async {
            loop {
                if let Some(receipt) = self.get_transaction_receipt(hash).await? {
                    return Ok::<_, CtfError>(receipt);
                }
                tokio::time::sleep(self.poll_interval).await;
            }
        };
        tokio::time::timeout(self.receipt_timeout, poll)
            .await
            .map_err(|_| CtfError::timeout(format!("waiting for receipt of {}", hash)))?
    }
}

/// Sender of transactions: a node-managed address, or a local private key.
#[derive(Clone)]
pub struct Account {
    rpc: Arc<RpcClient>,
    address: Address,
    signer: Option<SigningKey>,
}

impl Account {
    /// Address the node signs for.
    pub fn new(rpc: Arc<RpcClient>, address: Address) -> Self {
        Self {
            rpc,
            address,
            signer: None,
        }
    }

    /// Signs locally; the node only sees raw transactions.
    pub fn from_private_key(rpc: Arc<RpcClient>, private_key: &str) -> Result<Self> {
        let signer = parse_private_key(private_key)?;
        let address = address_of(&signer);
        tracing::info!("Using local key for {}", address);
        Ok(Self {
            rpc,
            address,
            signer: Some(signer),
        })
    }

    /// Local key when one is configured, otherwise the node's first account.
    pub async fn load(rpc: Arc<RpcClient>, private_key: Option<&str>) -> Result<Self> {
        match private_key {
            Some(key) => Self::from_private_key(rpc, key),
            None => Self::default_account(rpc).await,
        }
    }

    pub fn is_local(&self) -> bool {
        self.signer.is_some()
    }

    /// First account of `eth_accounts`.
    pub async fn default_account(rpc: Arc<RpcClient>) -> Result<Self> {
        let address = rpc
            .accounts()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| CtfError::MissingConfigError {
                field: "rpc.private_key (node has no accounts)".to_string(),
            })?;
        tracing::info!("Using default account {}", address);
        Ok(Self::new(rpc, address))
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn rpc(&self) -> &RpcClient {
        &self.rpc
    }

    pub async fn balance(&self) -> Result<u128> {
        self.rpc.get_balance(self.address).await
    }

    /// Sends `tx` from this account and returns the transaction hash.
    ///
    /// With a local key, missing nonce, gas price and gas are asked from the
    /// node before signing.
    pub async fn send_transaction(&self, mut tx: TransactionRequest) -> Result<String> {
        tx.from = Some(self.address);
        let Some(signer) = &self.signer else {
            return self.rpc.send_transaction(&tx).await;
        };

        let chain_id = self.rpc.chain_id().await?;
        let nonce = match tx.nonce.as_deref() {
            Some(nonce) => quantity_u64(nonce)?,
            None => self.rpc.transaction_count(self.address).await?,
        };
        let gas_price = match tx.gas_price.as_deref() {
            Some(price) => parse_quantity(price)?,
            None => self.rpc.gas_price().await?,
        };
        let gas = match tx.gas.as_deref() {
            Some(gas) => quantity_u64(gas)?,
            None => self.rpc.estimate_gas(&tx).await?,
        };

        let legacy = LegacyTransaction {
            nonce,
            gas_price,
            gas,
            to: tx.to,
            value: tx.value.as_deref().map(parse_quantity).transpose()?.unwrap_or(0),
            data: tx.data.as_deref().map(from_hex).transpose()?.unwrap_or_default(),
            chain_id,
        };
        let raw = legacy.sign(signer)?;
        self.rpc.send_raw_transaction(&raw).await
    }
}

#[derive(Clone)]
pub struct Contract {
    account: Account,
    address: Address,
}

impl Contract {
    pub fn at(account: Account, address: Address) -> Self {
        Self { account, address }
    }

    /// Deploys `bytecode` with constructor `args` and waits for the receipt.
    pub async fn deploy(
        account: Account,
        bytecode: &str,
        args: &[Token],
        value: u128,
    ) -> Result<Self> {
        let mut data = from_hex(bytecode)?;
        data.extend(encode_args(args));

        let tx = TransactionRequest {
            data: Some(to_hex(&data)),
            value: (value > 0).then(|| to_quantity(value)),
            ..Default::default()
        };
        let hash = account.send_transaction(tx).await?;
        let receipt = account.rpc.wait_for_receipt(&hash).await?;
        if !receipt.succeeded() {
            return Err(CtfError::processing(format!("deployment {} reverted", hash)));
        }
        let address = receipt
            .contract_address
            .ok_or_else(|| CtfError::protocol("receipt has no contractAddress"))?;

        tracing::info!("Deployed contract at {}", address);
        Ok(Self { account, address })
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    pub async fn call(&self, signature: &str, args: &[Token]) -> Result<Vec<u8>> {
        let tx = TransactionRequest {
            from: Some(self.account.address),
            to: Some(self.address),
            data: Some(to_hex(&encode_call(signature, args))),
            ..Default::default()
        };
        self.account.rpc.call(&tx).await
    }

    pub async fn call_bool(&self, signature: &str, args: &[Token]) -> Result<bool> {
        decode_bool(&self.call(signature, args).await?, 0)
    }

    pub async fn call_uint(&self, signature: &str, args: &[Token]) -> Result<u128> {
        decode_uint(&self.call(signature, args).await?, 0)
    }

    pub async fn call_address(&self, signature: &str, args: &[Token]) -> Result<Address> {
        decode_address(&self.call(signature, args).await?, 0)
    }

    pub async fn transact(&self, signature: &str, args: &[Token], value: u128) -> Result<String> {
        let tx = TransactionRequest {
            to: Some(self.address),
            data: Some(to_hex(&encode_call(signature, args))),
            value: (value > 0).then(|| to_quantity(value)),
            ..Default::default()
        };
        self.account.send_transaction(tx).await
    }

    pub async fn transact_and_wait(
        &self,
        signature: &str,
        args: &[Token],
        value: u128,
    ) -> Result<TransactionReceipt> {
        let hash = self.transact(signature, args, value).await?;
        let receipt = self.account.rpc.wait_for_receipt(&hash).await?;
        if !receipt.succeeded() {
            return Err(CtfError::processing(format!(
                "{} reverted in {}",
                signature, hash
            )));
        }
        Ok(receipt)
    }
}
