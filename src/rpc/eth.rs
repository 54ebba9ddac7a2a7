use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};

use super::{ChainRpc, RpcBlock, RpcError, RpcReceipt, RpcTransaction, parse_quantity};

/// Ethereum JSON-RPC client over HTTP.
pub struct EthRpc {
    url: String,
    client: Client,
    auth: Option<String>, // base64 encoded user:pass
}

impl EthRpc {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, RpcError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            url: url.to_string(),
            client,
            auth: None,
        })
    }

    /// Attach HTTP basic auth, for providers that gate their endpoint that way.
    pub fn with_basic_auth(mut self, user: &str, pass: &str) -> Self {
        use base64::{Engine, engine::general_purpose::STANDARD};
        self.auth = Some(STANDARD.encode(format!("{user}:{pass}")));
        self
    }

    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, RpcError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let mut request = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .json(&body);
        if let Some(auth) = &self.auth {
            request = request.header("Authorization", format!("Basic {auth}"));
        }

        let resp = request.send().await?;
        let json: Value = resp.json().await?;

        if let Some(err) = json.get("error").filter(|e| !e.is_null()) {
            return Err(RpcError::Rpc(err.clone()));
        }

        Ok(json["result"].clone())
    }
}

#[async_trait]
impl ChainRpc for EthRpc {
    async fn current_height(&self) -> Result<u64, RpcError> {
        let result = self.call("eth_blockNumber", vec![]).await?;
        let raw = result
            .as_str()
            .ok_or_else(|| RpcError::Decode(format!("eth_blockNumber returned {result}")))?;
        narrow(parse_quantity(raw)?, "block number")
    }

    async fn get_block(&self, height: u64, include_transactions: bool) -> Result<RpcBlock, RpcError> {
        let result = self
            .call(
                "eth_getBlockByNumber",
                vec![json!(format!("0x{height:x}")), json!(include_transactions)],
            )
            .await?;
        if result.is_null() {
            return Err(RpcError::NotFound(format!("block {height}")));
        }
        decode_block(&result)
    }

    async fn get_transaction_receipt(&self, tx_hash: &str) -> Result<RpcReceipt, RpcError> {
        let result = self
            .call("eth_getTransactionReceipt", vec![json!(tx_hash)])
            .await?;
        if result.is_null() {
            return Err(RpcError::NotFound(format!("receipt {tx_hash}")));
        }
        decode_receipt(&result)
    }
}

fn narrow(value: u128, what: &str) -> Result<u64, RpcError> {
    u64::try_from(value).map_err(|_| RpcError::Decode(format!("{what} {value} exceeds u64")))
}

fn field<'a>(obj: &'a Value, key: &str) -> Result<&'a str, RpcError> {
    obj.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| RpcError::Decode(format!("missing field `{key}`")))
}

fn optional_field<'a>(obj: &'a Value, key: &str) -> Option<&'a str> {
    obj.get(key).and_then(Value::as_str)
}

fn quantity_u64(obj: &Value, key: &str) -> Result<u64, RpcError> {
    narrow(parse_quantity(field(obj, key)?)?, key)
}

fn decode_block(obj: &Value) -> Result<RpcBlock, RpcError> {
    let entries = obj
        .get("transactions")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    let mut transaction_hashes = Vec::with_capacity(entries.len());
    let mut transactions = Vec::new();
    for entry in entries {
        match entry {
            Value::String(hash) => transaction_hashes.push(hash.clone()),
            Value::Object(_) => {
                let tx = decode_transaction(entry)?;
                transaction_hashes.push(tx.hash.clone());
                transactions.push(tx);
            }
            other => return Err(RpcError::Decode(format!("unexpected transaction entry {other}"))),
        }
    }

    Ok(RpcBlock {
        number: quantity_u64(obj, "number")?,
        hash: optional_field(obj, "hash").map(str::to_string),
        timestamp: quantity_u64(obj, "timestamp")?,
        transaction_hashes,
        transactions,
    })
}

fn decode_transaction(obj: &Value) -> Result<RpcTransaction, RpcError> {
    // Pre-London transactions only carry gasPrice; 1559 ones carry both.
    let gas_price_wei = match optional_field(obj, "gasPrice") {
        Some(raw) => parse_quantity(raw)?,
        None => 0,
    };
    Ok(RpcTransaction {
        hash: field(obj, "hash")?.to_string(),
        transaction_index: quantity_u64(obj, "transactionIndex")?,
        from: field(obj, "from")?.to_string(),
        to: optional_field(obj, "to").map(str::to_string),
        value_wei: parse_quantity(field(obj, "value")?)?,
        gas: quantity_u64(obj, "gas")?,
        gas_price_wei,
    })
}

fn decode_receipt(obj: &Value) -> Result<RpcReceipt, RpcError> {
    let status = optional_field(obj, "status")
        .map(|raw| parse_quantity(raw).and_then(|v| narrow(v, "status")))
        .transpose()?;
    let effective_gas_price_wei = optional_field(obj, "effectiveGasPrice")
        .map(parse_quantity)
        .transpose()?;
    Ok(RpcReceipt {
        gas_used: quantity_u64(obj, "gasUsed")?,
        cumulative_gas_used: quantity_u64(obj, "cumulativeGasUsed")?,
        status,
        contract_address: optional_field(obj, "contractAddress").map(str::to_string),
        effective_gas_price_wei,
    })
}
