use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{
    Address, Bytes, Eip1559TransactionRequest, TransactionRequest, U256, U64,
};
use serde::{Deserialize, Serialize};

use crate::rpc::RpcError;

pub const DEFAULT_GAS: u64 = 90_000;

/// The transaction object of `eth_sendTransaction` and
/// `eth_signTransaction`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionCall {
    pub from: Address,
    #[serde(default)]
    pub to: Option<Address>,
    #[serde(default)]
    pub gas: Option<U256>,
    #[serde(default)]
    pub gas_price: Option<U256>,
    #[serde(default)]
    pub max_fee_per_gas: Option<U256>,
    #[serde(default)]
    pub max_priority_fee_per_gas: Option<U256>,
    #[serde(default)]
    pub value: Option<U256>,
    #[serde(default, alias = "input")]
    pub data: Option<Bytes>,
    #[serde(default)]
    pub nonce: Option<U256>,
    #[serde(default)]
    pub chain_id: Option<U64>,
}

impl TransactionCall {
    fn is_eip1559(&self) -> bool {
        self.max_fee_per_gas.is_some()
            || self.max_priority_fee_per_gas.is_some()
    }

    /// Rejects fee fields that don't describe a single transaction type
    pub fn validate(&self) -> Result<(), RpcError> {
        if !self.is_eip1559() {
            return Ok(());
        }

        if self.gas_price.is_some() {
            return Err(RpcError::invalid_params(
                "gasPrice cannot be combined with maxFeePerGas or maxPriorityFeePerGas",
            ));
        }

        if self.max_fee_per_gas.is_none()
            || self.max_priority_fee_per_gas.is_none()
        {
            return Err(RpcError::invalid_params(
                "maxFeePerGas and maxPriorityFeePerGas must be set together",
            ));
        }

        Ok(())
    }

    /// Builds the transaction to sign, missing gas falls back to 90000 and
    /// a missing legacy gas price to zero.
    pub fn into_typed(self, nonce: U256, chain_id: u64) -> TypedTransaction {
        let gas = self.gas.unwrap_or_else(|| U256::from(DEFAULT_GAS));

        if self.is_eip1559() {
            let mut tx = Eip1559TransactionRequest::new()
                .from(self.from)
                .gas(gas)
                .nonce(nonce)
                .chain_id(chain_id)
                .max_fee_per_gas(self.max_fee_per_gas.unwrap_or_default())
                .max_priority_fee_per_gas(
                    self.max_priority_fee_per_gas.unwrap_or_default(),
                );

            tx.to = self.to.map(Into::into);
            tx.value = self.value;
            tx.data = self.data;

            return tx.into();
        }

        let mut tx = TransactionRequest::new()
            .from(self.from)
            .gas(gas)
            .gas_price(self.gas_price.unwrap_or_default())
            .nonce(nonce)
            .chain_id(chain_id);

        tx.to = self.to.map(Into::into);
        tx.value = self.value;
        tx.data = self.data;

        tx.into()
    }
}
