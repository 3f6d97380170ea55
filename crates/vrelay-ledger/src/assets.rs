//! Per-chain balances and allowances. `Address::NATIVE` is the chain's native asset.

use std::collections::HashMap;

use vrelay_types::{Address, Amount, RelayError, Result};

#[derive(Debug, Clone, Default)]
pub struct AssetBook {
    balances: HashMap<(Address, Address), Amount>,
    allowances: HashMap<(Address, Address, Address), Amount>,
}

impl AssetBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn balance_of(&self, owner: &Address, token: &Address) -> Amount {
        self.balances.get(&(*owner, *token)).copied().unwrap_or(0)
    }

    pub fn allowance(&self, owner: &Address, spender: &Address, token: &Address) -> Amount {
        self.allowances
            .get(&(*owner, *spender, *token))
            .copied()
            .unwrap_or(0)
    }

    /// Credit new units (genesis allocation, bridged mint, faucet).
    pub fn mint(&mut self, owner: Address, token: Address, amount: Amount) -> Result<()> {
        let balance = self.balances.entry((owner, token)).or_default();
        *balance = balance
            .checked_add(amount)
            .ok_or_else(|| RelayError::Economic(format!("balance of {} overflows", owner)))?;
        Ok(())
    }

    pub fn approve(&mut self, owner: Address, spender: Address, token: Address, amount: Amount) {
        self.allowances.insert((owner, spender, token), amount);
    }

    pub fn ensure_balance(&self, owner: &Address, token: &Address, amount: Amount) -> Result<()> {
        let balance = self.balance_of(owner, token);
        if balance < amount {
            return Err(RelayError::Validation(format!(
                "insufficient balance of token {} for {}: have {}, need {}",
                token, owner, balance, amount
            )));
        }
        Ok(())
    }

    pub fn transfer(
        &mut self,
        from: &Address,
        to: &Address,
        token: &Address,
        amount: Amount,
    ) -> Result<()> {
        if amount == 0 || from == to {
            return Ok(());
        }
        self.ensure_balance(from, token, amount)?;
        self.mint(*to, *token, amount)?;
        if let Some(balance) = self.balances.get_mut(&(*from, *token)) {
            *balance -= amount;
        }
        Ok(())
    }

    /// Move `amount` from `from` to `to`, spending `spender`'s allowance.
    pub fn transfer_from(
        &mut self,
        spender: &Address,
        from: &Address,
        to: &Address,
        token: &Address,
        amount: Amount,
    ) -> Result<()> {
        let allowed = self.allowance(from, spender, token);
        if allowed < amount {
            return Err(RelayError::Validation(format!(
                "allowance of token {} from {} to {} is {}, need {}",
                token, from, spender, allowed, amount
            )));
        }
        self.transfer(from, to, token, amount)?;
        self.allowances
            .insert((*from, *spender, *token), allowed - amount);
        Ok(())
    }
}
