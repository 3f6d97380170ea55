//! Delivery attesters trusted by one execution chain.

use std::collections::BTreeSet;

use vrelay_crypto::{ids, recover_signer};
use vrelay_types::{Address, DeliveryAttestation, RecoverableSignature, RelayError, Result};

#[derive(Debug, Clone, Default)]
pub struct AttesterSet {
    attesters: BTreeSet<Address>,
}

impl AttesterSet {
    pub fn new(attesters: impl IntoIterator<Item = Address>) -> Self {
        Self {
            attesters: attesters.into_iter().collect(),
        }
    }

    pub fn add(&mut self, attester: Address) -> bool {
        self.attesters.insert(attester)
    }

    pub fn remove(&mut self, attester: &Address) -> bool {
        self.attesters.remove(attester)
    }

    pub fn contains(&self, attester: &Address) -> bool {
        self.attesters.contains(attester)
    }

    pub fn len(&self) -> usize {
        self.attesters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attesters.is_empty()
    }

    /// Recover the signer of an attestation and check it is a registered attester.
    pub fn verify(
        &self,
        attestation: &DeliveryAttestation,
        signature: &RecoverableSignature,
    ) -> Result<Address> {
        let signer = recover_signer(&ids::attestation_digest(attestation), signature)?;
        if !self.contains(&signer) {
            return Err(RelayError::Authorization(format!(
                "{} is not a registered attester",
                signer
            )));
        }
        Ok(signer)
    }
}
