/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Client transactions and the instructions they carry.
//!
//! A [`ClientTransaction`] is an ordered batch of [`Instruction`]s. The batch is hashed
//! atomically: every instruction is signed over the digest of the whole batch, so an instruction
//! cannot be lifted out of its transaction and replayed alone. Instructions are applied
//! sequentially; an instruction may individually fail, which rejects the whole transaction
//! without affecting consensus.

use std::fmt::{self, Display, Formatter};

use borsh::{BorshDeserialize, BorshSerialize};

use super::basic::{CryptoHash, InstanceId, SignatureBytes};
use super::crypto_primitives::{CryptoHasher, Digest, Keypair};
use super::identity::Identity;

/// A named argument of an instruction.
#[derive(Clone, PartialEq, Eq, Debug, BorshDeserialize, BorshSerialize)]
pub struct Argument {
    pub name: String,
    pub value: Vec<u8>,
}

impl Argument {
    /// Create a new `Argument`.
    pub fn new(name: &str, value: Vec<u8>) -> Self {
        Self {
            name: name.to_string(),
            value,
        }
    }
}

/// A searchable list of [`Argument`]s.
#[derive(Clone, PartialEq, Eq, Debug, Default, BorshDeserialize, BorshSerialize)]
pub struct Arguments(Vec<Argument>);

impl Arguments {
    /// Create a new `Arguments` wrapping `args`.
    pub fn new(args: Vec<Argument>) -> Self {
        Self(args)
    }

    /// Get the value of the argument named `name`, if present.
    pub fn search(&self, name: &str) -> Option<&[u8]> {
        self.0
            .iter()
            .find(|arg| arg.name == name)
            .map(|arg| arg.value.as_slice())
    }

    /// Iterate over the arguments in order.
    pub fn iter(&self) -> std::slice::Iter<'_, Argument> {
        self.0.iter()
    }
}

/// Request to create a new instance of a contract.
#[derive(Clone, PartialEq, Eq, Debug, BorshDeserialize, BorshSerialize)]
pub struct Spawn {
    pub contract_kind: String,
    pub args: Arguments,
}

/// Request to call a command on an existing instance.
#[derive(Clone, PartialEq, Eq, Debug, BorshDeserialize, BorshSerialize)]
pub struct Invoke {
    pub contract_kind: String,
    pub command: String,
    pub args: Arguments,
}

/// Request to delete an existing instance.
#[derive(Clone, PartialEq, Eq, Debug, BorshDeserialize, BorshSerialize)]
pub struct Delete {
    pub contract_kind: String,
}

/// The operation an [`Instruction`] requests. Exactly one of spawn, invoke, or delete.
#[derive(Clone, PartialEq, Eq, Debug, BorshDeserialize, BorshSerialize)]
pub enum InstructionBody {
    Spawn(Spawn),
    Invoke(Invoke),
    Delete(Delete),
}

/// One client-requested operation on one instance.
#[derive(Clone, PartialEq, Eq, Debug, BorshDeserialize, BorshSerialize)]
pub struct Instruction {
    /// The instance the operation addresses.
    pub instance_id: InstanceId,
    /// The requested operation.
    pub body: InstructionBody,
    /// The identities signing this instruction. Must be primary identities.
    pub signer_identities: Vec<Identity>,
    /// Per-signer monotonic counters. Each must equal the signer's stored counter plus one.
    pub signer_counters: Vec<u64>,
    /// One signature per signer identity, over the hash of the whole enclosing transaction.
    pub signatures: Vec<SignatureBytes>,
}

impl Instruction {
    /// Create an unsigned instruction.
    pub fn new(instance_id: InstanceId, body: InstructionBody) -> Self {
        Self {
            instance_id,
            body,
            signer_identities: Vec::new(),
            signer_counters: Vec::new(),
            signatures: Vec::new(),
        }
    }

    /// The contract kind this instruction addresses.
    pub fn contract_kind(&self) -> &str {
        match &self.body {
            InstructionBody::Spawn(spawn) => &spawn.contract_kind,
            InstructionBody::Invoke(invoke) => &invoke.contract_kind,
            InstructionBody::Delete(delete) => &delete.contract_kind,
        }
    }

    /// The action string used to look up authorization rules: `spawn:kind`,
    /// `invoke:kind.command`, or `delete:kind`.
    pub fn action(&self) -> String {
        match &self.body {
            InstructionBody::Spawn(spawn) => format!("spawn:{}", spawn.contract_kind),
            InstructionBody::Invoke(invoke) => {
                format!("invoke:{}.{}", invoke.contract_kind, invoke.command)
            }
            InstructionBody::Delete(delete) => format!("delete:{}", delete.contract_kind),
        }
    }

    /// Compute the digest of this instruction.
    ///
    /// Variable-length fields are length-prefixed so that bytes cannot be moved between
    /// neighboring fields without changing the digest.
    pub fn hash(&self) -> CryptoHash {
        let mut hasher = CryptoHasher::new();
        hasher.update(self.instance_id.bytes());
        match &self.body {
            InstructionBody::Spawn(spawn) => {
                hasher.update([0u8]);
                hasher.update(spawn.contract_kind.as_bytes());
                hash_args(&mut hasher, &spawn.args);
            }
            InstructionBody::Invoke(invoke) => {
                hasher.update([1u8]);
                hasher.update(invoke.contract_kind.as_bytes());
                hasher.update(invoke.command.as_bytes());
                hash_args(&mut hasher, &invoke.args);
            }
            InstructionBody::Delete(delete) => {
                hasher.update([2u8]);
                hasher.update(delete.contract_kind.as_bytes());
            }
        }
        for counter in &self.signer_counters {
            hasher.update(counter.to_le_bytes());
        }
        for identity in &self.signer_identities {
            let bytes = identity.to_bytes();
            hasher.update((bytes.len() as u64).to_le_bytes());
            hasher.update(&bytes);
        }
        CryptoHash::new(hasher.finalize().into())
    }

    /// Derive a new instance id from this instruction and `what`.
    ///
    /// Contracts that create instances derive their ids this way; by convention a newly spawned
    /// instance gets `instr.derive_id("")`. The signatures are folded in with strict length
    /// prefixes so that mutating them cannot produce a colliding id.
    pub fn derive_id(&self, what: &str) -> InstanceId {
        let mut hasher = CryptoHasher::new();
        hasher.update(self.hash().bytes());
        hasher.update((self.signatures.len() as u32).to_le_bytes());
        for signature in &self.signatures {
            hasher.update((signature.bytes().len() as u32).to_le_bytes());
            hasher.update(signature.bytes());
        }
        hasher.update(what.as_bytes());
        InstanceId::new(hasher.finalize().into())
    }

    /// Sign this instruction over `batch_hash` (the hash of the enclosing transaction) with
    /// `signers`, which must match `signer_identities` in number and order.
    pub fn sign_with(
        &mut self,
        batch_hash: &CryptoHash,
        signers: &[Keypair],
    ) -> Result<(), SigningError> {
        if signers.len() != self.signer_identities.len() {
            return Err(SigningError::SignerIdentityMismatch);
        }
        if signers.len() != self.signer_counters.len() {
            return Err(SigningError::SignerCounterMismatch);
        }
        self.signatures = Vec::with_capacity(signers.len());
        for (signer, identity) in signers.iter().zip(self.signer_identities.iter()) {
            if Identity::ed25519(&signer.public()) != *identity {
                return Err(SigningError::SignerIdentityMismatch);
            }
            self.signatures.push(signer.sign(&batch_hash.bytes()));
        }
        Ok(())
    }

    /// The identity strings of the signers whose signature over `batch_hash` verifies.
    pub fn verified_identity_strings(&self, batch_hash: &CryptoHash) -> Vec<String> {
        self.signer_identities
            .iter()
            .zip(self.signatures.iter())
            .filter(|(identity, signature)| identity.verify(&batch_hash.bytes(), signature))
            .map(|(identity, _)| identity.to_string())
            .collect()
    }
}

impl Display for Instruction {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} on {} ({} signers)",
            self.action(),
            self.instance_id,
            self.signer_identities.len()
        )
    }
}

fn hash_args(hasher: &mut CryptoHasher, args: &Arguments) {
    for arg in args.iter() {
        hasher.update((arg.name.len() as u64).to_le_bytes());
        hasher.update(arg.name.as_bytes());
        hasher.update((arg.value.len() as u64).to_le_bytes());
        hasher.update(&arg.value);
    }
}

/// Reason signing a transaction failed.
#[derive(Debug, PartialEq, Eq)]
pub enum SigningError {
    SignerIdentityMismatch,
    SignerCounterMismatch,
}

impl Display for SigningError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            SigningError::SignerIdentityMismatch => {
                write!(f, "signers do not match the instruction's signer identities")
            }
            SigningError::SignerCounterMismatch => {
                write!(f, "the number of signers does not match the number of counters")
            }
        }
    }
}

/// An ordered batch of instructions, accepted or rejected as a unit.
#[derive(Clone, PartialEq, Eq, Debug, BorshDeserialize, BorshSerialize)]
pub struct ClientTransaction {
    pub instructions: Vec<Instruction>,
}

impl ClientTransaction {
    /// Create a new `ClientTransaction` wrapping `instructions`.
    pub fn new(instructions: Vec<Instruction>) -> Self {
        Self { instructions }
    }

    /// Compute the digest of the batch: SHA256 over the instruction hashes in order. This is
    /// the message every instruction's signatures are verified against.
    pub fn hash(&self) -> CryptoHash {
        let mut hasher = CryptoHasher::new();
        for instruction in &self.instructions {
            hasher.update(instruction.hash().bytes());
        }
        CryptoHash::new(hasher.finalize().into())
    }

    /// Compute a digest covering the instructions *and* their signatures. Distinguishes two
    /// submissions of the same instructions that differ only in signatures, which the plain
    /// [`hash`](Self::hash) does not.
    pub fn hash_with_signatures(&self) -> CryptoHash {
        let mut hasher = CryptoHasher::new();
        for instruction in &self.instructions {
            hasher.update(instruction.hash().bytes());
            for signature in &instruction.signatures {
                hasher.update(signature.bytes());
            }
        }
        CryptoHash::new(hasher.finalize().into())
    }

    /// Fill every instruction's signer identities with the identities of `signers`, set the
    /// per-instruction counters from `counters` (one per signer, used for every instruction in
    /// submission order), and sign.
    pub fn fill_signers_and_sign(
        &mut self,
        signers: &[Keypair],
        base_counters: &[u64],
    ) -> Result<(), SigningError> {
        if signers.len() != base_counters.len() {
            return Err(SigningError::SignerCounterMismatch);
        }
        let identities: Vec<Identity> = signers
            .iter()
            .map(|signer| Identity::ed25519(&signer.public()))
            .collect();
        for (offset, instruction) in self.instructions.iter_mut().enumerate() {
            instruction.signer_identities = identities.clone();
            instruction.signer_counters = base_counters
                .iter()
                .map(|counter| counter + 1 + offset as u64)
                .collect();
        }
        self.sign_with(signers)
    }

    /// Sign every instruction with `signers`. The signer identities and counters must already
    /// be set.
    pub fn sign_with(&mut self, signers: &[Keypair]) -> Result<(), SigningError> {
        let digest = self.hash();
        for instruction in &mut self.instructions {
            instruction.sign_with(&digest, signers)?;
        }
        Ok(())
    }

    /// The serialized size of this transaction in bytes, the measure checked against the
    /// ledger's maximum block size.
    pub fn size(&self) -> u64 {
        // Vec writers do not fail.
        self.try_to_vec().unwrap().len() as u64
    }
}

/// The recorded outcome of one transaction inside a block.
#[derive(Clone, PartialEq, Eq, Debug, BorshDeserialize, BorshSerialize)]
pub struct TxResult {
    pub transaction: ClientTransaction,
    pub accepted: bool,
}

impl TxResult {
    /// Wrap `transaction` with `accepted` set to false.
    pub fn pending(transaction: ClientTransaction) -> Self {
        Self {
            transaction,
            accepted: false,
        }
    }
}

/// An ordered list of transaction outcomes: the payload of one block.
#[derive(Clone, PartialEq, Eq, Debug, Default, BorshDeserialize, BorshSerialize)]
pub struct TxResults(pub Vec<TxResult>);

impl TxResults {
    /// Wrap a list of client transactions with `accepted` set to false for each.
    pub fn pending(transactions: Vec<ClientTransaction>) -> Self {
        Self(transactions.into_iter().map(TxResult::pending).collect())
    }

    /// Compute the digest of the outcomes: SHA256 over each transaction's hash followed by its
    /// accepted flag.
    pub fn hash(&self) -> CryptoHash {
        let mut hasher = CryptoHasher::new();
        for result in &self.0 {
            hasher.update(result.transaction.hash().bytes());
            hasher.update([result.accepted as u8]);
        }
        CryptoHash::new(hasher.finalize().into())
    }

    /// The summed serialized size of the transactions, in bytes.
    pub fn size(&self) -> u64 {
        self.0
            .iter()
            .map(|result| result.transaction.size())
            .sum()
    }

    /// Iterate over the outcomes in order.
    pub fn iter(&self) -> std::slice::Iter<'_, TxResult> {
        self.0.iter()
    }

    /// Get how many outcomes are in this `TxResults`.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check whether this `TxResults` is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::transaction::InstructionBody;
    use ed25519_dalek::SigningKey;
    use rand_core::OsRng;

    fn spawn_instruction() -> Instruction {
        Instruction::new(
            InstanceId::zero(),
            InstructionBody::Spawn(Spawn {
                contract_kind: "value".to_string(),
                args: Arguments::new(vec![Argument::new("value", vec![5, 6, 7, 8])]),
            }),
        )
    }

    #[test]
    fn hash_covers_arguments() {
        let a = spawn_instruction();
        let mut b = spawn_instruction();
        if let InstructionBody::Spawn(spawn) = &mut b.body {
            spawn.args = Arguments::new(vec![Argument::new("value", vec![5, 6, 7, 9])]);
        }
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn signatures_verify_over_batch_hash() {
        let mut csprg = OsRng {};
        let keypair = Keypair::new(SigningKey::generate(&mut csprg));
        let mut tx = ClientTransaction::new(vec![spawn_instruction()]);
        tx.fill_signers_and_sign(std::slice::from_ref(&keypair), &[0])
            .unwrap();

        let batch_hash = tx.hash();
        let verified = tx.instructions[0].verified_identity_strings(&batch_hash);
        assert_eq!(
            verified,
            vec![Identity::ed25519(&keypair.public()).to_string()]
        );
        assert_eq!(tx.instructions[0].signer_counters, vec![1]);
    }

    #[test]
    fn derive_id_separates_domains() {
        let mut csprg = OsRng {};
        let keypair = Keypair::new(SigningKey::generate(&mut csprg));
        let mut tx = ClientTransaction::new(vec![spawn_instruction()]);
        tx.fill_signers_and_sign(std::slice::from_ref(&keypair), &[0])
            .unwrap();
        let instruction = &tx.instructions[0];
        assert_ne!(instruction.derive_id(""), instruction.derive_id("a"));
    }

    #[test]
    fn tx_results_hash_covers_accepted_flag() {
        let tx = ClientTransaction::new(vec![spawn_instruction()]);
        let accepted = TxResults(vec![TxResult {
            transaction: tx.clone(),
            accepted: true,
        }]);
        let rejected = TxResults(vec![TxResult {
            transaction: tx,
            accepted: false,
        }]);
        assert_ne!(accepted.hash(), rejected.hash());
    }
}
