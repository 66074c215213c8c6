//! Persistence Layer for coordinator state
//!
//! Uses sled embedded database so a restarted coordinator resumes every round
//! exactly where it stopped: round records, observed submissions, held
//! aggregation leases and the last processed round id.

use fedchain_bridge::Lease;
use fedchain_types::{RewardRecord, Round, RoundId, Submission};
use serde::{Deserialize, Serialize};
use sled::Db;
use std::path::Path;

const LAST_PROCESSED_KEY: &str = "last_processed_round";

/// Everything the coordinator knows about one round
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RoundRecord {
    pub round: Round,
    /// Number of updates merged, once aggregation has run
    pub aggregated_participants: Option<u64>,
    /// Reward allocations, once settled
    pub rewards: Vec<RewardRecord>,
}

impl RoundRecord {
    pub fn new(round: Round) -> Self {
        Self {
            round,
            aggregated_participants: None,
            rewards: Vec::new(),
        }
    }
}

/// A lease this instance holds
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LeaseRecord {
    pub round_id: RoundId,
    pub holder: String,
    pub token: u64,
}

impl From<&Lease> for LeaseRecord {
    fn from(lease: &Lease) -> Self {
        Self {
            round_id: lease.round_id,
            holder: lease.holder.clone(),
            token: lease.token,
        }
    }
}

impl From<LeaseRecord> for Lease {
    fn from(record: LeaseRecord) -> Self {
        Lease {
            round_id: record.round_id,
            holder: record.holder,
            token: record.token,
        }
    }
}

fn submission_key(round_id: RoundId, seq: u64) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&round_id.to_be_bytes());
    key[8..].copy_from_slice(&seq.to_be_bytes());
    key
}

/// Durable coordinator state
pub struct EngineStore {
    /// Sled database instance
    db: Db,
    /// Round records keyed by big-endian round id
    rounds: sled::Tree,
    /// Submissions keyed by round id then observation sequence
    submissions: sled::Tree,
    /// Held leases keyed by round id
    leases: sled::Tree,
    /// Metadata tree
    meta: sled::Tree,
}

impl EngineStore {
    /// Open or create a store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let db = sled::open(&path)?;
        tracing::info!("Opened coordinator store at {:?}", path.as_ref());
        Self::from_db(db)
    }

    /// Throwaway in-memory store
    pub fn temporary() -> anyhow::Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> anyhow::Result<Self> {
        let rounds = db.open_tree("rounds")?;
        let submissions = db.open_tree("submissions")?;
        let leases = db.open_tree("leases")?;
        let meta = db.open_tree("meta")?;
        Ok(Self {
            db,
            rounds,
            submissions,
            leases,
            meta,
        })
    }

    pub fn save_round(&self, record: &RoundRecord) -> anyhow::Result<()> {
        let bytes = bincode::serialize(record)?;
        self.rounds.insert(record.round.id.to_be_bytes(), bytes)?;
        Ok(())
    }

    pub fn load_round(&self, round_id: RoundId) -> anyhow::Result<Option<RoundRecord>> {
        match self.rounds.get(round_id.to_be_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All round records in round order
    pub fn load_rounds(&self) -> anyhow::Result<Vec<RoundRecord>> {
        let mut records = Vec::new();
        for result in self.rounds.iter() {
            let (_, value) = result?;
            records.push(bincode::deserialize(&value)?);
        }
        Ok(records)
    }

    /// Append a submission at position `seq` within its round
    pub fn append_submission(&self, submission: &Submission, seq: u64) -> anyhow::Result<()> {
        let bytes = bincode::serialize(submission)?;
        self.submissions
            .insert(submission_key(submission.round_id, seq), bytes)?;
        Ok(())
    }

    /// All submissions, grouped by round in observation order
    pub fn load_submissions(&self) -> anyhow::Result<Vec<Submission>> {
        let mut submissions = Vec::new();
        for result in self.submissions.iter() {
            let (_, value) = result?;
            submissions.push(bincode::deserialize(&value)?);
        }
        Ok(submissions)
    }

    pub fn save_lease(&self, lease: &LeaseRecord) -> anyhow::Result<()> {
        let bytes = bincode::serialize(lease)?;
        self.leases.insert(lease.round_id.to_be_bytes(), bytes)?;
        Ok(())
    }

    pub fn remove_lease(&self, round_id: RoundId) -> anyhow::Result<()> {
        self.leases.remove(round_id.to_be_bytes())?;
        Ok(())
    }

    pub fn load_leases(&self) -> anyhow::Result<Vec<LeaseRecord>> {
        let mut leases = Vec::new();
        for result in self.leases.iter() {
            let (_, value) = result?;
            leases.push(bincode::deserialize(&value)?);
        }
        Ok(leases)
    }

    pub fn set_last_processed_round(&self, round_id: RoundId) -> anyhow::Result<()> {
        self.meta.insert(LAST_PROCESSED_KEY, round_id.to_be_bytes().to_vec())?;
        Ok(())
    }

    pub fn last_processed_round(&self) -> anyhow::Result<Option<RoundId>> {
        match self.meta.get(LAST_PROCESSED_KEY)? {
            Some(bytes) => {
                let arr: [u8; 8] = bytes
                    .as_ref()
                    .try_into()
                    .map_err(|_| anyhow::anyhow!("Invalid round id length"))?;
                Ok(Some(RoundId::from_be_bytes(arr)))
            }
            None => Ok(None),
        }
    }

    /// Flush all pending writes to disk
    pub fn flush(&self) -> anyhow::Result<()> {
        self.db.flush()?;
        Ok(())
    }
}
